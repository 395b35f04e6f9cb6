//! Configuration and policy
//!
//! Engine configuration, runtime presets, named policy templates and their
//! resolution into concrete isolation profiles.

pub mod config;
pub mod policy;
pub mod presets;
pub mod types;
pub mod validator;
