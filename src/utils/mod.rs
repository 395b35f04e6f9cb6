//! Utilities
//!
//! Bounded output capture and shutdown signal plumbing.

pub mod output;
pub mod signal;
