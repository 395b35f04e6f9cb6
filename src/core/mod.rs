//! Execution core.
//!
//! The engine entry point, admission control, process supervision and the
//! isolation provider seam with its container runtime implementation.

pub mod container;
pub mod engine;
pub mod pool;
pub mod provider;
pub mod remover;
pub mod supervisor;
pub mod types;
