//! Observability
//!
//! Tamper-evident per-execution audit records and security event logging.

pub mod audit;
pub mod events;
