//! codebox: a sandboxed execution engine for untrusted, machine-generated code
//!
//! Each request runs in a fresh, single-use isolation environment under a
//! named security policy. The caller gets back a classified result and one
//! tamper-evident audit record is written per request.
//!
//! # Architecture
//!
//! ## Execution Core ([`core`])
//! - [`core::engine`]: The `execute` entry point, tying every stage together
//! - [`core::supervisor`]: Launch, deadline enforcement, TERM/KILL escalation
//! - [`core::pool`]: Bounded admission of concurrent executions
//! - [`core::provider`]: Isolation provider seam
//! - [`core::container`]: Container runtime CLI provider (docker/podman)
//! - [`core::remover`]: Background removal of containers
//!
//! ## Configuration & Policy ([`config`])
//! - [`config::config`]: Engine configuration loading
//! - [`config::validator`]: Startup validation (errors vs warnings)
//! - [`config::policy`]: Named policy templates resolved to immutable profiles
//! - [`config::presets`]: Runtime presets (image, script name, command)
//! - [`config::types`]: Requests, results, states and errors
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::classifier`]: Pure mapping from terminal state to status kind
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::instance`]: Engine identity that survives pid reuse
//! - [`safety::workspace`]: Per-execution scratch directories
//! - [`safety::cleanup`]: Background retry of failed removals
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Hash-chained audit records
//! - [`observability::events`]: Security event logging
//!
//! ## Utilities ([`utils`])
//! - [`utils::output`]: Bounded output collection
//! - [`utils::signal`]: Shutdown signal handling
//!
//! # Design Principles
//!
//! 1. **Deny by default** - No network, no capabilities, read-only root, non-root user
//! 2. **Policies only tighten** - Overrides can never exceed host ceilings
//! 3. **Every request is accounted for** - One terminal state, one audit record
//! 4. **Nothing outlives its request** - Workspace and process are always reclaimed

// Execution Core
pub mod core;

// Configuration & Policy
pub mod config;

// Verdict
pub mod verdict;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the codebox binary
pub mod cli;

pub use config::config::EngineConfig;
pub use config::types::*;
pub use crate::core::engine::Engine;
pub use crate::core::provider::{IsolationHandle, IsolationProvider};
pub use crate::core::types::CancelToken;
