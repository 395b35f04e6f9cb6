//! Safety and cleanup
//!
//! Ephemeral workspaces and their guaranteed removal, including background
//! retry and reclamation after an abnormal engine exit.

pub mod cleanup;
pub mod instance;
pub mod workspace;
