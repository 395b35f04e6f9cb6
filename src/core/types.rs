use crate::config::presets::SCRIPT_PLACEHOLDER;
use crate::config::types::{SupervisorState, TerminationReason};
use crate::utils::output::CapturedStream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What to run inside the confined process, derived from a runtime preset
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entrypoint {
    pub runtime: String,
    pub image: String,
    pub script_name: String,
    pub command: Vec<String>,
}

impl Entrypoint {
    /// Argv with every `{script}` replaced by the artifact path inside the sandbox
    pub fn argv(&self, script_path: &Path) -> Vec<String> {
        let script = script_path.to_string_lossy();
        self.command
            .iter()
            .map(|arg| arg.replace(SCRIPT_PLACEHOLDER, &script))
            .collect()
    }
}

/// Shared cancellation flag for one or more in-flight executions
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How a confined process ended, as observed by the provider
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExitOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            exit_code: None,
            signal: Some(signal),
        }
    }
}

/// Evidence of the termination escalation
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    /// Process confirmed gone before the grace period ran out
    pub confirmed: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Raw outcome of a supervised run, before classification
#[derive(Clone, Debug)]
pub struct SupervisedOutcome {
    pub final_state: SupervisorState,
    pub exit: Option<ExitOutcome>,
    pub timed_out: bool,
    pub termination_reason: TerminationReason,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub wall_clock: Duration,
    pub peak_memory_bytes: Option<u64>,
    pub kill_report: Option<KillReport>,
}

impl SupervisedOutcome {
    /// Outcome of a run that ended before any process existed
    pub fn without_process(final_state: SupervisorState, reason: TerminationReason) -> Self {
        Self {
            final_state,
            exit: None,
            timed_out: false,
            termination_reason: reason,
            stdout: CapturedStream::default(),
            stderr: CapturedStream::default(),
            wall_clock: Duration::ZERO,
            peak_memory_bytes: None,
            kill_report: None,
        }
    }
}
