/// Result classification
///
/// A pure mapping from the supervisor's terminal observation onto the closed
/// set of [`StatusKind`]s. Same input, same answer.
use crate::config::types::{ExecutionResult, StatusKind, SupervisorState, TerminationReason};
use crate::core::types::SupervisedOutcome;

/// Signals that mean the program died on its own fault. SIGKILL not sent by
/// the engine is the kernel OOM killer enforcing the memory limit.
const CRASH_SIGNALS: &[i32] = &[
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGABRT,
    libc::SIGSYS,
    libc::SIGKILL,
];

pub fn is_crash_signal(signal: i32) -> bool {
    CRASH_SIGNALS.contains(&signal)
}

/// Everything classification depends on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassifierInput<'a> {
    pub state: SupervisorState,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub reason: &'a TerminationReason,
}

pub struct ResultClassifier;

impl ResultClassifier {
    pub fn classify(input: &ClassifierInput<'_>) -> StatusKind {
        // A deadline kill wins over whatever exit code raced it
        if input.timed_out || input.state == SupervisorState::TimedOut {
            return StatusKind::Timeout;
        }

        match input.state {
            // Same enforcement kill as a deadline; the reason records the trigger
            SupervisorState::Killed => StatusKind::Timeout,
            SupervisorState::Crashed => StatusKind::Crashed,
            SupervisorState::LaunchFailed => match input.reason {
                TerminationReason::PolicyRefused { .. } => StatusKind::PolicyViolation,
                _ => StatusKind::InfrastructureFailure,
            },
            SupervisorState::Completed => match (input.exit_code, input.signal) {
                (Some(0), _) => StatusKind::Success,
                (Some(_), _) => StatusKind::NonZeroExit,
                (None, Some(signal)) if is_crash_signal(signal) => StatusKind::Crashed,
                (None, Some(_)) => StatusKind::NonZeroExit,
                (None, None) => StatusKind::InfrastructureFailure,
            },
            SupervisorState::Created
            | SupervisorState::Launching
            | SupervisorState::Running
            | SupervisorState::TimedOut => {
                log::error!("Classifying non-terminal state {}", input.state);
                StatusKind::InfrastructureFailure
            }
        }
    }

    /// Build the caller-facing result for a supervised run
    pub fn to_result(request_id: &str, outcome: &SupervisedOutcome) -> ExecutionResult {
        let exit_code = outcome.exit.and_then(|e| e.exit_code);
        let signal = outcome.exit.and_then(|e| e.signal);
        let status_kind = Self::classify(&ClassifierInput {
            state: outcome.final_state,
            exit_code,
            signal,
            timed_out: outcome.timed_out,
            reason: &outcome.termination_reason,
        });

        ExecutionResult {
            request_id: request_id.to_string(),
            status_kind,
            exit_code,
            signal,
            stdout: outcome.stdout.text(),
            stderr: outcome.stderr.text(),
            stdout_truncated: outcome.stdout.truncated,
            stderr_truncated: outcome.stderr.truncated,
            wall_clock_ms: outcome.wall_clock.as_millis() as u64,
            termination_reason: outcome.termination_reason.clone(),
            final_state: outcome.final_state,
            peak_memory_bytes: outcome.peak_memory_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(
        state: SupervisorState,
        exit_code: Option<i32>,
        signal: Option<i32>,
        timed_out: bool,
    ) -> StatusKind {
        let reason = TerminationReason::Exited;
        ResultClassifier::classify(&ClassifierInput {
            state,
            exit_code,
            signal,
            timed_out,
            reason: &reason,
        })
    }

    #[test]
    fn clean_exits() {
        assert_eq!(
            classify(SupervisorState::Completed, Some(0), None, false),
            StatusKind::Success
        );
        assert_eq!(
            classify(SupervisorState::Completed, Some(3), None, false),
            StatusKind::NonZeroExit
        );
    }

    #[test]
    fn timeout_wins_over_racing_exit() {
        assert_eq!(
            classify(SupervisorState::TimedOut, Some(137), None, true),
            StatusKind::Timeout
        );
        assert_eq!(
            classify(SupervisorState::Completed, Some(1), None, true),
            StatusKind::Timeout
        );
    }

    #[test]
    fn crashes_and_cancellation() {
        assert_eq!(
            classify(SupervisorState::Crashed, None, Some(libc::SIGSEGV), false),
            StatusKind::Crashed
        );
        assert_eq!(
            classify(SupervisorState::Completed, None, Some(libc::SIGABRT), false),
            StatusKind::Crashed
        );
        assert_eq!(
            classify(SupervisorState::Killed, None, Some(libc::SIGKILL), false),
            StatusKind::Timeout
        );
        assert!(!is_crash_signal(libc::SIGTERM));
    }

    #[test]
    fn launch_failures() {
        let refused = TerminationReason::PolicyRefused {
            detail: "no restricted network configured".to_string(),
        };
        let input = ClassifierInput {
            state: SupervisorState::LaunchFailed,
            exit_code: None,
            signal: None,
            timed_out: false,
            reason: &refused,
        };
        assert_eq!(ResultClassifier::classify(&input), StatusKind::PolicyViolation);
        assert_eq!(
            classify(SupervisorState::LaunchFailed, None, None, false),
            StatusKind::InfrastructureFailure
        );
    }
}
