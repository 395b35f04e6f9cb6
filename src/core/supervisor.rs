/// Process supervision
///
/// Owns one execution from launch to terminal state: enforces the wall-clock
/// deadline, escalates termination, and captures bounded output concurrently
/// with the wait.
use crate::config::policy::PolicyProfile;
use crate::config::types::{Result, SandboxError, SupervisorState, TerminationReason};
use crate::core::provider::{IsolationHandle, IsolationProvider, WAIT_POLL_INTERVAL};
use crate::core::types::{CancelToken, Entrypoint, ExitOutcome, KillReport, SupervisedOutcome};
use crate::observability::events;
use crate::utils::output::{finish_pair, StreamCollector};
use crate::verdict::classifier::is_crash_signal;
use log::{debug, error, info, warn};
use std::path::Path;
use std::time::{Duration, Instant};

/// Per-run knobs taken from the engine configuration
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub deadline: Duration,
    pub kill_grace: Duration,
    pub output_limit: usize,
}

pub struct Supervisor<'a, P: IsolationProvider> {
    provider: &'a P,
    request_id: String,
    settings: SupervisorSettings,
    state: SupervisorState,
}

impl<'a, P: IsolationProvider> Supervisor<'a, P> {
    pub fn new(provider: &'a P, request_id: &str, settings: SupervisorSettings) -> Self {
        Self {
            provider,
            request_id: request_id.to_string(),
            settings,
            state: SupervisorState::Created,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, next: SupervisorState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SandboxError::Process(format!(
                "illegal supervisor transition {} -> {}",
                self.state, next
            )));
        }
        debug!("[{}] {} -> {}", self.request_id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Launch and supervise one confined process.
    ///
    /// Returns `Err` only for failures that leave no result to classify:
    /// runtime unavailable, container creation failure, or losing track of
    /// the process. A policy the provider refuses yields an outcome in the
    /// `LaunchFailed` state.
    pub fn run(
        mut self,
        workspace: &Path,
        profile: &PolicyProfile,
        entrypoint: &Entrypoint,
        cancel: &CancelToken,
    ) -> Result<SupervisedOutcome> {
        self.transition(SupervisorState::Launching)?;

        if cancel.is_cancelled() {
            self.transition(SupervisorState::Killed)?;
            return Ok(SupervisedOutcome::without_process(
                self.state,
                TerminationReason::Cancelled,
            ));
        }

        let mut handle = match self.provider.launch(workspace, profile, entrypoint) {
            Ok(handle) => handle,
            Err(SandboxError::PolicyRefused(detail)) => {
                self.transition(SupervisorState::LaunchFailed)?;
                events::policy_refused(&self.request_id, profile.name(), &detail);
                return Ok(SupervisedOutcome::without_process(
                    self.state,
                    TerminationReason::PolicyRefused { detail },
                ));
            }
            Err(e) => {
                self.transition(SupervisorState::LaunchFailed)?;
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            // Never enters Running; the handle is discarded after a forced kill
            let grace = self.settings.kill_grace;
            let start = Instant::now();
            let _ = handle.kill(grace / 2);
            let _ = handle.wait(grace.saturating_sub(start.elapsed()));
            self.transition(SupervisorState::Killed)?;
            return Ok(SupervisedOutcome::without_process(
                self.state,
                TerminationReason::Cancelled,
            ));
        }

        self.transition(SupervisorState::Running)?;
        let started = Instant::now();
        info!(
            "[{}] running {} via {} ({})",
            self.request_id,
            entrypoint.runtime,
            self.provider.name(),
            handle.id()
        );

        let limit = self.settings.output_limit;
        let stdout = match handle.take_stdout() {
            Some(pipe) => StreamCollector::spawn("stdout", pipe, limit),
            None => StreamCollector::empty("stdout"),
        };
        let stderr = match handle.take_stderr() {
            Some(pipe) => StreamCollector::spawn("stderr", pipe, limit),
            None => StreamCollector::empty("stderr"),
        };

        let deadline = started + self.settings.deadline;
        let (exit, reason, kill_report) = loop {
            match handle.try_wait() {
                Ok(Some(exit)) => break (Some(exit), exit_reason(exit), None),
                Ok(None) => {}
                Err(e) => {
                    error!("[{}] lost track of {}: {}", self.request_id, handle.id(), e);
                    let (_, report) = self.escalate(&mut handle, "wait failed");
                    self.transition(SupervisorState::Killed)?;
                    debug!("[{}] kill report after wait failure: {:?}", self.request_id, report);
                    return Err(e);
                }
            }

            if cancel.is_cancelled() {
                let (exit, report) = self.escalate(&mut handle, "cancelled");
                break (exit, TerminationReason::Cancelled, Some(report));
            }
            if Instant::now() >= deadline {
                let (exit, report) = self.escalate(&mut handle, "deadline exceeded");
                break (exit, TerminationReason::DeadlineExceeded, Some(report));
            }

            std::thread::sleep(WAIT_POLL_INTERVAL);
        };
        let wall_clock = started.elapsed();

        let next = match (&reason, exit) {
            (TerminationReason::DeadlineExceeded, _) => SupervisorState::TimedOut,
            (TerminationReason::Cancelled, _) => SupervisorState::Killed,
            (_, Some(ExitOutcome { signal: Some(sig), .. })) if is_crash_signal(sig) => {
                SupervisorState::Crashed
            }
            _ => SupervisorState::Completed,
        };
        self.transition(next)?;

        // After an escalation the capture gets what is left of the grace period
        let capture_budget = match &kill_report {
            Some(report) => self
                .settings
                .kill_grace
                .saturating_sub(Duration::from_millis(report.waited_ms)),
            None => self.settings.kill_grace,
        };
        let (stdout, stderr) = finish_pair(stdout, stderr, capture_budget);
        let peak_memory_bytes = handle.peak_memory();

        info!(
            "[{}] {} after {}ms ({})",
            self.request_id,
            self.state,
            wall_clock.as_millis(),
            reason
        );

        Ok(SupervisedOutcome {
            final_state: self.state,
            exit,
            timed_out: self.state == SupervisorState::TimedOut,
            termination_reason: reason,
            stdout,
            stderr,
            wall_clock,
            peak_memory_bytes,
            kill_report,
        })
    }

    /// Graceful terminate, then forced kill, all within nine tenths of the
    /// grace period. The last tenth is kept for output capture.
    ///
    /// Every provider call gets an explicit budget, so a hung runtime cannot
    /// stretch the escalation past the grace period.
    fn escalate(&self, handle: &mut P::Handle, why: &str) -> (Option<ExitOutcome>, KillReport) {
        let budget = self.settings.kill_grace * 9 / 10;
        let start = Instant::now();
        let left = |until: Duration| until.saturating_sub(start.elapsed());
        let mut report = KillReport::default();

        events::graceful_kill(&self.request_id, why);
        match handle.terminate(budget / 4) {
            Ok(()) => report.term_sent = true,
            Err(e) => report.notes.push(format!("terminate failed: {}", e)),
        }

        let mut exit = handle.wait(left(budget / 2)).unwrap_or_else(|e| {
            report.notes.push(format!("wait after terminate failed: {}", e));
            None
        });

        if exit.is_none() {
            events::forced_kill(&self.request_id, why);
            match handle.kill(left(budget) * 3 / 4) {
                Ok(()) => report.kill_sent = true,
                Err(e) => report.notes.push(format!("kill failed: {}", e)),
            }
            exit = handle.wait(left(budget)).unwrap_or_else(|e| {
                report.notes.push(format!("wait after kill failed: {}", e));
                None
            });
        }

        report.confirmed = exit.is_some();
        report.waited_ms = start.elapsed().as_millis() as u64;
        if !report.confirmed {
            warn!(
                "[{}] {} not confirmed dead after {}ms: {:?}",
                self.request_id,
                handle.id(),
                report.waited_ms,
                report.notes
            );
        }
        (exit, report)
    }
}

fn exit_reason(exit: ExitOutcome) -> TerminationReason {
    match exit.signal {
        Some(signal) => TerminationReason::Signaled { signal },
        None => TerminationReason::Exited,
    }
}
