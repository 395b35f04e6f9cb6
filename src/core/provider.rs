//! Isolation provider abstraction
//!
//! The engine only ever needs four things from an isolation runtime: launch a
//! confined process, wait for it, kill it, and collect its output. Providers
//! must fail closed: an error from any method means nothing ran unconfined.

use crate::config::policy::PolicyProfile;
use crate::config::types::Result;
use crate::core::types::{Entrypoint, ExitOutcome};
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

/// Poll interval used by the default `wait`
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub type OutputPipe = Box<dyn Read + Send>;

/// A launched, confined process
pub trait IsolationHandle: Send {
    /// Provider-specific identifier (container id, pid, ...)
    fn id(&self) -> &str;

    fn take_stdout(&mut self) -> Option<OutputPipe>;

    fn take_stderr(&mut self) -> Option<OutputPipe>;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> Result<Option<ExitOutcome>>;

    /// Wait until the process exits or `timeout` elapses.
    /// Returns `None` when the timeout elapsed first.
    fn wait(&mut self, timeout: Duration) -> Result<Option<ExitOutcome>> {
        let start = Instant::now();
        loop {
            if let Some(outcome) = self.try_wait()? {
                return Ok(Some(outcome));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Ask the process to stop (SIGTERM-equivalent). Returns within `budget`.
    fn terminate(&mut self, budget: Duration) -> Result<()>;

    /// Stop the process unconditionally (SIGKILL-equivalent). Returns within
    /// `budget`; whatever could not be confirmed by then is left to the
    /// provider's background cleanup.
    fn kill(&mut self, budget: Duration) -> Result<()>;

    /// Peak memory observed for the process, if the provider can tell
    fn peak_memory(&self) -> Option<u64> {
        None
    }
}

/// Capability trait over a runtime able to launch confined processes
pub trait IsolationProvider: Send + Sync + 'static {
    type Handle: IsolationHandle;

    fn name(&self) -> &str;

    /// Verify the runtime is reachable and `image` is available locally
    fn probe(&self, image: &str) -> Result<()>;

    /// Launch `entrypoint` confined by `profile` with `workspace` mounted at
    /// the profile's work dir.
    ///
    /// Errors: `IsolationUnavailable` when the runtime cannot be reached,
    /// `PolicyRefused` when the profile cannot be enforced, `LaunchFailed`
    /// for any other creation failure.
    fn launch(
        &self,
        workspace: &Path,
        profile: &PolicyProfile,
        entrypoint: &Entrypoint,
    ) -> Result<Self::Handle>;

    /// Remove confined processes left behind by engines that are no longer alive
    fn reap_orphans(&self) -> Result<usize> {
        Ok(0)
    }

    /// Wait up to `timeout` for teardown queued in the background.
    /// Returns false if work is still pending.
    fn wait_idle(&self, _timeout: Duration) -> bool {
        true
    }
}
