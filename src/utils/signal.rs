/// Async-safe shutdown signal handling for the CLI
///
/// The handler only stores into atomics. A watcher thread turns the flag into
/// a cancelled [`CancelToken`] so in-flight executions are torn down through
/// the normal escalation path.
use crate::config::types::{Result, SandboxError};
use crate::core::types::CancelToken;
use log::{info, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

const WATCH_INTERVAL: Duration = Duration::from_millis(50);

extern "C" fn on_signal(signal: libc::c_int) {
    SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers. Call before spawning worker threads.
pub fn install_shutdown_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    // SAFETY: the handler only touches atomics.
    unsafe {
        signal::sigaction(Signal::SIGINT, &action)
            .map_err(|e| SandboxError::Process(format!("Failed to install SIGINT handler: {}", e)))?;
        signal::sigaction(Signal::SIGTERM, &action).map_err(|e| {
            SandboxError::Process(format!("Failed to install SIGTERM handler: {}", e))
        })?;
    }

    info!("Signal handlers installed (SIGINT, SIGTERM)");
    Ok(())
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Signal number last received, 0 if none
pub fn received_signal() -> i32 {
    SIGNAL_RECEIVED.load(Ordering::SeqCst)
}

/// Cancel `token` once a shutdown signal arrives. The watcher exits after
/// cancelling, or when the token is cancelled by someone else.
pub fn cancel_on_shutdown(token: CancelToken) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        if token.is_cancelled() {
            return;
        }
        if shutdown_requested() {
            warn!(
                "Received signal {}, cancelling in-flight execution",
                received_signal()
            );
            token.cancel();
            return;
        }
        thread::sleep(WATCH_INTERVAL);
    })
}
