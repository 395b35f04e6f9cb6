//! Container provider lifecycle against a scripted stand-in for the runtime
//! CLI: launch, exit detection, escalation when the runtime misbehaves, and
//! reclamation after an engine restart.

mod support;

use codebox::safety::instance::EngineInstance;
use codebox::{CancelToken, ExecutionRequest, PolicySelector, SandboxError, StatusKind};
use codebox::{SupervisorState, TerminationReason};
use std::fs;
use std::time::{Duration, Instant};
use support::{audit_lines, container_engine_with, fake_runtime_engine, FakeRuntime};

const IGNORES_TERM: &str = "echo started; trap '' TERM; exec sleep 30";
const DEADLINE: Duration = Duration::from_millis(300);
const GRACE_MS: u64 = 1_000;

fn sh(code: &str) -> ExecutionRequest {
    ExecutionRequest::new(code, "sh", PolicySelector::named("default"))
}

fn single_container(runtime: &FakeRuntime) -> String {
    let containers = runtime.containers();
    assert_eq!(containers.len(), 1, "{:?}", containers);
    containers[0].clone()
}

#[test]
fn test_exit_code_and_streams_come_from_the_runtime() {
    let (t, runtime) = container_engine_with(|_| {});
    let result = t
        .engine
        .execute(&sh("echo hello; echo oops >&2; exit 3"), &CancelToken::new())
        .unwrap();

    assert_eq!(result.status_kind, StatusKind::NonZeroExit);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "oops\n");

    let name = single_container(&runtime);
    assert!(runtime.called(&format!("start {}", name)));
    assert!(runtime.called(&format!("logs --follow {}", name)));
    assert!(runtime.called(&format!("wait {}", name)));

    // Stopped containers are removed off the result path
    assert!(t.engine.wait_idle(Duration::from_secs(5)));
    assert!(runtime.removed(&name));
}

#[test]
fn test_image_is_checked_once_per_image() {
    let (t, runtime) = container_engine_with(|_| {});
    for _ in 0..3 {
        let result = t.engine.execute(&sh("exit 0"), &CancelToken::new()).unwrap();
        assert_eq!(result.status_kind, StatusKind::Success);
    }
    assert_eq!(runtime.count("image inspect"), 1);
    assert_eq!(runtime.count("create"), 3);
}

#[test]
fn test_deadline_with_ignored_term_stays_within_grace() {
    let (t, runtime) = container_engine_with(|c| c.kill_grace_ms = GRACE_MS);
    let grace = Duration::from_millis(GRACE_MS);

    let start = Instant::now();
    let result = t
        .engine
        .execute(&sh(IGNORES_TERM).with_deadline(DEADLINE), &CancelToken::new())
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(result.status_kind, StatusKind::Timeout);
    assert_eq!(result.termination_reason, TerminationReason::DeadlineExceeded);
    assert_eq!(result.final_state, SupervisorState::TimedOut);
    assert!(result.stdout.starts_with("started"), "{:?}", result.stdout);
    assert!(result.wall_clock_ms < (DEADLINE + grace).as_millis() as u64);
    // Launch needs a handful of runtime calls on top of the run itself
    assert!(elapsed < DEADLINE + grace + Duration::from_millis(300), "took {:?}", elapsed);

    let name = single_container(&runtime);
    assert!(runtime.called(&format!("kill --signal SIGTERM {}", name)));
    assert!(runtime.called(&format!("kill {}", name)));
    assert!(!runtime.running(&name));
}

#[test]
fn test_refused_kill_falls_back_to_forced_removal() {
    let (t, runtime) = container_engine_with(|c| c.kill_grace_ms = GRACE_MS);
    runtime.set_mode("killfails");

    let result = t
        .engine
        .execute(&sh(IGNORES_TERM).with_deadline(DEADLINE), &CancelToken::new())
        .unwrap();

    assert_eq!(result.status_kind, StatusKind::Timeout);
    let name = single_container(&runtime);
    assert!(runtime.called(&format!("kill {}", name)));
    assert!(runtime.called(&format!("rm --force {}", name)));
    assert!(runtime.removed(&name));
    assert!(!runtime.running(&name));
}

#[test]
fn test_hung_runtime_cannot_stretch_the_grace_period() {
    let (t, runtime) = container_engine_with(|c| c.kill_grace_ms = GRACE_MS);
    runtime.set_mode("killhangs");
    let grace = Duration::from_millis(GRACE_MS);

    let start = Instant::now();
    let result = t
        .engine
        .execute(&sh(IGNORES_TERM).with_deadline(DEADLINE), &CancelToken::new())
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(result.status_kind, StatusKind::Timeout);
    assert!(result.wall_clock_ms < (DEADLINE + grace).as_millis() as u64);
    assert!(elapsed < DEADLINE + grace + Duration::from_millis(300), "took {:?}", elapsed);

    // The hanging kill client was cut loose and removal took over
    let name = single_container(&runtime);
    assert!(runtime.called(&format!("rm --force {}", name)));
    assert!(!runtime.running(&name));
}

#[test]
fn test_start_failure_is_a_launch_failure() {
    let (t, runtime) = container_engine_with(|_| {});
    runtime.set_mode("nostart");

    let err = t
        .engine
        .execute(&sh("echo never"), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, SandboxError::LaunchFailed(_)), "{:?}", err);
    assert_eq!(err.status_kind(), StatusKind::InfrastructureFailure);

    // Never followed, so never counted as running
    let name = single_container(&runtime);
    assert_eq!(runtime.count("logs"), 0);
    assert_eq!(runtime.count("wait"), 0);
    assert!(t.engine.wait_idle(Duration::from_secs(5)));
    assert!(runtime.removed(&name));

    let lines = audit_lines(t.engine.audit_path());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["status_kind"], "infrastructure_failure");
}

#[test]
fn test_missing_image_is_unavailable_before_create() {
    let (t, runtime) = container_engine_with(|_| {});
    runtime.set_mode("noimage");

    let err = t
        .engine
        .execute(&sh("echo never"), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, SandboxError::IsolationUnavailable(_)), "{:?}", err);
    assert_eq!(runtime.count("create"), 0);
    assert!(t.engine.check(Some("sh")).is_err());
}

#[test]
fn test_restart_reclaims_leftovers_of_a_previous_engine_with_the_same_pid() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = FakeRuntime::install(dir.path());

    // An engine that crashed in an earlier process which had this pid
    let stale = dir
        .path()
        .join("workspaces")
        .join(format!("engine-{}", std::process::id()))
        .join("ws-stale");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("main.py"), b"print('left behind')").unwrap();

    let live = EngineInstance::current();
    runtime.set_listing(&format!(
        "c0ffee 4999999-1-abcd\nbeef00 {}\nfeed00 <no value>\n",
        live.label()
    ));

    let t = fake_runtime_engine(dir, &runtime, |_| {});

    assert!(!stale.exists());
    assert!(runtime.called("rm --force c0ffee"));
    assert!(runtime.called("rm --force feed00"));
    // Containers of an engine that is still alive are left alone
    assert!(!runtime.called("rm --force beef00"));
    assert!(t.engine.workspace_dir().exists());
}
