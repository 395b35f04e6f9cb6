//! End-to-end engine lifecycle tests against the local-process provider.
//!
//! These cover workspaces, deadlines, escalation, classification and audit
//! without needing a container runtime.

mod support;

use codebox::observability::audit::{sha256_hex, verify_chain};
use codebox::{
    CancelToken, Engine, ExecutionRequest, PolicyOverrides, PolicySelector, SandboxError,
    StatusKind, SupervisorState, TerminationReason,
};
use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};
use support::{audit_lines, live_workspaces, local_engine, local_engine_with, UnavailableProvider};

fn sh(code: &str) -> ExecutionRequest {
    ExecutionRequest::new(code, "sh", PolicySelector::named("default"))
}

#[test]
fn test_success_captures_output_and_cleans_up() {
    let t = local_engine();
    let request = sh("echo hello; echo oops >&2");
    let result = t.engine.execute(&request, &CancelToken::new()).unwrap();

    assert_eq!(result.status_kind, StatusKind::Success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "oops\n");
    assert_eq!(result.request_id, request.id());
    assert_eq!(result.final_state, SupervisorState::Completed);
    assert_eq!(live_workspaces(t.engine.workspace_dir()), 0);
}

#[test]
fn test_non_zero_exit() {
    let t = local_engine();
    let result = t.engine.execute(&sh("exit 3"), &CancelToken::new()).unwrap();
    assert_eq!(result.status_kind, StatusKind::NonZeroExit);
    assert_eq!(result.exit_code, Some(3));
    assert!(!result.success());
}

#[test]
fn test_crash_signal_is_classified_as_crash() {
    let t = local_engine();
    let result = t
        .engine
        .execute(&sh("kill -SEGV $$"), &CancelToken::new())
        .unwrap();
    assert_eq!(result.status_kind, StatusKind::Crashed);
    assert_eq!(result.signal, Some(libc::SIGSEGV));
}

#[test]
fn test_deadline_is_enforced_even_when_term_is_ignored() {
    let t = local_engine();
    let deadline = Duration::from_millis(300);
    let request = sh("trap '' TERM; echo started; sleep 30").with_deadline(deadline);

    let start = Instant::now();
    let result = t.engine.execute(&request, &CancelToken::new()).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(result.status_kind, StatusKind::Timeout);
    assert_eq!(result.termination_reason, TerminationReason::DeadlineExceeded);
    assert_eq!(result.final_state, SupervisorState::TimedOut);
    assert!(result.stdout.starts_with("started"));
    let grace = t.engine.config().kill_grace();
    assert!(result.wall_clock_ms < (deadline + grace).as_millis() as u64);
    // Workspace setup and the audit write on top of the run
    assert!(elapsed < deadline + grace + Duration::from_millis(150), "took {:?}", elapsed);
    assert_eq!(live_workspaces(t.engine.workspace_dir()), 0);
}

#[test]
fn test_output_is_truncated_at_budget() {
    let t = local_engine();
    let request = sh("head -c 20000 /dev/zero | tr '\\0' a");
    let result = t.engine.execute(&request, &CancelToken::new()).unwrap();

    assert_eq!(result.status_kind, StatusKind::Success);
    assert!(result.stdout_truncated);
    assert!(!result.stderr_truncated);
    assert!(result.stdout.starts_with(&"a".repeat(4096)));
    assert!(result.stdout.contains("output truncated"));
}

#[test]
fn test_cancellation_kills_running_process() {
    let t = local_engine();
    let cancel = CancelToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        })
    };

    let start = Instant::now();
    let result = t.engine.execute(&sh("sleep 30"), &cancel).unwrap();
    canceller.join().unwrap();

    // Classified like any enforcement kill; the reason tells it apart
    assert_eq!(result.status_kind, StatusKind::Timeout);
    assert_eq!(result.termination_reason, TerminationReason::Cancelled);
    assert_eq!(result.final_state, SupervisorState::Killed);
    assert!(start.elapsed() < Duration::from_millis(200) + t.engine.config().kill_grace() * 2);
}

#[test]
fn test_cancellation_while_queued_for_a_slot() {
    let t = local_engine_with(|config| config.pool_size = 1);
    let engine = &t.engine;
    let cancel = CancelToken::new();

    thread::scope(|scope| {
        let busy = scope.spawn(|| engine.execute(&sh("sleep 1"), &CancelToken::new()));
        while engine.pool().in_flight() == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        let queued = scope.spawn(|| engine.execute(&sh("echo never"), &cancel));
        thread::sleep(Duration::from_millis(100));
        let cancelled_at = Instant::now();
        cancel.cancel();

        let result = queued.join().unwrap().unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_millis(300));
        assert_eq!(result.status_kind, StatusKind::Timeout);
        assert_eq!(result.termination_reason, TerminationReason::Cancelled);
        assert_eq!(result.final_state, SupervisorState::Killed);
        assert!(result.stdout.is_empty());
        // Still waiting on the first request
        assert_eq!(engine.pool().in_flight(), 1);

        assert!(busy.join().unwrap().unwrap().success());
    });

    assert_eq!(audit_lines(t.engine.audit_path()).len(), 2);
    assert_eq!(live_workspaces(t.engine.workspace_dir()), 0);
}

#[test]
fn test_restart_reclaims_workspaces_left_under_a_reused_pid() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir
        .path()
        .join("workspaces")
        .join(format!("engine-{}", std::process::id()))
        .join("ws-stale");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("main.py"), b"print(1)").unwrap();

    let engine = Engine::new(support::test_config(dir.path()), support::LocalProvider).unwrap();
    assert!(!stale.exists());
    assert_ne!(engine.workspace_dir(), stale.parent().unwrap());
    let result = engine.execute(&sh("echo fresh"), &CancelToken::new()).unwrap();
    assert_eq!(result.stdout, "fresh\n");
}

#[test]
fn test_one_audit_record_per_request_with_artifact_hash() {
    let t = local_engine();
    let code = "echo audited";
    let request = sh(code);
    t.engine.execute(&request, &CancelToken::new()).unwrap();

    let lines = audit_lines(t.engine.audit_path());
    assert_eq!(lines.len(), 1);
    let record = &lines[0];
    assert_eq!(record["request_id"], request.id());
    assert_eq!(record["artifact_sha256"], sha256_hex(code.as_bytes()));
    assert_eq!(record["status_kind"], "success");
    assert_eq!(record["policy_name"], "default");
    // Content is not retained unless configured
    assert!(record["code"].is_null());
    assert!(record["stdout"].is_null());

    assert!(verify_chain(t.engine.audit_path()).unwrap().is_intact());
}

#[test]
fn test_rejected_request_is_audited() {
    let t = local_engine();
    let request = ExecutionRequest::new("echo hi", "sh", PolicySelector::named("missing"));
    let err = t.engine.execute(&request, &CancelToken::new()).unwrap_err();

    assert!(matches!(err, SandboxError::InvalidPolicy { .. }));
    assert_eq!(err.status_kind(), StatusKind::PolicyViolation);

    let lines = audit_lines(t.engine.audit_path());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["status_kind"], "policy_violation");
    assert!(lines[0]["error"].as_str().unwrap().contains("missing"));
}

#[test]
fn test_loosening_override_is_rejected_before_launch() {
    let t = local_engine();
    let selector = PolicySelector::Inline {
        base: "default".to_string(),
        overrides: PolicyOverrides {
            memory_limit: Some(u64::MAX),
            ..PolicyOverrides::default()
        },
    };
    let request = ExecutionRequest::new("echo hi", "sh", selector);
    let err = t.engine.execute(&request, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, SandboxError::InvalidPolicy { .. }));
    assert_eq!(live_workspaces(t.engine.workspace_dir()), 0);
}

#[test]
fn test_unknown_runtime_and_excessive_deadline_are_rejected() {
    let t = local_engine();
    let request = ExecutionRequest::new("x", "cobol", PolicySelector::named("default"));
    assert!(t.engine.execute(&request, &CancelToken::new()).is_err());

    let request = sh("echo hi").with_deadline(Duration::from_secs(3600));
    let err = t.engine.execute(&request, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, SandboxError::InvalidRequest(_)));

    assert_eq!(audit_lines(t.engine.audit_path()).len(), 2);
}

#[test]
fn test_unavailable_runtime_is_infrastructure_failure() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(support::test_config(dir.path()), UnavailableProvider).unwrap();

    let err = engine
        .execute(&sh("echo hi"), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, SandboxError::IsolationUnavailable(_)));
    assert_eq!(err.status_kind(), StatusKind::InfrastructureFailure);
    assert!(engine.check(Some("sh")).is_err());

    let lines = audit_lines(engine.audit_path());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["status_kind"], "infrastructure_failure");
    // Resolution succeeded, so the record names the policy
    assert_eq!(lines[0]["policy_name"], "default");
    assert_eq!(live_workspaces(engine.workspace_dir()), 0);
}

#[test]
fn test_policy_resolution_is_idempotent() {
    let t = local_engine();
    let selector = PolicySelector::named("default");
    let first = t.engine.resolver().resolve(&selector).unwrap();
    let second = t.engine.resolver().resolve(&selector).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.fingerprint(), second.fingerprint());
}

#[test]
fn test_concurrent_requests_get_isolated_workspaces() {
    let t = local_engine_with(|config| config.pool_size = 4);
    let engine = &t.engine;
    let pool_size = engine.pool().size();

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..50)
            .map(|_| scope.spawn(move || engine.execute(&sh("pwd; sleep 0.05"), &CancelToken::new())))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut dirs = HashSet::new();
    for result in results {
        let result = result.unwrap();
        assert_eq!(result.status_kind, StatusKind::Success);
        assert!(dirs.insert(result.stdout.trim().to_string()));
    }
    assert_eq!(dirs.len(), 50);
    assert!(engine.pool().high_water() <= pool_size);
    assert_eq!(engine.pool().in_flight(), 0);
    assert_eq!(live_workspaces(engine.workspace_dir()), 0);

    let report = verify_chain(engine.audit_path()).unwrap();
    assert_eq!(report.records, 50);
    assert!(report.is_intact());
}

#[test]
fn test_retained_content_lands_in_audit() {
    let t = local_engine_with(|config| config.audit.retain_content = true);
    t.engine.execute(&sh("echo kept"), &CancelToken::new()).unwrap();

    let lines = audit_lines(t.engine.audit_path());
    assert_eq!(lines[0]["code"], "echo kept");
    assert_eq!(lines[0]["stdout"], "kept\n");
}
