/// Core types and structures for the codebox engine
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Network exposure of a confined process
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NetworkMode {
    /// Fully isolated network namespace (no interfaces besides loopback)
    #[default]
    #[serde(rename = "none")]
    None,
    /// Attached to an operator-defined restricted network
    #[serde(rename = "restricted")]
    Restricted,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::None => write!(f, "none"),
            NetworkMode::Restricted => write!(f, "restricted"),
        }
    }
}

/// Mount access mode
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MountMode {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

/// Where a mount's content comes from on the host
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum MountSource {
    /// The per-request ephemeral workspace
    Workspace,
    /// A fixed host path whitelisted by a named policy
    Host(PathBuf),
}

/// One entry of a resolved mount list
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MountSpec {
    pub source: MountSource,
    pub container_path: PathBuf,
    pub mode: MountMode,
}

impl MountSpec {
    pub fn is_workspace(&self) -> bool {
        matches!(self.source, MountSource::Workspace)
    }
}

/// Per-request tightening of a named policy.
/// Every value must be lower than or equal to the base policy's value.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub memory_limit: Option<u64>,
    #[serde(default)]
    pub cpu_quota: Option<f64>,
    #[serde(default)]
    pub pid_limit: Option<u32>,
    #[serde(default)]
    pub tmp_size: Option<u64>,
}

/// How a request names its security policy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicySelector {
    Named { name: String },
    Inline { base: String, overrides: PolicyOverrides },
}

impl PolicySelector {
    pub fn named(name: impl Into<String>) -> Self {
        PolicySelector::Named { name: name.into() }
    }

    /// Name of the configured policy this selector starts from
    pub fn base_name(&self) -> &str {
        match self {
            PolicySelector::Named { name } => name,
            PolicySelector::Inline { base, .. } => base,
        }
    }
}

/// A single execution request. Immutable once handed to the engine.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    id: String,
    code: Vec<u8>,
    runtime: String,
    policy: PolicySelector,
    deadline: Option<Duration>,
}

impl ExecutionRequest {
    /// Create a request with a fresh random id and the configured default deadline
    pub fn new(code: impl Into<Vec<u8>>, runtime: impl Into<String>, policy: PolicySelector) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code: code.into(),
            runtime: runtime.into(),
            policy,
            deadline: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub fn policy(&self) -> &PolicySelector {
        &self.policy
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }
}

/// Classified outcome of one execution - closed set
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StatusKind {
    /// Exit code 0 within the deadline
    #[serde(rename = "success")]
    Success,
    /// Clean exit with a non-zero code
    #[serde(rename = "non_zero_exit")]
    NonZeroExit,
    /// The engine killed the process: deadline elapsed, or the caller
    /// cancelled (`termination_reason` tells which)
    #[serde(rename = "timeout")]
    Timeout,
    /// The isolation provider refused the launch because of the policy
    #[serde(rename = "policy_violation")]
    PolicyViolation,
    /// Isolation runtime unavailable or launch failed
    #[serde(rename = "infrastructure_failure")]
    InfrastructureFailure,
    /// Terminated by a crash-class signal
    #[serde(rename = "crashed")]
    Crashed,
}

impl StatusKind {
    pub fn is_success(&self) -> bool {
        matches!(self, StatusKind::Success)
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusKind::Success => "success",
            StatusKind::NonZeroExit => "non_zero_exit",
            StatusKind::Timeout => "timeout",
            StatusKind::PolicyViolation => "policy_violation",
            StatusKind::InfrastructureFailure => "infrastructure_failure",
            StatusKind::Crashed => "crashed",
        };
        write!(f, "{}", name)
    }
}

/// Why the supervised process stopped
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    /// Process exited on its own
    Exited,
    /// Process was terminated by a signal it did not get from the engine
    Signaled { signal: i32 },
    /// Engine killed the process at the deadline
    DeadlineExceeded,
    /// Engine killed the process on caller request
    Cancelled,
    /// Provider refused the profile before anything ran
    PolicyRefused { detail: String },
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Exited => write!(f, "exited"),
            TerminationReason::Signaled { signal } => write!(f, "signaled({})", signal),
            TerminationReason::DeadlineExceeded => write!(f, "deadline_exceeded"),
            TerminationReason::Cancelled => write!(f, "cancelled"),
            TerminationReason::PolicyRefused { detail } => write!(f, "policy_refused: {}", detail),
        }
    }
}

/// Supervisor lifecycle states
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    #[serde(rename = "created")]
    Created,
    #[serde(rename = "launching")]
    Launching,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "timed_out")]
    TimedOut,
    #[serde(rename = "killed")]
    Killed,
    #[serde(rename = "launch_failed")]
    LaunchFailed,
    #[serde(rename = "crashed")]
    Crashed,
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupervisorState::Completed
                | SupervisorState::TimedOut
                | SupervisorState::Killed
                | SupervisorState::LaunchFailed
                | SupervisorState::Crashed
        )
    }

    /// Legal edges of the lifecycle graph
    pub fn can_transition_to(&self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        match (self, next) {
            (Created, Launching) => true,
            (Launching, Running) | (Launching, LaunchFailed) => true,
            // cancellation observed before the handle is running
            (Launching, Killed) => true,
            (Running, Completed) | (Running, TimedOut) | (Running, Killed) | (Running, Crashed) => {
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SupervisorState::Created => "created",
            SupervisorState::Launching => "launching",
            SupervisorState::Running => "running",
            SupervisorState::Completed => "completed",
            SupervisorState::TimedOut => "timed_out",
            SupervisorState::Killed => "killed",
            SupervisorState::LaunchFailed => "launch_failed",
            SupervisorState::Crashed => "crashed",
        };
        write!(f, "{}", name)
    }
}

/// Result returned to the caller for every execution that reached a terminal state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Id of the originating request
    pub request_id: String,
    /// Classified outcome
    pub status_kind: StatusKind,
    /// Exit code, if the process exited on its own
    pub exit_code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    /// Captured stdout, capped at the per-stream budget
    pub stdout: String,
    /// Captured stderr, capped at the per-stream budget
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Wall-clock time from launch to terminal state
    pub wall_clock_ms: u64,
    pub termination_reason: TerminationReason,
    /// Terminal supervisor state
    pub final_state: SupervisorState,
    /// Peak memory of the confined process, when the provider can observe it
    pub peak_memory_bytes: Option<u64>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status_kind.is_success()
    }
}

/// Custom error types for codebox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid policy '{policy}': {reason}")]
    InvalidPolicy { policy: String, reason: String },

    #[error("Workspace creation failed: {0}")]
    WorkspaceCreateFailed(String),

    #[error("Workspace cleanup failed for {path}: {reason}")]
    WorkspaceCleanupFailed { path: PathBuf, reason: String },

    #[error("Isolation runtime unavailable: {0}")]
    IsolationUnavailable(String),

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Isolation provider refused policy: {0}")]
    PolicyRefused(String),

    #[error("Process control error: {0}")]
    Process(String),

    #[error("Audit write failed: {0}")]
    AuditWriteFailed(String),
}

impl SandboxError {
    pub(crate) fn invalid_policy(policy: &str, reason: impl Into<String>) -> Self {
        SandboxError::InvalidPolicy {
            policy: policy.to_string(),
            reason: reason.into(),
        }
    }

    /// Classification of a request-level failure for callers and the audit log
    pub fn status_kind(&self) -> StatusKind {
        match self {
            SandboxError::InvalidPolicy { .. }
            | SandboxError::InvalidRequest(_)
            | SandboxError::PolicyRefused(_) => StatusKind::PolicyViolation,
            _ => StatusKind::InfrastructureFailure,
        }
    }

    /// Stable short name used in audit records
    pub fn kind_name(&self) -> &'static str {
        match self {
            SandboxError::Io(_) => "io",
            SandboxError::Config(_) => "config",
            SandboxError::InvalidRequest(_) => "invalid_request",
            SandboxError::InvalidPolicy { .. } => "invalid_policy",
            SandboxError::WorkspaceCreateFailed(_) => "workspace_create_failed",
            SandboxError::WorkspaceCleanupFailed { .. } => "workspace_cleanup_failed",
            SandboxError::IsolationUnavailable(_) => "isolation_unavailable",
            SandboxError::LaunchFailed(_) => "launch_failed",
            SandboxError::PolicyRefused(_) => "policy_refused",
            SandboxError::Process(_) => "process",
            SandboxError::AuditWriteFailed(_) => "audit_write_failed",
        }
    }
}

/// Result type alias for codebox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
