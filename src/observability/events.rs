/// Security event logging
///
/// Operational events that matter for incident response (network opt-ins,
/// forced kills, cleanup failures, audit persistence problems). Each event is
/// emitted through the `log` facade at a level matching its severity and, when
/// a security logger has been initialised, appended as one JSON line to its file.
use crate::config::types::{NetworkMode, Result, SandboxError};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SecurityEventType {
    NetworkOptIn,
    CapabilityOptIn,
    WritableRoot,
    PolicyRefused,
    InfrastructureFailure,
    GracefulKill,
    ForcedKill,
    CleanupWarning,
    CleanupFailure,
    OrphanReclaimed,
    AuditWriteFailed,
}

impl SecurityEventType {
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::NetworkOptIn => SecuritySeverity::Medium,
            SecurityEventType::CapabilityOptIn => SecuritySeverity::Medium,
            SecurityEventType::WritableRoot => SecuritySeverity::Medium,
            SecurityEventType::PolicyRefused => SecuritySeverity::High,
            SecurityEventType::InfrastructureFailure => SecuritySeverity::High,
            SecurityEventType::GracefulKill => SecuritySeverity::Low,
            SecurityEventType::ForcedKill => SecuritySeverity::High,
            SecurityEventType::CleanupWarning => SecuritySeverity::Medium,
            SecurityEventType::CleanupFailure => SecuritySeverity::Critical,
            SecurityEventType::OrphanReclaimed => SecuritySeverity::Low,
            SecurityEventType::AuditWriteFailed => SecuritySeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    pub request_id: Option<String>,
    pub policy: Option<String>,
    pub process_id: u32,
}

impl SecurityEvent {
    /// Create an event with the type's default severity
    pub fn new(event_type: SecurityEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details: details.into(),
            request_id: None,
            policy: None,
            process_id: std::process::id(),
        }
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn with_policy(mut self, policy: &str) -> Self {
        self.policy = Some(policy.to_string());
        self
    }

    pub fn with_severity(mut self, severity: SecuritySeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// File sink for security events
pub struct SecurityLogger {
    file: Mutex<File>,
    path: PathBuf,
}

impl SecurityLogger {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Config(format!("Failed to create security log directory: {}", e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| SandboxError::Config(format!("Failed to open security log: {}", e)))?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &SecurityEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize security event: {}", e);
                return;
            }
        };
        match self.file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                    error!("Failed to write security log {}: {}", self.path.display(), e);
                }
            }
            Err(_) => error!("Security log lock poisoned"),
        }
    }
}

static SECURITY_LOGGER: OnceLock<SecurityLogger> = OnceLock::new();

/// Install the global file sink. Later calls are ignored with a warning.
pub fn init_security_logger(path: &Path) -> Result<()> {
    let logger = SecurityLogger::new(path)?;
    if SECURITY_LOGGER.set(logger).is_err() {
        warn!("Security logger already initialized");
    } else {
        info!("Security events appended to {}", path.display());
    }
    Ok(())
}

pub fn log_security_event(event: SecurityEvent) {
    let scope = event.request_id.as_deref().unwrap_or("-");
    match event.severity {
        SecuritySeverity::Critical => {
            error!("SECURITY CRITICAL: {:?} [{}] - {}", event.event_type, scope, event.details)
        }
        SecuritySeverity::High => {
            error!("SECURITY HIGH: {:?} [{}] - {}", event.event_type, scope, event.details)
        }
        SecuritySeverity::Medium => {
            warn!("SECURITY MEDIUM: {:?} [{}] - {}", event.event_type, scope, event.details)
        }
        SecuritySeverity::Low => {
            info!("SECURITY LOW: {:?} [{}] - {}", event.event_type, scope, event.details)
        }
    }

    if let Some(logger) = SECURITY_LOGGER.get() {
        logger.append(&event);
    }
}

pub fn network_opt_in(policy: &str, mode: NetworkMode) {
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::NetworkOptIn,
            format!("policy resolved with network mode '{}'", mode),
        )
        .with_policy(policy),
    );
}

pub fn capability_opt_in(policy: &str, capabilities: &BTreeSet<String>) {
    let caps: Vec<&str> = capabilities.iter().map(String::as_str).collect();
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::CapabilityOptIn,
            format!("policy resolved with added capabilities: {}", caps.join(",")),
        )
        .with_policy(policy),
    );
}

pub fn writable_root(policy: &str) {
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::WritableRoot,
            "policy resolved with a writable root filesystem",
        )
        .with_policy(policy),
    );
}

pub fn policy_refused(request_id: &str, policy: &str, detail: &str) {
    log_security_event(
        SecurityEvent::new(SecurityEventType::PolicyRefused, detail)
            .with_request_id(request_id)
            .with_policy(policy),
    );
}

pub fn infrastructure_failure(request_id: &str, detail: &str) {
    log_security_event(
        SecurityEvent::new(SecurityEventType::InfrastructureFailure, detail)
            .with_request_id(request_id),
    );
}

pub fn graceful_kill(request_id: &str, reason: &str) {
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::GracefulKill,
            format!("graceful termination requested: {}", reason),
        )
        .with_request_id(request_id),
    );
}

pub fn forced_kill(request_id: &str, reason: &str) {
    log_security_event(
        SecurityEvent::new(SecurityEventType::ForcedKill, format!("forced kill: {}", reason))
            .with_request_id(request_id),
    );
}

pub fn cleanup_warning(request_id: &str, path: &Path, reason: &str) {
    log_security_event(
        SecurityEvent::new(
            SecurityEventType::CleanupWarning,
            format!("workspace {} not removed: {}", path.display(), reason),
        )
        .with_request_id(request_id),
    );
}

pub fn cleanup_failure(path: &Path, attempts: u32, reason: &str) {
    log_security_event(SecurityEvent::new(
        SecurityEventType::CleanupFailure,
        format!(
            "workspace {} still present after {} attempts: {}",
            path.display(),
            attempts,
            reason
        ),
    ));
}

pub fn container_removal_failed(container: &str, attempts: u32, reason: &str) {
    log_security_event(SecurityEvent::new(
        SecurityEventType::CleanupFailure,
        format!(
            "container {} still present after {} removal attempts: {}",
            container, attempts, reason
        ),
    ));
}

pub fn orphan_reclaimed(details: String) {
    log_security_event(SecurityEvent::new(SecurityEventType::OrphanReclaimed, details));
}

pub fn audit_write_failed(request_id: &str, reason: &str) {
    log_security_event(
        SecurityEvent::new(SecurityEventType::AuditWriteFailed, reason)
            .with_request_id(request_id),
    );
}
