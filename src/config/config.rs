/// Engine configuration loading from a JSON file
use crate::config::presets::RuntimePreset;
use crate::config::types::{NetworkMode, Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Absolute per-execution ceilings configured for the host.
/// Policies may only tighten these, never loosen them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostCeilings {
    pub memory_limit: u64,
    pub cpu_quota: f64,
    pub pid_limit: u32,
    pub tmp_size: u64,
}

impl Default for HostCeilings {
    fn default() -> Self {
        Self {
            memory_limit: 512 * MIB,
            cpu_quota: 1.0,
            pid_limit: 128,
            tmp_size: 64 * MIB,
        }
    }
}

/// Resources the whole engine may consume concurrently
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostBudget {
    pub memory_bytes: u64,
    pub cpus: f64,
}

impl Default for HostBudget {
    fn default() -> Self {
        Self {
            memory_bytes: 4096 * MIB,
            cpus: 4.0,
        }
    }
}

/// A host directory a policy exposes read-only (e.g. an interpreter cache)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadOnlyMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
}

/// Named policy template as written by the operator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyTemplate {
    pub network_mode: NetworkMode,
    /// Explicit opt-in required for any network mode other than `none`
    pub network_allowed: bool,
    pub capabilities: BTreeSet<String>,
    /// Explicit opt-in required for a non-empty capability set
    pub capabilities_allowed: bool,
    pub read_only_root: bool,
    pub tmp_size: u64,
    pub pid_limit: u32,
    pub memory_limit: u64,
    pub cpu_quota: f64,
    pub run_as_user: u32,
    pub run_as_group: u32,
    /// Container path of the workspace mount
    pub work_dir: PathBuf,
    /// Additional whitelisted mounts; always read-only
    pub readonly_mounts: Vec<ReadOnlyMount>,
}

impl Default for PolicyTemplate {
    fn default() -> Self {
        Self {
            network_mode: NetworkMode::None,
            network_allowed: false,
            capabilities: BTreeSet::new(),
            capabilities_allowed: false,
            read_only_root: true,
            tmp_size: 64 * MIB,
            pid_limit: 64,
            memory_limit: 256 * MIB,
            cpu_quota: 0.5,
            run_as_user: 9999,
            run_as_group: 9999,
            work_dir: PathBuf::from("/work"),
            readonly_mounts: Vec::new(),
        }
    }
}

/// Container runtime selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Runtime CLI: `docker` or `podman`
    pub binary: String,
    /// Network attached for `restricted` policies; refused when unset
    pub restricted_network: Option<String>,
    /// Upper bound for probe, create, start and background removal calls.
    /// Kill and terminate calls are bounded by the kill grace instead.
    pub control_timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            restricted_network: None,
            control_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    /// Append-only JSON-lines destination
    pub path: PathBuf,
    /// Longest the result path waits for a record to be persisted
    pub timeout_ms: u64,
    /// Keep raw code and output in records. Off unless explicitly set.
    pub retain_content: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: EngineConfig::runtime_root_dir().join("audit.jsonl"),
            timeout_ms: 2_000,
            retain_content: false,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub ceilings: HostCeilings,
    pub host_budget: HostBudget,
    /// Upper bound on concurrent executions before budget capping
    pub pool_size: usize,
    pub policies: BTreeMap<String, PolicyTemplate>,
    pub runtimes: BTreeMap<String, RuntimePreset>,
    /// Capture budget per stream
    pub output_limit_bytes: usize,
    pub default_deadline_ms: u64,
    pub max_deadline_ms: u64,
    /// Time between graceful termination and the end of forced kill confirmation
    pub kill_grace_ms: u64,
    pub workspace_root: PathBuf,
    /// Attempts the background reaper makes for a workspace that failed to delete
    pub cleanup_retry_attempts: u32,
    pub audit: AuditConfig,
    pub provider: ProviderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut policies = BTreeMap::new();
        policies.insert("default".to_string(), PolicyTemplate::default());

        Self {
            ceilings: HostCeilings::default(),
            host_budget: HostBudget::default(),
            pool_size: 4,
            policies,
            runtimes: crate::config::presets::default_runtimes(),
            output_limit_bytes: 64 * 1024,
            default_deadline_ms: 5_000,
            max_deadline_ms: 60_000,
            kill_grace_ms: 2_000,
            workspace_root: Self::runtime_root_dir().join("workspaces"),
            cleanup_retry_attempts: 3,
            audit: AuditConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Runtime root directory scoped by effective UID.
    /// Keeps root and non-root engines from colliding under the shared temp dir.
    pub fn runtime_root_dir() -> PathBuf {
        let euid = nix::unistd::geteuid();
        std::env::temp_dir().join(format!("codebox-uid-{}", euid))
    }

    /// Load configuration from a JSON file; missing keys take built-in defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))?;

        log::info!(
            "Loaded engine config from {} ({} policies, {} runtimes)",
            path.display(),
            config.policies.len(),
            config.runtimes.len()
        );
        Ok(config)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn max_deadline(&self) -> Duration {
        Duration::from_millis(self.max_deadline_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Concurrency ceiling such that `N * memory ceiling <= host memory`
    /// and `N * cpu ceiling <= host cpus`. Never below one.
    pub fn effective_pool_size(&self) -> usize {
        let by_memory = if self.ceilings.memory_limit == 0 {
            usize::MAX
        } else {
            (self.host_budget.memory_bytes / self.ceilings.memory_limit) as usize
        };
        let by_cpu = if self.ceilings.cpu_quota > 0.0 {
            (self.host_budget.cpus / self.ceilings.cpu_quota).floor() as usize
        } else {
            usize::MAX
        };

        self.pool_size.min(by_memory).min(by_cpu).max(1)
    }

    /// Resolve a requested deadline against the default and maximum
    pub fn effective_deadline(&self, requested: Option<Duration>) -> Result<Duration> {
        let deadline = requested.unwrap_or_else(|| self.default_deadline());
        if deadline.is_zero() {
            return Err(SandboxError::InvalidRequest("deadline must be non-zero".to_string()));
        }
        if deadline > self.max_deadline() {
            return Err(SandboxError::InvalidRequest(format!(
                "deadline {:?} exceeds maximum {:?}",
                deadline,
                self.max_deadline()
            )));
        }
        Ok(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_restrictive_default_policy() {
        let config = EngineConfig::default();
        let policy = config.policies.get("default").expect("default policy");
        assert_eq!(policy.network_mode, NetworkMode::None);
        assert!(!policy.network_allowed);
        assert!(policy.capabilities.is_empty());
        assert!(policy.read_only_root);
        assert_ne!(policy.run_as_user, 0);
        assert!(!config.audit.retain_content);
    }

    #[test]
    fn pool_size_is_capped_by_host_budget() {
        let mut config = EngineConfig::default();
        config.pool_size = 64;
        config.ceilings.memory_limit = 512 * MIB;
        config.host_budget.memory_bytes = 2048 * MIB;
        config.ceilings.cpu_quota = 1.0;
        config.host_budget.cpus = 8.0;
        assert_eq!(config.effective_pool_size(), 4);

        config.host_budget.cpus = 2.0;
        assert_eq!(config.effective_pool_size(), 2);

        config.host_budget.cpus = 0.1;
        assert_eq!(config.effective_pool_size(), 1);
    }

    #[test]
    fn deadline_is_bounded() {
        let config = EngineConfig::default();
        assert_eq!(config.effective_deadline(None).unwrap(), Duration::from_secs(5));
        assert!(config.effective_deadline(Some(Duration::from_secs(600))).is_err());
        assert!(config.effective_deadline(Some(Duration::ZERO)).is_err());
    }

    #[test]
    fn partial_json_takes_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"pool_size": 2, "audit": {"retain_content": true}}"#).unwrap();
        assert_eq!(config.pool_size, 2);
        assert!(config.audit.retain_content);
        assert_eq!(config.audit.timeout_ms, 2_000);
        assert!(config.policies.contains_key("default"));
        assert!(config.runtimes.contains_key("python"));
    }

    #[test]
    fn load_from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = EngineConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config JSON"));
    }
}
