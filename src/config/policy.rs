//! Policy resolution
//!
//! Turns a [`PolicySelector`] into an immutable [`PolicyProfile`]. Resolution
//! is a pure function of the selector and the engine configuration: the same
//! inputs always produce equal profiles with identical fingerprints.
//!
//! The default template is maximally restrictive. Network access and added
//! capabilities each require an explicit opt-in flag on the named template,
//! and every resolution that uses one is reported as a security event.

use crate::config::config::{EngineConfig, HostCeilings, PolicyTemplate};
use crate::config::types::{
    MountMode, MountSource, MountSpec, NetworkMode, PolicyOverrides, PolicySelector, Result,
    SandboxError,
};
use crate::observability::events;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Linux capability names accepted in policy files (without the `CAP_` prefix)
const KNOWN_CAPABILITIES: &[&str] = &[
    "AUDIT_CONTROL",
    "AUDIT_READ",
    "AUDIT_WRITE",
    "BLOCK_SUSPEND",
    "BPF",
    "CHECKPOINT_RESTORE",
    "CHOWN",
    "DAC_OVERRIDE",
    "DAC_READ_SEARCH",
    "FOWNER",
    "FSETID",
    "IPC_LOCK",
    "IPC_OWNER",
    "KILL",
    "LEASE",
    "LINUX_IMMUTABLE",
    "MAC_ADMIN",
    "MAC_OVERRIDE",
    "MKNOD",
    "NET_ADMIN",
    "NET_BIND_SERVICE",
    "NET_BROADCAST",
    "NET_RAW",
    "PERFMON",
    "SETFCAP",
    "SETGID",
    "SETPCAP",
    "SETUID",
    "SYSLOG",
    "SYS_ADMIN",
    "SYS_BOOT",
    "SYS_CHROOT",
    "SYS_MODULE",
    "SYS_NICE",
    "SYS_PACCT",
    "SYS_PTRACE",
    "SYS_RAWIO",
    "SYS_RESOURCE",
    "SYS_TIME",
    "SYS_TTY_CONFIG",
    "WAKE_ALARM",
];

/// Capabilities that defeat the sandbox outright; never grantable
const FORBIDDEN_CAPABILITIES: &[&str] = &[
    "BPF",
    "DAC_READ_SEARCH",
    "MAC_ADMIN",
    "MAC_OVERRIDE",
    "NET_ADMIN",
    "PERFMON",
    "SETFCAP",
    "SETPCAP",
    "SYS_ADMIN",
    "SYS_BOOT",
    "SYS_MODULE",
    "SYS_PTRACE",
    "SYS_RAWIO",
    "SYS_TIME",
];

/// Fully resolved, immutable isolation parameters for one execution
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct PolicyProfile {
    name: String,
    network_mode: NetworkMode,
    capabilities: BTreeSet<String>,
    read_only_root: bool,
    tmp_size: u64,
    pid_limit: u32,
    memory_limit: u64,
    cpu_quota: f64,
    run_as_user: u32,
    run_as_group: u32,
    mounts: Vec<MountSpec>,
}

impl PolicyProfile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.network_mode
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn read_only_root(&self) -> bool {
        self.read_only_root
    }

    pub fn tmp_size(&self) -> u64 {
        self.tmp_size
    }

    pub fn pid_limit(&self) -> u32 {
        self.pid_limit
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    pub fn cpu_quota(&self) -> f64 {
        self.cpu_quota
    }

    pub fn run_as_user(&self) -> u32 {
        self.run_as_user
    }

    pub fn run_as_group(&self) -> u32 {
        self.run_as_group
    }

    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// Container path of the workspace mount
    pub fn work_dir(&self) -> &Path {
        self.mounts
            .iter()
            .find(|m| m.is_workspace())
            .map(|m| m.container_path.as_path())
            .unwrap_or_else(|| Path::new("/work"))
    }

    /// SHA256 over the canonical JSON form of the profile
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }
}

/// Resolves selectors against the configured templates and host ceilings
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    ceilings: HostCeilings,
    templates: BTreeMap<String, PolicyTemplate>,
}

impl PolicyResolver {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ceilings: config.ceilings.clone(),
            templates: config.policies.clone(),
        }
    }

    pub fn policy_names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    /// Resolve a selector into a validated profile or fail with `InvalidPolicy`
    pub fn resolve(&self, selector: &PolicySelector) -> Result<PolicyProfile> {
        let name = selector.base_name();
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| SandboxError::invalid_policy(name, "unknown policy"))?;

        let mut limits = Limits::from_template(template);
        if let PolicySelector::Inline { overrides, .. } = selector {
            limits.tighten(name, overrides)?;
        }
        limits.check_ceilings(name, &self.ceilings)?;

        if template.run_as_user == 0 || template.run_as_group == 0 {
            return Err(SandboxError::invalid_policy(
                name,
                "run_as_user and run_as_group must be non-zero",
            ));
        }

        if template.network_mode != NetworkMode::None {
            if !template.network_allowed {
                return Err(SandboxError::invalid_policy(
                    name,
                    format!(
                        "network mode '{}' requires network_allowed",
                        template.network_mode
                    ),
                ));
            }
            events::network_opt_in(name, template.network_mode);
        }

        let capabilities = normalize_capabilities(name, template)?;
        if !capabilities.is_empty() {
            events::capability_opt_in(name, &capabilities);
        }

        if !template.read_only_root {
            events::writable_root(name);
        }

        let mounts = build_mounts(name, template)?;

        Ok(PolicyProfile {
            name: name.to_string(),
            network_mode: template.network_mode,
            capabilities,
            read_only_root: template.read_only_root,
            tmp_size: limits.tmp_size,
            pid_limit: limits.pid_limit,
            memory_limit: limits.memory_limit,
            cpu_quota: limits.cpu_quota,
            run_as_user: template.run_as_user,
            run_as_group: template.run_as_group,
            mounts,
        })
    }
}

/// Numeric limits while a profile is being assembled
struct Limits {
    memory_limit: u64,
    cpu_quota: f64,
    pid_limit: u32,
    tmp_size: u64,
}

impl Limits {
    fn from_template(template: &PolicyTemplate) -> Self {
        Self {
            memory_limit: template.memory_limit,
            cpu_quota: template.cpu_quota,
            pid_limit: template.pid_limit,
            tmp_size: template.tmp_size,
        }
    }

    /// Apply inline overrides; they may only lower a value
    fn tighten(&mut self, policy: &str, overrides: &PolicyOverrides) -> Result<()> {
        if let Some(memory) = overrides.memory_limit {
            if memory > self.memory_limit {
                return Err(SandboxError::invalid_policy(
                    policy,
                    format!("override memory_limit {} loosens {}", memory, self.memory_limit),
                ));
            }
            self.memory_limit = memory;
        }
        if let Some(cpu) = overrides.cpu_quota {
            if !cpu.is_finite() || cpu > self.cpu_quota {
                return Err(SandboxError::invalid_policy(
                    policy,
                    format!("override cpu_quota {} loosens {}", cpu, self.cpu_quota),
                ));
            }
            self.cpu_quota = cpu;
        }
        if let Some(pids) = overrides.pid_limit {
            if pids > self.pid_limit {
                return Err(SandboxError::invalid_policy(
                    policy,
                    format!("override pid_limit {} loosens {}", pids, self.pid_limit),
                ));
            }
            self.pid_limit = pids;
        }
        if let Some(tmp) = overrides.tmp_size {
            if tmp > self.tmp_size {
                return Err(SandboxError::invalid_policy(
                    policy,
                    format!("override tmp_size {} loosens {}", tmp, self.tmp_size),
                ));
            }
            self.tmp_size = tmp;
        }
        Ok(())
    }

    fn check_ceilings(&self, policy: &str, ceilings: &HostCeilings) -> Result<()> {
        if self.memory_limit == 0 || self.memory_limit > ceilings.memory_limit {
            return Err(SandboxError::invalid_policy(
                policy,
                format!(
                    "memory_limit {} outside (0, {}]",
                    self.memory_limit, ceilings.memory_limit
                ),
            ));
        }
        if !self.cpu_quota.is_finite()
            || self.cpu_quota <= 0.0
            || self.cpu_quota > ceilings.cpu_quota
        {
            return Err(SandboxError::invalid_policy(
                policy,
                format!(
                    "cpu_quota {} outside (0, {}]",
                    self.cpu_quota, ceilings.cpu_quota
                ),
            ));
        }
        if self.pid_limit == 0 || self.pid_limit > ceilings.pid_limit {
            return Err(SandboxError::invalid_policy(
                policy,
                format!("pid_limit {} outside (0, {}]", self.pid_limit, ceilings.pid_limit),
            ));
        }
        if self.tmp_size == 0 || self.tmp_size > ceilings.tmp_size {
            return Err(SandboxError::invalid_policy(
                policy,
                format!("tmp_size {} outside (0, {}]", self.tmp_size, ceilings.tmp_size),
            ));
        }
        Ok(())
    }
}

fn normalize_capabilities(policy: &str, template: &PolicyTemplate) -> Result<BTreeSet<String>> {
    if template.capabilities.is_empty() {
        return Ok(BTreeSet::new());
    }
    if !template.capabilities_allowed {
        return Err(SandboxError::invalid_policy(
            policy,
            "capabilities require capabilities_allowed",
        ));
    }

    let mut normalized = BTreeSet::new();
    for raw in &template.capabilities {
        let upper = raw.trim().to_ascii_uppercase();
        let cap = upper.strip_prefix("CAP_").unwrap_or(&upper);
        if cap == "ALL" {
            return Err(SandboxError::invalid_policy(policy, "capability ALL is never grantable"));
        }
        if !KNOWN_CAPABILITIES.contains(&cap) {
            return Err(SandboxError::invalid_policy(
                policy,
                format!("unknown capability: {}", raw),
            ));
        }
        if FORBIDDEN_CAPABILITIES.contains(&cap) {
            return Err(SandboxError::invalid_policy(
                policy,
                format!("capability {} is never grantable", cap),
            ));
        }
        normalized.insert(cap.to_string());
    }
    Ok(normalized)
}

fn build_mounts(policy: &str, template: &PolicyTemplate) -> Result<Vec<MountSpec>> {
    let work_dir = &template.work_dir;
    if !work_dir.is_absolute() || work_dir == Path::new("/") {
        return Err(SandboxError::invalid_policy(
            policy,
            format!("work_dir must be an absolute, non-root path: {}", work_dir.display()),
        ));
    }

    let mut mounts = vec![MountSpec {
        source: MountSource::Workspace,
        container_path: work_dir.clone(),
        mode: MountMode::ReadWrite,
    }];
    let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
    seen.insert(work_dir.clone());
    seen.insert(PathBuf::from("/tmp"));

    for mount in &template.readonly_mounts {
        if !mount.host_path.is_absolute() || !mount.container_path.is_absolute() {
            return Err(SandboxError::invalid_policy(
                policy,
                format!(
                    "whitelisted mount paths must be absolute: {} -> {}",
                    mount.host_path.display(),
                    mount.container_path.display()
                ),
            ));
        }
        if mount.container_path == Path::new("/") || !seen.insert(mount.container_path.clone()) {
            return Err(SandboxError::invalid_policy(
                policy,
                format!(
                    "mount target {} collides with another mount",
                    mount.container_path.display()
                ),
            ));
        }
        mounts.push(MountSpec {
            source: MountSource::Host(mount.host_path.clone()),
            container_path: mount.container_path.clone(),
            mode: MountMode::ReadOnly,
        });
    }

    Ok(mounts)
}
