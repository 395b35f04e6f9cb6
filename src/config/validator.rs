// Startup validation of the engine configuration.
// Errors are fatal: the engine refuses to start. Warnings are logged.

use crate::config::config::EngineConfig;
use crate::config::policy::PolicyResolver;
use crate::config::types::{NetworkMode, PolicySelector};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn validate_config(config: &EngineConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_ceilings(config, &mut result);
    validate_timing(config, &mut result);
    validate_paths(config, &mut result);
    validate_runtimes(config, &mut result);
    validate_policies(config, &mut result);

    if config.provider.binary.trim().is_empty() {
        result.add_error("provider.binary cannot be empty".to_string());
    }
    if config.audit.retain_content {
        result.add_warning(
            "audit.retain_content is on: raw code and output will be written to the audit log"
                .to_string(),
        );
    }

    result
}

fn validate_ceilings(config: &EngineConfig, result: &mut ValidationResult) {
    let ceilings = &config.ceilings;
    if ceilings.memory_limit == 0 {
        result.add_error("ceilings.memory_limit cannot be zero".to_string());
    }
    if !ceilings.cpu_quota.is_finite() || ceilings.cpu_quota <= 0.0 {
        result.add_error(format!(
            "ceilings.cpu_quota must be positive, got {}",
            ceilings.cpu_quota
        ));
    }
    if ceilings.pid_limit == 0 {
        result.add_error("ceilings.pid_limit cannot be zero".to_string());
    }
    if ceilings.tmp_size == 0 {
        result.add_error("ceilings.tmp_size cannot be zero".to_string());
    }

    if config.pool_size == 0 {
        result.add_error("pool_size cannot be zero".to_string());
    } else {
        let effective = config.effective_pool_size();
        if effective < config.pool_size {
            result.add_warning(format!(
                "pool_size {} capped to {} by the host budget",
                config.pool_size, effective
            ));
        }
    }

    if config.output_limit_bytes == 0 {
        result.add_error("output_limit_bytes cannot be zero".to_string());
    } else if config.output_limit_bytes > 16 * 1024 * 1024 {
        result.add_warning(format!(
            "output_limit_bytes {} is large; results are held in memory",
            config.output_limit_bytes
        ));
    }
}

fn validate_timing(config: &EngineConfig, result: &mut ValidationResult) {
    if config.default_deadline_ms == 0 {
        result.add_error("default_deadline_ms cannot be zero".to_string());
    }
    if config.max_deadline_ms < config.default_deadline_ms {
        result.add_error(format!(
            "max_deadline_ms ({}) must be >= default_deadline_ms ({})",
            config.max_deadline_ms, config.default_deadline_ms
        ));
    }
    if config.kill_grace_ms == 0 {
        result.add_error("kill_grace_ms cannot be zero".to_string());
    } else if config.kill_grace_ms < 100 {
        result.add_warning(format!(
            "kill_grace_ms {} leaves little time to confirm a kill",
            config.kill_grace_ms
        ));
    }
    if config.audit.timeout_ms == 0 {
        result.add_error("audit.timeout_ms cannot be zero".to_string());
    }
    if config.cleanup_retry_attempts == 0 {
        result.add_warning(
            "cleanup_retry_attempts is 0; failed workspace removals get a single retry".to_string(),
        );
    }
}

fn validate_paths(config: &EngineConfig, result: &mut ValidationResult) {
    let root = &config.workspace_root;
    if !root.is_absolute() {
        result.add_error(format!(
            "workspace_root must be an absolute path: {}",
            root.display()
        ));
    }
    if root.to_string_lossy().contains(',') {
        result.add_error(format!(
            "workspace_root cannot contain ',': {}",
            root.display()
        ));
    }
    if !config.audit.path.is_absolute() {
        result.add_warning(format!(
            "audit.path is relative and depends on the working directory: {}",
            config.audit.path.display()
        ));
    }
}

fn validate_runtimes(config: &EngineConfig, result: &mut ValidationResult) {
    if config.runtimes.is_empty() {
        result.add_error("no runtimes configured".to_string());
    }
    for (name, preset) in &config.runtimes {
        if let Err(e) = preset.validate(name) {
            result.add_error(e.to_string());
        }
    }
}

fn validate_policies(config: &EngineConfig, result: &mut ValidationResult) {
    if !config.policies.contains_key("default") {
        result.add_error("policies must define 'default'".to_string());
    }

    let resolver = PolicyResolver::new(config);
    for (name, template) in &config.policies {
        if let Err(e) = resolver.resolve(&PolicySelector::named(name.as_str())) {
            result.add_error(e.to_string());
            continue;
        }
        if template.network_mode == NetworkMode::Restricted
            && config.provider.restricted_network.is_none()
        {
            result.add_warning(format!(
                "policy '{}' uses a restricted network but provider.restricted_network is unset; \
                 its requests will be refused",
                name
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::PolicyTemplate;

    #[test]
    fn default_config_is_valid() {
        let result = validate_config(&EngineConfig::default());
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn zero_limits_are_errors() {
        let mut config = EngineConfig::default();
        config.ceilings.pid_limit = 0;
        config.kill_grace_ms = 0;
        let result = validate_config(&config);
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("ceilings.pid_limit")));
        assert!(result.errors.iter().any(|e| e.contains("kill_grace_ms")));
        // The default policy no longer fits under the ceiling
        assert!(result.errors.iter().any(|e| e.contains("'default'")));
    }

    #[test]
    fn deadline_ordering_is_checked() {
        let mut config = EngineConfig::default();
        config.default_deadline_ms = 90_000;
        let result = validate_config(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("max_deadline_ms")));
    }

    #[test]
    fn policies_must_resolve() {
        let mut config = EngineConfig::default();
        config.policies.insert(
            "root".to_string(),
            PolicyTemplate {
                run_as_user: 0,
                ..PolicyTemplate::default()
            },
        );
        let result = validate_config(&config);
        assert!(result.errors.iter().any(|e| e.contains("'root'")));

        let mut config = EngineConfig::default();
        config.policies.clear();
        assert!(!validate_config(&config).is_valid());
    }

    #[test]
    fn relative_workspace_root_is_rejected() {
        let mut config = EngineConfig::default();
        config.workspace_root = "relative/ws".into();
        assert!(!validate_config(&config).is_valid());
    }

    #[test]
    fn restricted_network_without_provider_network_warns() {
        let mut config = EngineConfig::default();
        config.policies.insert(
            "egress".to_string(),
            PolicyTemplate {
                network_mode: NetworkMode::Restricted,
                network_allowed: true,
                ..PolicyTemplate::default()
            },
        );
        let result = validate_config(&config);
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("egress")));
    }
}
