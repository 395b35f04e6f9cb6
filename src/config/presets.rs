/// Runtime presets
///
/// A preset names the image a runtime executes in, the file the submitted
/// artifact is materialized as, and the argv used to start it. `{script}` in
/// the argv is replaced by the artifact's path as seen by the confined process.
use crate::config::types::{Result, SandboxError};
use crate::core::types::Entrypoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Placeholder substituted with the artifact path inside the sandbox
pub const SCRIPT_PLACEHOLDER: &str = "{script}";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimePreset {
    /// Container image; must already be present locally
    pub image: String,
    /// File name the artifact is written to inside the workspace
    pub script_name: String,
    /// Command line; one element must contain `{script}`
    pub command: Vec<String>,
}

impl RuntimePreset {
    fn new(image: &str, script_name: &str, command: &[&str]) -> Self {
        Self {
            image: image.to_string(),
            script_name: script_name.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Check the preset is usable before any request reaches it
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::Config(format!("runtime '{}' has no image", name)));
        }
        if self.command.is_empty() {
            return Err(SandboxError::Config(format!("runtime '{}' has an empty command", name)));
        }
        if !self.command.iter().any(|arg| arg.contains(SCRIPT_PLACEHOLDER)) {
            return Err(SandboxError::Config(format!(
                "runtime '{}' command never references {}",
                name, SCRIPT_PLACEHOLDER
            )));
        }
        if self.script_name.is_empty()
            || self.script_name.contains('/')
            || self.script_name == "."
            || self.script_name == ".."
        {
            return Err(SandboxError::Config(format!(
                "runtime '{}' script name must be a plain file name",
                name
            )));
        }
        Ok(())
    }

    pub fn entrypoint(&self, runtime: &str) -> Entrypoint {
        Entrypoint {
            runtime: runtime.to_string(),
            image: self.image.clone(),
            script_name: self.script_name.clone(),
            command: self.command.clone(),
        }
    }
}

/// Built-in runtimes
pub fn default_runtimes() -> BTreeMap<String, RuntimePreset> {
    let mut runtimes = BTreeMap::new();
    runtimes.insert(
        "python".to_string(),
        RuntimePreset::new("python:3.12-slim", "main.py", &["python3", "-u", "{script}"]),
    );
    runtimes.insert(
        "sh".to_string(),
        RuntimePreset::new("busybox:1.36", "main.sh", &["/bin/sh", "{script}"]),
    );
    runtimes.insert(
        "node".to_string(),
        RuntimePreset::new("node:20-slim", "main.js", &["node", "{script}"]),
    );
    runtimes
}

/// Look up a runtime by name; aliases follow common file extensions
pub fn lookup<'a>(
    runtimes: &'a BTreeMap<String, RuntimePreset>,
    runtime: &str,
) -> Result<(&'a str, &'a RuntimePreset)> {
    let canonical = match runtime {
        "py" | "python3" => "python",
        "shell" | "bash" => "sh",
        "js" | "javascript" => "node",
        other => other,
    };

    runtimes
        .get_key_value(canonical)
        .map(|(name, preset)| (name.as_str(), preset))
        .ok_or_else(|| SandboxError::InvalidRequest(format!("unsupported runtime: {}", runtime)))
}
