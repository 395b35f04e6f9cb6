//! Execution engine
//!
//! `Engine::execute` is the single inbound entry point. It runs the request
//! through resolution, workspace allocation, supervised launch and
//! classification, records exactly one audit entry whatever happens, and
//! returns either a classified result or the request-level error.

use crate::config::config::EngineConfig;
use crate::config::policy::{PolicyProfile, PolicyResolver};
use crate::config::presets;
use crate::config::types::{
    ExecutionRequest, ExecutionResult, PolicySelector, Result, SandboxError, StatusKind,
    SupervisorState, TerminationReason,
};
use crate::config::validator::validate_config;
use crate::core::container::ContainerProvider;
use crate::core::pool::WorkerPool;
use crate::core::provider::IsolationProvider;
use crate::core::supervisor::{Supervisor, SupervisorSettings};
use crate::core::types::{CancelToken, SupervisedOutcome};
use crate::observability::audit::AuditRecorder;
use crate::observability::events;
use crate::safety::cleanup::CleanupReaper;
use crate::safety::instance::EngineInstance;
use crate::safety::workspace::{WorkspaceManager, WorkspaceOwner};
use crate::verdict::classifier::ResultClassifier;
use log::{info, warn};
use std::path::Path;
use std::time::{Duration, Instant};

/// What a reap pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub workspaces: usize,
    pub containers: usize,
}

/// A request-level failure together with the profile, if resolution got that far
struct Failure {
    profile: Option<PolicyProfile>,
    error: SandboxError,
}

impl Failure {
    fn before_policy(error: SandboxError) -> Self {
        Self {
            profile: None,
            error,
        }
    }
}

pub struct Engine<P: IsolationProvider> {
    config: EngineConfig,
    provider: P,
    resolver: PolicyResolver,
    reaper: CleanupReaper,
    workspaces: WorkspaceManager,
    pool: WorkerPool,
    audit: AuditRecorder,
}

impl Engine<ContainerProvider> {
    /// Engine backed by the configured container runtime CLI
    pub fn with_container_runtime(config: EngineConfig) -> Result<Self> {
        let provider = ContainerProvider::new(&config.provider);
        Self::new(config, provider)
    }
}

impl<P: IsolationProvider> Engine<P> {
    pub fn new(config: EngineConfig, provider: P) -> Result<Self> {
        let validation = validate_config(&config);
        for warning in &validation.warnings {
            warn!("config: {}", warning);
        }
        if !validation.is_valid() {
            return Err(SandboxError::Config(validation.errors.join("; ")));
        }

        let reaper = CleanupReaper::spawn(config.cleanup_retry_attempts);
        let workspaces = WorkspaceManager::new(
            &config.workspace_root,
            EngineInstance::current(),
            reaper.clone(),
        )?;
        let audit = AuditRecorder::open(&config.audit)?;
        let pool = WorkerPool::new(config.effective_pool_size());
        let resolver = PolicyResolver::new(&config);

        let engine = Self {
            config,
            provider,
            resolver,
            reaper,
            workspaces,
            pool,
            audit,
        };

        // Leftovers of an engine that died without cleaning up
        if let Err(e) = engine.reap() {
            warn!("Startup reap incomplete: {}", e);
        }

        info!(
            "Engine ready: provider={}, pool={}, workspaces={}",
            engine.provider.name(),
            engine.pool.size(),
            engine.workspaces.instance_dir().display()
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn audit_path(&self) -> &Path {
        self.audit.path()
    }

    pub fn workspace_dir(&self) -> &Path {
        self.workspaces.instance_dir()
    }

    /// Wait up to `timeout` for background workspace and container removal.
    /// Call before exiting the process; returns false if work is left over.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let workspaces = self.reaper.wait_idle(timeout);
        let provider = self
            .provider
            .wait_idle(timeout.saturating_sub(start.elapsed()));
        workspaces && provider
    }

    /// Run one request to a terminal state.
    ///
    /// Blocks while the pool is full, unless `cancel` fires first. `Err` means
    /// no result could be produced; `err.status_kind()` classifies it. Either
    /// way one audit record is written.
    pub fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult> {
        match self.run(request, cancel) {
            Ok((profile, result)) => {
                self.audit.record(request, &profile, &result);
                Ok(result)
            }
            Err(failure) => {
                let err = failure.error;
                if err.status_kind() == StatusKind::InfrastructureFailure {
                    events::infrastructure_failure(request.id(), &err.to_string());
                } else {
                    warn!("[{}] rejected: {}", request.id(), err);
                }
                self.audit
                    .record_failure(request, failure.profile.as_ref(), &err);
                Err(err)
            }
        }
    }

    /// Convenience wrapper building a request for a named policy
    pub fn execute_code(
        &self,
        code: &[u8],
        runtime: &str,
        policy: &str,
        deadline: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let mut request = ExecutionRequest::new(code, runtime, PolicySelector::named(policy));
        if let Some(deadline) = deadline {
            request = request.with_deadline(deadline);
        }
        self.execute(&request, &CancelToken::new())
    }

    fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancelToken,
    ) -> std::result::Result<(PolicyProfile, ExecutionResult), Failure> {
        if request.code().is_empty() {
            return Err(Failure::before_policy(SandboxError::InvalidRequest(
                "empty artifact".to_string(),
            )));
        }
        let deadline = self
            .config
            .effective_deadline(request.deadline())
            .map_err(Failure::before_policy)?;
        let (runtime, preset) = presets::lookup(&self.config.runtimes, request.runtime())
            .map_err(Failure::before_policy)?;
        let entrypoint = preset.entrypoint(runtime);

        let profile = self
            .resolver
            .resolve(request.policy())
            .map_err(Failure::before_policy)?;

        let _permit = match self.pool.acquire_until_cancelled(cancel) {
            Some(permit) => permit,
            None => {
                info!("[{}] cancelled while waiting for a pool slot", request.id());
                let outcome = SupervisedOutcome::without_process(
                    SupervisorState::Killed,
                    TerminationReason::Cancelled,
                );
                let result = ResultClassifier::to_result(request.id(), &outcome);
                return Ok((profile, result));
            }
        };

        let fail = |error: SandboxError| Failure {
            profile: Some(profile.clone()),
            error,
        };

        let owner = WorkspaceOwner {
            uid: profile.run_as_user(),
            gid: profile.run_as_group(),
        };
        let workspace = self.workspaces.acquire(request.id(), owner).map_err(fail)?;
        workspace
            .materialize(&entrypoint.script_name, request.code())
            .map_err(fail)?;

        let settings = SupervisorSettings {
            deadline,
            kill_grace: self.config.kill_grace(),
            output_limit: self.config.output_limit_bytes,
        };
        let outcome = Supervisor::new(&self.provider, request.id(), settings)
            .run(workspace.path(), &profile, &entrypoint, cancel)
            .map_err(fail)?;

        let result = ResultClassifier::to_result(request.id(), &outcome);

        // Cleanup failures are already reported and queued for retry
        let _ = workspace.release();

        info!(
            "[{}] {} exit={:?} signal={:?} {}ms",
            request.id(),
            result.status_kind,
            result.exit_code,
            result.signal,
            result.wall_clock_ms
        );
        Ok((profile, result))
    }

    /// Probe the runtime and the image of `runtime`, or of every runtime
    pub fn check(&self, runtime: Option<&str>) -> Result<()> {
        match runtime {
            Some(name) => {
                let (_, preset) = presets::lookup(&self.config.runtimes, name)?;
                self.provider.probe(&preset.image)
            }
            None => {
                for preset in self.config.runtimes.values() {
                    self.provider.probe(&preset.image)?;
                }
                Ok(())
            }
        }
    }

    /// Remove workspaces and confined processes of dead engines
    pub fn reap(&self) -> Result<ReapReport> {
        let workspaces = self.workspaces.reclaim_orphans()?;
        let containers = self.provider.reap_orphans()?;
        Ok(ReapReport {
            workspaces,
            containers,
        })
    }
}
