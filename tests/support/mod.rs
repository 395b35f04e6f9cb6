//! Test-only isolation providers and helpers.
//!
//! `LocalProvider` runs scripts as plain local processes with no confinement
//! at all, so the engine's lifecycle (workspaces, deadlines, escalation,
//! classification, audit) can be exercised on hosts without a container
//! runtime. `FakeRuntime` installs a shell stand-in for the docker CLI so the
//! real `ContainerProvider` can be driven through failure modes a live daemon
//! cannot be made to produce on demand.

#![allow(dead_code)]

use codebox::config::policy::PolicyProfile;
use codebox::core::container::ContainerProvider;
use codebox::core::provider::{IsolationHandle, IsolationProvider, OutputPipe};
use codebox::core::types::{Entrypoint, ExitOutcome};
use codebox::{Engine, EngineConfig, Result, SandboxError};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;

const FAKE_DOCKER: &str = include_str!("fake_docker.sh");

pub struct LocalHandle {
    id: String,
    child: Child,
}

impl LocalHandle {
    fn signal_group(&self, signal: libc::c_int) -> Result<()> {
        let pgid = self.child.id() as libc::pid_t;
        // SAFETY: plain kill(2) on the child's own process group
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(SandboxError::Io(err));
            }
        }
        Ok(())
    }
}

impl IsolationHandle for LocalHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn take_stdout(&mut self) -> Option<OutputPipe> {
        self.child
            .stdout
            .take()
            .map(|pipe| Box::new(pipe) as OutputPipe)
    }

    fn take_stderr(&mut self) -> Option<OutputPipe> {
        self.child
            .stderr
            .take()
            .map(|pipe| Box::new(pipe) as OutputPipe)
    }

    fn try_wait(&mut self) -> Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(|status| match status.signal() {
            Some(signal) => ExitOutcome::signaled(signal),
            None => ExitOutcome::exited(status.code().unwrap_or(-1)),
        }))
    }

    fn terminate(&mut self, _budget: Duration) -> Result<()> {
        self.signal_group(libc::SIGTERM)
    }

    fn kill(&mut self, _budget: Duration) -> Result<()> {
        self.signal_group(libc::SIGKILL)
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.signal_group(libc::SIGKILL);
            let _ = self.child.wait();
        }
    }
}

#[derive(Default)]
pub struct LocalProvider;

impl IsolationProvider for LocalProvider {
    type Handle = LocalHandle;

    fn name(&self) -> &str {
        "local"
    }

    fn probe(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    fn launch(
        &self,
        workspace: &Path,
        _profile: &PolicyProfile,
        entrypoint: &Entrypoint,
    ) -> Result<LocalHandle> {
        let argv = entrypoint.argv(&workspace.join(&entrypoint.script_name));
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::LaunchFailed("empty argv".to_string()))?;

        let child = Command::new(program)
            .args(args)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| SandboxError::LaunchFailed(format!("spawn {}: {}", program, e)))?;

        Ok(LocalHandle {
            id: format!("local-{}", child.id()),
            child,
        })
    }
}

/// A provider whose runtime is never reachable
#[derive(Default)]
pub struct UnavailableProvider;

impl IsolationProvider for UnavailableProvider {
    type Handle = LocalHandle;

    fn name(&self) -> &str {
        "unavailable"
    }

    fn probe(&self, image: &str) -> Result<()> {
        Err(SandboxError::IsolationUnavailable(format!(
            "runtime not reachable (image {})",
            image
        )))
    }

    fn launch(
        &self,
        _workspace: &Path,
        _profile: &PolicyProfile,
        _entrypoint: &Entrypoint,
    ) -> Result<LocalHandle> {
        Err(SandboxError::IsolationUnavailable(
            "runtime not reachable".to_string(),
        ))
    }
}

/// Config rooted in `dir`, with short timings suited to tests
pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workspace_root = dir.join("workspaces");
    config.audit.path = dir.join("audit.jsonl");
    config.default_deadline_ms = 5_000;
    config.kill_grace_ms = 400;
    config.output_limit_bytes = 4096;
    config
}

pub struct TestEngine<P: IsolationProvider> {
    pub engine: Engine<P>,
    pub dir: TempDir,
}

pub fn local_engine() -> TestEngine<LocalProvider> {
    local_engine_with(|_| {})
}

pub fn local_engine_with(tweak: impl FnOnce(&mut EngineConfig)) -> TestEngine<LocalProvider> {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let engine = Engine::new(config, LocalProvider).unwrap();
    TestEngine { engine, dir }
}

/// Every audit line parsed as JSON
pub fn audit_lines(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Workspace directories currently present under the engine instance dir
pub fn live_workspaces(instance_dir: &Path) -> usize {
    match std::fs::read_dir(instance_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("ws-"))
            .count(),
        Err(_) => 0,
    }
}

/// Shell stand-in for the docker CLI, installed in a test directory
pub struct FakeRuntime {
    state: PathBuf,
}

impl FakeRuntime {
    pub fn install(dir: &Path) -> Self {
        let state = dir.join("runtime");
        fs::create_dir_all(&state).unwrap();
        let binary = state.join("docker");
        fs::write(&binary, FAKE_DOCKER).unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

        // A sibling test forking while the script was open for writing makes
        // exec fail with ETXTBSY until that child has exec'd
        for _ in 0..50 {
            match Command::new(&binary).arg("version").output() {
                Ok(_) => break,
                Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                Err(e) => panic!("fake runtime unusable: {}", e),
            }
        }
        Self { state }
    }

    pub fn binary(&self) -> PathBuf {
        self.state.join("docker")
    }

    pub fn set_mode(&self, mode: &str) {
        fs::write(self.state.join("mode"), mode).unwrap();
    }

    /// Lines `ps` will print: `<id> <engine label>`
    pub fn set_listing(&self, listing: &str) {
        fs::write(self.state.join("ps"), listing).unwrap();
    }

    /// Every command line the runtime was invoked with
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.state.join("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn called(&self, command: &str) -> bool {
        self.calls().iter().any(|line| line == command)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|line| line.starts_with(prefix)).count()
    }

    /// Names of containers created so far
    pub fn containers(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.state)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(".created"))
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }

    pub fn removed(&self, container: &str) -> bool {
        self.state.join(format!("{}.removed", container)).exists()
    }

    /// True while the container's wrapper or program process still runs
    pub fn running(&self, container: &str) -> bool {
        ["pid", "child"].iter().any(|kind| {
            fs::read_to_string(self.state.join(format!("{}.{}", container, kind)))
                .ok()
                .and_then(|raw| raw.trim().parse::<libc::pid_t>().ok())
                .map_or(false, process_running)
        })
    }
}

fn process_running(pid: libc::pid_t) -> bool {
    // SAFETY: signal 0 only checks for existence
    if unsafe { libc::kill(pid, 0) } != 0 {
        return false;
    }
    let status = fs::read_to_string(format!("/proc/{}/status", pid)).unwrap_or_default();
    !status
        .lines()
        .any(|line| line.starts_with("State:") && line.contains('Z'))
}

/// Engine on the real container provider, driving a fake runtime
pub fn container_engine_with(
    tweak: impl FnOnce(&mut EngineConfig),
) -> (TestEngine<ContainerProvider>, FakeRuntime) {
    let dir = tempfile::tempdir().unwrap();
    let runtime = FakeRuntime::install(dir.path());
    let engine = fake_runtime_engine(dir, &runtime, tweak);
    (engine, runtime)
}

/// Engine over an already installed (and possibly pre-seeded) fake runtime
pub fn fake_runtime_engine(
    dir: TempDir,
    runtime: &FakeRuntime,
    tweak: impl FnOnce(&mut EngineConfig),
) -> TestEngine<ContainerProvider> {
    let mut config = test_config(dir.path());
    config.provider.binary = runtime.binary().display().to_string();
    config.provider.control_timeout_ms = 5_000;
    tweak(&mut config);
    let engine = Engine::with_container_runtime(config).unwrap();
    TestEngine { engine, dir }
}
