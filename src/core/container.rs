/// Container runtime isolation provider
///
/// Drives the `docker` (or argument-compatible `podman`) CLI. A launch is
/// `create` with a typed argument vector, then a detached `start` whose
/// status is checked before the run counts as started. Output comes from a
/// `logs --follow` client and the exit status from a `wait` client, so no
/// attach client ever stands in for the container itself: the container is
/// only taken as stopped when the runtime says so. No argument ever passes
/// through a shell.
use crate::config::config::ProviderConfig;
use crate::config::policy::PolicyProfile;
use crate::config::types::{MountMode, MountSource, NetworkMode, Result, SandboxError};
use crate::core::provider::{IsolationHandle, IsolationProvider, OutputPipe};
use crate::core::remover::ContainerRemover;
use crate::core::types::{Entrypoint, ExitOutcome};
use crate::safety::instance::EngineInstance;
use crate::verdict::classifier::is_crash_signal;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

pub const MANAGED_LABEL: &str = "codebox.managed";
pub const ENGINE_LABEL: &str = "codebox.engine";

const CONTROL_POLL: Duration = Duration::from_millis(10);
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
const REMOVAL_ATTEMPTS: u32 = 3;

/// Output of a short control command against the runtime
#[derive(Debug)]
pub struct ControlOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run `<binary> <args>` to completion, killing the client past `timeout`
pub fn control_command(binary: &str, args: &[&str], timeout: Duration) -> Result<ControlOutput> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            SandboxError::IsolationUnavailable(format!(
                "cannot execute container runtime '{}': {}",
                binary, e
            ))
        })?;

    // Drained concurrently so a chatty command cannot fill the pipe and stall
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    match wait_within(&mut child, timeout)? {
        Some(status) => Ok(ControlOutput {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        }),
        None => Err(SandboxError::IsolationUnavailable(format!(
            "'{} {}' did not answer within {:?}",
            binary,
            args.first().copied().unwrap_or_default(),
            timeout
        ))),
    }
}

/// Run a control command with its output discarded. `None` when the client
/// had to be killed at the end of `budget`.
fn control_within(binary: &str, args: &[&str], budget: Duration) -> Result<Option<ExitStatus>> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    wait_within(&mut child, budget)
}

fn wait_within(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(CONTROL_POLL);
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(reader: Option<thread::JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

pub struct ContainerProvider {
    binary: String,
    restricted_network: Option<String>,
    control_timeout: Duration,
    instance: EngineInstance,
    ready_images: Mutex<HashSet<String>>,
    remover: ContainerRemover,
}

impl ContainerProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let control_timeout = Duration::from_millis(config.control_timeout_ms);
        Self {
            binary: config.binary.clone(),
            restricted_network: config.restricted_network.clone(),
            control_timeout,
            instance: EngineInstance::current(),
            ready_images: Mutex::new(HashSet::new()),
            remover: ContainerRemover::spawn(
                config.binary.clone(),
                control_timeout,
                REMOVAL_ATTEMPTS,
            ),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Engine identity stamped on every container this provider creates
    pub fn instance(&self) -> &EngineInstance {
        &self.instance
    }

    /// Arguments for `<binary> create ...`, image and argv included
    pub fn create_args(
        &self,
        name: &str,
        workspace: &Path,
        profile: &PolicyProfile,
        entrypoint: &Entrypoint,
    ) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--pull".into(),
            "never".into(),
            "--name".into(),
            name.into(),
            "--label".into(),
            format!("{}=true", MANAGED_LABEL),
            "--label".into(),
            format!("{}={}", ENGINE_LABEL, self.instance.label()),
        ];
        args.push("--network".into());
        match profile.network_mode() {
            NetworkMode::None => args.push("none".into()),
            NetworkMode::Restricted => match &self.restricted_network {
                Some(network) => args.push(network.clone()),
                None => {
                    return Err(SandboxError::PolicyRefused(format!(
                        "policy '{}' requests a restricted network but none is configured",
                        profile.name()
                    )))
                }
            },
        }

        args.push("--cap-drop".into());
        args.push("ALL".into());
        for cap in profile.capabilities() {
            args.push("--cap-add".into());
            args.push(cap.clone());
        }
        args.push("--security-opt".into());
        args.push("no-new-privileges".into());
        if profile.read_only_root() {
            args.push("--read-only".into());
        }
        args.push("--tmpfs".into());
        args.push(format!(
            "/tmp:rw,noexec,nosuid,nodev,size={}",
            profile.tmp_size()
        ));
        args.push("--pids-limit".into());
        args.push(profile.pid_limit().to_string());
        args.push("--memory".into());
        args.push(profile.memory_limit().to_string());
        args.push("--memory-swap".into());
        args.push(profile.memory_limit().to_string());
        args.push("--cpus".into());
        args.push(format!("{}", profile.cpu_quota()));
        args.push("--user".into());
        args.push(format!(
            "{}:{}",
            profile.run_as_user(),
            profile.run_as_group()
        ));
        args.push("--env".into());
        args.push("HOME=/tmp".into());

        for mount in profile.mounts() {
            let source = match &mount.source {
                MountSource::Workspace => workspace.to_path_buf(),
                MountSource::Host(path) => path.clone(),
            };
            args.push("--mount".into());
            args.push(bind_mount(&source, &mount.container_path, mount.mode)?);
        }
        args.push("--workdir".into());
        args.push(profile.work_dir().display().to_string());

        args.push("--entrypoint".into());
        args.push(String::new());
        args.push(entrypoint.image.clone());
        args.extend(entrypoint.argv(&profile.work_dir().join(&entrypoint.script_name)));

        Ok(args)
    }

    fn control(&self, args: &[&str]) -> Result<ControlOutput> {
        control_command(&self.binary, args, self.control_timeout)
    }

    fn images(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.ready_images.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Probe `image` once; later launches trust the cached answer
    fn ensure_image(&self, image: &str) -> Result<()> {
        if self.images().contains(image) {
            return Ok(());
        }
        self.probe(image)?;
        self.images().insert(image.to_string());
        Ok(())
    }

    /// Spawn a long-running client (`logs --follow`, `wait`) for `name`
    fn client(&self, args: &[&str], with_stderr: bool) -> std::io::Result<Child> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if with_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .spawn()
    }
}

impl IsolationProvider for ContainerProvider {
    type Handle = ContainerHandle;

    fn name(&self) -> &str {
        &self.binary
    }

    fn probe(&self, image: &str) -> Result<()> {
        let version = self.control(&["version", "--format", "{{.Server.Version}}"])?;
        if !version.status.success() {
            return Err(SandboxError::IsolationUnavailable(format!(
                "container daemon unreachable: {}",
                version.stderr.trim()
            )));
        }

        let inspect = self.control(&["image", "inspect", "--format", "{{.Id}}", image])?;
        if !inspect.status.success() {
            return Err(SandboxError::IsolationUnavailable(format!(
                "image '{}' is not available locally",
                image
            )));
        }

        debug!(
            "{} server {} ready, image {} present",
            self.binary,
            version.stdout.trim(),
            image
        );
        Ok(())
    }

    fn launch(
        &self,
        workspace: &Path,
        profile: &PolicyProfile,
        entrypoint: &Entrypoint,
    ) -> Result<ContainerHandle> {
        let name = format!("codebox-{}", uuid::Uuid::new_v4());
        let workspace = workspace.canonicalize().map_err(|e| {
            SandboxError::LaunchFailed(format!(
                "workspace {} unusable: {}",
                workspace.display(),
                e
            ))
        })?;
        let args = self.create_args(&name, &workspace, profile, entrypoint)?;
        self.ensure_image(&entrypoint.image)?;

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let created = self.control(&arg_refs)?;
        if !created.status.success() {
            // Re-probe next time; create may also have left a container behind
            self.images().remove(&entrypoint.image);
            self.remover.submit(&name);
            return Err(SandboxError::LaunchFailed(format!(
                "create {} failed: {}",
                name,
                created.stderr.trim()
            )));
        }
        let container_id = created.stdout.trim().to_string();

        let started = match self.control(&["start", name.as_str()]) {
            Ok(started) => started,
            Err(e) => {
                self.remover.submit(&name);
                return Err(e);
            }
        };
        if !started.status.success() {
            self.remover.submit(&name);
            return Err(SandboxError::LaunchFailed(format!(
                "container {} did not start: {}",
                name,
                started.stderr.trim()
            )));
        }

        let logs = self.client(&["logs", "--follow", name.as_str()], true);
        let waiter = self.client(&["wait", name.as_str()], false);
        let (logs, mut waiter) = match (logs, waiter) {
            (Ok(logs), Ok(waiter)) => (logs, waiter),
            (logs, waiter) => {
                let mut detail = String::new();
                for client in [logs, waiter] {
                    match client {
                        Ok(mut child) => {
                            let _ = child.kill();
                            let _ = child.wait();
                        }
                        Err(e) => detail = e.to_string(),
                    }
                }
                self.remover.submit(&name);
                return Err(SandboxError::LaunchFailed(format!(
                    "cannot follow container {}: {}",
                    name, detail
                )));
            }
        };
        let waiter_output = waiter.stdout.take().map(drain);

        info!("Started container {} ({})", name, short_id(&container_id));
        Ok(ContainerHandle {
            name,
            binary: self.binary.clone(),
            remover: self.remover.clone(),
            memory_paths: cgroup_memory_paths(&container_id),
            logs,
            waiter,
            waiter_output,
            exit: None,
            removal: Removal::NotRequested,
            peak_memory: None,
            last_sample: None,
        })
    }

    fn reap_orphans(&self) -> Result<usize> {
        let label_filter = format!("label={}=true", MANAGED_LABEL);
        let columns = format!("{{{{.ID}}}} {{{{.Label \"{}\"}}}}", ENGINE_LABEL);
        let listing = self.control(&[
            "ps",
            "--all",
            "--filter",
            label_filter.as_str(),
            "--format",
            columns.as_str(),
        ])?;
        if !listing.status.success() {
            return Err(SandboxError::IsolationUnavailable(format!(
                "cannot list containers: {}",
                listing.stderr.trim()
            )));
        }

        let mut reaped = 0;
        for (id, owner) in parse_orphan_listing(&listing.stdout) {
            // Unlabelled or unparseable owners count as dead
            if owner.as_ref().is_some_and(EngineInstance::is_alive) {
                continue;
            }
            match self.control(&["rm", "--force", id]) {
                Ok(out) if out.status.success() => {
                    let owner = owner.map(|o| o.label()).unwrap_or_else(|| "?".to_string());
                    info!("Removed orphaned container {} of dead engine {}", id, owner);
                    reaped += 1;
                }
                Ok(out) => warn!("Failed to remove container {}: {}", id, out.stderr.trim()),
                Err(e) => warn!("Failed to remove container {}: {}", id, e),
            }
        }
        Ok(reaped)
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        self.remover.wait_idle(timeout)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Removal {
    NotRequested,
    /// Handed to the background remover
    Queued,
    /// `rm --force` answered successfully
    Confirmed,
}

/// A started container together with its `logs` and `wait` clients
pub struct ContainerHandle {
    name: String,
    binary: String,
    remover: ContainerRemover,
    memory_paths: Vec<PathBuf>,
    logs: Child,
    waiter: Child,
    waiter_output: Option<thread::JoinHandle<String>>,
    exit: Option<ExitOutcome>,
    removal: Removal,
    peak_memory: Option<u64>,
    last_sample: Option<Instant>,
}

impl ContainerHandle {
    fn sample_memory(&mut self) {
        if self.memory_paths.is_empty() {
            return;
        }
        if let Some(last) = self.last_sample {
            if last.elapsed() < MEMORY_SAMPLE_INTERVAL {
                return;
            }
        }
        self.last_sample = Some(Instant::now());

        for path in &self.memory_paths {
            if let Ok(raw) = std::fs::read_to_string(path) {
                if let Ok(value) = raw.trim().parse::<u64>() {
                    self.peak_memory = Some(self.peak_memory.map_or(value, |p| p.max(value)));
                    return;
                }
            }
        }
    }

    fn queue_removal(&mut self) {
        if self.removal == Removal::NotRequested {
            self.remover.submit(&self.name);
            self.removal = Removal::Queued;
        }
    }
}

impl IsolationHandle for ContainerHandle {
    fn id(&self) -> &str {
        &self.name
    }

    fn take_stdout(&mut self) -> Option<OutputPipe> {
        self.logs
            .stdout
            .take()
            .map(|pipe| Box::new(pipe) as OutputPipe)
    }

    fn take_stderr(&mut self) -> Option<OutputPipe> {
        self.logs
            .stderr
            .take()
            .map(|pipe| Box::new(pipe) as OutputPipe)
    }

    fn try_wait(&mut self) -> Result<Option<ExitOutcome>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let status = match self.waiter.try_wait()? {
            Some(status) => status,
            None => {
                self.sample_memory();
                return Ok(None);
            }
        };

        let printed = collect(self.waiter_output.take());
        let exit = match printed.trim().parse::<i32>() {
            Ok(code) if status.success() => exit_outcome(code),
            // Removed under the waiter by our own rm --force
            _ if self.removal == Removal::Confirmed => ExitOutcome::signaled(libc::SIGKILL),
            _ => {
                return Err(SandboxError::Process(format!(
                    "lost container {}: wait client ended with {} ({:?})",
                    self.name,
                    status,
                    printed.trim()
                )))
            }
        };
        self.exit = Some(exit);
        Ok(Some(exit))
    }

    fn terminate(&mut self, budget: Duration) -> Result<()> {
        let args = ["kill", "--signal", "SIGTERM", self.name.as_str()];
        match control_within(&self.binary, &args, budget)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(SandboxError::Process(format!(
                "SIGTERM to {} not delivered ({})",
                self.name, status
            ))),
            None => Err(SandboxError::Process(format!(
                "SIGTERM to {} unanswered after {:?}",
                self.name, budget
            ))),
        }
    }

    /// `kill` gets half the budget. Unless the runtime confirms it, the rest
    /// goes to `rm --force`; if that is not confirmed either, removal is
    /// queued in the background.
    fn kill(&mut self, budget: Duration) -> Result<()> {
        let start = Instant::now();
        let killed = control_within(&self.binary, &["kill", self.name.as_str()], budget / 2);
        if let Ok(Some(status)) = &killed {
            if status.success() {
                return Ok(());
            }
        }
        debug!("kill of {} not confirmed ({:?}); forcing removal", self.name, killed);

        let remaining = budget.saturating_sub(start.elapsed());
        let removed = control_within(
            &self.binary,
            &["rm", "--force", self.name.as_str()],
            remaining,
        );
        match removed {
            Ok(Some(status)) if status.success() => {
                self.removal = Removal::Confirmed;
                Ok(())
            }
            other => {
                self.queue_removal();
                Err(SandboxError::Process(format!(
                    "container {} not confirmed removed within {:?} ({:?}); removal queued",
                    self.name, budget, other
                )))
            }
        }
    }

    fn peak_memory(&self) -> Option<u64> {
        self.peak_memory
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.exit.is_none() && self.removal != Removal::Confirmed {
            warn!("Container {} dropped before exit; removing", self.name);
        }
        // Stopped containers are not auto-removed
        if self.removal != Removal::Confirmed {
            self.queue_removal();
        }
        for client in [&mut self.logs, &mut self.waiter] {
            if let Ok(None) = client.try_wait() {
                let _ = client.kill();
            }
            let _ = client.wait();
        }
    }
}

fn bind_mount(source: &Path, target: &Path, mode: MountMode) -> Result<String> {
    let source_str = source.display().to_string();
    let target_str = target.display().to_string();
    if source_str.contains(',') || target_str.contains(',') {
        return Err(SandboxError::LaunchFailed(format!(
            "mount path contains ',': {} -> {}",
            source_str, target_str
        )));
    }
    let mut spec = format!("type=bind,source={},target={}", source_str, target_str);
    if mode == MountMode::ReadOnly {
        spec.push_str(",readonly");
    }
    Ok(spec)
}

/// The runtime reports death by signal N as exit code 128+N. Only
/// crash-class signals are decoded; other codes are taken literally.
fn exit_outcome(code: i32) -> ExitOutcome {
    if code > 128 && is_crash_signal(code - 128) {
        return ExitOutcome::signaled(code - 128);
    }
    ExitOutcome::exited(code)
}

fn cgroup_memory_paths(container_id: &str) -> Vec<PathBuf> {
    if container_id.is_empty() || !container_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Vec::new();
    }
    let root = Path::new("/sys/fs/cgroup");
    let scopes = [
        root.join(format!("system.slice/docker-{}.scope", container_id)),
        root.join(format!("docker/{}", container_id)),
        root.join(format!("machine.slice/libpod-{}.scope", container_id)),
    ];
    scopes
        .iter()
        .flat_map(|scope| [scope.join("memory.peak"), scope.join("memory.current")])
        .collect()
}

/// `<id> <engine label>` lines; the label is `None` when absent or malformed
fn parse_orphan_listing(listing: &str) -> Vec<(&str, Option<EngineInstance>)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let owner = parts.next().and_then(EngineInstance::parse);
            Some((id, owner))
        })
        .collect()
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
