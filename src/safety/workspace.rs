/// Ephemeral per-request workspaces
///
/// Layout: `<root>/engine-<instance>/ws-<uuid>`, where `<instance>` is the
/// owning engine's [`EngineInstance`] label. The uuid is random and never
/// derived from request content. A workspace belongs to exactly one request
/// and is removed on every exit path through [`WorkspaceGuard`]'s `Drop`.
use crate::config::types::{Result, SandboxError};
use crate::observability::events;
use crate::safety::cleanup::{remove_tree, CleanupReaper};
use crate::safety::instance::EngineInstance;
use log::{debug, info, warn};
use std::fs;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const INSTANCE_PREFIX: &str = "engine-";
const WORKSPACE_PREFIX: &str = "ws-";

/// Identity the confined process runs as
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkspaceOwner {
    pub uid: u32,
    pub gid: u32,
}

/// Allocates workspaces under one engine instance directory
pub struct WorkspaceManager {
    root: PathBuf,
    instance: EngineInstance,
    instance_dir: PathBuf,
    reaper: CleanupReaper,
}

impl WorkspaceManager {
    pub fn new(root: &Path, instance: EngineInstance, reaper: CleanupReaper) -> Result<Self> {
        let create_failed = |path: &Path, e: std::io::Error| {
            SandboxError::WorkspaceCreateFailed(format!(
                "Failed to create instance directory {}: {}",
                path.display(),
                e
            ))
        };
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(root)
            .map_err(|e| create_failed(root, e))?;

        // Never adopt an existing directory: a leftover with this name is not ours
        let instance_dir = root.join(format!("{}{}", INSTANCE_PREFIX, instance.label()));
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&instance_dir)
            .map_err(|e| create_failed(&instance_dir, e))?;

        Ok(Self {
            root: root.to_path_buf(),
            instance,
            instance_dir,
            reaper,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    /// Create a fresh workspace for `request_id`.
    ///
    /// Running as root, the directory is 0700 and owned by `owner`. Otherwise
    /// ownership cannot be handed over, so the directory is 0755 and the
    /// confined process can read the artifact but not write next to it.
    pub fn acquire(&self, request_id: &str, owner: WorkspaceOwner) -> Result<WorkspaceGuard> {
        let path = self
            .instance_dir
            .join(format!("{}{}", WORKSPACE_PREFIX, Uuid::new_v4()));
        let as_root = nix::unistd::geteuid().is_root();

        fs::DirBuilder::new()
            .mode(0o700)
            .create(&path)
            .map_err(|e| {
                SandboxError::WorkspaceCreateFailed(format!(
                    "Failed to create workspace {}: {}",
                    path.display(),
                    e
                ))
            })?;

        // From here on the guard owns the directory and removes it on failure
        let guard = WorkspaceGuard {
            request_id: request_id.to_string(),
            path,
            owner: as_root.then_some(owner),
            reaper: self.reaper.clone(),
            released: false,
        };

        if as_root {
            chown(&guard.path, owner)?;
        } else {
            fs::set_permissions(&guard.path, fs::Permissions::from_mode(0o755)).map_err(|e| {
                SandboxError::WorkspaceCreateFailed(format!(
                    "Failed to set workspace permissions: {}",
                    e
                ))
            })?;
        }

        debug!("Workspace {} acquired for {}", guard.path.display(), request_id);
        Ok(guard)
    }

    /// Remove instance directories left behind by engines that died.
    /// Directories whose name does not carry a full instance label are
    /// treated as dead. Returns the number of workspaces removed.
    pub fn reclaim_orphans(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SandboxError::Io(e)),
        };
        let mut reclaimed = 0;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Failed to read workspace root entry: {}", e);
                    continue;
                }
            };
            let name = entry.file_name();
            let label = match name.to_str().and_then(|n| n.strip_prefix(INSTANCE_PREFIX)) {
                Some(label) => label,
                None => continue,
            };
            if label == self.instance.label().as_str() {
                continue;
            }
            if let Some(owner) = EngineInstance::parse(label) {
                if owner.is_alive() {
                    continue;
                }
            }

            let dir = entry.path();
            let workspaces = fs::read_dir(&dir)
                .map(|it| {
                    it.filter_map(|e| e.ok())
                        .filter(|e| e.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX))
                        .count()
                })
                .unwrap_or(0);

            match remove_tree(&dir) {
                Ok(()) => {
                    reclaimed += workspaces;
                    events::orphan_reclaimed(format!(
                        "removed {} workspaces of dead engine {}",
                        workspaces, label
                    ));
                }
                Err(e) => {
                    events::cleanup_warning("-", &dir, &e.to_string());
                    self.reaper.submit("-", dir);
                }
            }
        }

        if reclaimed > 0 {
            info!("Reclaimed {} orphaned workspaces", reclaimed);
        }
        Ok(reclaimed)
    }
}

impl Drop for WorkspaceManager {
    fn drop(&mut self) {
        // Only succeeds once every workspace is gone
        let _ = fs::remove_dir(&self.instance_dir);
    }
}

/// Exclusive ownership of one workspace directory
pub struct WorkspaceGuard {
    request_id: String,
    path: PathBuf,
    owner: Option<WorkspaceOwner>,
    reaper: CleanupReaper,
    released: bool,
}

impl WorkspaceGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the submitted artifact into the workspace
    pub fn materialize(&self, file_name: &str, content: &[u8]) -> Result<PathBuf> {
        if file_name.is_empty()
            || file_name.contains('/')
            || file_name.contains('\0')
            || file_name == "."
            || file_name == ".."
        {
            return Err(SandboxError::InvalidRequest(format!(
                "artifact name must be a plain file name: {:?}",
                file_name
            )));
        }

        let target = self.path.join(file_name);
        let write = || -> std::io::Result<()> {
            use std::io::Write;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o644)
                .open(&target)?;
            file.write_all(content)?;
            file.sync_all()
        };
        write().map_err(|e| {
            SandboxError::WorkspaceCreateFailed(format!(
                "Failed to write artifact {}: {}",
                target.display(),
                e
            ))
        })?;

        if let Some(owner) = self.owner {
            chown(&target, owner)?;
        }
        Ok(target)
    }

    /// Remove the workspace now. On failure the path goes to the reaper and
    /// a `CleanupWarning` event is raised.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        match remove_tree(&self.path) {
            Ok(()) => {
                debug!("Workspace {} released", self.path.display());
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                events::cleanup_warning(&self.request_id, &self.path, &reason);
                self.reaper.submit(&self.request_id, self.path.clone());
                Err(SandboxError::WorkspaceCleanupFailed {
                    path: self.path.clone(),
                    reason,
                })
            }
        }
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        let _ = self.release_inner();
    }
}

fn chown(path: &Path, owner: WorkspaceOwner) -> Result<()> {
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(owner.uid)),
        Some(nix::unistd::Gid::from_raw(owner.gid)),
    )
    .map_err(|e| {
        SandboxError::WorkspaceCreateFailed(format!(
            "Failed to chown {} to {}:{}: {}",
            path.display(),
            owner.uid,
            owner.gid,
            e
        ))
    })
}
