//! Sandbox lifecycle
//!
//! A sandbox is one container plus one host-side filesystem root, bind-mounted
//! as the working user's home directory, plus the host port its service is
//! published on. [`SandboxManager`] provisions, resets and destroys them.

use crate::config::{ProvisionScripts, SandboxConfig};
use crate::docker::{ContainerSpec, ExecConfig, PortBinding, SandboxRuntime, VolumeBinding};
use crate::errors::{Result, StudyError};
use crate::snapshot::{self, FsNode, MaterializeReport, SnapshotOptions};
use crate::task::{Fixup, Task};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Label put on every sandbox container
pub const SANDBOX_LABEL: &str = "shellstudy.sandbox";

/// A provisioned sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    /// Runtime-assigned container ID
    pub container_id: String,
    /// Unique name of the filesystem root (also the container name)
    pub filesystem_name: String,
    /// Host path bind-mounted as the sandbox home directory
    pub home_path: PathBuf,
    /// Host port of the in-sandbox service
    pub port: u16,
}

/// Creates and deletes per-sandbox filesystem roots
#[allow(async_fn_in_trait)]
pub trait FilesystemProvisioner {
    /// Allocate the root called `name` and return the host home directory inside it
    async fn make_root(&self, name: &str) -> Result<PathBuf>;

    /// Delete the root called `name`; deleting a missing root succeeds
    async fn delete_root(&self, name: &str) -> Result<()>;
}

fn check_root_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(StudyError::ProvisioningFailure {
            name: name.to_string(),
            reason: "invalid filesystem root name".to_string(),
        });
    }
    Ok(())
}

/// Plain directories: `<base>/<name>/home`
#[derive(Debug, Clone)]
pub struct DirectoryProvisioner {
    base: PathBuf,
}

impl DirectoryProvisioner {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn root_path(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }
}

impl FilesystemProvisioner for DirectoryProvisioner {
    #[instrument(skip(self))]
    async fn make_root(&self, name: &str) -> Result<PathBuf> {
        check_root_name(name)?;
        let root = self.root_path(name);

        if tokio::fs::try_exists(&root).await.unwrap_or(false) {
            warn!("Replacing stale filesystem root {}", root.display());
            tokio::fs::remove_dir_all(&root)
                .await
                .map_err(|e| snapshot_io(&root, e))?;
        }

        let home = root.join("home");
        tokio::fs::create_dir_all(&home)
            .await
            .map_err(|e| snapshot_io(&home, e))?;
        debug!("Created filesystem root {}", root.display());
        Ok(home)
    }

    #[instrument(skip(self))]
    async fn delete_root(&self, name: &str) -> Result<()> {
        check_root_name(name)?;
        let root = self.root_path(name);
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Filesystem root {} already deleted", root.display());
                Ok(())
            }
            Err(e) => Err(snapshot_io(&root, e)),
        }
    }
}

fn snapshot_io(path: &Path, e: std::io::Error) -> StudyError {
    crate::errors::SnapshotError::io(path, e).into()
}

/// External scripts, e.g. for loop-mounted virtual filesystems
#[derive(Debug, Clone)]
pub struct ScriptProvisioner {
    scripts: ProvisionScripts,
}

impl ScriptProvisioner {
    pub fn new(scripts: ProvisionScripts) -> Self {
        Self { scripts }
    }

    async fn run(&self, script: &Path, name: &str) -> Result<String> {
        let output = tokio::process::Command::new(script)
            .arg(name)
            .output()
            .await
            .map_err(|e| StudyError::ProvisioningFailure {
                name: name.to_string(),
                reason: format!("failed to run {}: {}", script.display(), e),
            })?;

        if !output.status.success() {
            return Err(StudyError::ProvisioningFailure {
                name: name.to_string(),
                reason: format!(
                    "{} exited with {}: {}",
                    script.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl FilesystemProvisioner for ScriptProvisioner {
    #[instrument(skip(self))]
    async fn make_root(&self, name: &str) -> Result<PathBuf> {
        check_root_name(name)?;
        let home = self.run(&self.scripts.make_root, name).await?;
        if home.is_empty() {
            return Err(StudyError::ProvisioningFailure {
                name: name.to_string(),
                reason: "make_root script printed no home directory".to_string(),
            });
        }
        Ok(PathBuf::from(home))
    }

    #[instrument(skip(self))]
    async fn delete_root(&self, name: &str) -> Result<()> {
        check_root_name(name)?;
        self.run(&self.scripts.delete_root, name).await.map(|_| ())
    }
}

/// Either provisioner, chosen from configuration
#[derive(Debug, Clone)]
pub enum AnyProvisioner {
    Directory(DirectoryProvisioner),
    Script(ScriptProvisioner),
}

impl AnyProvisioner {
    pub fn from_config(config: &SandboxConfig) -> Self {
        match &config.scripts {
            Some(scripts) => Self::Script(ScriptProvisioner::new(scripts.clone())),
            None => Self::Directory(DirectoryProvisioner::new(config.filesystem_root.clone())),
        }
    }
}

impl FilesystemProvisioner for AnyProvisioner {
    async fn make_root(&self, name: &str) -> Result<PathBuf> {
        match self {
            Self::Directory(p) => p.make_root(name).await,
            Self::Script(p) => p.make_root(name).await,
        }
    }

    async fn delete_root(&self, name: &str) -> Result<()> {
        match self {
            Self::Directory(p) => p.delete_root(name).await,
            Self::Script(p) => p.delete_root(name).await,
        }
    }
}

/// Provisions, resets and destroys sandboxes
#[derive(Debug)]
pub struct SandboxManager<R, F> {
    runtime: R,
    provisioner: F,
    config: SandboxConfig,
}

impl<R: SandboxRuntime, F: FilesystemProvisioner> SandboxManager<R, F> {
    pub fn new(runtime: R, provisioner: F, config: SandboxConfig) -> Self {
        Self {
            runtime,
            provisioner,
            config,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Create a ready sandbox seeded with the task's initial filesystem.
    ///
    /// Any failure after the filesystem root exists removes whatever was
    /// created and surfaces as [`StudyError::ProvisioningFailure`].
    #[instrument(skip(self, task), fields(task_id = task.task_id))]
    pub async fn provision(&self, filesystem_name: &str, task: &Task) -> Result<Sandbox> {
        let home_path = self
            .provisioner
            .make_root(filesystem_name)
            .await
            .map_err(|e| provisioning_failure(filesystem_name, e))?;

        let mut container_id = None;
        match self
            .provision_into(filesystem_name, &home_path, task, &mut container_id)
            .await
        {
            Ok(sandbox) => {
                info!(
                    container_id = %sandbox.container_id,
                    port = sandbox.port,
                    "Provisioned sandbox {}",
                    filesystem_name
                );
                Ok(sandbox)
            }
            Err(e) => {
                warn!("Provisioning {} failed, rolling back: {}", filesystem_name, e);
                self.release(filesystem_name, container_id.as_deref()).await;
                Err(provisioning_failure(filesystem_name, e))
            }
        }
    }

    async fn provision_into(
        &self,
        filesystem_name: &str,
        home_path: &Path,
        task: &Task,
        container_id: &mut Option<String>,
    ) -> Result<Sandbox> {
        self.seed(home_path, &task.initial_filesystem).await?;

        let spec = ContainerSpec {
            image: self.config.image.clone(),
            name: filesystem_name.to_string(),
            volume_bindings: vec![VolumeBinding {
                host_path: home_path.display().to_string(),
                container_path: self.config.home_dir(),
                read_only: false,
            }],
            port_bindings: vec![PortBinding {
                container_port: self.config.service_port,
                host_port: None,
            }],
            labels: HashMap::from([(SANDBOX_LABEL.to_string(), filesystem_name.to_string())]),
        };

        let id = self.runtime.create_container(&spec).await?;
        *container_id = Some(id.clone());
        self.runtime.start_container(&id).await?;
        self.wait_until_running(filesystem_name, &id).await?;

        self.normalize_ownership(&id).await?;
        for fixup in &task.fixups {
            self.apply_fixup(&id, home_path, fixup).await?;
        }

        let port = self
            .runtime
            .inspect_port(&id, self.config.service_port)
            .await?
            .ok_or_else(|| StudyError::ProvisioningFailure {
                name: filesystem_name.to_string(),
                reason: format!("no host port published for {}/tcp", self.config.service_port),
            })?;

        Ok(Sandbox {
            container_id: id,
            filesystem_name: filesystem_name.to_string(),
            home_path: home_path.to_path_buf(),
            port,
        })
    }

    async fn wait_until_running(&self, name: &str, container_id: &str) -> Result<()> {
        let timeout = self.config.startup_timeout();
        let deadline = Instant::now() + timeout;

        loop {
            match self.runtime.inspect_container(container_id).await? {
                Some(info) if info.is_running() => return Ok(()),
                Some(info) if info.state == "exited" || info.state == "dead" => {
                    return Err(StudyError::ProvisioningFailure {
                        name: name.to_string(),
                        reason: format!("container {} during startup", info.state),
                    })
                }
                Some(info) => debug!("Waiting for {} (state: {})", container_id, info.state),
                None => {
                    return Err(StudyError::ProvisioningFailure {
                        name: name.to_string(),
                        reason: "container disappeared during startup".to_string(),
                    })
                }
            }

            if Instant::now() >= deadline {
                return Err(StudyError::ProvisioningFailure {
                    name: name.to_string(),
                    reason: format!("not running after {}s", timeout.as_secs()),
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn seed(&self, home_path: &Path, tree: &FsNode) -> Result<MaterializeReport> {
        let tree = tree.clone();
        let home = home_path.to_path_buf();
        let report = tokio::task::spawn_blocking(move || snapshot::materialize(&tree, &home))
            .await
            .map_err(|e| StudyError::Internal(format!("Task join error: {}", e)))?;

        if !report.is_success() {
            warn!(
                failures = report.failures.len(),
                "Some entries of the initial filesystem could not be materialized"
            );
        }
        Ok(report)
    }

    async fn normalize_ownership(&self, container_id: &str) -> Result<()> {
        let owner = format!("{0}:{0}", self.config.user);
        let command = vec![
            "chown".to_string(),
            "-R".to_string(),
            owner,
            self.config.home_dir(),
        ];
        self.runtime
            .exec(container_id, &command, ExecConfig::as_user("root"))
            .await?
            .check()
            .map(|_| ())
    }

    async fn apply_fixup(&self, container_id: &str, home_path: &Path, fixup: &Fixup) -> Result<()> {
        match fixup {
            Fixup::SetModified { path, timestamp } => {
                let relative = Path::new(path);
                if !relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)))
                {
                    return Err(StudyError::Internal(format!(
                        "fixup path must stay inside the home directory: {}",
                        path
                    )));
                }
                let target = home_path.join(relative);
                let time = snapshot::secs_to_system_time(*timestamp);
                debug!("Setting modified time of {} to {}", target.display(), timestamp);
                tokio::task::spawn_blocking(move || {
                    std::fs::File::open(&target)
                        .and_then(|f| f.set_modified(time))
                        .map_err(|e| snapshot_io(&target, e))
                })
                .await
                .map_err(|e| StudyError::Internal(format!("Task join error: {}", e)))?
            }
            Fixup::Exec { user, argv } => {
                debug!("Running fixup {:?} as {}", argv, user);
                self.runtime
                    .exec(container_id, argv, ExecConfig::as_user(user.clone()))
                    .await?
                    .check()
                    .map(|_| ())
            }
        }
    }

    /// Remove the container and filesystem root; never fails
    #[instrument(skip(self, sandbox), fields(name = %sandbox.filesystem_name))]
    pub async fn destroy(&self, sandbox: &Sandbox) {
        self.release(&sandbox.filesystem_name, Some(&sandbox.container_id))
            .await;
        debug!("Destroyed sandbox {}", sandbox.filesystem_name);
    }

    /// Remove a container (when known) and a filesystem root by name; never fails
    pub async fn release(&self, filesystem_name: &str, container_id: Option<&str>) {
        if let Some(id) = container_id {
            if let Err(e) = self.runtime.remove_container(id).await {
                warn!("Failed to remove container {}: {}", id, e);
            }
        }
        if let Err(e) = self.provisioner.delete_root(filesystem_name).await {
            warn!("Failed to delete filesystem root {}: {}", filesystem_name, e);
        }
    }

    /// Wipe the home directory and re-seed it; identity and port stay the same.
    ///
    /// Timestamp fixups are re-applied; exec fixups are not repeated.
    #[instrument(skip(self, sandbox, task), fields(name = %sandbox.filesystem_name))]
    pub async fn reset(&self, sandbox: &Sandbox, task: &Task) -> Result<MaterializeReport> {
        let home = sandbox.home_path.clone();
        let cleared = tokio::task::spawn_blocking(move || snapshot::clear_directory(&home))
            .await
            .map_err(|e| StudyError::Internal(format!("Task join error: {}", e)))?;

        if let Err(e) = cleared {
            warn!("Host-side wipe failed ({}), wiping inside the sandbox", e);
            let command = vec![
                "find".to_string(),
                self.config.home_dir(),
                "-mindepth".to_string(),
                "1".to_string(),
                "-delete".to_string(),
            ];
            self.runtime
                .exec(&sandbox.container_id, &command, ExecConfig::as_user("root"))
                .await?
                .check()?;
        }

        let report = self.seed(&sandbox.home_path, &task.initial_filesystem).await?;
        self.normalize_ownership(&sandbox.container_id).await?;
        for fixup in &task.fixups {
            if matches!(fixup, Fixup::SetModified { .. }) {
                self.apply_fixup(&sandbox.container_id, &sandbox.home_path, fixup)
                    .await?;
            }
        }
        Ok(report)
    }

    /// Serialize the sandbox's home directory
    pub async fn current_filesystem(&self, sandbox: &Sandbox) -> Result<FsNode> {
        let home = sandbox.home_path.clone();
        tokio::task::spawn_blocking(move || snapshot::serialize(&home, &SnapshotOptions::diff_only()))
            .await
            .map_err(|e| StudyError::Internal(format!("Task join error: {}", e)))?
    }
}

fn provisioning_failure(name: &str, error: StudyError) -> StudyError {
    match error {
        StudyError::ProvisioningFailure { .. } => error,
        other => StudyError::ProvisioningFailure {
            name: name.to_string(),
            reason: other.to_string(),
        },
    }
}
