//! Sandbox runtime abstraction and CLI implementation
//!
//! The study core drives containers through the [`SandboxRuntime`] trait. The
//! production implementation shells out to the `docker` (or `podman`) binary;
//! tests use [`mock::MockRuntime`].

use crate::errors::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Command;
use tracing::{debug, instrument};

/// Container information returned by inspect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container ID
    pub id: String,
    /// Container name (without the leading slash)
    pub name: String,
    /// Container image
    pub image: String,
    /// Container state (`created`, `running`, `exited`, ...)
    pub state: String,
    /// Port mappings from host to container
    pub port_mappings: Vec<PortMapping>,
    /// Container labels
    pub labels: HashMap<String, String>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    /// Host port published for the given container port, if any
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.port_mappings
            .iter()
            .find(|m| m.container_port == container_port && m.protocol == "tcp")
            .map(|m| m.host_port)
    }
}

/// Represents a port mapping from host to container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host port
    pub host_port: u16,
    /// Container port
    pub container_port: u16,
    /// Protocol (tcp/udp)
    pub protocol: String,
    /// Host IP
    pub host_ip: String,
}

/// A host directory mounted into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeBinding {
    fn to_arg(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.host_path, self.container_path, mode)
    }
}

/// Container port to publish; `host_port: None` lets the runtime pick an ephemeral port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: Option<u16>,
}

impl PortBinding {
    fn to_arg(self) -> String {
        match self.host_port {
            Some(host) => format!("{}:{}", host, self.container_port),
            None => self.container_port.to_string(),
        }
    }
}

/// Everything needed to create one sandbox container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub volume_bindings: Vec<VolumeBinding>,
    pub port_bindings: Vec<PortBinding>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Arguments for `<runtime> create`
    pub fn create_args(&self) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), self.name.clone()];

        let mut labels: Vec<_> = self.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for volume in &self.volume_bindings {
            args.push("-v".to_string());
            args.push(volume.to_arg());
        }
        for port in &self.port_bindings {
            args.push("-p".to_string());
            args.push(port.to_arg());
        }

        args.push(self.image.clone());
        args
    }
}

/// Configuration for executing commands in containers
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    /// User to run command as
    pub user: Option<String>,
    /// Working directory
    pub working_dir: Option<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
}

impl ExecConfig {
    pub fn as_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Self::default()
        }
    }
}

/// Result of executing a command in a container
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the command
    pub exit_code: i32,
    /// Whether the command completed successfully (exit code 0)
    pub success: bool,
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
}

impl ExecResult {
    /// Turn a non-zero exit into [`RuntimeError::ExecFailed`]
    pub fn check(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(RuntimeError::ExecFailed {
                code: self.exit_code,
            }
            .into())
        }
    }
}

/// Container operations the sandbox lifecycle depends on
#[allow(async_fn_in_trait)]
pub trait SandboxRuntime {
    /// Health check for daemon availability
    async fn ping(&self) -> Result<()>;

    /// Create (but do not start) a container, returning its ID
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container
    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Inspect a container; `None` when it does not exist
    async fn inspect_container(&self, container_id: &str) -> Result<Option<ContainerInfo>>;

    /// Run a command inside a running container and capture its output
    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        config: ExecConfig,
    ) -> Result<ExecResult>;

    /// Force-remove a container; removing a missing container succeeds
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Host port mapped to `container_port`, discovered through inspect
    async fn inspect_port(&self, container_id: &str, container_port: u16) -> Result<Option<u16>> {
        Ok(self
            .inspect_container(container_id)
            .await?
            .and_then(|info| info.host_port(container_port)))
    }
}

/// Generic CLI-based container runtime implementation
///
/// Used for both Docker and Podman since they share a compatible CLI.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    /// Container runtime CLI binary path (e.g., "docker" or "podman")
    runtime_path: String,
}

impl CliRuntime {
    pub fn docker() -> Self {
        Self {
            runtime_path: "docker".to_string(),
        }
    }

    pub fn podman() -> Self {
        Self {
            runtime_path: "podman".to_string(),
        }
    }

    /// Create a new CliRuntime with custom runtime binary path
    pub fn with_runtime_path(runtime_path: String) -> Self {
        Self { runtime_path }
    }

    pub fn runtime_path(&self) -> &str {
        &self.runtime_path
    }

    /// Parse port mappings from container NetworkSettings.Ports
    fn parse_port_mappings(container: &serde_json::Value) -> Vec<PortMapping> {
        let mut port_mappings = Vec::new();

        let Some(ports_obj) = container
            .get("NetworkSettings")
            .and_then(|ns| ns.get("Ports"))
            .and_then(|p| p.as_object())
        else {
            return port_mappings;
        };

        for (port_spec, bindings) in ports_obj {
            let Some((port_str, protocol)) = port_spec.split_once('/') else {
                continue;
            };
            let Ok(container_port) = port_str.parse::<u16>() else {
                continue;
            };
            for binding in bindings.as_array().into_iter().flatten() {
                let host_port = binding
                    .get("HostPort")
                    .and_then(|hp| hp.as_str())
                    .and_then(|hp| hp.parse::<u16>().ok());
                if let Some(host_port) = host_port {
                    port_mappings.push(PortMapping {
                        host_port,
                        container_port,
                        protocol: protocol.to_string(),
                        host_ip: binding
                            .get("HostIp")
                            .and_then(|hi| hi.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
        }

        port_mappings
    }

    fn parse_container_info(container: &serde_json::Value) -> ContainerInfo {
        let labels = container
            .get("Config")
            .and_then(|config| config.get("Labels"))
            .and_then(|labels| labels.as_object())
            .map(|labels_obj| {
                labels_obj
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let text = |value: Option<&serde_json::Value>| {
            value
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string()
        };

        ContainerInfo {
            id: text(container.get("Id")),
            name: text(container.get("Name")).trim_start_matches('/').to_string(),
            image: text(container.get("Config").and_then(|c| c.get("Image"))),
            state: text(container.get("State").and_then(|s| s.get("Status"))),
            port_mappings: Self::parse_port_mappings(container),
            labels,
        }
    }

    /// Check if container runtime binary is available
    #[instrument(skip(self))]
    pub fn check_runtime_installed(&self) -> Result<()> {
        debug!(
            "Checking if container runtime binary is installed at: {}",
            self.runtime_path
        );

        match Command::new(&self.runtime_path).arg("--version").output() {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(RuntimeError::CliError(format!("Runtime version check failed: {}", stderr)).into())
            }
            Err(e) => {
                debug!("Container runtime binary not found: {}", e);
                Err(RuntimeError::NotInstalled.into())
            }
        }
    }

    /// Run the runtime binary with `args` on the blocking pool
    async fn run(&self, args: Vec<String>, action: &'static str) -> Result<std::process::Output> {
        let runtime_path = self.runtime_path.clone();

        tokio::task::spawn_blocking(move || {
            Command::new(&runtime_path).args(&args).output().map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::NotInstalled
                } else {
                    RuntimeError::CliError(format!("Failed to {}: {}", action, e))
                }
            })
        })
        .await
        .map_err(|e| RuntimeError::CliError(format!("Task join error: {}", e)))?
        .map_err(Into::into)
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::docker()
    }
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such object") || stderr.contains("No such container")
}

impl SandboxRuntime for CliRuntime {
    #[instrument(skip(self))]
    async fn ping(&self) -> Result<()> {
        let output = self
            .run(vec!["version".to_string(), "--format".to_string(), "{{.Server.Version}}".to_string()], "ping runtime")
            .await?;

        if output.status.success() {
            debug!(
                "Runtime daemon version: {}",
                String::from_utf8_lossy(&output.stdout).trim()
            );
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RuntimeError::CliError(format!("Runtime daemon not reachable: {}", stderr)).into())
        }
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let args = spec.create_args();
        debug!("Runtime create args: {:?}", args);

        let output = self.run(args, "create container").await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CliError(format!("Container create failed: {}", stderr)).into());
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("Created container with ID: {}", container_id);
        Ok(container_id)
    }

    #[instrument(skip(self))]
    async fn start_container(&self, container_id: &str) -> Result<()> {
        let output = self
            .run(vec!["start".to_string(), container_id.to_string()], "start container")
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_container(&stderr) {
                return Err(RuntimeError::ContainerNotFound {
                    id: container_id.to_string(),
                }
                .into());
            }
            return Err(RuntimeError::CliError(format!("Start command failed: {}", stderr)).into());
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn inspect_container(&self, container_id: &str) -> Result<Option<ContainerInfo>> {
        let output = self
            .run(vec!["inspect".to_string(), container_id.to_string()], "inspect container")
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_container(&stderr) {
                return Ok(None);
            }
            return Err(RuntimeError::CliError(format!("Inspect command failed: {}", stderr)).into());
        }

        let containers: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout)
            .map_err(|e| RuntimeError::CliError(format!("Failed to parse inspect JSON: {}", e)))?;

        Ok(containers.first().map(Self::parse_container_info))
    }

    #[instrument(skip(self, config))]
    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        config: ExecConfig,
    ) -> Result<ExecResult> {
        let mut args = vec!["exec".to_string()];

        if let Some(user) = config.user {
            args.push("-u".to_string());
            args.push(user);
        }
        if let Some(workdir) = config.working_dir {
            args.push("-w".to_string());
            args.push(workdir);
        }
        let mut env: Vec<_> = config.env.into_iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(container_id.to_string());
        args.extend(command.iter().cloned());

        debug!("Runtime exec args: {:?}", args);
        let output = self.run(args, "exec in container").await?;
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(ExecResult {
            exit_code,
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let output = self
            .run(
                vec!["rm".to_string(), "-f".to_string(), container_id.to_string()],
                "remove container",
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_container(&stderr) {
                debug!("Container {} already removed", container_id);
                return Ok(());
            }
            return Err(RuntimeError::CliError(format!("Remove command failed: {}", stderr)).into());
        }
        Ok(())
    }
}

/// Mock runtime for testing sandbox lifecycle flows
pub mod mock {
    //! In-memory implementation of [`SandboxRuntime`]
    //!
    //! Containers live in a shared map; port assignment, startup readiness and
    //! failures are configurable so lifecycle tests run without a daemon.

    use super::{ContainerInfo, ContainerSpec, ExecConfig, ExecResult, PortMapping, SandboxRuntime};
    use crate::errors::{Result, RuntimeError};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use tracing::{debug, instrument};

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration for the mock runtime
    #[derive(Debug, Clone)]
    pub struct MockRuntimeConfig {
        /// Simulate the daemon being unavailable
        pub daemon_unavailable: bool,
        /// State a container reports after `start` (`"running"` unless testing readiness)
        pub started_state: String,
        /// First host port handed out; later containers get the next ones
        pub first_host_port: u16,
        /// Publish no ports, to exercise port discovery failures
        pub omit_port_mappings: bool,
        /// Exit code returned for every exec
        pub exec_exit_code: i32,
        /// Make `create_container` fail
        pub fail_create: bool,
        /// Make `remove_container` fail
        pub fail_remove: bool,
    }

    impl Default for MockRuntimeConfig {
        fn default() -> Self {
            Self {
                daemon_unavailable: false,
                started_state: "running".to_string(),
                first_host_port: 32768,
                omit_port_mappings: false,
                exec_exit_code: 0,
                fail_create: false,
                fail_remove: false,
            }
        }
    }

    /// Mock container state
    #[derive(Debug, Clone)]
    pub struct MockContainer {
        pub id: String,
        pub spec: ContainerSpec,
        pub state: String,
        pub port_mappings: Vec<PortMapping>,
    }

    /// Record of an exec call for verification in tests
    #[derive(Debug, Clone)]
    pub struct MockExecCall {
        pub container_id: String,
        pub command: Vec<String>,
        pub user: Option<String>,
    }

    /// Mock runtime implementation; clones share state
    #[derive(Debug, Clone, Default)]
    pub struct MockRuntime {
        config: Arc<Mutex<MockRuntimeConfig>>,
        containers: Arc<Mutex<HashMap<String, MockContainer>>>,
        exec_history: Arc<Mutex<Vec<MockExecCall>>>,
        removed: Arc<Mutex<Vec<String>>>,
        next_id: Arc<Mutex<u64>>,
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_config(config: MockRuntimeConfig) -> Self {
            Self {
                config: Arc::new(Mutex::new(config)),
                ..Self::default()
            }
        }

        /// Update mock configuration
        pub fn update_config<F>(&self, f: F)
        where
            F: FnOnce(&mut MockRuntimeConfig),
        {
            f(&mut lock(&self.config));
        }

        /// Containers that currently exist
        pub fn live_containers(&self) -> Vec<MockContainer> {
            let mut containers: Vec<_> = lock(&self.containers).values().cloned().collect();
            containers.sort_by(|a, b| a.id.cmp(&b.id));
            containers
        }

        pub fn container(&self, id: &str) -> Option<MockContainer> {
            lock(&self.containers).get(id).cloned()
        }

        /// IDs passed to successful `remove_container` calls, in order
        pub fn removed_containers(&self) -> Vec<String> {
            lock(&self.removed).clone()
        }

        /// Get history of exec calls made
        pub fn get_exec_history(&self) -> Vec<MockExecCall> {
            lock(&self.exec_history).clone()
        }

        pub fn clear_exec_history(&self) {
            lock(&self.exec_history).clear();
        }

        fn check_daemon(&self) -> Result<()> {
            if lock(&self.config).daemon_unavailable {
                return Err(RuntimeError::NotInstalled.into());
            }
            Ok(())
        }
    }

    impl SandboxRuntime for MockRuntime {
        #[instrument(skip(self))]
        async fn ping(&self) -> Result<()> {
            self.check_daemon()
        }

        #[instrument(skip(self, spec), fields(name = %spec.name))]
        async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
            self.check_daemon()?;
            let config = lock(&self.config).clone();
            if config.fail_create {
                return Err(RuntimeError::CliError("Mock create failure".to_string()).into());
            }

            let mut containers = lock(&self.containers);
            if containers.values().any(|c| c.spec.name == spec.name) {
                return Err(RuntimeError::CliError(format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    spec.name
                ))
                .into());
            }

            let mut next_id = lock(&self.next_id);
            *next_id += 1;
            let id = format!("mock-{:04}", *next_id);

            let port_mappings = if config.omit_port_mappings {
                Vec::new()
            } else {
                spec.port_bindings
                    .iter()
                    .enumerate()
                    .map(|(i, binding)| PortMapping {
                        host_port: binding.host_port.unwrap_or(
                            config.first_host_port + (*next_id as u16 - 1) * 8 + i as u16,
                        ),
                        container_port: binding.container_port,
                        protocol: "tcp".to_string(),
                        host_ip: "0.0.0.0".to_string(),
                    })
                    .collect()
            };

            debug!("MockRuntime created container {}", id);
            containers.insert(
                id.clone(),
                MockContainer {
                    id: id.clone(),
                    spec: spec.clone(),
                    state: "created".to_string(),
                    port_mappings,
                },
            );
            Ok(id)
        }

        #[instrument(skip(self))]
        async fn start_container(&self, container_id: &str) -> Result<()> {
            self.check_daemon()?;
            let started_state = lock(&self.config).started_state.clone();
            match lock(&self.containers).get_mut(container_id) {
                Some(container) => {
                    container.state = started_state;
                    Ok(())
                }
                None => Err(RuntimeError::ContainerNotFound {
                    id: container_id.to_string(),
                }
                .into()),
            }
        }

        #[instrument(skip(self))]
        async fn inspect_container(&self, container_id: &str) -> Result<Option<ContainerInfo>> {
            self.check_daemon()?;
            Ok(lock(&self.containers).get(container_id).map(|c| ContainerInfo {
                id: c.id.clone(),
                name: c.spec.name.clone(),
                image: c.spec.image.clone(),
                state: c.state.clone(),
                port_mappings: if c.state == "running" {
                    c.port_mappings.clone()
                } else {
                    Vec::new()
                },
                labels: c.spec.labels.clone(),
            }))
        }

        #[instrument(skip(self, config))]
        async fn exec(
            &self,
            container_id: &str,
            command: &[String],
            config: ExecConfig,
        ) -> Result<ExecResult> {
            self.check_daemon()?;
            let running = lock(&self.containers)
                .get(container_id)
                .map(|c| c.state == "running");
            match running {
                None => {
                    return Err(RuntimeError::ContainerNotFound {
                        id: container_id.to_string(),
                    }
                    .into())
                }
                Some(false) => {
                    return Err(RuntimeError::CliError(format!(
                        "Container {} is not running",
                        container_id
                    ))
                    .into())
                }
                Some(true) => {}
            }

            lock(&self.exec_history).push(MockExecCall {
                container_id: container_id.to_string(),
                command: command.to_vec(),
                user: config.user,
            });

            let exit_code = lock(&self.config).exec_exit_code;
            Ok(ExecResult {
                exit_code,
                success: exit_code == 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        #[instrument(skip(self))]
        async fn remove_container(&self, container_id: &str) -> Result<()> {
            self.check_daemon()?;
            if lock(&self.config).fail_remove {
                return Err(RuntimeError::CliError("Mock remove failure".to_string()).into());
            }
            if lock(&self.containers).remove(container_id).is_some() {
                lock(&self.removed).push(container_id.to_string());
            }
            Ok(())
        }
    }
}
