//! Study configuration
//!
//! A study is described by one JSON5 file (comments and trailing commas
//! allowed):
//!
//! ```json5
//! {
//!   sandbox: {
//!     image: "shellstudy/sandbox:latest",
//!     user: "me",
//!     filesystem_root: "/srv/shellstudy/fs",
//!   },
//!   schedule: { training: [21, 22], block_i: [5, 10], block_ii: [8, 7] },
//!   tasks_file: "tasks.json",
//! }
//! ```
//!
//! Relative paths are resolved against the directory holding the file. The
//! loaded configuration is immutable and shared through `Arc`.

use crate::diff::DiffOptions;
use crate::errors::{ConfigError, Result, StudyError};
use crate::runtime::RuntimeKind;
use crate::scheduler::{ScheduleConfig, Scheduler};
use crate::task::{TaskCatalog, TaskRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const KNOWN_KEYS: &[&str] = &["sandbox", "schedule", "tasks", "tasks_file", "diff"];

fn default_user() -> String {
    "me".to_string()
}

fn default_service_port() -> u16 {
    10411
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    250
}

/// External scripts that create and delete a sandbox's filesystem root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionScripts {
    /// Called as `<make_root> <name>`; prints the home directory path on stdout
    pub make_root: PathBuf,
    /// Called as `<delete_root> <name>`
    pub delete_root: PathBuf,
}

/// Sandbox container settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Image every sandbox is created from
    pub image: String,
    /// Unprivileged working user inside the sandbox
    #[serde(default = "default_user")]
    pub user: String,
    /// In-sandbox service port published to the host
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Host directory holding one filesystem root per sandbox
    pub filesystem_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeKind>,
    /// Use scripts instead of plain directories under `filesystem_root`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts: Option<ProvisionScripts>,
}

impl SandboxConfig {
    /// Minimal settings for the given image and host root
    pub fn new(image: impl Into<String>, filesystem_root: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            user: default_user(),
            service_port: default_service_port(),
            startup_timeout_secs: default_startup_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            filesystem_root: filesystem_root.into(),
            runtime: None,
            scripts: None,
        }
    }

    /// Home directory of the working user inside the sandbox
    pub fn home_dir(&self) -> String {
        format!("/home/{}", self.user)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Complete study configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyConfig {
    pub sandbox: SandboxConfig,
    pub schedule: ScheduleConfig,
    /// Inline task definitions
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    /// JSON file with more task definitions, relative to the config file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_file: Option<PathBuf>,
    /// Attributes the diff engine compares beyond the defaults
    #[serde(default)]
    pub diff: DiffOptions,
}

impl StudyConfig {
    /// Load, resolve and validate a study file
    pub fn load_from_path(path: &Path) -> Result<StudyConfig> {
        debug!("Loading study configuration from {}", path.display());

        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            debug!("Failed to read configuration file: {}", e);
            StudyError::Config(ConfigError::Io(e))
        })?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let config = Self::from_json5_str(&content, base_dir)?;

        debug!(
            "Loaded study configuration: {} tasks, {} scored",
            config.tasks.len(),
            config.schedule.block_i.len() + config.schedule.block_ii.len()
        );
        Ok(config)
    }

    /// Parse a study file body; relative paths resolve against `base_dir`
    pub fn from_json5_str(content: &str, base_dir: &Path) -> Result<StudyConfig> {
        let raw_value: serde_json::Value = json5::from_str(content).map_err(|e| {
            StudyError::Config(ConfigError::Parsing {
                message: format!("JSON parsing error: {}", e),
            })
        })?;

        let serde_json::Value::Object(obj) = &raw_value else {
            return Err(ConfigError::Validation {
                message: "Study configuration must contain a JSON object literal".to_string(),
            }
            .into());
        };
        for key in obj.keys().filter(|k| !KNOWN_KEYS.contains(&k.as_str())) {
            debug!("Ignoring unknown configuration key: {}", key);
        }

        let mut config: StudyConfig = serde_json::from_value(raw_value).map_err(|e| {
            StudyError::Config(ConfigError::Validation {
                message: format!("Deserialization error: {}", e),
            })
        })?;

        config.resolve_paths(base_dir)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: &Path) -> Result<()> {
        let resolve = |p: &Path| -> PathBuf {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        };

        self.sandbox.filesystem_root = resolve(&self.sandbox.filesystem_root);
        if let Some(scripts) = &mut self.sandbox.scripts {
            scripts.make_root = resolve(&scripts.make_root);
            scripts.delete_root = resolve(&scripts.delete_root);
        }

        if let Some(tasks_file) = self.tasks_file.take() {
            let tasks_path = resolve(&tasks_file);
            debug!("Loading tasks from {}", tasks_path.display());
            let content = std::fs::read_to_string(&tasks_path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StudyError::Config(ConfigError::NotFound {
                        path: tasks_path.display().to_string(),
                    })
                } else {
                    StudyError::Config(ConfigError::Io(e))
                }
            })?;
            let records: Vec<TaskRecord> = json5::from_str(&content).map_err(|e| {
                StudyError::Config(ConfigError::Parsing {
                    message: format!("{}: {}", tasks_path.display(), e),
                })
            })?;
            self.tasks.extend(records);
            self.tasks_file = Some(tasks_path);
        }
        Ok(())
    }

    /// Structural checks; task-level checks run when the catalog is built
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| -> StudyError {
            ConfigError::Validation {
                message: message.to_string(),
            }
            .into()
        };

        if self.sandbox.image.trim().is_empty() {
            return Err(invalid("sandbox.image must not be empty"));
        }
        if self.sandbox.user.is_empty()
            || !self
                .sandbox
                .user
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("sandbox.user must be a plain user name"));
        }
        if self.sandbox.startup_timeout_secs == 0 {
            return Err(invalid("sandbox.startup_timeout_secs must be positive"));
        }
        if self.sandbox.poll_interval_ms == 0 {
            return Err(invalid("sandbox.poll_interval_ms must be positive"));
        }
        self.schedule.validate()?;
        self.build_scheduler().map(|_| ())
    }

    pub fn catalog(&self) -> Result<TaskCatalog> {
        TaskCatalog::from_records(self.tasks.clone())
    }

    pub fn build_scheduler(&self) -> Result<Scheduler> {
        Scheduler::new(self.schedule.clone(), self.catalog()?)
    }
}
