//! Container runtime selection
//!
//! Chooses between Docker and Podman without changing sandbox logic; both are
//! driven through [`CliRuntime`].

use crate::docker::CliRuntime;
use crate::errors::{ConfigError, StudyError};

/// Environment variable overriding the configured runtime
pub const RUNTIME_ENV_VAR: &str = "SHELLSTUDY_RUNTIME";

/// Runtime selection options
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = StudyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            _ => Err(ConfigError::Validation {
                message: format!("Unknown runtime: {}. Supported runtimes: docker, podman", s),
            }
            .into()),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime factory for creating container runtime instances
pub struct RuntimeFactory;

impl RuntimeFactory {
    /// Precedence: CLI flag > `SHELLSTUDY_RUNTIME` > study config > docker
    pub fn detect_runtime(
        cli_runtime: Option<RuntimeKind>,
        config_runtime: Option<RuntimeKind>,
    ) -> RuntimeKind {
        if let Some(runtime) = cli_runtime {
            return runtime;
        }

        if let Ok(env_runtime) = std::env::var(RUNTIME_ENV_VAR) {
            match env_runtime.parse() {
                Ok(runtime) => return runtime,
                Err(_) => tracing::warn!(
                    "Ignoring unknown {} value '{}'",
                    RUNTIME_ENV_VAR,
                    env_runtime
                ),
            }
        }

        config_runtime.unwrap_or(RuntimeKind::Docker)
    }

    pub fn create_runtime(kind: RuntimeKind) -> CliRuntime {
        match kind {
            RuntimeKind::Docker => CliRuntime::docker(),
            RuntimeKind::Podman => CliRuntime::podman(),
        }
    }
}
