use crate::commands::diff::DiffArgs;
use crate::commands::sandbox::{SandboxDownArgs, SandboxUpArgs};
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use shellstudy_core::scheduler::Group;
use shellstudy_core::task::TaskType;
use std::path::PathBuf;

/// Study file used when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "shellstudy.json5";

/// Runtime selection options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum RuntimeOption {
    /// Docker runtime
    Docker,
    /// Podman runtime
    Podman,
}

impl From<RuntimeOption> for shellstudy_core::runtime::RuntimeKind {
    fn from(runtime: RuntimeOption) -> Self {
        match runtime {
            RuntimeOption::Docker => shellstudy_core::runtime::RuntimeKind::Docker,
            RuntimeOption::Podman => shellstudy_core::runtime::RuntimeKind::Podman,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Task type options for diff annotation
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TaskTypeOption {
    Stdout,
    FileSearch,
    FilesystemChange,
}

impl From<TaskTypeOption> for TaskType {
    fn from(option: TaskTypeOption) -> Self {
        match option {
            TaskTypeOption::Stdout => TaskType::Stdout,
            TaskTypeOption::FileSearch => TaskType::FileSearch,
            TaskTypeOption::FilesystemChange => TaskType::FilesystemChange,
        }
    }
}

/// Participant group options
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum GroupOption {
    Group1,
    Group2,
    Group3,
    Group4,
}

impl From<GroupOption> for Group {
    fn from(option: GroupOption) -> Self {
        match option {
            GroupOption::Group1 => Group::Group1,
            GroupOption::Group2 => Group::Group2,
            GroupOption::Group3 => Group::Group3,
            GroupOption::Group4 => Group::Group4,
        }
    }
}

/// Operator CLI for shell-task user studies
#[derive(Debug, Parser)]
#[command(
    name = "shellstudy",
    version,
    about = "Shell-task user study toolkit",
    long_about = "Shell-task user study toolkit\n\nInspects study configuration, snapshots and diffs filesystems, and manages task sandboxes."
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via SHELLSTUDY_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Study configuration file path
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Container runtime to use (overrides SHELLSTUDY_RUNTIME and the study file)
    #[arg(long, global = true, value_enum)]
    pub runtime: Option<RuntimeOption>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serialize a directory tree to JSON on stdout
    Snapshot {
        /// Directory to serialize
        dir: PathBuf,
        /// Record files above this many bytes by hash only (the tree can then
        /// be diffed but not materialized)
        #[arg(long, value_name = "BYTES")]
        inline_limit: Option<u64>,
    },
    /// Recreate a JSON tree under a directory
    Materialize {
        /// JSON tree file
        tree: PathBuf,
        /// Target directory (created if missing)
        dir: PathBuf,
    },
    /// Compare a current tree against a goal tree
    Diff {
        /// Current tree: a directory or a JSON tree file
        current: PathBuf,
        /// Goal tree: a directory or a JSON tree file
        goal: PathBuf,
        /// Annotate the delta for this task type
        #[arg(long, value_enum)]
        task_type: Option<TaskTypeOption>,
        /// Command transcript whose listed paths are highlighted
        #[arg(long, value_name = "PATH")]
        output_file: Option<PathBuf>,
        /// Sandbox home directory the transcript's paths are relative to
        #[arg(long, default_value = "/home/me")]
        home: String,
        /// Compare ownership
        #[arg(long)]
        compare_owner: bool,
        /// Compare modification times
        #[arg(long)]
        compare_modified: bool,
    },
    /// Print the task order for a participant group
    Schedule {
        #[arg(long, value_enum)]
        group: GroupOption,
    },
    /// Validate the study configuration and task catalog
    CheckConfig,
    /// Manage task sandboxes by hand
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum SandboxCommands {
    /// Provision a sandbox for a task and print it as JSON
    Up {
        /// Task ID from the catalog
        #[arg(long)]
        task: u32,
        /// Filesystem root and container name
        #[arg(long)]
        name: String,
    },
    /// Remove a sandbox's container and filesystem root
    Down {
        #[arg(long)]
        container_id: Option<String>,
        /// Filesystem root name
        #[arg(long)]
        name: String,
    },
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub async fn dispatch(self) -> Result<()> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None,
        };

        let log_level = self.log_level.as_str();
        if std::env::var_os("SHELLSTUDY_LOG").is_none() && std::env::var_os("RUST_LOG").is_none() {
            std::env::set_var(
                "RUST_LOG",
                format!("shellstudy={},shellstudy_core={}", log_level, log_level),
            );
        }
        shellstudy_core::logging::init(log_format)?;
        tracing::debug!("CLI initialized with log level: {}", log_level);

        let config_path = self.config_path();
        let runtime = self.runtime.map(Into::into);

        match self.command {
            Commands::Snapshot { dir, inline_limit } => {
                crate::commands::snapshot::execute_snapshot(&dir, inline_limit).await
            }
            Commands::Materialize { tree, dir } => {
                crate::commands::snapshot::execute_materialize(&tree, &dir).await
            }
            Commands::Diff {
                current,
                goal,
                task_type,
                output_file,
                home,
                compare_owner,
                compare_modified,
            } => {
                crate::commands::diff::execute_diff(DiffArgs {
                    current,
                    goal,
                    task_type: task_type.map(Into::into),
                    output_file,
                    home,
                    compare_owner,
                    compare_modified,
                })
                .await
            }
            Commands::Schedule { group } => {
                crate::commands::schedule::execute_schedule(&config_path, group.into())
            }
            Commands::CheckConfig => crate::commands::check_config::execute_check_config(&config_path),
            Commands::Sandbox { command } => match command {
                SandboxCommands::Up { task, name } => {
                    crate::commands::sandbox::execute_up(SandboxUpArgs {
                        config_path,
                        runtime,
                        task_id: task,
                        name,
                    })
                    .await
                }
                SandboxCommands::Down { container_id, name } => {
                    crate::commands::sandbox::execute_down(SandboxDownArgs {
                        config_path,
                        runtime,
                        container_id,
                        name,
                    })
                    .await
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "shellstudy",
            "schedule",
            "--group",
            "group3",
            "--runtime",
            "podman",
            "--config",
            "study.json5",
        ])
        .unwrap();
        assert_eq!(cli.runtime, Some(RuntimeOption::Podman));
        assert_eq!(cli.config_path(), PathBuf::from("study.json5"));
        assert!(matches!(
            cli.command,
            Commands::Schedule {
                group: GroupOption::Group3
            }
        ));
    }

    #[test]
    fn test_default_config_path() {
        let cli = Cli::try_parse_from(["shellstudy", "check-config"]).unwrap();
        assert_eq!(cli.config_path(), PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_diff_task_type_values() {
        let cli = Cli::try_parse_from([
            "shellstudy",
            "diff",
            "a",
            "b",
            "--task-type",
            "file-search",
        ])
        .unwrap();
        match cli.command {
            Commands::Diff { task_type, .. } => {
                assert_eq!(task_type.map(TaskType::from), Some(TaskType::FileSearch))
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
