//! Sandbox up/down commands
//!
//! Operator tools for provisioning a task's sandbox outside a study, and
//! for cleaning up after a failed or abandoned session.

use super::print_json;
use anyhow::Result;
use shellstudy_core::config::StudyConfig;
use shellstudy_core::docker::{CliRuntime, SandboxRuntime};
use shellstudy_core::runtime::{RuntimeFactory, RuntimeKind};
use shellstudy_core::sandbox::{AnyProvisioner, SandboxManager};
use std::path::PathBuf;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct SandboxUpArgs {
    pub config_path: PathBuf,
    pub runtime: Option<RuntimeKind>,
    pub task_id: u32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct SandboxDownArgs {
    pub config_path: PathBuf,
    pub runtime: Option<RuntimeKind>,
    pub container_id: Option<String>,
    pub name: String,
}

fn manager(
    config: &StudyConfig,
    runtime: Option<RuntimeKind>,
) -> SandboxManager<CliRuntime, AnyProvisioner> {
    let kind = RuntimeFactory::detect_runtime(runtime, config.sandbox.runtime);
    info!("Using {} runtime", kind);
    SandboxManager::new(
        RuntimeFactory::create_runtime(kind),
        AnyProvisioner::from_config(&config.sandbox),
        config.sandbox.clone(),
    )
}

#[instrument(skip(args), fields(task_id = args.task_id, name = %args.name))]
pub async fn execute_up(args: SandboxUpArgs) -> Result<()> {
    let config = StudyConfig::load_from_path(&args.config_path)?;
    let catalog = config.catalog()?;
    let task = catalog.get(args.task_id)?;

    let manager = manager(&config, args.runtime);
    manager.runtime().ping().await?;

    let sandbox = manager.provision(&args.name, task).await?;
    print_json(&sandbox)
}

#[instrument(skip(args), fields(name = %args.name))]
pub async fn execute_down(args: SandboxDownArgs) -> Result<()> {
    let config = StudyConfig::load_from_path(&args.config_path)?;
    let manager = manager(&config, args.runtime);
    manager
        .release(&args.name, args.container_id.as_deref())
        .await;
    println!("Released sandbox {}", args.name);
    Ok(())
}
