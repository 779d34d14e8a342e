//! Check-config command

use anyhow::Result;
use shellstudy_core::config::StudyConfig;
use shellstudy_core::scheduler::Group;
use std::path::Path;
use tracing::{info, instrument};

/// Load and validate the study file, then print a short summary
#[instrument]
pub fn execute_check_config(config_path: &Path) -> Result<()> {
    let config = StudyConfig::load_from_path(config_path)?;
    let scheduler = config.build_scheduler()?;
    info!("Configuration {} is valid", config_path.display());

    println!("Configuration OK: {}", config_path.display());
    println!("  image: {}", config.sandbox.image);
    println!("  tasks in catalog: {}", scheduler.catalog().len());
    println!("  training tasks: {}", scheduler.total_training_tasks());
    println!("  scored tasks: {}", scheduler.total_scored_tasks());
    for group in Group::ALL {
        println!(
            "  {}: switch after {} tasks",
            group,
            scheduler.switch_point(group)
        );
    }
    Ok(())
}
