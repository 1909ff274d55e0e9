//! `keel plan` command implementation.
//!
//! Submits policy documents through the engine as a given user, prints the update result in its
//! columns and optionally applies the plan with the dry-run driver.

use anyhow::{Context, Result};
use keel_core::KeelConfig;
use keel_runtime::PlanExecutor;
use std::path::PathBuf;
use tracing::info;

use super::{open_engine, policy_sources, read_objects};

pub async fn run(config: &KeelConfig, user: &str, files: &[PathBuf], apply: bool) -> Result<()> {
    let objects = read_objects(&policy_sources(config, files)?)?;
    info!(objects = objects.len(), user = user, "Submitting policy");

    let engine = open_engine(config).await?;
    let result = engine
        .update_policy(user, objects)
        .await
        .context("Policy update rejected")?;

    for (column, value) in result.as_columns() {
        println!("{}:", column);
        for line in value.lines() {
            println!("  {}", line);
        }
    }
    if !result.changed_objects.is_empty() {
        println!("Changed objects:");
        for key in &result.changed_objects {
            println!("  {}", key);
        }
    }

    if apply {
        let executor = PlanExecutor::new().with_max_parallel(config.enforcer.max_parallel);
        let report = engine.apply_last(&executor).await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to render apply report")?
        );
    }

    Ok(())
}
