//! `keel run` command implementation.
//!
//! Loads `policy_dir` as the system user when it is configured, then runs the enforcement loop
//! until Ctrl-C.

use anyhow::{Context, Result};
use keel_core::{KeelConfig, RoleGrant, RoleId, User};
use keel_runtime::{Enforcer, PlanExecutor};
use keel_store::SYSTEM_USER;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::read_objects;

pub async fn run(config: &KeelConfig) -> Result<()> {
    if !config.enforcer.enabled {
        warn!("Enforcer is disabled in the configuration, nothing to run");
        return Ok(());
    }

    // Policy documents from disk are loaded with full rights.
    let mut config = config.clone();
    config
        .users
        .push(User::new(SYSTEM_USER).with_role(RoleGrant::new(RoleId::DomainAdmin, ["*"])));
    let engine = Arc::new(super::open_engine(&config).await?);

    if let Some(dir) = &config.policy_dir {
        let objects = read_objects(std::slice::from_ref(dir))?;
        let result = engine
            .update_policy(SYSTEM_USER, objects)
            .await
            .context("Failed to load policy directory")?;
        info!(generation = %result.generation, changed = result.changed, "Loaded policy directory");
    }

    let executor = PlanExecutor::new().with_max_parallel(config.enforcer.max_parallel);
    let enforcer = Enforcer::new(
        engine,
        executor,
        Duration::from_secs(config.enforcer.interval_secs),
    );
    enforcer
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await;
    Ok(())
}
