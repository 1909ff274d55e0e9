//! CLI command implementations.

pub mod check;
pub mod plan;
pub mod run;
pub mod show;

use anyhow::{Context, Result, bail};
use keel_core::config::{load_objects_from_dir, load_objects_from_file};
use keel_core::{ExternalData, KeelConfig, PolicyObject, StaticUserDirectory};
use keel_runtime::{ActualStateStore, DriverRegistry, DryRunDriver, Engine};
use keel_store::{PolicyStore, create_backend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Load the configuration file, or defaults when none is given.
pub fn load_config(path: Option<&Path>) -> Result<KeelConfig> {
    match path {
        Some(path) => KeelConfig::load_with_context(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(KeelConfig::default()),
    }
}

/// Read policy objects from files and directories, in argument order.
pub fn read_objects(paths: &[PathBuf]) -> Result<Vec<PolicyObject>> {
    let mut objects = Vec::new();
    for path in paths {
        let loaded = if path.is_dir() {
            load_objects_from_dir(path)
        } else {
            load_objects_from_file(path)
        };
        objects.extend(loaded.with_context(|| format!("Failed to read {}", path.display()))?);
    }
    Ok(objects)
}

/// Policy sources for a command: explicit paths, else the configured policy directory.
pub fn policy_sources(config: &KeelConfig, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if !files.is_empty() {
        return Ok(files.to_vec());
    }
    match &config.policy_dir {
        Some(dir) => Ok(vec![dir.clone()]),
        None => bail!("No policy files given and no policy_dir configured"),
    }
}

pub fn external_data(config: &KeelConfig) -> ExternalData {
    ExternalData::new(Arc::new(StaticUserDirectory::new(config.users.clone())))
}

/// Open the configured store and build an engine that deploys through the dry-run driver.
///
/// Generations and the actual state are both reloaded from the configured backend.
pub async fn open_engine(config: &KeelConfig) -> Result<Engine> {
    let backend = create_backend(&config.store).context("Failed to open generation store")?;
    let store = PolicyStore::open(backend.clone())
        .await
        .context("Failed to load stored generations")?;
    let actual = ActualStateStore::load(backend)
        .await
        .context("Failed to load actual state")?;
    let registry = DriverRegistry::new().with_fallback(Arc::new(DryRunDriver));

    Ok(Engine::new(Arc::new(store), external_data(config), Arc::new(registry))
        .with_actual(Arc::new(actual))
        .with_plugin_timeout(Duration::from_secs(config.enforcer.plugin_timeout_secs)))
}
