//! `keel show` command implementation.

use anyhow::{Context, Result, bail};
use keel_core::{GenerationRef, KeelConfig};

use super::open_engine;

pub async fn run(config: &KeelConfig, generation: GenerationRef) -> Result<()> {
    let engine = open_engine(config).await?;
    let Some(snapshot) = engine.get_policy(generation)? else {
        bail!("Generation {} not found", generation);
    };

    let data = &snapshot.data;
    println!(
        "Generation {} (updated by {} at {})",
        data.generation,
        data.updated_by,
        data.updated_at.to_rfc3339()
    );
    for obj in snapshot.policy.objects() {
        println!("---");
        print!(
            "{}",
            serde_yaml::to_string(obj)
                .with_context(|| format!("Failed to render {}", obj.key()))?
        );
    }
    Ok(())
}
