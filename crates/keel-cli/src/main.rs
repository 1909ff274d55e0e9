use anyhow::Result;
use clap::{Parser, Subcommand};
use keel_core::{GenerationRef, KeelConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "keel", version, about = "Keel policy engine CLI")]
struct Cli {
    /// Path to keel.yaml. Built-in defaults (in-memory store, no users) when omitted.
    #[arg(long, short, global = true, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate policy documents without touching any store.
    Check {
        /// Policy files or directories of `*.yaml` files.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Submit policy documents as a user and print the resulting action plan.
    Plan {
        /// User the update is made as.
        #[arg(long, short)]
        user: String,

        /// Policy files or directories. Defaults to `policy_dir` from the config.
        files: Vec<PathBuf>,

        /// Apply the plan with the dry-run driver after printing it.
        #[arg(long, default_value_t = false)]
        apply: bool,
    },

    /// List the objects of a stored generation.
    Show {
        /// Generation number or `last`.
        #[arg(long, short, default_value = "last")]
        generation: GenerationRef,
    },

    /// Run the enforcement loop with the dry-run driver until interrupted.
    Run,
}

fn init_tracing(config: &KeelConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.cmd {
        Command::Check { files } => commands::check::run(&config, &files)?,
        Command::Plan { user, files, apply } => {
            commands::plan::run(&config, &user, &files, apply).await?
        }
        Command::Show { generation } => commands::show::run(&config, generation).await?,
        Command::Run => commands::run::run(&config).await?,
    }

    Ok(())
}
