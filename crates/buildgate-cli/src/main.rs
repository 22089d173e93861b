//! Build gate operator CLI.

use buildgate_core::{BuildId, JobId};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "buildgate")]
#[command(about = "Build admission gate operator tool", long_about = None)]
struct Cli {
    /// Worker configuration file (KDL)
    #[arg(long, global = true, env = "BUILDGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Store URL, overriding the configuration file. In-memory when unset.
    #[arg(long, global = true, env = "BUILDGATE_STORE_URL")]
    store_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse the configuration and print the effective settings
    Validate,
    /// Show a job's running lock and waiting queue
    Inspect {
        /// Job ID
        job: JobId,
    },
    /// Cancel a queued build
    Cancel {
        /// Job ID
        job: JobId,
        /// Build ID
        build: BuildId,
    },
    /// Run one timeout sweep
    Sweep,
    /// Run timeout sweeps until interrupted
    Reaper,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = commands::load_config(cli.config.as_deref(), cli.store_url)?;

    match cli.command {
        Commands::Validate => commands::validate(&config)?,
        Commands::Inspect { job } => commands::inspect(&config, job).await?,
        Commands::Cancel { job, build } => commands::cancel(&config, job, build).await?,
        Commands::Sweep => commands::sweep(&config).await?,
        Commands::Reaper => commands::reaper(&config).await?,
    }

    Ok(())
}
