use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::Command;

#[derive(Parser)]
#[command(name = "fsc")]
#[command(about = "Local status cache and sync engine for amlt experiments", long_about = None)]
struct Cli {
    /// Status database (default: ~/.fsc/jobs.db)
    #[arg(long, env = "FSC_DB_PATH", global = true)]
    db: Option<PathBuf>,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };
    commands::run(cli.command, &db_path).await
}

fn default_db_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot resolve home directory; pass --db")?;
    Ok(home.join(".fsc").join("jobs.db"))
}

// stderr keeps stdout clean for command output and --json.
fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FSC_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
