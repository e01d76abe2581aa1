use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stoa_core::config::{load_config, Config};
use stoa_core::observability::init_logging;
use tracing::info;

#[derive(Parser)]
#[command(name = "stoad", about = "stoa edge server daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server.
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Load and validate a configuration, then exit.
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => {
            let config = load_config(&config)?;
            run_with_runtime(config)
        }
        Command::Check { config } => {
            let _ = load_config(&config)?;
            println!("config ok");
            Ok(())
        }
    }
}

fn run_with_runtime(config: Config) -> Result<()> {
    // Single-threaded cooperative scheduling: one OS thread drives every
    // connection as a task with bounded I/O steps.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let _log_guards = init_logging(&config.paths.log_dir, &config.access_log, &config.debug)?;
        info!(version = env!("CARGO_PKG_VERSION"), "stoad starting");
        stoad::server::run(config).await
    })
}
