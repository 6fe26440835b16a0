use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use tally::config::Config;
use tally::storage::server::Server;
use tally::{agent, dump};

#[derive(Parser)]
#[command(name = "tally", about = "Call-stats telemetry pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Tail client log files and ship merged buckets to storage.
    Agent {
        #[arg(long, default_value = "tally.toml")]
        config: PathBuf,
    },
    /// Persist shipped buckets and serve queries.
    Storage {
        #[arg(long, default_value = "tally.toml")]
        config: PathBuf,
    },
    /// Print the frames of log or storage files as text.
    Dump {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Agent { config } => {
            let config = match Config::load(&config) {
                Ok(config) => config,
                Err(err) => {
                    error!(message = "cannot load configuration", error = %err);
                    return ExitCode::FAILURE;
                }
            };

            // runs until the process is stopped
            let (_hold, never) = mpsc::channel();
            if let Err(err) = agent::run(config.agent, never) {
                error!(message = "agent failed", error = %err);
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Command::Storage { config } => {
            let config = match Config::load(&config) {
                Ok(config) => config,
                Err(err) => {
                    error!(message = "cannot load configuration", error = %err);
                    return ExitCode::FAILURE;
                }
            };

            match Server::bind(config.storage) {
                Ok(server) => {
                    let (_hold, never) = mpsc::channel();
                    server.run(never);
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(message = "storage failed to start", error = %err);
                    ExitCode::FAILURE
                }
            }
        }
        Command::Dump { files } => {
            if dump::dump_files(&files) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
