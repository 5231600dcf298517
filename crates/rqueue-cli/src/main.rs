use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rqueue_core::{check_health, Client, RedisSettings, StopReason, WorkerSettings};

mod tasks;
mod watch;

#[derive(Parser)]
#[command(name = "rqueue")]
#[command(about = "Job queues in Rust with tokio and redis")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a worker
    Worker {
        /// TOML settings file; defaults plus REDIS_* environment otherwise
        settings: Option<PathBuf>,

        /// Batch mode: exit once no jobs are found in the queue
        #[arg(long, conflicts_with = "no_burst")]
        burst: bool,

        /// Disable batch mode even if the settings file enables it
        #[arg(long)]
        no_burst: bool,

        /// Health check: verify a fresh health record exists and exit
        #[arg(long)]
        check: bool,

        /// Watch a directory and reload the worker upon changes
        #[arg(long, value_name = "DIR")]
        watch: Option<PathBuf>,

        /// Enable verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Start the read-only introspection HTTP server
    Server {
        /// TOML settings file; defaults plus REDIS_* environment otherwise
        settings: Option<PathBuf>,

        /// Listen host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Listen port
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(2);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker {
            settings,
            burst,
            no_burst,
            check,
            watch,
            verbose,
        } => {
            init_logging(verbose);
            let mut settings = load_settings(settings.as_deref())?;
            if burst {
                settings.burst = true;
            } else if no_burst {
                settings.burst = false;
            }

            if check {
                let healthy = check_health(&settings).await?;
                std::process::exit(if healthy { 0 } else { 1 });
            }

            if let Some(dir) = watch {
                return watch::watch_and_run(dir, settings).await;
            }

            loop {
                let mut worker = tasks::build_worker(settings.clone());
                match worker.main().await? {
                    StopReason::Reload => {
                        info!("reloading rqueue worker...");
                        continue;
                    }
                    _ => break,
                }
            }
            Ok(())
        }

        Commands::Server { settings, host, port } => {
            init_logging(false);
            let settings = load_settings(settings.as_deref())?;
            let client = Client::connect(&settings.redis)
                .await?
                .with_default_queue(settings.queue_name.clone());
            rqueue_api::run(client, &host, port).await?;
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<WorkerSettings> {
    match path {
        Some(path) => {
            let settings = WorkerSettings::from_file(path)?;
            info!("loaded settings from {}", path.display());
            Ok(settings)
        }
        None => Ok(WorkerSettings {
            redis: RedisSettings::from_env(),
            ..Default::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_worker_flags() {
        let cli = Cli::parse_from(["rqueue", "worker", "settings.toml", "--burst", "-v"]);
        match cli.command {
            Commands::Worker {
                settings,
                burst,
                no_burst,
                verbose,
                ..
            } => {
                assert_eq!(settings.unwrap().to_str().unwrap(), "settings.toml");
                assert!(burst);
                assert!(!no_burst);
                assert!(verbose);
            }
            _ => panic!("expected worker command"),
        }
    }

    #[test]
    fn test_server_defaults() {
        let cli = Cli::parse_from(["rqueue", "server"]);
        match cli.command {
            Commands::Server { host, port, .. } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 8080);
            }
            _ => panic!("expected server command"),
        }
    }
}
