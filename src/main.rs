use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rigworker::config::WorkerConfig;

#[derive(Parser)]
#[command(
    name = "rigworker",
    about = "Hardware-in-the-loop test rig worker",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $RIGWORKER_CONFIG, then /etc/rigworker/rigworker.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker (backend setup + control API)
    Serve {
        /// Bind address, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Resolve and print the capability contract
    Contract,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = WorkerConfig::resolve(cli.config.as_deref())?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(
                bind = %config.server.bind,
                worker_type = %config.identity.worker_type,
                "Starting rigworker"
            );
            rigworker::serve(config).await?;
        }
        Commands::Contract => {
            let contract = rigworker::resolve_contract(&config).await?;
            println!("{}", serde_json::to_string_pretty(&contract)?);
        }
        Commands::Config => {
            if config.identity.api_key.is_some() {
                config.identity.api_key = Some("<redacted>".to_string());
            }
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
