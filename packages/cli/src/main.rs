use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use stagehand_runtime::StageRegistry;

mod api;
mod config;
mod delegate;
mod error;
mod hostprep;
mod server;
mod tls;

use config::Config;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Host-local pipeline stage executor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stage executor server (the default)
    Server,
    /// Generate a development CA plus server/client certificates for mTLS
    Certs {
        #[arg(long, default_value = "/tmp/certs")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Server) {
        Commands::Server => run_server().await,
        Commands::Certs { dir } => {
            init_tracing(false, false);
            tls::generate_certs(&dir)?;
            Ok(())
        }
    }
}

async fn run_server() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.debug, config.trace);
    info!(
        name = %config.server_name,
        version = env!("CARGO_PKG_VERSION"),
        "starting stagehand"
    );

    if !config.server.skip_prepare_server {
        hostprep::prepare_system().await;
    }

    let instance_id = Uuid::new_v4().to_string();
    delegate::register_capacity(&config, &instance_id).await;

    // the registry lives for the whole process and is handed down to every
    // handler; a restart loses all active stages by design
    let registry = Arc::new(StageRegistry::new());
    server::start(config, registry).await
}

fn init_tracing(debug: bool, trace: bool) {
    let default_level = if trace {
        "trace"
    } else if debug {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
