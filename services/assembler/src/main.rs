//! plexus Assembler
//!
//! Runs assembly negotiations over an in-process network of hosts described
//! by a JSON scenario and prints the resulting tree.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plexus_assembler::config::Config;
use plexus_assembler::scenario::{self, Scenario};

/// plexus assembler
#[derive(Debug, Parser)]
#[command(name = "plexus-assembler")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Configure a scenario's root and print the assembly tree.
    Simulate {
        /// Scenario file (JSON).
        scenario: PathBuf,

        /// Cut this host off the network once the application is prepared.
        #[arg(long, value_name = "HOST")]
        remove: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Simulate { scenario: path, remove } => {
            let loaded = Scenario::from_path(&path)?;
            info!(
                scenario = %path.display(),
                hosts = loaded.hosts.len(),
                "Starting simulation"
            );

            let tree = scenario::simulate(&loaded, remove.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
    }

    Ok(())
}
