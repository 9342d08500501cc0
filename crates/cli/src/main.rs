use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nexum_card_resource::CardResourceService;
use nexum_card_resource_pcsc::PcscDriver;
use tracing::info;

mod commands;
mod config;

#[derive(Parser)]
#[command(version, about = "Allocate smart-card readers by profile")]
struct Cli {
    /// Configuration file (defaults to ~/.nxm/card-resources.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Trace level output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the plugins of the driver
    Plugins,

    /// Show the pools built from the configuration
    Status,

    /// Allocate a resource for a profile and hold it
    Allocate {
        /// Profile name
        #[arg(required = true)]
        profile: String,

        /// Maximum wait in milliseconds (configured timeout when unset)
        #[arg(long)]
        wait_ms: Option<u64>,

        /// Time to hold the resource before releasing it, in milliseconds
        #[arg(long, default_value_t = 0)]
        hold_ms: u64,
    },

    /// Print the pools whenever they change
    Watch {
        /// How long to watch, in seconds
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = config::load_config(cli.config.as_deref())?;
    let driver = PcscDriver::with_config(config.pcsc)?;

    if let Commands::Plugins = cli.command {
        return commands::plugins(&driver);
    }

    let service = CardResourceService::new(driver);
    service.start(config.service)?;
    info!("Card resource service ready");

    let result = match &cli.command {
        Commands::Plugins => Ok(()),
        Commands::Status => commands::status(&service),
        Commands::Allocate {
            profile,
            wait_ms,
            hold_ms,
        } => commands::allocate(&service, profile, *wait_ms, *hold_ms),
        Commands::Watch { seconds } => commands::watch(&service, *seconds),
    };

    service.stop();
    result
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
