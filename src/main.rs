//! bitaxe-flasher - flash factory firmware to Bitaxe miners.
//!
//! Connects to a Bitaxe over USB serial, writes the factory image that
//! matches its model and board version, and captures its serial log.

mod catalog;
mod cli;
mod commands;
mod connection;
mod device;
mod error;
mod firmware;
mod flash;
mod log_reader;
mod log_sink;
mod serial;
mod session;
mod status;
mod ui;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands};
use commands::{cmd_catalog, cmd_flash, cmd_list_ports, cmd_monitor, cmd_ui, SessionConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Ui);

    // Initialize logging. The terminal UI owns the screen, so it only gets
    // log output when asked for.
    let filter = match (&command, cli.verbose) {
        (_, true) => "debug",
        (Commands::Ui, false) => "off",
        (_, false) => "info",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cfg = SessionConfig {
        port: cli.port,
        baud: cli.baud,
        firmware_base: cli.firmware_base,
        log_dir: cli.log_dir,
    };

    match command {
        Commands::Ports => {
            cmd_list_ports()?;
        }
        Commands::Catalog { model } => {
            cmd_catalog(model)?;
        }
        Commands::Flash {
            model,
            board,
            monitor,
            digest,
        } => {
            cmd_flash(&cfg, model, &board, monitor, digest).await?;
        }
        Commands::Monitor => {
            cmd_monitor(&cfg).await?;
        }
        Commands::Ui => {
            cmd_ui(&cfg).await?;
        }
    }

    Ok(())
}
