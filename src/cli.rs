//! CLI argument definitions using clap

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::catalog::DeviceModel;

#[derive(Parser)]
#[command(name = "bitaxe-flasher")]
#[command(author, version, about = "Flash factory firmware to Bitaxe miners", long_about = None)]
pub struct Cli {
    /// Serial port device (e.g., /dev/ttyACM0 on Linux, COM3 on Windows)
    #[arg(short, long, global = true, env = "BITAXE_PORT")]
    pub port: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value = "115200", global = true)]
    pub baud: u32,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Where firmware locators are resolved: an http(s) URL or a directory
    #[arg(
        long,
        global = true,
        env = "BITAXE_FIRMWARE_BASE",
        default_value = "."
    )]
    pub firmware_base: String,

    /// Directory for exported logs (defaults to the download directory)
    #[arg(long, global = true, env = "BITAXE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available serial ports
    Ports,

    /// Show supported models, board versions and firmware files
    Catalog {
        /// Only this model
        #[arg(value_enum)]
        model: Option<DeviceModel>,
    },

    /// Flash factory firmware to a device
    Flash {
        /// Device model
        #[arg(short, long, value_enum)]
        model: DeviceModel,

        /// Board version, e.g. 204
        #[arg(long = "board")]
        board: String,

        /// Log serial output after flashing until Ctrl+C
        #[arg(long)]
        monitor: bool,

        /// Image digest to log before writing
        #[arg(long, value_enum, default_value = "none")]
        digest: DigestKind,
    },

    /// Capture serial output until Ctrl+C and save it
    Monitor,

    /// Interactive terminal UI (default)
    Ui,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
pub enum DigestKind {
    None,
    Sha256,
}
