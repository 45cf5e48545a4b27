//! Command implementations

pub mod flash;
pub mod monitor;
pub mod util;

pub use flash::*;
pub use monitor::*;
pub use util::*;

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::device::EspConnector;
use crate::firmware::FirmwareStore;
use crate::log_sink::default_export_dir;
use crate::session::Session;

/// Session over real hardware and the configured firmware origin.
pub type CliSession = Session<EspConnector, FirmwareStore>;

/// Options every device command shares.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port: Option<String>,
    pub baud: u32,
    pub firmware_base: String,
    pub log_dir: Option<PathBuf>,
}

impl SessionConfig {
    pub fn export_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(default_export_dir)
    }

    /// `interactive` allows prompting for a port; `show_progress` draws a
    /// download bar for remote firmware.
    pub fn build(&self, interactive: bool, show_progress: bool) -> Result<CliSession> {
        let store = FirmwareStore::from_base(&self.firmware_base, show_progress)
            .with_context(|| format!("Invalid firmware base '{}'", self.firmware_base))?;
        let mut session = Session::new(EspConnector::new(self.baud, interactive), store);
        session.set_endpoint_hint(self.port.clone());
        Ok(session)
    }
}

pub async fn cmd_ui(cfg: &SessionConfig) -> Result<()> {
    let session = cfg.build(false, false)?;
    crate::ui::run(session, cfg.export_dir()).await
}
