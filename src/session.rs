//! The session owner.
//!
//! One `Session` holds the connection, the flash controller, the log reader,
//! the log buffer and the status line. Every operation takes `&mut self`, so
//! connect, flash, logging and disconnect never overlap.

use std::path::{Path, PathBuf};

use crate::catalog::{DeviceModel, DeviceSelection};
use crate::connection::{Connection, ConnectionManager};
use crate::device::Connector;
use crate::error::SessionError;
use crate::firmware::{FirmwareSource, ImageDigest};
use crate::flash::{FlashContext, FlashController, FlashReport};
use crate::log_reader::LogReader;
use crate::log_sink::LogSink;
use crate::status::{Gate, StatusBoard};

/// First line of every logging session.
pub const LOG_BANNER: &str = "Serial logging started...";

/// Flags the UI derives its controls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState {
    pub connected: bool,
    pub connecting: bool,
    pub flashing: bool,
    pub logging: bool,
    pub has_logs: bool,
    pub model_selected: bool,
    pub selection_complete: bool,
}

/// Which controls are usable in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    /// Connect, or Disconnect when connected.
    pub connect: bool,
    pub model_picker: bool,
    pub board_picker_visible: bool,
    pub board_picker: bool,
    pub flash: bool,
    /// Start, or Stop when logging.
    pub logging: bool,
    pub download: bool,
}

impl Controls {
    pub fn for_state(s: &SessionState) -> Self {
        let idle = !s.connecting && !s.flashing;
        Self {
            connect: idle,
            model_picker: idle && s.connected,
            board_picker_visible: s.model_selected,
            board_picker: idle && s.model_selected,
            flash: idle && s.connected && s.selection_complete && !s.logging,
            logging: s.connected && !s.flashing,
            download: s.has_logs,
        }
    }
}

/// Cloneable views a UI can read while an operation borrows the session.
#[derive(Debug, Clone)]
pub struct SessionHandles {
    pub status: StatusBoard,
    pub sink: LogSink,
    pub connecting: Gate,
    pub flashing: Gate,
}

impl SessionHandles {
    /// `base` with the live busy flags and log presence applied.
    pub fn overlay(&self, base: SessionState) -> SessionState {
        SessionState {
            connecting: self.connecting.is_set(),
            flashing: self.flashing.is_set(),
            has_logs: !self.sink.is_empty(),
            ..base
        }
    }
}

pub struct Session<C, F> {
    connections: ConnectionManager<C>,
    flasher: FlashController<F>,
    logger: LogReader,
    sink: LogSink,
    status: StatusBoard,
    selection: DeviceSelection,
}

impl<C: Connector, F: FirmwareSource> Session<C, F> {
    pub fn new(connector: C, firmware: F) -> Self {
        Self {
            connections: ConnectionManager::new(connector),
            flasher: FlashController::new(firmware),
            logger: LogReader::new(),
            sink: LogSink::new(),
            status: StatusBoard::new(),
            selection: DeviceSelection::new(),
        }
    }

    pub fn with_digest(mut self, digest: Box<dyn ImageDigest>) -> Self {
        self.flasher = self.flasher.with_digest(digest);
        self
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    pub fn handles(&self) -> SessionHandles {
        SessionHandles {
            status: self.status.clone(),
            sink: self.sink.clone(),
            connecting: self.connections.connecting_gate(),
            flashing: self.flasher.flashing_gate(),
        }
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connections.connection()
    }

    pub fn is_logging(&self) -> bool {
        self.logger.is_logging()
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            connected: self.connections.is_connected(),
            connecting: self.connections.connecting_gate().is_set(),
            flashing: self.flasher.is_flashing(),
            logging: self.logger.is_logging(),
            has_logs: !self.sink.is_empty(),
            model_selected: self.selection.model().is_some(),
            selection_complete: self.selection.is_complete(),
        }
    }

    pub fn controls(&self) -> Controls {
        Controls::for_state(&self.state())
    }

    pub fn selection(&self) -> &DeviceSelection {
        &self.selection
    }

    /// Choose a model; the board version is cleared.
    pub fn select_model(&mut self, model: DeviceModel) {
        self.selection.set_model(model);
    }

    pub fn select_board_version(&mut self, board_version: &str) -> Result<(), SessionError> {
        self.selection
            .set_board_version(board_version)
            .inspect_err(|e| self.status.set(e.to_string()))
    }

    /// Replace the whole selection, e.g. from command-line flags.
    pub fn set_selection(&mut self, selection: DeviceSelection) {
        self.selection = selection;
    }

    pub fn set_endpoint_hint(&mut self, endpoint: Option<String>) {
        self.connections.set_endpoint_hint(endpoint);
    }

    pub fn endpoint_hint(&self) -> Option<&str> {
        self.connections.endpoint_hint()
    }

    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if let Some(e) = self.connect_precondition() {
            self.status.set(e.to_string());
            return Err(e);
        }
        self.status.set("Connecting to device...");
        match self.connections.connect().await {
            Ok(connection) => {
                self.sink
                    .append_line(&format!("Connected to {}", connection.description()));
                self.status.set("Connected successfully!");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Connection failed: {e}");
                self.sink.append_line(&format!("Connection failed: {e}"));
                self.status.set(format!("Connection failed: {e}"));
                Err(e)
            }
        }
    }

    fn connect_precondition(&self) -> Option<SessionError> {
        if self.connections.is_connected() {
            Some(SessionError::precondition("Already connected to a device"))
        } else if self.connections.connecting_gate().is_set() {
            Some(SessionError::precondition(
                "A connection attempt is already in progress",
            ))
        } else {
            None
        }
    }

    /// Stop logging if active, then release the device.
    pub async fn disconnect(&mut self) -> Result<(), SessionError> {
        if self.logger.is_logging() {
            self.logger.stop().await;
            self.sink.clear();
        } else {
            // Reap a reader that already ended on EOF or error.
            self.logger.stop().await;
        }

        let result = self.connections.disconnect().await;
        self.status.clear();
        if let Err(e) = &result {
            tracing::warn!("Error while releasing the device: {e}");
        }
        result
    }

    pub async fn start_flashing(&mut self) -> Result<FlashReport, SessionError> {
        let ctx = FlashContext {
            connection: self.connections.connection(),
            selection: &self.selection,
            logging: self.logger.is_logging(),
            console: &self.sink,
        };
        self.flasher.start_flashing(ctx, &self.status).await
    }

    /// Start draining the device's serial output into the log buffer.
    ///
    /// Clears the buffer first. A no-op while already logging.
    pub fn start_logging(&mut self) -> Result<(), SessionError> {
        let Some(connection) = self.connections.connection() else {
            let e = SessionError::precondition("Please connect to a device first");
            self.status.set(e.to_string());
            return Err(e);
        };
        if self.logger.is_logging() {
            return Ok(());
        }
        if self.flasher.is_flashing() {
            let e = SessionError::precondition("Wait for flashing to finish before logging");
            self.status.set(e.to_string());
            return Err(e);
        }

        let stream = connection.open_log_stream().inspect_err(|e| {
            self.status.set(format!("Logging error: {e}"));
        })?;

        self.sink.clear();
        self.sink.append_line(LOG_BANNER);
        self.logger
            .start(stream, self.sink.clone(), self.status.clone());
        tracing::info!("Serial logging started on {}", connection.endpoint());
        Ok(())
    }

    pub async fn stop_logging(&mut self) {
        self.logger.stop().await;
    }

    /// Save the log buffer to a timestamped file in `dir`.
    pub fn export_logs(&self, dir: &Path) -> Result<PathBuf, SessionError> {
        if self.sink.is_empty() {
            let e = SessionError::precondition("No logs to download");
            self.status.set(e.to_string());
            return Err(e);
        }
        match self.sink.export_to(dir) {
            Ok(path) => {
                self.status.set(format!("Logs saved to {}", path.display()));
                Ok(path)
            }
            Err(e) => {
                let e = SessionError::from(e);
                self.status.set(e.to_string());
                Err(e)
            }
        }
    }
}
