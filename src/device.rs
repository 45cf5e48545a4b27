//! Device programming seam.
//!
//! `Connector` finds and opens an endpoint; `Programmer` is the ready
//! programming session on it. The production pair wraps `espflash`, which
//! owns the boot-loader protocol, compression and verification.

use std::borrow::Cow;
use std::time::Duration;

use espflash::connection::{Connection, ResetAfterOperation, ResetBeforeOperation};
use espflash::flasher::Flasher;
use espflash::image_format::Segment;
use espflash::target::ProgressCallbacks;
use tokio::io::AsyncRead;

use crate::error::SessionError;
use crate::firmware::FirmwareImage;
use crate::serial;

pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// What `espflash` does to the chip when a write finishes. Nothing: the
/// controller resets once, through `Programmer::hard_reset`.
const AFTER_WRITE: ResetAfterOperation = ResetAfterOperation::NoResetNoStub;

/// One image placed at a flash address.
#[derive(Debug, Clone)]
pub struct ImageSegment {
    pub address: u32,
    pub image: FirmwareImage,
}

/// Flash write request handed to a programmer.
///
/// Flash size, mode and frequency are always kept as the device has them;
/// the image header is written untouched.
#[derive(Debug, Clone)]
pub struct WriteJob {
    pub segments: Vec<ImageSegment>,
    pub erase_all: bool,
    pub compress: bool,
}

impl WriteJob {
    /// A full factory image at address 0.
    pub fn factory_image(image: FirmwareImage) -> Self {
        Self {
            segments: vec![ImageSegment { address: 0, image }],
            erase_all: false,
            compress: true,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.image.len()).sum()
    }
}

/// Ready programming session on one device.
///
/// Methods block; callers run them off the async executor.
pub trait Programmer: Send {
    /// Write every segment, calling `progress(written, total)` for the
    /// segment currently in flight.
    fn write_flash(
        &mut self,
        job: &WriteJob,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<(), SessionError>;

    fn hard_reset(&mut self) -> Result<(), SessionError>;

    /// Independent reader over the device's serial output.
    fn open_log_stream(&mut self) -> Result<LogStream, SessionError>;

    /// Release the transport.
    fn close(self: Box<Self>) -> Result<(), SessionError>;
}

/// A programmer plus a human readable description of what it talks to.
pub struct Opened {
    pub programmer: Box<dyn Programmer>,
    pub description: String,
}

/// Selects and opens endpoints. Methods block.
pub trait Connector: Send + Sync + 'static {
    fn select_endpoint(&self, hint: Option<&str>) -> Result<String, SessionError>;

    fn open(&self, endpoint: &str) -> Result<Opened, SessionError>;
}

/// `espflash` over a native serial port.
#[derive(Debug, Clone)]
pub struct EspConnector {
    baud: u32,
    interactive: bool,
}

impl EspConnector {
    pub fn new(baud: u32, interactive: bool) -> Self {
        Self { baud, interactive }
    }
}

impl Connector for EspConnector {
    fn select_endpoint(&self, hint: Option<&str>) -> Result<String, SessionError> {
        let ports = serial::list_ports()?;
        serial::select_port(&ports, hint, self.interactive)
    }

    fn open(&self, endpoint: &str) -> Result<Opened, SessionError> {
        let connect_err = |what: &str, e: &dyn std::fmt::Display| {
            SessionError::Connect(format!("{what} {endpoint}: {e}"))
        };

        let usb_info = serialport::available_ports()
            .ok()
            .and_then(|ports| ports.into_iter().find(|p| p.port_name == endpoint))
            .and_then(|p| match p.port_type {
                serialport::SerialPortType::UsbPort(info) => Some(info),
                _ => None,
            })
            .unwrap_or(serialport::UsbPortInfo {
                vid: 0,
                pid: 0,
                serial_number: None,
                manufacturer: None,
                product: None,
            });

        let port = serialport::new(endpoint, self.baud)
            .timeout(Duration::from_millis(3000))
            .open_native()
            .map_err(|e| connect_err("Failed to open serial port", &e))?;
        #[cfg(unix)]
        let log_port = port
            .try_clone_native()
            .map_err(|e| connect_err("Failed to share serial port", &e))?;

        let connection = Connection::new(
            port,
            usb_info,
            AFTER_WRITE,
            ResetBeforeOperation::DefaultReset,
            self.baud,
        );

        tracing::info!("Connecting to boot loader on {endpoint}");
        // Stub on, verification off, no skipping of unchanged regions.
        let mut flasher = Flasher::connect(connection, true, false, false, None, None)
            .map_err(|e| connect_err("Handshake failed on", &e))?;

        let description = match flasher.device_info() {
            Ok(info) => format!("{} ({} flash) on {endpoint}", info.chip, info.flash_size),
            Err(e) => {
                tracing::warn!("Could not read device info: {e}");
                endpoint.to_string()
            }
        };
        tracing::info!("Connected: {description}");

        Ok(Opened {
            programmer: Box::new(EspProgrammer {
                flasher,
                #[cfg(unix)]
                log_port,
            }),
            description,
        })
    }
}

struct EspProgrammer {
    flasher: Flasher,
    #[cfg(unix)]
    log_port: serialport::TTYPort,
}

/// Forwards `espflash` progress callbacks to a plain closure.
struct ProgressBridge<'a> {
    total: usize,
    report: &'a mut dyn FnMut(usize, usize),
}

impl ProgressCallbacks for ProgressBridge<'_> {
    fn init(&mut self, addr: u32, total: usize) {
        tracing::debug!("Writing segment at 0x{addr:x} ({total} units)");
        self.total = total;
        (self.report)(0, total);
    }

    fn update(&mut self, current: usize) {
        (self.report)(current, self.total);
    }

    fn verifying(&mut self) {}

    fn finish(&mut self, _skipped: bool) {
        (self.report)(self.total, self.total);
    }
}

impl Programmer for EspProgrammer {
    fn write_flash(
        &mut self,
        job: &WriteJob,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<(), SessionError> {
        tracing::debug!(
            "Writing {} bytes in {} segment(s)",
            job.total_bytes(),
            job.segments.len()
        );
        if !job.compress {
            tracing::warn!("Uncompressed transfer requested; espflash compresses regardless");
        }
        if job.erase_all {
            self.flasher
                .erase_flash()
                .map_err(|e| SessionError::Write(format!("Chip erase failed: {e}")))?;
        }

        let segments: Vec<Segment> = job
            .segments
            .iter()
            .map(|s| Segment {
                addr: s.address,
                data: Cow::Borrowed(s.image.as_bytes()),
            })
            .collect();

        let mut bridge = ProgressBridge {
            total: 0,
            report: progress,
        };
        self.flasher
            .write_bins_to_flash(&segments, &mut bridge)
            .map_err(|e| SessionError::Write(e.to_string()))
    }

    fn hard_reset(&mut self) -> Result<(), SessionError> {
        self.flasher
            .connection()
            .reset()
            .map_err(|e| SessionError::Write(format!("Hard reset failed: {e}")))
    }

    #[cfg(unix)]
    fn open_log_stream(&mut self) -> Result<LogStream, SessionError> {
        Ok(Box::new(serial::log_stream(&self.log_port)?))
    }

    #[cfg(not(unix))]
    fn open_log_stream(&mut self) -> Result<LogStream, SessionError> {
        Err(SessionError::Read(
            "Serial logging is not supported on this platform".into(),
        ))
    }

    fn close(self: Box<Self>) -> Result<(), SessionError> {
        tracing::debug!("Releasing serial port");
        drop(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_image_job() {
        let job = WriteJob::factory_image(FirmwareImage::encode(vec![0xe9; 4096]));
        assert_eq!(job.segments.len(), 1);
        assert_eq!(job.segments[0].address, 0);
        assert!(!job.erase_all);
        assert!(job.compress);
        assert_eq!(job.total_bytes(), 4096);
    }

    #[test]
    fn test_progress_bridge_forwards_totals() {
        let mut seen = Vec::new();
        {
            let mut report = |w: usize, t: usize| seen.push((w, t));
            let mut bridge = ProgressBridge {
                total: 0,
                report: &mut report,
            };
            bridge.init(0, 40);
            bridge.update(10);
            bridge.update(40);
            bridge.finish(false);
        }
        assert_eq!(seen, vec![(0, 40), (10, 40), (40, 40), (40, 40)]);
    }

    #[test]
    fn test_write_leaves_chip_in_place() {
        // A reset here would reboot the board a second time.
        assert_eq!(AFTER_WRITE, ResetAfterOperation::NoResetNoStub);
        assert_ne!(AFTER_WRITE, ResetAfterOperation::HardReset);
        assert_ne!(AFTER_WRITE, ResetAfterOperation::WatchdogReset);
    }
}
