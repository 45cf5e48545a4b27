//! Flash session controller.
//!
//! Sequences one flash job: catalog lookup, firmware fetch, image encoding,
//! the write itself and the hard reset. Every outcome lands in the status
//! line, and the steps are echoed to the log buffer. Failures leave the
//! connection as it was.

use std::fmt;

use crate::catalog::{self, DeviceSelection};
use crate::connection::Connection;
use crate::device::WriteJob;
use crate::error::SessionError;
use crate::firmware::{FirmwareImage, FirmwareSource, ImageDigest, SkipDigest};
use crate::log_sink::LogSink;
use crate::status::{Gate, StatusBoard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolving,
    Fetching,
    Writing,
    Resetting,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Resolving => "resolving",
            Phase::Fetching => "fetching",
            Phase::Writing => "writing",
            Phase::Resetting => "resetting",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// An in-flight flash job. Never outlives `start_flashing`.
#[derive(Debug)]
struct FlashJob {
    id: u64,
    selection: DeviceSelection,
    phase: Phase,
}

impl FlashJob {
    fn advance(&mut self, phase: Phase) {
        tracing::debug!(job = self.id, from = %self.phase, to = %phase, "flash job phase");
        self.phase = phase;
    }
}

/// What a successful job did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub job: u64,
    pub locator: &'static str,
    pub bytes: usize,
    pub digest: Option<String>,
}

/// Preconditions checked before a job may start, and where the job's
/// progress lines go.
#[derive(Clone, Copy)]
pub struct FlashContext<'a> {
    pub connection: Option<&'a Connection>,
    pub selection: &'a DeviceSelection,
    pub logging: bool,
    pub console: &'a LogSink,
}

pub struct FlashController<F> {
    firmware: F,
    digest: Box<dyn ImageDigest>,
    flashing: Gate,
    last_job: u64,
}

impl<F: FirmwareSource> FlashController<F> {
    pub fn new(firmware: F) -> Self {
        Self {
            firmware,
            digest: Box::new(SkipDigest),
            flashing: Gate::new(),
            last_job: 0,
        }
    }

    pub fn with_digest(mut self, digest: Box<dyn ImageDigest>) -> Self {
        self.digest = digest;
        self
    }

    pub fn flashing_gate(&self) -> Gate {
        self.flashing.clone()
    }

    pub fn is_flashing(&self) -> bool {
        self.flashing.is_set()
    }

    /// Run one flash job.
    ///
    /// Precondition failures only set the status. Anything that goes wrong
    /// after the job starts is reported as `Flashing failed: ...`.
    pub async fn start_flashing(
        &mut self,
        ctx: FlashContext<'_>,
        status: &StatusBoard,
    ) -> Result<FlashReport, SessionError> {
        let connection = match self.check_preconditions(&ctx) {
            Ok(c) => c,
            Err(e) => {
                status.set(e.to_string());
                return Err(e);
            }
        };
        let Some(_busy) = self.flashing.try_enter() else {
            let e = SessionError::precondition("Flashing is already in progress");
            status.set(e.to_string());
            return Err(e);
        };

        self.last_job += 1;
        let mut job = FlashJob {
            id: self.last_job,
            selection: ctx.selection.clone(),
            phase: Phase::Resolving,
        };
        status.set("Preparing to flash...");

        let result = self.run(&mut job, connection, status, ctx.console).await;
        status.end_job();

        match &result {
            Ok(report) => {
                job.advance(Phase::Done);
                tracing::info!(
                    "Flashed {} ({} bytes) to {}",
                    report.locator,
                    report.bytes,
                    connection.endpoint()
                );
                status.set("Flashing completed successfully! Device has been restarted.");
            }
            Err(e) => {
                tracing::error!(job = job.id, phase = %job.phase, "Flashing failed: {e}");
                ctx.console.append_line(&format!("Flashing failed: {e}"));
                status.set(format!("Flashing failed: {e}. Please try again."));
            }
        }
        result
    }

    fn check_preconditions<'a>(
        &self,
        ctx: &FlashContext<'a>,
    ) -> Result<&'a Connection, SessionError> {
        let connection = ctx
            .connection
            .ok_or_else(|| SessionError::precondition("Please connect to a device first"))?;
        if !ctx.selection.is_complete() {
            return Err(SessionError::precondition(
                "Please select both device model and board version",
            ));
        }
        if ctx.logging {
            return Err(SessionError::precondition(
                "Stop serial logging before flashing",
            ));
        }
        Ok(connection)
    }

    async fn run(
        &self,
        job: &mut FlashJob,
        connection: &Connection,
        status: &StatusBoard,
        console: &LogSink,
    ) -> Result<FlashReport, SessionError> {
        let locator = job.selection.locator().ok_or(SessionError::Catalog)?;

        job.advance(Phase::Fetching);
        let raw = self.firmware.fetch(locator).await?;
        let image = FirmwareImage::encode(raw);
        if image.is_empty() {
            return Err(SessionError::Write("Firmware image is empty".into()));
        }
        let bytes = image.len();
        let digest = self.digest.digest(&image);
        if let Some(d) = &digest {
            tracing::info!("Image digest {d}");
        }

        job.advance(Phase::Writing);
        status.set("Flashing firmware...");
        status.begin_job(job.id);

        let programmer = connection.programmer();
        let reporter = status.clone();
        let job_id = job.id;
        let write = WriteJob::factory_image(image);
        for segment in &write.segments {
            console.append_line(&format!(
                "Writing {} ({} bytes) at 0x{:08x}...",
                locator,
                segment.image.len(),
                segment.address
            ));
        }
        tokio::task::spawn_blocking(move || {
            let mut programmer = programmer
                .lock()
                .map_err(|_| SessionError::Write("Device handle is unusable".into()))?;
            programmer.write_flash(&write, &mut |written, total| {
                reporter.report(job_id, written, total);
            })
        })
        .await??;
        status.end_job();
        console.append_line(&format!("Wrote {bytes} bytes"));

        job.advance(Phase::Resetting);
        status.set("Flashing completed. Restarting device...");
        console.append_line("Hard resetting via RTS pin...");
        let programmer = connection.programmer();
        tokio::task::spawn_blocking(move || {
            let mut programmer = programmer
                .lock()
                .map_err(|_| SessionError::Write("Device handle is unusable".into()))?;
            programmer.hard_reset()
        })
        .await??;

        Ok(FlashReport {
            job: job.id,
            locator,
            bytes,
            digest,
        })
    }
}
