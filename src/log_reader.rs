//! Serial log reader.
//!
//! Drains a device byte stream into the [`LogSink`] on a background task.
//! `stop` signals the task and waits for it, so once it returns nothing
//! more is appended and the stream has been dropped.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::log_sink::LogSink;
use crate::status::StatusBoard;

const CHUNK_SIZE: usize = 1024;

struct ReaderTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Idle until `start`, Logging until `stop`, EOF or a read error.
#[derive(Default)]
pub struct LogReader {
    task: Option<ReaderTask>,
}

impl LogReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_logging(&self) -> bool {
        self.task
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Begin draining `stream`. A no-op (returning `false`) while already
    /// logging.
    pub fn start<R>(&mut self, stream: R, sink: LogSink, status: StatusBoard) -> bool
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if self.is_logging() {
            tracing::debug!("Serial logging already running");
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(read_loop(stream, sink, status, shutdown_rx));
        self.task = Some(ReaderTask {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Cancel the pending read and wait for the task to finish. Idempotent.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = task.shutdown_tx.send(true);
        if let Err(e) = task.handle.await {
            tracing::warn!("Serial log task ended abnormally: {e}");
        }
        tracing::info!("Serial logging stopped");
    }
}

async fn read_loop<R>(
    mut stream: R,
    sink: LogSink,
    status: StatusBoard,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut decoder = Utf8Decoder::default();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::info!("Serial stream closed");
                    break;
                }
                Ok(n) => sink.append(&decoder.decode(&buf[..n])),
                Err(e) => {
                    tracing::warn!("Serial read failed: {e}");
                    status.set(format!("Logging error: {e}"));
                    break;
                }
            },
        }
    }

    let rest = decoder.flush();
    if !rest.is_empty() {
        sink.append(&rest);
    }
}

/// Text decoder that keeps a multi-byte character split across chunks
/// together. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more.
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn flush(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).into_owned()
    }
}
