//! Serial log capture

use std::io::{self, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use super::{CliSession, SessionConfig};
use crate::log_sink::LogCursor;

pub async fn cmd_monitor(cfg: &SessionConfig) -> Result<()> {
    let mut session = cfg.build(true, false)?;
    session
        .connect()
        .await
        .context("Could not connect to the device")?;
    if let Some(conn) = session.connection() {
        println!("Connected: {}", conn.description());
    }

    let result = capture(&mut session, cfg).await;
    session.disconnect().await?;
    result
}

/// Log until Ctrl+C or the stream ends, then save the capture.
pub(crate) async fn capture(session: &mut CliSession, cfg: &SessionConfig) -> Result<()> {
    session.start_logging()?;
    println!("Logging serial output (Press Ctrl+C to stop)\n");

    follow_log(session).await?;

    let path = session.export_logs(&cfg.export_dir())?;
    println!("\nLogs saved to {}", path.display());
    Ok(())
}

/// Echo new log text to stdout until interrupted, then stop logging.
async fn follow_log(session: &mut CliSession) -> Result<()> {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })
    .context("Failed to install Ctrl+C handler")?;

    let sink = session.sink().clone();
    let mut cursor = LogCursor::default();
    let mut tick = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = tick.tick() => {}
        }
        cursor = echo(sink.since(cursor))?;
        if !session.is_logging() {
            println!("\n--- Serial stream ended ---");
            break;
        }
    }

    session.stop_logging().await;
    echo(sink.since(cursor))?;
    Ok(())
}

fn echo((text, end): (String, LogCursor)) -> Result<LogCursor> {
    if !text.is_empty() {
        let mut out = io::stdout().lock();
        out.write_all(text.as_bytes())?;
        out.flush()?;
    }
    Ok(end)
}
