//! Flash command

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::monitor::capture;
use super::SessionConfig;
use crate::catalog::DeviceModel;
use crate::cli::DigestKind;
use crate::firmware::Sha256Digest;
use crate::status::StatusBoard;

pub async fn cmd_flash(
    cfg: &SessionConfig,
    model: DeviceModel,
    board: &str,
    monitor: bool,
    digest: DigestKind,
) -> Result<()> {
    let mut session = cfg.build(true, true)?;
    if digest == DigestKind::Sha256 {
        session = session.with_digest(Box::new(Sha256Digest));
    }

    session.select_model(model);
    session.select_board_version(board).with_context(|| {
        format!("Run 'bitaxe-flasher catalog {model}' to list supported board versions")
    })?;
    let locator = session.selection().locator().unwrap_or_default();
    println!(
        "Flashing {} board {board} with {locator}\n",
        model.display_name()
    );

    session
        .connect()
        .await
        .context("Could not connect to the device")?;
    if let Some(conn) = session.connection() {
        println!("Connected: {}", conn.description());
    }

    let printer = StatusPrinter::spawn(session.status().clone());
    let result = session.start_flashing().await;
    printer.finish().await;

    let outcome = match result {
        Ok(report) => {
            println!("{}", session.status().text());
            if let Some(d) = &report.digest {
                println!("SHA-256: {d}");
            }
            if monitor {
                capture(&mut session, cfg).await
            } else {
                Ok(())
            }
        }
        Err(e) => Err(anyhow::Error::new(e).context("Flashing failed")),
    };

    session.disconnect().await?;
    outcome
}

/// Mirrors the status line and job progress onto a terminal bar.
struct StatusPrinter {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StatusPrinter {
    fn spawn(status: StatusBoard) -> Self {
        let bar = ProgressBar::new(100);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{msg:32} [{bar:40.cyan/blue}] {pos:>3}%")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(status.text());

        let mut text_rx = status.subscribe();
        let mut progress_rx = status.subscribe_progress();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    Ok(()) = text_rx.changed() => {
                        let text = text_rx.borrow_and_update().clone();
                        // The bar already shows the percentage.
                        if !text.starts_with("Flashing:") {
                            bar.set_message(text);
                        }
                    }
                    Ok(()) = progress_rx.changed() => {
                        if let Some(p) = *progress_rx.borrow_and_update() {
                            bar.set_position(u64::from(p.percent));
                        }
                    }
                }
            }
            bar.finish_and_clear();
        });

        Self { stop_tx, task }
    }

    async fn finish(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::debug!("Progress printer ended abnormally: {e}");
        }
    }
}
