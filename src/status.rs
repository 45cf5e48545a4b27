//! User-facing status line and flash progress.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Progress of one flash job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub job: u64,
    pub percent: u8,
}

#[derive(Debug)]
struct Inner {
    text: watch::Sender<String>,
    progress: watch::Sender<Option<Progress>>,
    active_job: AtomicU64,
}

/// Single mutable status string plus the current job's progress.
///
/// Handles are cheap to clone and may be moved onto blocking threads.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    inner: Arc<Inner>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (text, _) = watch::channel(String::new());
        let (progress, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                text,
                progress,
                active_job: AtomicU64::new(0),
            }),
        }
    }

    pub fn set(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::debug!(status = %text);
        self.inner.text.send_replace(text);
    }

    pub fn clear(&self) {
        self.inner.text.send_replace(String::new());
    }

    pub fn text(&self) -> String {
        self.inner.text.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.inner.text.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Option<Progress>> {
        self.inner.progress.subscribe()
    }

    pub fn progress(&self) -> Option<Progress> {
        *self.inner.progress.borrow()
    }

    /// Make `job` the only job whose progress is accepted, starting at 0%.
    pub fn begin_job(&self, job: u64) {
        self.inner.active_job.store(job, Ordering::SeqCst);
        self.inner
            .progress
            .send_replace(Some(Progress { job, percent: 0 }));
    }

    /// Stop accepting progress for any job.
    pub fn end_job(&self) {
        self.inner.active_job.store(0, Ordering::SeqCst);
    }

    /// Record `written` of `total` bytes for `job`.
    ///
    /// Updates from a job other than the active one are dropped, and the
    /// percentage never moves backwards within a job. Returns the accepted
    /// percentage.
    pub fn report(&self, job: u64, written: usize, total: usize) -> Option<u8> {
        if job == 0 || self.inner.active_job.load(Ordering::SeqCst) != job {
            return None;
        }
        let percent = percent(written, total);
        let mut accepted = None;
        self.inner.progress.send_if_modified(|current| match current {
            Some(p) if p.job == job && p.percent >= percent => false,
            _ => {
                *current = Some(Progress { job, percent });
                accepted = Some(percent);
                true
            }
        });
        if let Some(pct) = accepted {
            self.set(format!("Flashing: {pct}% complete"));
        }
        accepted
    }
}

/// Boolean busy flag with a scoped guard.
///
/// Clones observe the same flag, so a UI can read it while the owning
/// operation is in flight. The flag drops back when the guard does, even if
/// the operation's future is cancelled.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    set: Arc<AtomicBool>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Raise the flag, or `None` if it is already raised.
    pub fn try_enter(&self) -> Option<GateGuard> {
        self.set
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| GateGuard {
                set: self.set.clone(),
            })
    }
}

#[derive(Debug)]
pub struct GateGuard {
    set: Arc<AtomicBool>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.set.store(false, Ordering::SeqCst);
    }
}

/// `written / total` as a rounded percentage in `0..=100`.
pub fn percent(written: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let written = written.min(total) as f64;
    ((written / total as f64) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_rounding() {
        assert_eq!(percent(0, 1000), 0);
        assert_eq!(percent(5, 1000), 1);
        assert_eq!(percent(4, 1000), 0);
        assert_eq!(percent(999, 1000), 100);
        assert_eq!(percent(2000, 1000), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let status = StatusBoard::new();
        status.begin_job(1);
        assert_eq!(status.report(1, 500, 1000), Some(50));
        assert_eq!(status.report(1, 200, 1000), None);
        assert_eq!(status.progress(), Some(Progress { job: 1, percent: 50 }));
        assert_eq!(status.text(), "Flashing: 50% complete");
        assert_eq!(status.report(1, 1000, 1000), Some(100));
    }

    #[test]
    fn test_progress_never_decreases_for_any_sequence() {
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        for job in 1..=50u64 {
            let status = StatusBoard::new();
            status.begin_job(job);
            let total = next() % 5000;
            let mut last = 0u8;
            for _ in 0..40 {
                status.report(job, next() % (total + 10), total);
                let p = status.progress().unwrap();
                assert_eq!(p.job, job);
                assert!(p.percent >= last && p.percent <= 100);
                last = p.percent;
            }
        }
    }

    #[test]
    fn test_stale_job_progress_dropped() {
        let status = StatusBoard::new();
        status.begin_job(1);
        status.report(1, 900, 1000);
        status.begin_job(2);
        assert_eq!(status.report(1, 1000, 1000), None);
        assert_eq!(status.progress(), Some(Progress { job: 2, percent: 0 }));
        assert_eq!(status.report(2, 100, 1000), Some(10));

        status.end_job();
        assert_eq!(status.report(2, 1000, 1000), None);
    }

    #[test]
    fn test_gate_single_entry() {
        let gate = Gate::new();
        let observer = gate.clone();
        let guard = gate.try_enter().unwrap();
        assert!(observer.is_set());
        assert!(gate.try_enter().is_none());
        drop(guard);
        assert!(!observer.is_set());
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn test_subscribers_see_latest_text() {
        let status = StatusBoard::new();
        let rx = status.subscribe();
        status.set("Connecting to device...");
        status.set("Connected successfully!");
        assert_eq!(*rx.borrow(), "Connected successfully!");
        status.clear();
        assert_eq!(status.text(), "");
    }
}
