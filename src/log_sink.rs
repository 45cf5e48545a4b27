//! In-memory serial log buffer.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};

#[derive(Debug, Default)]
struct Buffer {
    text: String,
    /// Bumped on every clear.
    generation: u64,
}

/// Read position for [`LogSink::since`].
///
/// The default cursor sits at the start of whatever the buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogCursor {
    generation: u64,
    offset: usize,
}

/// Shared, append-only text buffer.
///
/// Cloning yields another handle to the same buffer, so the log reader task
/// and the UI see identical contents.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    buf: Arc<Mutex<Buffer>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        // A panic mid-append cannot leave the buffer invalid.
        self.buf.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, text: &str) {
        self.lock().text.push_str(text);
    }

    pub fn append_line(&self, line: &str) {
        let mut buf = self.lock();
        buf.text.push_str(line);
        buf.text.push('\n');
    }

    pub fn clear(&self) {
        let mut buf = self.lock();
        buf.text.clear();
        buf.generation += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.lock().text.is_empty()
    }

    /// Copy of the whole buffer.
    pub fn contents(&self) -> String {
        self.lock().text.clone()
    }

    /// Text appended after `cursor`, and the cursor at the new end.
    ///
    /// If the buffer was cleared since `cursor` was taken, everything is
    /// returned.
    pub fn since(&self, cursor: LogCursor) -> (String, LogCursor) {
        let buf = self.lock();
        let start = if cursor.generation == buf.generation {
            cursor.offset
        } else {
            0
        };
        let end = LogCursor {
            generation: buf.generation,
            offset: buf.text.len(),
        };
        (buf.text.get(start..).unwrap_or_default().to_string(), end)
    }

    /// The last `n` lines, for display.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let buf = self.lock();
        let lines: Vec<&str> = buf.text.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].iter().map(|l| l.to_string()).collect()
    }

    /// Write the buffer to a timestamped file in `dir`. The buffer is kept.
    pub fn export_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(export_file_name(Utc::now()));
        // Snapshot first so the file matches one consistent state.
        let contents = self.contents();
        fs::create_dir_all(dir)?;
        fs::write(&path, &contents)?;
        tracing::info!("Exported {} bytes of logs to {}", contents.len(), path.display());
        Ok(path)
    }
}

/// `bitaxe-logs-2024-05-01T10-20-30-123Z.txt`
pub fn export_file_name(now: DateTime<Utc>) -> String {
    let stamp = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("bitaxe-logs-{stamp}.txt")
}

/// Where exports go when no directory is configured.
pub fn default_export_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_export_file_name() {
        let now = Utc
            .with_ymd_and_hms(2024, 5, 1, 10, 20, 30)
            .unwrap()
            + chrono::Duration::milliseconds(123);
        assert_eq!(
            export_file_name(now),
            "bitaxe-logs-2024-05-01T10-20-30-123Z.txt"
        );
    }

    #[test]
    fn test_append_and_clear() {
        let sink = LogSink::new();
        assert!(sink.is_empty());
        sink.append_line("Serial logging started...");
        sink.append("abc");
        assert_eq!(sink.contents(), "Serial logging started...\nabc");
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_clones_share_buffer() {
        let sink = LogSink::new();
        let other = sink.clone();
        other.append("x");
        assert_eq!(sink.contents(), "x");
    }

    #[test]
    fn test_since_follows_appends() {
        let sink = LogSink::new();
        sink.append("boot\n");
        let (text, end) = sink.since(LogCursor::default());
        assert_eq!(text, "boot\n");
        sink.append("wifi up\n");
        let (text, end) = sink.since(end);
        assert_eq!(text, "wifi up\n");
        assert_eq!(sink.since(end).0, "");

        sink.clear();
        sink.append("x");
        assert_eq!(sink.since(end).0, "x");
    }

    #[test]
    fn test_since_after_clear_and_longer_refill() {
        let sink = LogSink::new();
        sink.append("Serial logging started...\n");
        let (_, stale) = sink.since(LogCursor::default());

        // Refill past the old end offset.
        sink.clear();
        let refill = "Serial logging started...\nI (31) boot: ESP-IDF v5.1\n";
        sink.append(refill);
        let (text, end) = sink.since(stale);
        assert_eq!(text, refill);
        assert_eq!(sink.since(end).0, "");
    }

    #[test]
    fn test_tail() {
        let sink = LogSink::new();
        sink.append("one\ntwo\nthree\n");
        assert_eq!(sink.tail(2), vec!["two", "three"]);
        assert_eq!(sink.tail(10).len(), 3);
    }

    #[test]
    fn test_export_matches_appends_since_clear() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new();
        sink.append("stale");
        sink.clear();
        let pieces = ["Serial logging started...\n", "I (31) boot: ", "ESP-IDF v5.1\r\n", "\u{fffd}"];
        for p in pieces {
            sink.append(p);
        }

        let path = sink.export_to(dir.path()).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("bitaxe-logs-"));
        assert!(name.ends_with(".txt"));
        assert_eq!(fs::read_to_string(&path).unwrap(), pieces.concat());

        // Export does not consume the buffer.
        assert_eq!(sink.contents(), pieces.concat());
    }
}
