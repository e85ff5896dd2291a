use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

static LOGGER: OnceLock<Logger> = OnceLock::new();

pub fn init_log_file(path: &Path) -> Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = Logger::new(path)?;
    let _ = LOGGER.set(logger);
    Ok(())
}

pub fn info(msg: impl AsRef<str>) {
    write_line("INFO", msg.as_ref());
}

pub fn error(msg: impl AsRef<str>) {
    write_line("ERROR", msg.as_ref());
}

/// One remote request: `R.VERB    : [status] path duration`.
pub fn request_trace(verb: &str, status: u16, path: &str, started: Instant) {
    write_line(
        "INFO",
        &format!(
            "R.{verb:<8}: [{status}] {path} {}",
            english_duration(started.elapsed())
        ),
    );
}

/// Timing line for one phase of an iteration (scan, GET batch, PUT
/// batch, inbound walk). Quiet phases are only reported when they ran
/// long enough to matter.
pub fn section_end(happened: bool, message: &str, started: Instant) {
    let elapsed = started.elapsed();
    if should_log_section(happened, elapsed) {
        write_line(
            "INFO",
            &format!("[SECTION] {message} took {}", english_duration(elapsed)),
        );
    }
}

fn should_log_section(happened: bool, elapsed: Duration) -> bool {
    happened || elapsed > Duration::from_secs(1)
}

/// Human-readable duration for request and section lines.
pub fn english_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 0.001 {
        return format!("{} ns", (secs * 1_000_000.0).round());
    }
    if secs < 1.0 {
        return format!("{} ms", (secs * 10_000.0).round() / 10.0);
    }
    if secs < 90.0 {
        return format!("{} secs", (secs * 100.0).round() / 100.0);
    }
    if secs < 5400.0 {
        return format!("{} mins", (secs / 60.0 * 100.0).round() / 100.0);
    }
    format!("{} hours", (secs / 3600.0 * 100.0).round() / 100.0)
}

fn write_line(level: &str, msg: &str) {
    if let Some(logger) = LOGGER.get() {
        logger.write_line(level, msg);
    }
}

struct Logger {
    file: Mutex<File>,
    mirror_to_stdout: bool,
}

impl Logger {
    fn new(path: &Path) -> Result<Self> {
        Self::new_with_stdout(path, true)
    }

    fn new_with_stdout(path: &Path, mirror_to_stdout: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        // New log file per run (truncate).
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            mirror_to_stdout,
        })
    }

    fn write_line(&self, level: &str, msg: &str) {
        // The same bytes go to the log file and the console.
        let line = format!(
            "{} {level}: {msg}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        if let Ok(mut f) = self.file.lock() {
            let _ = f.write_all(line.as_bytes());
            let _ = f.flush();
        }
        if self.mirror_to_stdout {
            let mut out = std::io::stdout();
            let _ = out.write_all(line.as_bytes());
            let _ = out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_truncated_and_lines_are_timestamped() {
        let tmp = std::env::temp_dir().join("subsyncit-log-test");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        let log_path = tmp.join("subsyncit.log");
        std::fs::write(&log_path, "old\n").unwrap();

        let logger = Logger::new_with_stdout(&log_path, false).unwrap();
        logger.write_line("INFO", "R.PROPFIND: [207] /svn/repo 2 ms");
        logger.write_line("ERROR", "ConnectionError: refused");

        let raw = std::fs::read_to_string(&log_path).unwrap();
        assert!(!raw.contains("old"));
        let mut lines = raw.lines();
        let first = lines.next().unwrap();
        // "YYYY-MM-DD HH:MM:SS " prefix, then the level and message.
        assert_eq!(&first[4..5], "-");
        assert_eq!(&first[10..11], " ");
        assert!(first.ends_with("INFO: R.PROPFIND: [207] /svn/repo 2 ms"));
        let second = lines.next().unwrap();
        assert!(second.ends_with("ERROR: ConnectionError: refused"));
    }

    #[test]
    fn quiet_sections_are_logged_only_when_slow() {
        assert!(should_log_section(true, Duration::from_millis(1)));
        assert!(should_log_section(false, Duration::from_secs(2)));
        assert!(!should_log_section(false, Duration::from_millis(10)));
    }

    #[test]
    fn english_duration_buckets() {
        assert_eq!(english_duration(Duration::from_millis(250)), "250 ms");
        assert_eq!(english_duration(Duration::from_secs(2)), "2 secs");
        assert_eq!(english_duration(Duration::from_secs(120)), "2 mins");
        assert_eq!(english_duration(Duration::from_secs(7200)), "2 hours");
    }
}
