use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Serialize, Deserialize)]
struct StatusJson {
    last_scanned: String,
    last_root_revision: i64,
}

/// Snapshot restored from the state directory at boot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Resumed {
    pub last_scanned: i64,
    pub last_root_revision: i64,
}

/// Persists the last-seen remote root revision and last scan timestamp
/// across restarts. Writes only when the serialized form changed.
pub struct StatusFile {
    path: PathBuf,
    previously: String,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            previously: String::new(),
        }
    }

    /// Read `status.json`, falling back to the legacy plain-text
    /// `last_scanned` file next to it.
    pub fn load(&self) -> Resumed {
        if let Ok(raw) = fs::read_to_string(&self.path) {
            if let Ok(parsed) = serde_json::from_str::<StatusJson>(&raw) {
                return Resumed {
                    last_scanned: parse_local_timestamp(&parsed.last_scanned).unwrap_or(0),
                    last_root_revision: parsed.last_root_revision,
                };
            }
        }

        let legacy = self
            .path
            .parent()
            .map(|d| d.join("last_scanned"))
            .unwrap_or_else(|| PathBuf::from("last_scanned"));
        if let Ok(raw) = fs::read_to_string(legacy) {
            if let Ok(secs) = raw.trim().parse::<i64>() {
                return Resumed {
                    last_scanned: secs,
                    last_root_revision: 0,
                };
            }
        }

        Resumed::default()
    }

    pub fn save_if_changed(&mut self, last_scanned: i64, last_root_revision: i64) -> Result<()> {
        let status = StatusJson {
            last_scanned: format_local_timestamp(last_scanned),
            last_root_revision,
        };
        let json = serde_json::to_string(&status).context("serialize status")?;
        if json == self.previously {
            return Ok(());
        }
        fs::write(&self.path, &json)
            .with_context(|| format!("write {}", self.path.display()))?;
        self.previously = json;
        Ok(())
    }
}

fn format_local_timestamp(secs: i64) -> String {
    match Local.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format(TIME_FORMAT).to_string(),
        None => Local::now().format(TIME_FORMAT).to_string(),
    }
}

fn parse_local_timestamp(raw: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(raw, TIME_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp())
}

/// Single-file "last error" record, written on startup and connection
/// failures, cleared when the engine comes back online.
pub struct ErrorSink {
    path: PathBuf,
}

impl ErrorSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn record(&self, msg: &str) {
        let line = msg.lines().next().unwrap_or(msg);
        if fs::write(&self.path, line).is_ok() {
            make_hidden_on_windows(&self.path);
        }
        crate::logging::error(line);
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(windows)]
pub fn make_hidden_on_windows(path: &Path) {
    use std::os::windows::ffi::OsStrExt;

    #[link(name = "kernel32")]
    extern "system" {
        fn SetFileAttributesW(lp_file_name: *const u16, dw_file_attributes: u32) -> i32;
    }
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x02;

    let wide: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    unsafe {
        SetFileAttributesW(wide.as_ptr(), FILE_ATTRIBUTE_HIDDEN);
    }
}

#[cfg(not(windows))]
pub fn make_hidden_on_windows(_path: &Path) {}
