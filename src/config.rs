use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::rules::STOP_SENTINEL;

/// Resolved runtime settings: where the remote lives, where the sync
/// root is, and where this sync root's state directory sits under
/// `~/.subsyncit/`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote repository URL, always with a trailing `/`.
    pub svn_url: String,
    /// Absolute path of the local sync root.
    pub local_root: PathBuf,
    pub user: String,
    /// None means anonymous access (`--passwd *NONE`).
    pub password: Option<String>,
    pub verify_ssl: bool,
    pub scan_enabled: bool,
    pub watch_enabled: bool,
    pub sleep_secs: u64,
    pub state_dir: PathBuf,
}

impl Config {
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        remote_url: &str,
        local_root: &Path,
        user: &str,
        password: Option<String>,
        verify_ssl: bool,
        scan_enabled: bool,
        watch_enabled: bool,
        sleep_secs: u64,
    ) -> Result<Self> {
        let mut svn_url = remote_url.to_string();
        if !svn_url.ends_with('/') {
            svn_url.push('/');
        }

        let local_root = absolutize(local_root)?;
        let state_dir = home_dir()
            .join(".subsyncit")
            .join(encoded_root_component(&local_root));

        Ok(Config {
            svn_url,
            local_root,
            user: user.to_string(),
            password,
            verify_ssl,
            scan_enabled,
            watch_enabled,
            sleep_secs,
            state_dir,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("subsyncit.db")
    }

    pub fn status_path(&self) -> PathBuf {
        self.state_dir.join("status.json")
    }

    pub fn error_path(&self) -> PathBuf {
        self.state_dir.join("subsyncit.err")
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join("subsyncit.log")
    }

    pub fn stop_sentinel_path(&self) -> PathBuf {
        self.local_root.join(STOP_SENTINEL)
    }

    /// Create the per-sync-root state directory, write the INFO.TXT
    /// pointer back to the watched directory, and clear any stale stop
    /// sentinel left over from a previous run.
    pub fn ensure_state_layout(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("create {}", self.state_dir.display()))?;
        if let Some(parent) = self.state_dir.parent() {
            crate::state::make_hidden_on_windows(parent);
        }

        let info = self.state_dir.join("INFO.TXT");
        std::fs::write(
            &info,
            format!(
                "{} is the Subsyncit sync directory that this state pertains to\n",
                self.local_root.display()
            ),
        )
        .with_context(|| format!("write {}", info.display()))?;

        std::fs::create_dir_all(&self.local_root)
            .with_context(|| format!("create {}", self.local_root.display()))?;
        let sentinel = self.stop_sentinel_path();
        if sentinel.is_file() {
            let _ = std::fs::remove_file(&sentinel);
        }
        Ok(())
    }
}

fn home_dir() -> PathBuf {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(normalize(path));
    }
    let cwd = std::env::current_dir().context("current dir")?;
    Ok(normalize(&cwd.join(path)))
}

fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Directory name for this sync root under `~/.subsyncit/`, derived by
/// escaping the separators out of the absolute path.
pub fn encoded_root_component(abs_root: &Path) -> String {
    abs_root
        .to_string_lossy()
        .replace('/', "%47")
        .replace(':', "%58")
        .replace('\\', "%92")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_url_gains_trailing_slash() {
        let cfg = Config::resolve(
            "http://127.0.0.1:8099/svn/testrepo",
            Path::new("/tmp/sync"),
            "alice",
            None,
            true,
            true,
            true,
            30,
        )
        .unwrap();
        assert_eq!(cfg.svn_url, "http://127.0.0.1:8099/svn/testrepo/");
    }

    #[test]
    fn state_dir_encodes_the_sync_root_path() {
        let encoded = encoded_root_component(Path::new("/home/alice/my sync"));
        assert_eq!(encoded, "%47home%47alice%47my sync");
        assert!(!encoded.contains('/'));
    }

    #[test]
    fn state_file_paths_live_under_state_dir() {
        let cfg = Config::resolve(
            "https://example.net/svn/r/",
            Path::new("/tmp/sync2"),
            "bob",
            Some("pw".to_string()),
            false,
            false,
            false,
            5,
        )
        .unwrap();
        assert!(cfg.db_path().starts_with(&cfg.state_dir));
        assert!(cfg.status_path().ends_with("status.json"));
        assert!(cfg.error_path().ends_with("subsyncit.err"));
        assert_eq!(cfg.stop_sentinel_path(), cfg.local_root.join("subsyncit.stop"));
    }

    #[test]
    fn relative_roots_are_absolutized() {
        let cfg = Config::resolve(
            "https://example.net/svn/r/",
            Path::new("some/rel/dir"),
            "bob",
            None,
            true,
            true,
            true,
            30,
        )
        .unwrap();
        assert!(cfg.local_root.is_absolute());
    }
}
