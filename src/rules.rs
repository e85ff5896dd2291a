use std::sync::RwLock;

use regex::Regex;

/// Marker file whose appearance in the sync root requests shutdown.
pub const STOP_SENTINEL: &str = "subsyncit.stop";

/// Remote file holding one exclusion regex per line.
pub const EXCLUSIONS_FILE: &str = ".subsyncit-excluded-filename-patterns";

/// Basename patterns excluded from sync in both directions.
///
/// The pattern list is loaded once per boot from the remote repository;
/// until then only the built-in rules (dotfiles, clash sidecars, the stop
/// sentinel) apply.
pub struct ExcludedPatterns {
    regexes: RwLock<Vec<Regex>>,
}

impl ExcludedPatterns {
    pub fn new() -> Self {
        Self {
            regexes: RwLock::new(Vec::new()),
        }
    }

    /// Replace the pattern list with regexes parsed from `text`
    /// (one per line). Lines that fail to compile are logged and skipped.
    pub fn set_from_lines(&self, text: &str) {
        let mut regexes = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match Regex::new(line) {
                Ok(re) => regexes.push(re),
                Err(err) => {
                    crate::logging::error(format!("bad exclusion pattern {line:?}: {err}"));
                }
            }
        }
        let count = regexes.len();
        *self.regexes.write().expect("exclusions lock") = regexes;
        crate::logging::info(format!("loaded {count} exclusion patterns"));
    }

    /// True when `path` must not be synced in either direction.
    pub fn excluded(&self, path: &str) -> bool {
        let basename = basename_of(path);

        if basename.is_empty()
            || basename.starts_with('.')
            || basename == STOP_SENTINEL
            || path.contains(".clash_")
        {
            return true;
        }

        let regexes = self.regexes.read().expect("exclusions lock");
        regexes.iter().any(|re| re.is_match(basename))
    }
}

impl Default for ExcludedPatterns {
    fn default() -> Self {
        Self::new()
    }
}

fn basename_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotfiles_and_sentinel_are_excluded() {
        let rules = ExcludedPatterns::new();
        assert!(rules.excluded("/.hidden"));
        assert!(rules.excluded("/a/.DS_Store"));
        assert!(rules.excluded("/subsyncit.stop"));
        assert!(rules.excluded(&format!("/{EXCLUSIONS_FILE}")));
    }

    #[test]
    fn clash_sidecars_are_excluded_anywhere_in_path() {
        let rules = ExcludedPatterns::new();
        assert!(rules.excluded("/a/out.txt.clash_2017-11-02-10-00-00"));
        assert!(rules.excluded("/a.clash_2017-11-02-10-00-00/inner.txt"));
    }

    #[test]
    fn empty_and_root_paths_are_excluded() {
        let rules = ExcludedPatterns::new();
        assert!(rules.excluded(""));
        assert!(rules.excluded("/"));
    }

    #[test]
    fn remote_patterns_match_basenames_only() {
        let rules = ExcludedPatterns::new();
        rules.set_from_lines(".*\\.txt\n");
        assert!(rules.excluded("/a/notes.txt"));
        assert!(!rules.excluded("/a/notes.zzz"));
        // Directory component must not trip the basename match.
        assert!(!rules.excluded("/stuff.txt.d/archive.zzz"));
    }

    #[test]
    fn bad_pattern_lines_are_skipped() {
        let rules = ExcludedPatterns::new();
        rules.set_from_lines("[unclosed\n.*\\.log\n");
        assert!(rules.excluded("/a/x.log"));
        assert!(!rules.excluded("/a/x.zzz"));
    }

    #[test]
    fn regular_paths_are_not_excluded() {
        let rules = ExcludedPatterns::new();
        assert!(!rules.excluded("/a/out.txt"));
        assert!(!rules.excluded("/a/b/"));
    }
}
