use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use walkdir::WalkDir;

use crate::index::{canonical_rel, join_root, Index, Instruction};
use crate::queue::{Action, ActionQueue};
use crate::rules::ExcludedPatterns;

/// Per-invocation cap so a single sweep cannot starve the main loop.
const SCAN_BATCH_LIMIT: usize = 100;

/// Walk the sync root for files the watcher missed (agent was off,
/// events lost): unknown or never-uploaded files become `add_file`
/// actions, known files whose size+mtime moved become `change` actions.
pub fn scan_missed_adds_and_changes(
    root: &Path,
    index: &Index,
    queue: &ActionQueue,
    rules: &ExcludedPatterns,
    shutdown: &AtomicBool,
    last_scanned: i64,
) -> Result<usize> {
    let start = Instant::now();
    let mut to_add = 0usize;
    let mut to_change = 0usize;

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if to_add + to_change > SCAN_BATCH_LIMIT {
            break;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if mtime_secs(&meta) < last_scanned {
            continue;
        }

        let Some(rel) = canonical_rel(root, entry.path(), false) else {
            continue;
        };
        if rules.excluded(&rel) {
            continue;
        }

        let row = index.get(&rel)?;
        if row.as_ref().is_some_and(|r| r.instruction.is_some()) {
            continue;
        }
        match row {
            Some(row) if row.in_subversion() => {
                let size_mtime = meta.len() as i64 + mtime_secs(&meta);
                if size_mtime != row.size_mtime {
                    queue.push(rel, Action::Change);
                    to_change += 1;
                }
            }
            _ => {
                queue.push(rel, Action::AddFile);
                to_add += 1;
            }
        }
    }

    crate::logging::section_end(
        to_add + to_change > 0,
        &format!("scan found {to_add} missed adds and {to_change} missed changes"),
        start,
    );
    Ok(to_add + to_change)
}

/// Walk the index for rows the server still has but the local tree no
/// longer does, and mark them for remote deletion.
pub fn scan_missed_deletes(
    root: &Path,
    index: &Index,
    shutdown: &AtomicBool,
) -> Result<usize> {
    let start = Instant::now();
    let mut to_delete = 0usize;

    for row in index.idle_rows_in_subversion()? {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if to_delete > SCAN_BATCH_LIMIT {
            break;
        }
        if !join_root(root, &row.path).exists() {
            index.set_instruction(&row.path, Some(Instruction::DeleteRemote))?;
            to_delete += 1;
        }
    }

    crate::logging::section_end(
        to_delete > 0,
        &format!("scan found {to_delete} missed deletes"),
        start,
    );
    Ok(to_delete)
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Kind;
    use std::fs;
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn unknown_files_become_add_actions() {
        let root = make_temp_dir("subsyncit-scan-add");
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("a").join("new.txt"), b"fresh").unwrap();

        let index = Index::open_in_memory().unwrap();
        let queue = ActionQueue::new();
        let rules = ExcludedPatterns::new();
        let shutdown = AtomicBool::new(false);

        let found =
            scan_missed_adds_and_changes(&root, &index, &queue, &rules, &shutdown, 0).unwrap();
        assert_eq!(found, 1);
        assert_eq!(queue.pop(), Some(("/a/new.txt".to_string(), Action::AddFile)));
    }

    #[test]
    fn known_unchanged_files_are_skipped() {
        let root = make_temp_dir("subsyncit-scan-skip");
        let f = root.join("same.txt");
        fs::write(&f, b"stable").unwrap();
        let meta = fs::metadata(&f).unwrap();
        let size_mtime = meta.len() as i64 + mtime_secs(&meta);

        let index = Index::open_in_memory().unwrap();
        index.upsert("/same.txt", Kind::File, 0, None).unwrap();
        index.record_synced("/same.txt", 3, "abc", size_mtime).unwrap();

        let queue = ActionQueue::new();
        let rules = ExcludedPatterns::new();
        let shutdown = AtomicBool::new(false);

        let found =
            scan_missed_adds_and_changes(&root, &index, &queue, &rules, &shutdown, 0).unwrap();
        assert_eq!(found, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn changed_size_mtime_becomes_change_action() {
        let root = make_temp_dir("subsyncit-scan-change");
        let f = root.join("moved.txt");
        fs::write(&f, b"longer than before").unwrap();

        let index = Index::open_in_memory().unwrap();
        index.upsert("/moved.txt", Kind::File, 0, None).unwrap();
        // Stale size+mtime from an earlier reconcile.
        index.record_synced("/moved.txt", 3, "abc", 1).unwrap();

        let queue = ActionQueue::new();
        let rules = ExcludedPatterns::new();
        let shutdown = AtomicBool::new(false);

        scan_missed_adds_and_changes(&root, &index, &queue, &rules, &shutdown, 0).unwrap();
        assert_eq!(queue.pop(), Some(("/moved.txt".to_string(), Action::Change)));
    }

    #[test]
    fn entries_older_than_last_scan_are_ignored() {
        let root = make_temp_dir("subsyncit-scan-old");
        fs::write(root.join("old.txt"), b"old").unwrap();

        let index = Index::open_in_memory().unwrap();
        let queue = ActionQueue::new();
        let rules = ExcludedPatterns::new();
        let shutdown = AtomicBool::new(false);

        let far_future = mtime_secs(&fs::metadata(root.join("old.txt")).unwrap()) + 3600;
        let found = scan_missed_adds_and_changes(
            &root, &index, &queue, &rules, &shutdown, far_future,
        )
        .unwrap();
        assert_eq!(found, 0);
    }

    #[test]
    fn rows_with_pending_instructions_are_left_alone() {
        let root = make_temp_dir("subsyncit-scan-pending");
        fs::write(root.join("busy.txt"), b"busy").unwrap();

        let index = Index::open_in_memory().unwrap();
        index
            .upsert("/busy.txt", Kind::File, 0, Some(Instruction::Get))
            .unwrap();

        let queue = ActionQueue::new();
        let rules = ExcludedPatterns::new();
        let shutdown = AtomicBool::new(false);

        let found =
            scan_missed_adds_and_changes(&root, &index, &queue, &rules, &shutdown, 0).unwrap();
        assert_eq!(found, 0);
    }

    #[test]
    fn vanished_local_files_get_remote_delete_instruction() {
        let root = make_temp_dir("subsyncit-scan-del");
        fs::write(root.join("kept.txt"), b"kept").unwrap();

        let index = Index::open_in_memory().unwrap();
        index.upsert("/kept.txt", Kind::File, 0, None).unwrap();
        index.record_synced("/kept.txt", 5, "aaa", 10).unwrap();
        index.upsert("/gone.txt", Kind::File, 0, None).unwrap();
        index.record_synced("/gone.txt", 5, "bbb", 10).unwrap();

        let shutdown = AtomicBool::new(false);
        let found = scan_missed_deletes(&root, &index, &shutdown).unwrap();
        assert_eq!(found, 1);

        let gone = index.get("/gone.txt").unwrap().unwrap();
        assert_eq!(gone.instruction, Some(Instruction::DeleteRemote));
        let kept = index.get("/kept.txt").unwrap().unwrap();
        assert!(kept.instruction.is_none());
    }

    #[test]
    fn excluded_files_are_not_scanned_up() {
        let root = make_temp_dir("subsyncit-scan-excl");
        fs::write(root.join(".dotfile"), b"x").unwrap();

        let index = Index::open_in_memory().unwrap();
        let queue = ActionQueue::new();
        let rules = ExcludedPatterns::new();
        let shutdown = AtomicBool::new(false);

        let found =
            scan_missed_adds_and_changes(&root, &index, &queue, &rules, &shutdown, 0).unwrap();
        assert_eq!(found, 0);
    }
}
