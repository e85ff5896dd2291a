use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::index::canonical_rel;
use crate::queue::{Action, ActionQueue};
use crate::rules::{ExcludedPatterns, STOP_SENTINEL};

/// How long an "engine just wrote this" entry suppresses echo events.
const SELF_WRITE_WINDOW: Duration = Duration::from_secs(2);

/// Accepts raw filesystem events, filters them through the path rules,
/// and appends de-duplicated `(path, action)` pairs to the queue. Also
/// the owner of the stop-sentinel shutdown flag and of the short-lived
/// "expected self-writes" set the engine feeds before writing locally.
pub struct EventSink {
    root: PathBuf,
    queue: Arc<ActionQueue>,
    rules: Arc<ExcludedPatterns>,
    shutdown: Arc<AtomicBool>,
    recent_writes: Mutex<HashMap<String, Instant>>,
}

impl EventSink {
    pub fn new(
        root: PathBuf,
        queue: Arc<ActionQueue>,
        rules: Arc<ExcludedPatterns>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            root,
            queue,
            rules,
            shutdown,
            recent_writes: Mutex::new(HashMap::new()),
        }
    }

    /// Called by the engine just before it writes `rel` locally, so the
    /// resulting created/modified event is not mistaken for a user edit.
    pub fn note_engine_write(&self, rel: &str) {
        let mut writes = self.recent_writes.lock().expect("recent writes lock");
        writes.insert(rel.to_string(), Instant::now());
    }

    fn recently_written(&self, rel: &str) -> bool {
        let mut writes = self.recent_writes.lock().expect("recent writes lock");
        let now = Instant::now();
        writes.retain(|_, at| now.duration_since(*at) < SELF_WRITE_WINDOW);
        writes.contains_key(rel)
    }

    pub fn created(&self, abs: &Path, is_dir: bool) {
        if self.intercept_stop_sentinel(abs) {
            return;
        }
        let Some(rel) = canonical_rel(&self.root, abs, is_dir) else {
            return;
        };
        if self.rules.excluded(&rel) || self.recently_written(&rel) {
            return;
        }
        let action = if is_dir { Action::AddDir } else { Action::AddFile };
        self.queue.push(rel, action);
    }

    pub fn modified(&self, abs: &Path, is_dir: bool) {
        if self.intercept_stop_sentinel(abs) {
            return;
        }
        if is_dir {
            return;
        }
        let Some(rel) = canonical_rel(&self.root, abs, false) else {
            return;
        };
        if rel == "/" || self.rules.excluded(&rel) || self.recently_written(&rel) {
            return;
        }
        if self.queue.contains(&rel, Action::AddFile) || self.queue.contains(&rel, Action::Change) {
            return;
        }
        self.queue.push(rel, Action::Change);
    }

    pub fn deleted(&self, abs: &Path) {
        let Some(rel) = canonical_rel(&self.root, abs, false) else {
            return;
        };
        // The clash-sidecar rename a GET performs looks like a deletion
        // of the original path; the self-write window covers it.
        if self.rules.excluded(&rel) || self.recently_written(&rel) {
            return;
        }
        self.queue.push(rel, Action::Delete);
    }

    fn intercept_stop_sentinel(&self, abs: &Path) -> bool {
        let is_sentinel = abs
            .file_name()
            .map(|n| n == STOP_SENTINEL)
            .unwrap_or(false);
        if !is_sentinel {
            return false;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = std::fs::remove_file(abs);
        true
    }
}

/// Start the filesystem watcher on the sync root. The returned watcher
/// must be kept alive for the lifetime of the engine; its callback
/// thread shares nothing with the engine except the sink.
pub fn spawn_watcher(sink: Arc<EventSink>) -> Result<RecommendedWatcher> {
    let root = sink.root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                crate::logging::error(format!("watcher error: {err}"));
                return;
            }
        };
        dispatch_event(&sink, &event);
    })
    .context("create filesystem watcher")?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", root.display()))?;
    Ok(watcher)
}

fn dispatch_event(sink: &EventSink, event: &Event) {
    match event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                sink.created(path, path.is_dir());
            }
        }
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            // Renames arrive as Name events carrying the old and/or new
            // path; treat them as delete + add.
            for path in &event.paths {
                if path.exists() {
                    sink.created(path, path.is_dir());
                } else {
                    sink.deleted(path);
                }
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                sink.modified(path, path.is_dir());
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                sink.deleted(path);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
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

    fn make_sink(root: &Path) -> (Arc<EventSink>, Arc<ActionQueue>, Arc<AtomicBool>) {
        let queue = Arc::new(ActionQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(EventSink::new(
            root.to_path_buf(),
            queue.clone(),
            Arc::new(ExcludedPatterns::new()),
            shutdown.clone(),
        ));
        (sink, queue, shutdown)
    }

    #[test]
    fn created_file_enqueues_add_file() {
        let root = make_temp_dir("subsyncit-sink-add");
        let (sink, queue, _) = make_sink(&root);
        sink.created(&root.join("a").join("out.txt"), false);
        assert_eq!(queue.pop(), Some(("/a/out.txt".to_string(), Action::AddFile)));
    }

    #[test]
    fn created_dir_enqueues_add_dir_with_trailing_slash() {
        let root = make_temp_dir("subsyncit-sink-adddir");
        let (sink, queue, _) = make_sink(&root);
        sink.created(&root.join("a"), true);
        assert_eq!(queue.pop(), Some(("/a/".to_string(), Action::AddDir)));
    }

    #[test]
    fn modified_dedupes_against_queued_add_and_change() {
        let root = make_temp_dir("subsyncit-sink-dedup");
        let (sink, queue, _) = make_sink(&root);
        let f = root.join("out.txt");

        sink.created(&f, false);
        sink.modified(&f, false);
        assert_eq!(queue.len(), 1);

        queue.pop();
        sink.modified(&f, false);
        sink.modified(&f, false);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(("/out.txt".to_string(), Action::Change)));
    }

    #[test]
    fn directory_modifications_are_ignored() {
        let root = make_temp_dir("subsyncit-sink-dirmod");
        let (sink, queue, _) = make_sink(&root);
        sink.modified(&root.join("a"), true);
        assert!(queue.is_empty());
    }

    #[test]
    fn excluded_paths_never_reach_the_queue() {
        let root = make_temp_dir("subsyncit-sink-excl");
        let (sink, queue, _) = make_sink(&root);
        sink.created(&root.join(".hidden"), false);
        sink.modified(&root.join("x.clash_2017-11-02-10-00-00"), false);
        sink.deleted(&root.join(".hidden"));
        assert!(queue.is_empty());
    }

    #[test]
    fn stop_sentinel_signals_shutdown_and_removes_the_file() {
        let root = make_temp_dir("subsyncit-sink-stop");
        let (sink, queue, shutdown) = make_sink(&root);
        let sentinel = root.join(STOP_SENTINEL);
        fs::write(&sentinel, b"").unwrap();

        sink.created(&sentinel, false);
        assert!(shutdown.load(Ordering::SeqCst));
        assert!(!sentinel.exists());
        assert!(queue.is_empty());
    }

    #[test]
    fn engine_self_writes_are_suppressed() {
        let root = make_temp_dir("subsyncit-sink-echo");
        let (sink, queue, _) = make_sink(&root);
        let f = root.join("pulled.txt");

        sink.note_engine_write("/pulled.txt");
        sink.created(&f, false);
        sink.modified(&f, false);
        // A clash rename shows up as a deletion of the original path.
        sink.deleted(&f);
        assert!(queue.is_empty());
    }

    #[test]
    fn paths_outside_the_root_are_ignored() {
        let root = make_temp_dir("subsyncit-sink-outside");
        let (sink, queue, _) = make_sink(&root);
        sink.created(Path::new("/somewhere/else.txt"), false);
        assert!(queue.is_empty());
    }
}
