//! Event -> queue -> index pipeline, exercised without a server.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use subsyncit::engine::apply_queued_actions;
use subsyncit::events::EventSink;
use subsyncit::index::{Index, Instruction, Kind};
use subsyncit::queue::{Action, ActionQueue};
use subsyncit::rules::ExcludedPatterns;
use subsyncit::scanner;

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

struct Harness {
    root: PathBuf,
    sink: Arc<EventSink>,
    queue: Arc<ActionQueue>,
    index: Index,
    shutdown: Arc<AtomicBool>,
    rules: Arc<ExcludedPatterns>,
}

fn harness(prefix: &str) -> Harness {
    let root = make_temp_dir(prefix);
    let queue = Arc::new(ActionQueue::new());
    let rules = Arc::new(ExcludedPatterns::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let sink = Arc::new(EventSink::new(
        root.clone(),
        queue.clone(),
        rules.clone(),
        shutdown.clone(),
    ));
    Harness {
        root,
        sink,
        queue,
        index: Index::open_in_memory().unwrap(),
        shutdown,
        rules,
    }
}

#[test]
fn created_file_flows_to_put_instruction() {
    let h = harness("subsyncit-pipeline-add");
    let abs = h.root.join("a").join("out.txt");

    h.sink.created(&abs, false);
    apply_queued_actions(&h.index, &h.queue).unwrap();

    let row = h.index.get("/a/out.txt").unwrap().unwrap();
    assert_eq!(row.kind, Kind::File);
    assert_eq!(row.instruction, Some(Instruction::Put));
    assert!(row.remote_sha1.is_none());
}

#[test]
fn created_dir_flows_to_mkcol_instruction() {
    let h = harness("subsyncit-pipeline-mkcol");
    h.sink.created(&h.root.join("newdir"), true);
    apply_queued_actions(&h.index, &h.queue).unwrap();

    let row = h.index.get("/newdir/").unwrap().unwrap();
    assert_eq!(row.kind, Kind::Dir);
    assert_eq!(row.instruction, Some(Instruction::Mkcol));
}

#[test]
fn echoed_add_for_downloaded_file_is_discarded() {
    let h = harness("subsyncit-pipeline-echo");
    // Row as it looks right after a GET wrote the file locally.
    h.index.upsert("/pulled.txt", Kind::File, 0, None).unwrap();
    h.index.record_synced("/pulled.txt", 8, "abc", 42).unwrap();

    // Suppose the echo slipped past the self-write window: the drain
    // still discards it because the row is already on the server.
    h.queue.push("/pulled.txt".to_string(), Action::AddFile);
    apply_queued_actions(&h.index, &h.queue).unwrap();

    let row = h.index.get("/pulled.txt").unwrap().unwrap();
    assert!(row.instruction.is_none());
}

#[test]
fn delete_of_never_uploaded_file_is_dropped() {
    let h = harness("subsyncit-pipeline-drop-delete");
    h.index.upsert("/draft.txt", Kind::File, 0, None).unwrap();

    h.sink.deleted(&h.root.join("draft.txt"));
    apply_queued_actions(&h.index, &h.queue).unwrap();

    let row = h.index.get("/draft.txt").unwrap().unwrap();
    assert!(row.instruction.is_none());
}

#[test]
fn delete_of_synced_file_marks_remote_delete() {
    let h = harness("subsyncit-pipeline-delete");
    h.index.upsert("/a/doc.txt", Kind::File, 0, None).unwrap();
    h.index.record_synced("/a/doc.txt", 5, "abc", 10).unwrap();

    h.sink.deleted(&h.root.join("a").join("doc.txt"));
    apply_queued_actions(&h.index, &h.queue).unwrap();

    let row = h.index.get("/a/doc.txt").unwrap().unwrap();
    assert_eq!(row.instruction, Some(Instruction::DeleteRemote));
}

#[test]
fn change_events_collapse_to_one_put() {
    let h = harness("subsyncit-pipeline-change");
    h.index.upsert("/doc.txt", Kind::File, 0, None).unwrap();
    h.index.record_synced("/doc.txt", 5, "abc", 10).unwrap();

    let abs = h.root.join("doc.txt");
    h.sink.modified(&abs, false);
    h.sink.modified(&abs, false);
    h.sink.modified(&abs, false);
    assert_eq!(h.queue.len(), 1);

    apply_queued_actions(&h.index, &h.queue).unwrap();
    let row = h.index.get("/doc.txt").unwrap().unwrap();
    assert_eq!(row.instruction, Some(Instruction::Put));
}

#[test]
fn stop_sentinel_trips_shutdown_flag() {
    let h = harness("subsyncit-pipeline-stop");
    let sentinel = h.root.join("subsyncit.stop");
    fs::write(&sentinel, b"anything").unwrap();

    h.sink.modified(&sentinel, false);
    assert!(h.shutdown.load(Ordering::SeqCst));
    assert!(!sentinel.exists());
    assert!(h.queue.is_empty());
}

#[test]
fn scanner_feeds_the_same_drain_path_as_events() {
    let h = harness("subsyncit-pipeline-scan");
    fs::create_dir_all(h.root.join("deep")).unwrap();
    fs::write(h.root.join("deep").join("found.txt"), b"scanned up").unwrap();

    scanner::scan_missed_adds_and_changes(
        &h.root, &h.index, &h.queue, &h.rules, &h.shutdown, 0,
    )
    .unwrap();
    apply_queued_actions(&h.index, &h.queue).unwrap();

    let row = h.index.get("/deep/found.txt").unwrap().unwrap();
    assert_eq!(row.instruction, Some(Instruction::Put));
}

#[test]
fn excluded_paths_stay_out_of_the_index() {
    let h = harness("subsyncit-pipeline-excluded");
    h.rules.set_from_lines(".*\\.txt\n");

    h.sink.created(&h.root.join("a.txt"), false);
    h.sink.created(&h.root.join("a.zzz"), false);
    apply_queued_actions(&h.index, &h.queue).unwrap();

    assert!(h.index.get("/a.txt").unwrap().is_none());
    assert_eq!(
        h.index.get("/a.zzz").unwrap().unwrap().instruction,
        Some(Instruction::Put)
    );
}

#[test]
fn rapid_create_then_delete_converges_to_nothing() {
    let h = harness("subsyncit-pipeline-rapid");
    let abs = h.root.join("blip.txt");

    h.sink.created(&abs, false);
    h.sink.deleted(&abs);
    apply_queued_actions(&h.index, &h.queue).unwrap();

    // The add produced a PUT row; the delete found it not yet on the
    // server and was dropped. The PUT will later skip on file-missing.
    let row = h.index.get("/blip.txt").unwrap().unwrap();
    assert_eq!(row.instruction, Some(Instruction::Put));
    assert!(h.queue.is_empty());
}
