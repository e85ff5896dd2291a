use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::events::EventSink;
use crate::index::{join_root, parent_of, Entry, Index, Instruction, Kind};
use crate::queue::{Action, ActionQueue};
use crate::remote::{
    DepthInfinityRefused, RemoteEntry, RepoGeometry, ServerObjected, SvnClient,
};
use crate::rules::{ExcludedPatterns, EXCLUSIONS_FILE};
use crate::scanner;
use crate::state::{ErrorSink, StatusFile};

/// Batches of 100 so there is intermediate reporting on long passes.
const BATCH_LIMIT: usize = 100;
const DELETE_PASS_LIMIT: usize = 100_000;

/// The remote copy moved between our last sync and this PUT; drop the
/// local write and let the next inbound pass produce a clash sidecar.
#[derive(Debug)]
struct ChangedOnServer;

impl std::fmt::Display for ChangedOnServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "changed on the server by another user")
    }
}

impl std::error::Error for ChangedOnServer {}

#[derive(Debug)]
struct StillBeingWritten(PathBuf);

impl std::fmt::Display for StillBeingWritten {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} is still being written to", self.0.display())
    }
}

impl std::error::Error for StillBeingWritten {}

/// The reconciliation loop: drains queued actions into index
/// instructions, executes them against the remote in a fixed order
/// (GETs, local deletes, PUTs, remote deletes), then walks remote
/// directories whose revision moved to pick up inbound changes.
pub struct Engine {
    cfg: Arc<Config>,
    index: Index,
    queue: Arc<ActionQueue>,
    rules: Arc<ExcludedPatterns>,
    sink: Arc<EventSink>,
    shutdown: Arc<AtomicBool>,
    status: StatusFile,
    errors: ErrorSink,
    online: bool,
    iteration: u64,
    last_scanned: i64,
    last_root_revision: i64,
    geometry: Option<RepoGeometry>,
}

impl Engine {
    pub fn new(
        cfg: Arc<Config>,
        queue: Arc<ActionQueue>,
        rules: Arc<ExcludedPatterns>,
        sink: Arc<EventSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let index = Index::open(&cfg.db_path())?;
        let status = StatusFile::new(cfg.status_path());
        let resumed = status.load();
        let errors = ErrorSink::new(cfg.error_path());
        Ok(Engine {
            cfg,
            index,
            queue,
            rules,
            sink,
            shutdown,
            status,
            errors,
            online: false,
            iteration: 0,
            last_scanned: resumed.last_scanned,
            last_root_revision: resumed.last_root_revision,
            geometry: None,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        while self.should_keep_going() {
            // A fresh session per iteration survives the user moving
            // between networks.
            let mut client = SvnClient::connect(&self.cfg, self.geometry.clone())?;

            let walk_instructions = match self.iterate(&mut client).await {
                Ok(count) => count,
                Err(err) => {
                    if err.downcast_ref::<DepthInfinityRefused>().is_some() {
                        return Err(err);
                    }
                    self.online = false;
                    self.errors.record(&format!("{err:#}"));
                    0
                }
            };

            self.iteration += 1;
            self.status
                .save_if_changed(self.last_scanned, self.last_root_revision)?;

            let substantial = client.anything_substantial_happened() || walk_instructions > 0;
            if !substantial {
                self.sleep_between_iterations().await;
            }
        }

        // Cooperative shutdown: one last action-to-instruction pass so
        // nothing the watcher saw is lost, then persist.
        apply_queued_actions(&self.index, &self.queue)?;
        self.status
            .save_if_changed(self.last_scanned, self.last_root_revision)?;
        crate::logging::info("shutdown complete");
        Ok(())
    }

    fn should_keep_going(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let sentinel = self.cfg.stop_sentinel_path();
        if sentinel.is_file() {
            let _ = std::fs::remove_file(&sentinel);
            self.shutdown.store(true, Ordering::SeqCst);
            return false;
        }
        true
    }

    async fn sleep_between_iterations(&self) {
        let deadline = Instant::now() + Duration::from_secs(self.cfg.sleep_secs);
        while Instant::now() < deadline {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// One pass of the loop. Returns how many instructions the inbound
    /// walk created (they make the next iteration start immediately).
    async fn iterate(&mut self, client: &mut SvnClient) -> Result<usize> {
        // (a) Bootstrap against the repository root.
        let root = match client.details("/").await {
            Ok(details) if details.revision > 0 => details,
            Ok(_) => {
                self.online = false;
                return Ok(0);
            }
            Err(fault) => {
                self.online = false;
                self.errors.record(&fault.to_string());
                return Ok(0);
            }
        };

        let geometry = match self.geometry.take() {
            Some(mut geometry) => {
                geometry.baseline_rel_path = root.baseline_rel_path.clone();
                geometry
            }
            None => RepoGeometry {
                baseline_rel_path: root.baseline_rel_path.clone(),
                repo_parent_path: client.repo_parent_path().await?,
            },
        };
        client.set_geometry(geometry.clone());
        self.geometry = Some(geometry);

        if !self.online {
            self.errors.clear();
        }
        self.online = true;

        if self.iteration == 0 {
            if let Some(text) = client.get_text(&format!("/{EXCLUSIONS_FILE}")).await {
                self.rules.set_from_lines(&text);
            }
        }

        // (b) Periodic scan for anything the watcher missed.
        if self.cfg.scan_enabled {
            let scan_start = chrono::Utc::now().timestamp();
            scanner::scan_missed_adds_and_changes(
                &self.cfg.local_root,
                &self.index,
                &self.queue,
                &self.rules,
                &self.shutdown,
                self.last_scanned,
            )?;
            scanner::scan_missed_deletes(&self.cfg.local_root, &self.index, &self.shutdown)?;
            self.last_scanned = scan_start;
        }

        // (c)-(g) Queued actions become instructions; instructions run
        // in a fixed order, re-draining the queue between phases.
        apply_queued_actions(&self.index, &self.queue)?;
        self.execute_gets(client).await?;
        apply_queued_actions(&self.index, &self.queue)?;
        self.execute_local_deletes()?;
        apply_queued_actions(&self.index, &self.queue)?;
        let possible_clash = self.execute_puts(client).await?;
        apply_queued_actions(&self.index, &self.queue)?;
        self.execute_remote_deletes(client).await?;
        apply_queued_actions(&self.index, &self.queue)?;

        // (h) Inbound: walk directories whose revision moved.
        let mut walk_instructions = 0;
        if root.revision != self.last_root_revision || possible_clash {
            walk_instructions = self.merkle_walk(client, root.revision).await?;
            self.last_root_revision = root.revision;
        }
        apply_queued_actions(&self.index, &self.queue)?;

        Ok(walk_instructions)
    }

    /// (d) Execute pending GETs, batched. Directory GETs may instruct
    /// further GETs for their children; the re-query loop picks those
    /// up until the inbound set is drained.
    async fn execute_gets(&mut self, client: &SvnClient) -> Result<()> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            let rows = self.index.with_instruction(Instruction::Get, BATCH_LIMIT, false)?;
            if rows.is_empty() {
                return Ok(());
            }
            let start = Instant::now();
            let mut files = 0usize;
            for row in &rows {
                if self.shutdown.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if self.rules.excluded(&row.path) {
                    self.index.set_instruction(&row.path, None)?;
                    continue;
                }
                let treat_as_dir = row.kind == Kind::Dir
                    || client.head_is_collection(&row.path).await.unwrap_or(false);
                let result = if treat_as_dir {
                    self.get_dir(client, row).await.map(|_| ())
                } else {
                    files += 1;
                    self.get_file(client, row).await
                };
                if let Err(err) = result {
                    if err.downcast_ref::<DepthInfinityRefused>().is_some() {
                        return Err(err);
                    }
                    crate::logging::error(format!("GET failed for {}: {err:#}", row.path));
                }
                self.index.set_instruction(&row.path, None)?;
                remark_parent_for_get(&self.index, &row.path)?;
            }
            crate::logging::section_end(
                !rows.is_empty(),
                &format!(
                    "GETs from the server: {} files, {} directories",
                    files,
                    rows.len() - files
                ),
                start,
            );
        }
    }

    async fn get_file(&self, client: &SvnClient, row: &Entry) -> Result<()> {
        let details = client.details(&row.path).await?;
        let resp = client.get_stream(&row.path).await?;
        let abs = join_root(&self.cfg.local_root, &row.path);
        self.sink.note_engine_write(&row.path);

        // Preserve a locally modified copy before truncating it: if the
        // bytes on disk are not the bytes we last reconciled, the user
        // (or an interrupted download) changed them.
        if abs.exists() {
            let on_disk = sha1_of_file(&abs)?;
            if row.local_sha1.as_deref() != Some(on_disk.as_str()) {
                let clash = clash_path(&abs);
                std::fs::rename(&abs, &clash)
                    .with_context(|| format!("rename to {}", clash.display()))?;
                crate::logging::info(format!(
                    "local content preserved as {}",
                    clash.display()
                ));
            }
        }

        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = tokio::fs::File::create(&abs)
            .await
            .with_context(|| format!("create {}", abs.display()))?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);

        let sha1 = sha1_of_file(&abs)?;
        let size_mtime = size_plus_mtime(&abs).unwrap_or(0);
        self.index
            .record_synced(&row.path, details.revision, &sha1, size_mtime)?;
        Ok(())
    }

    async fn get_dir(&self, client: &SvnClient, row: &Entry) -> Result<usize> {
        let dir = as_dir_path(&row.path);
        let abs = join_root(&self.cfg.local_root, &dir);
        if !abs.exists() {
            self.sink.note_engine_write(&dir);
            std::fs::create_dir_all(&abs)?;
        }
        let remote_rev = client.directory_revision(&dir).await?;
        if remote_rev == row.revision {
            return Ok(0);
        }
        self.index.update_revision(&row.path, remote_rev)?;
        let children = client.dir_list(&dir).await?;
        let outcome = reconcile_children(&self.index, &self.rules, &dir, &children)?;
        Ok(outcome.instructions)
    }

    /// (e) Best-effort local unlinks, children before parents. A
    /// directory that is not yet empty stays instructed for a later
    /// pass.
    fn execute_local_deletes(&self) -> Result<()> {
        let rows =
            self.index
                .with_instruction(Instruction::DeleteLocal, DELETE_PASS_LIMIT, true)?;
        for row in rows {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            let abs = join_root(&self.cfg.local_root, &row.path);
            let result = if row.kind == Kind::Dir {
                std::fs::remove_dir(&abs)
            } else {
                std::fs::remove_file(&abs)
            };
            match result {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(_) => continue,
            }
            self.index.remove(&row.path)?;
            remark_parent_for_get(&self.index, &row.path)?;
        }
        Ok(())
    }

    /// (f) Locally added directories first (MKCOL), then file PUTs,
    /// batched. Returns whether a concurrent remote change was seen.
    async fn execute_puts(&mut self, client: &SvnClient) -> Result<bool> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let rows = self
                .index
                .with_instruction(Instruction::Mkcol, BATCH_LIMIT, false)?;
            if rows.is_empty() {
                break;
            }
            for row in rows {
                if self.shutdown.load(Ordering::SeqCst) {
                    return Ok(false);
                }
                if let Err(err) = self.ensure_remote_dirs(client, &row.path).await {
                    if err.downcast_ref::<DepthInfinityRefused>().is_some() {
                        return Err(err);
                    }
                    crate::logging::error(format!("MKCOL failed for {}: {err:#}", row.path));
                }
                self.index.set_instruction(&row.path, None)?;
            }
        }

        let mut possible_clash = false;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let rows = self.index.with_instruction(Instruction::Put, BATCH_LIMIT, false)?;
            if rows.is_empty() {
                break;
            }
            let start = Instant::now();
            let mut put_count = 0usize;
            let mut unchanged = 0usize;
            for row in &rows {
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let abs = join_root(&self.cfg.local_root, &row.path);
                let new_sha1 = match sha1_of_file(&abs) {
                    Ok(sha) => sha,
                    Err(_) => {
                        // Vanished since the event fired.
                        self.index.set_instruction(&row.path, None)?;
                        unchanged += 1;
                        continue;
                    }
                };
                // Files that come down as new/changed get written to
                // the filesystem and superficially look like they
                // should be pushed straight back up. If the SHA-1 is
                // unchanged, don't.
                if row.remote_sha1 == row.local_sha1
                    && row.local_sha1.as_deref() == Some(new_sha1.as_str())
                {
                    self.index.set_instruction(&row.path, None)?;
                    unchanged += 1;
                    continue;
                }

                match self.put_file(client, row, &abs, &new_sha1).await {
                    Ok(()) => {
                        put_count += 1;
                        remark_parent_for_get(&self.index, &row.path)?;
                    }
                    Err(err) => {
                        if err.downcast_ref::<DepthInfinityRefused>().is_some() {
                            return Err(err);
                        }
                        if err.downcast_ref::<ChangedOnServer>().is_some() {
                            // Let the next inbound pass get back to this
                            // path and the GET win; the sidecar rename
                            // there preserves the local bytes.
                            possible_clash = true;
                            unchanged += 1;
                        } else if let Some(busy) = err.downcast_ref::<StillBeingWritten>() {
                            crate::logging::info(format!("{busy}; retrying later"));
                            unchanged += 1;
                        } else if let Some(objection) = err.downcast_ref::<ServerObjected>() {
                            if objection.body.contains("txn-current-lock")
                                && objection.body.contains("Permission denied")
                            {
                                crate::logging::error(format!(
                                    "user lacks write permissions for {}, possibly for the whole repo",
                                    row.path
                                ));
                            } else {
                                crate::logging::error(format!(
                                    "PUT rejected for {}: {objection}",
                                    row.path
                                ));
                            }
                        } else {
                            crate::logging::error(format!(
                                "PUT failed for {}: {err:#}",
                                row.path
                            ));
                        }
                    }
                }
                self.index.set_instruction(&row.path, None)?;
            }
            crate::logging::section_end(
                put_count > 0 || unchanged > 0,
                &format!("PUTs on the server: {put_count} files ({unchanged} not actually changed)"),
                start,
            );
        }
        Ok(possible_clash)
    }

    async fn put_file(
        &self,
        client: &SvnClient,
        row: &Entry,
        abs: &Path,
        new_sha1: &str,
    ) -> Result<()> {
        // Stability check: a file mid-write is left for a later pass.
        let size_before = std::fs::metadata(abs)?.len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let size_after = std::fs::metadata(abs)?.len();
        if size_before != size_after {
            return Err(StillBeingWritten(abs.to_path_buf()).into());
        }

        if let Some(parent) = parent_of(&row.path) {
            if parent != "/" {
                self.ensure_remote_dirs(client, &parent).await?;
            }
        }

        // Concurrent-modification guard: somebody else moved the remote
        // copy since our last reconcile.
        if let Some(alleged) = &row.remote_sha1 {
            let details = client.details(&row.path).await?;
            if let Some(actual) = details.sha1 {
                if actual != *alleged {
                    return Err(ChangedOnServer.into());
                }
            }
        }

        let file = tokio::fs::File::open(abs)
            .await
            .with_context(|| format!("open {}", abs.display()))?;
        client.put(&row.path, reqwest::Body::from(file)).await?;

        let entry = client.file_entry(&row.path).await?;
        if entry.sha1.as_deref() != Some(new_sha1) {
            return Err(ChangedOnServer.into());
        }
        let size_mtime = size_plus_mtime(abs).unwrap_or(0);
        self.index
            .record_synced(&row.path, entry.revision, new_sha1, size_mtime)?;
        Ok(())
    }

    /// MKCOL any ancestors the server does not have yet, shallowest
    /// first, recording each directory's fresh revision.
    async fn ensure_remote_dirs(&self, client: &SvnClient, dir: &str) -> Result<usize> {
        let mut chain = Vec::new();
        let mut cursor = Some(as_dir_path(dir));
        while let Some(d) = cursor {
            if d == "/" {
                break;
            }
            let on_server = self
                .index
                .get(&d)?
                .map(|row| row.revision != 0)
                .unwrap_or(false);
            if on_server {
                break;
            }
            cursor = parent_of(&d);
            chain.push(d);
        }

        let mut made = 0usize;
        for d in chain.iter().rev() {
            let status = client.mkcol(d).await?;
            if status != 201 {
                anyhow::bail!("unexpected return code {status} for MKCOL {d}");
            }
            let revision = client.directory_revision(d).await?;
            self.index.record_dir_on_server(d, revision)?;
            made += 1;
        }
        Ok(made)
    }

    /// (g) Remote deletes, deepest first. The row goes away after any
    /// DELETE the server answered, whatever the status: a copy the
    /// server kept is then an unknown path to the next inbound walk,
    /// which re-GETs it, instead of an idle row whose stored SHA-1
    /// still matches the server's and masks the failure. Transport
    /// failures keep the instruction so the next iteration retries.
    async fn execute_remote_deletes(&self, client: &SvnClient) -> Result<()> {
        let rows =
            self.index
                .with_instruction(Instruction::DeleteRemote, DELETE_PASS_LIMIT, true)?;
        for row in rows {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            match client.delete(&row.path).await {
                Ok((status, body)) => {
                    if !((200..300).contains(&status) || status == 404) {
                        crate::logging::error(format!(
                            "unexpected DELETE status {status} for {}: {body}",
                            row.path
                        ));
                    }
                    self.index.remove(&row.path)?;
                    remark_parent_for_get(&self.index, &row.path)?;
                }
                Err(err) => {
                    crate::logging::error(format!("DELETE failed for {}: {err:#}", row.path));
                }
            }
        }
        Ok(())
    }

    /// (h) Walk the remote tree from the root, pruning any directory
    /// whose revision matches what we recorded last time. Returns the
    /// number of instructions created.
    async fn merkle_walk(&mut self, client: &SvnClient, root_revision: i64) -> Result<usize> {
        let start = Instant::now();
        let mut instructions = 0usize;
        let mut stack: Vec<String> = vec!["/".to_string()];
        while let Some(dir) = stack.pop() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if dir != "/" {
                let known = self
                    .index
                    .get(&dir)?
                    .map(|row| row.revision)
                    .unwrap_or(0);
                let remote = client.directory_revision(&dir).await?;
                if known != 0 && known == remote {
                    // Identical subtree; skip it entirely.
                    continue;
                }
                self.index.update_revision(&dir, remote)?;
            }
            let children = client.dir_list(&dir).await?;
            let outcome = reconcile_children(&self.index, &self.rules, &dir, &children)?;
            instructions += outcome.instructions;
            stack.extend(outcome.existing_dirs);
        }
        crate::logging::section_end(
            instructions > 0,
            &format!(
                "inbound walk created {instructions} instructions (root revision {root_revision})"
            ),
            start,
        );
        Ok(instructions)
    }
}

/// (c) Drain the action queue into index instructions.
pub fn apply_queued_actions(index: &Index, queue: &ActionQueue) -> Result<usize> {
    let mut applied = 0usize;
    while let Some((path, action)) = queue.pop() {
        match action {
            Action::AddDir => {
                index.upsert(&path, Kind::Dir, 0, Some(Instruction::Mkcol))?;
            }
            Action::AddFile => {
                // A GET-triggered write looks like a local add; only
                // files the server has never seen become PUTs.
                if !index.in_subversion(&path)? {
                    index.upsert(&path, Kind::File, 0, Some(Instruction::Put))?;
                }
            }
            Action::Change => {
                index.set_instruction(&path, Some(Instruction::Put))?;
            }
            Action::Delete => {
                // The watcher cannot tell a deleted file from a deleted
                // directory; resolve against the index. Deletes of rows
                // that never reached the server are discarded.
                let entry = match index.get(&path)? {
                    Some(entry) => Some(entry),
                    None => index.get(&format!("{path}/"))?,
                };
                if let Some(entry) = entry {
                    if entry.in_subversion() {
                        index.set_instruction(&entry.path, Some(Instruction::DeleteRemote))?;
                    }
                }
            }
        }
        applied += 1;
    }
    Ok(applied)
}

struct Reconciled {
    instructions: usize,
    existing_dirs: Vec<String>,
}

/// Compare one remote directory listing against the index rows directly
/// under it: unknown remote paths become GET rows, files whose remote
/// SHA-1 moved get GET, and idle rows the remote no longer lists get
/// DELETE_LOCAL.
fn reconcile_children(
    index: &Index,
    rules: &ExcludedPatterns,
    dir: &str,
    children: &[RemoteEntry],
) -> Result<Reconciled> {
    let mut unmatched: HashMap<String, Entry> = index
        .idle_children_of(dir)?
        .into_iter()
        .filter(|entry| !rules.excluded(&entry.path))
        .map(|entry| (entry.path.clone(), entry))
        .collect();

    let mut instructions = 0usize;
    let mut existing_dirs = Vec::new();

    for child in children {
        if rules.excluded(&child.path) {
            continue;
        }
        unmatched.remove(&child.path);
        match index.get(&child.path)? {
            None => {
                let kind = if child.sha1.is_none() { Kind::Dir } else { Kind::File };
                index.upsert(&child.path, kind, 0, Some(Instruction::Get))?;
                instructions += 1;
            }
            Some(row) => {
                if row.kind == Kind::Dir {
                    if row.instruction.is_none() {
                        existing_dirs.push(row.path);
                    }
                } else if row.remote_sha1 != child.sha1 {
                    index.set_instruction(&row.path, Some(Instruction::Get))?;
                    instructions += 1;
                }
            }
        }
    }

    // Locally known but absent from the remote listing: inbound delete.
    for path in unmatched.into_keys() {
        index.set_instruction(&path, Some(Instruction::DeleteLocal))?;
        instructions += 1;
    }

    Ok(Reconciled {
        instructions,
        existing_dirs,
    })
}

/// After a transfer under a directory, refresh that directory's
/// revision on a later sub-pass so the pruning state stays honest.
fn remark_parent_for_get(index: &Index, path: &str) -> Result<()> {
    let Some(parent) = parent_of(path) else {
        return Ok(());
    };
    if parent == "/" {
        return Ok(());
    }
    if let Some(row) = index.get(&parent)? {
        if row.instruction.is_none() {
            index.set_instruction(&parent, Some(Instruction::Get))?;
        }
    }
    Ok(())
}

fn as_dir_path(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

pub fn sha1_of_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Cheap change hint: size plus mtime, as recorded in the index.
pub fn size_plus_mtime(path: &Path) -> Option<i64> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs() as i64;
    Some(meta.len() as i64 + mtime)
}

fn clash_path(abs: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
    PathBuf::from(format!("{}.clash_{stamp}", abs.display()))
}
