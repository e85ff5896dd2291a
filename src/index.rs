use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

const INDEX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    path        TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    depth       INTEGER NOT NULL,
    remote_sha1 TEXT,
    local_sha1  TEXT,
    size_mtime  INTEGER NOT NULL DEFAULT 0,
    revision    INTEGER NOT NULL DEFAULT 0,
    instruction TEXT
);

CREATE INDEX IF NOT EXISTS idx_files_instruction ON files(instruction);
CREATE INDEX IF NOT EXISTS idx_files_depth ON files(depth);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Dir,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::File => "file",
            Kind::Dir => "dir",
        }
    }

    fn parse(raw: &str) -> Kind {
        match raw {
            "dir" => Kind::Dir,
            _ => Kind::File,
        }
    }
}

/// Pending action the engine will take on a row in the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Put,
    Get,
    Mkcol,
    DeleteRemote,
    DeleteLocal,
}

impl Instruction {
    fn as_str(self) -> &'static str {
        match self {
            Instruction::Put => "PUT",
            Instruction::Get => "GET",
            Instruction::Mkcol => "MKCOL",
            Instruction::DeleteRemote => "DELETE_REMOTE",
            Instruction::DeleteLocal => "DELETE_LOCAL",
        }
    }

    fn parse(raw: &str) -> Option<Instruction> {
        match raw {
            "PUT" => Some(Instruction::Put),
            "GET" => Some(Instruction::Get),
            "MKCOL" => Some(Instruction::Mkcol),
            "DELETE_REMOTE" => Some(Instruction::DeleteRemote),
            "DELETE_LOCAL" => Some(Instruction::DeleteLocal),
            _ => None,
        }
    }
}

/// One row per known path. Paths are relative to the sync root,
/// `/`-separated, with a leading `/` and a trailing `/` iff directory.
#[derive(Debug, Clone)]
pub struct Entry {
    pub path: String,
    pub kind: Kind,
    pub depth: i64,
    pub remote_sha1: Option<String>,
    pub local_sha1: Option<String>,
    pub size_mtime: i64,
    pub revision: i64,
    pub instruction: Option<Instruction>,
}

impl Entry {
    /// A file row is on the server iff its remote SHA-1 is known; a
    /// directory row iff its revision has been observed.
    pub fn in_subversion(&self) -> bool {
        match self.kind {
            Kind::File => self.remote_sha1.is_some(),
            Kind::Dir => self.revision != 0,
        }
    }
}

/// The on-disk table reconciling the local and remote views. All access
/// takes a coarse per-operation lock; the engine is the only mutator of
/// a row while its instruction is being consumed.
pub struct Index {
    conn: Mutex<Connection>,
}

impl Index {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open index {}", db_path.display()))?;
        conn.execute_batch(INDEX_SCHEMA).context("init index schema")?;
        Ok(Index {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory index")?;
        conn.execute_batch(INDEX_SCHEMA).context("init index schema")?;
        Ok(Index {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, path: &str) -> Result<Option<Entry>> {
        let conn = self.conn.lock().expect("index lock");
        let row = conn
            .query_row(
                "SELECT path, kind, depth, remote_sha1, local_sha1, size_mtime, revision, instruction
                 FROM files WHERE path = ?1",
                params![path],
                entry_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert a fresh idle-or-instructed row, or, when the row already
    /// exists, just set the instruction (if one was given).
    pub fn upsert(
        &self,
        path: &str,
        kind: Kind,
        revision: i64,
        instruction: Option<Instruction>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("index lock");
        let existing: Option<String> = conn
            .query_row(
                "SELECT path FROM files WHERE path = ?1",
                params![path],
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_none() {
            conn.execute(
                "INSERT INTO files (path, kind, depth, remote_sha1, local_sha1, size_mtime, revision, instruction)
                 VALUES (?1, ?2, ?3, NULL, NULL, 0, ?4, ?5)",
                params![
                    path,
                    kind.as_str(),
                    depth_of(path),
                    revision,
                    instruction.map(Instruction::as_str)
                ],
            )?;
            return Ok(());
        }
        if let Some(instruction) = instruction {
            conn.execute(
                "UPDATE files SET instruction = ?2 WHERE path = ?1",
                params![path, instruction.as_str()],
            )?;
        }
        Ok(())
    }

    /// Set or clear the pending instruction. No-op for unknown paths.
    pub fn set_instruction(&self, path: &str, instruction: Option<Instruction>) -> Result<()> {
        let conn = self.conn.lock().expect("index lock");
        conn.execute(
            "UPDATE files SET instruction = ?2 WHERE path = ?1",
            params![path, instruction.map(Instruction::as_str)],
        )?;
        Ok(())
    }

    /// Record a completed transfer: both SHAs now match the given value.
    pub fn record_synced(&self, path: &str, revision: i64, sha1: &str, size_mtime: i64) -> Result<()> {
        let conn = self.conn.lock().expect("index lock");
        conn.execute(
            "UPDATE files SET remote_sha1 = ?2, local_sha1 = ?2, size_mtime = ?3, revision = ?4
             WHERE path = ?1",
            params![path, sha1, size_mtime, revision],
        )?;
        Ok(())
    }

    pub fn update_revision(&self, path: &str, revision: i64) -> Result<()> {
        let conn = self.conn.lock().expect("index lock");
        conn.execute(
            "UPDATE files SET revision = ?2 WHERE path = ?1",
            params![path, revision],
        )?;
        Ok(())
    }

    /// Mark a directory as present on the server: revision recorded,
    /// instruction cleared. Inserts the row when missing.
    pub fn record_dir_on_server(&self, path: &str, revision: i64) -> Result<()> {
        let conn = self.conn.lock().expect("index lock");
        let updated = conn.execute(
            "UPDATE files SET revision = ?2, instruction = NULL WHERE path = ?1",
            params![path, revision],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO files (path, kind, depth, remote_sha1, local_sha1, size_mtime, revision, instruction)
                 VALUES (?1, 'dir', ?2, NULL, NULL, 0, ?3, NULL)",
                params![path, depth_of(path), revision],
            )?;
        }
        Ok(())
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let conn = self.conn.lock().expect("index lock");
        conn.execute("DELETE FROM files WHERE path = ?1", params![path])?;
        Ok(())
    }

    pub fn in_subversion(&self, path: &str) -> Result<bool> {
        Ok(self.get(path)?.map(|e| e.in_subversion()).unwrap_or(false))
    }

    /// Rows carrying the given instruction, up to `limit`. `deep_first`
    /// orders children before parents (deletes); otherwise parents come
    /// first (gets, puts).
    pub fn with_instruction(
        &self,
        instruction: Instruction,
        limit: usize,
        deep_first: bool,
    ) -> Result<Vec<Entry>> {
        let conn = self.conn.lock().expect("index lock");
        let sql = if deep_first {
            "SELECT path, kind, depth, remote_sha1, local_sha1, size_mtime, revision, instruction
             FROM files WHERE instruction = ?1 ORDER BY depth DESC, path LIMIT ?2"
        } else {
            "SELECT path, kind, depth, remote_sha1, local_sha1, size_mtime, revision, instruction
             FROM files WHERE instruction = ?1 ORDER BY depth ASC, path LIMIT ?2"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![instruction.as_str(), limit as i64], entry_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Idle direct children of a directory (depth-pruned prefix query).
    pub fn idle_children_of(&self, dir: &str) -> Result<Vec<Entry>> {
        let child_depth = depth_of(dir) + 1;
        let conn = self.conn.lock().expect("index lock");
        let mut stmt = conn.prepare(
            "SELECT path, kind, depth, remote_sha1, local_sha1, size_mtime, revision, instruction
             FROM files WHERE depth = ?1 AND instruction IS NULL ORDER BY path",
        )?;
        let rows = stmt.query_map(params![child_depth], entry_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            let entry: Entry = row?;
            if entry.path.starts_with(dir) && entry.path != dir {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Idle rows that are on the server (the scanner's missed-delete pass).
    pub fn idle_rows_in_subversion(&self) -> Result<Vec<Entry>> {
        let conn = self.conn.lock().expect("index lock");
        let mut stmt = conn.prepare(
            "SELECT path, kind, depth, remote_sha1, local_sha1, size_mtime, revision, instruction
             FROM files WHERE instruction IS NULL AND remote_sha1 IS NOT NULL ORDER BY path",
        )?;
        let rows = stmt.query_map([], entry_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn all(&self) -> Result<Vec<Entry>> {
        let conn = self.conn.lock().expect("index lock");
        let mut stmt = conn.prepare(
            "SELECT path, kind, depth, remote_sha1, local_sha1, size_mtime, revision, instruction
             FROM files ORDER BY path",
        )?;
        let rows = stmt.query_map([], entry_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let kind: String = row.get(1)?;
    let instruction: Option<String> = row.get(7)?;
    Ok(Entry {
        path: row.get(0)?,
        kind: Kind::parse(&kind),
        depth: row.get(2)?,
        remote_sha1: row.get(3)?,
        local_sha1: row.get(4)?,
        size_mtime: row.get(5)?,
        revision: row.get(6)?,
        instruction: instruction.as_deref().and_then(Instruction::parse),
    })
}

/// Separator count of a canonical path, not counting a trailing one:
/// `/a/b.txt` and `/a/b/` are both depth 2, `/` is depth 0. Direct
/// children of a directory at depth k sit at depth k + 1, files and
/// subdirectories alike.
pub fn depth_of(path: &str) -> i64 {
    path.trim_end_matches('/').matches('/').count() as i64
}

/// Parent directory in canonical form: `/a/b.txt` -> `/a/`,
/// `/a/b/` -> `/a/`, `/a` -> `/`. The root has no parent.
pub fn parent_of(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(format!("{}/", &trimmed[..idx])),
        None => None,
    }
}

/// Canonical index path for an absolute filesystem path under `root`:
/// `/`-separated, leading `/`, trailing `/` iff directory. None when
/// the path is not under the sync root.
pub fn canonical_rel(root: &Path, abs: &Path, is_dir: bool) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let mut out = String::from("/");
    for part in rel.components() {
        let part = part.as_os_str().to_string_lossy();
        if part.is_empty() {
            continue;
        }
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(&part);
    }
    if is_dir && !out.ends_with('/') {
        out.push('/');
    }
    Some(out)
}

/// Absolute filesystem path for a canonical index path.
pub fn join_root(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in rel.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}
