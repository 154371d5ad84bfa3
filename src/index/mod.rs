//! The persistent SQLite index: schema owner, candidate location policy,
//! build/finalize lifecycle, and the read-only query surface the mount
//! layer sits on top of.

pub mod schema;
pub mod versions;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use rusqlite::{Connection, OpenFlags};

use crate::error::{RatarkitError, Result};
use crate::model::{FileEntry, MetadataEntry, XAttrRecord};

/// Lifecycle state of an in-progress or finished index. Methods that only
/// make sense once the index is queryable reject calls made while still
/// `Building`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Building,
    Finalized,
}

/// Where an index for a given archive might live, tried in order.
#[derive(Debug, Clone)]
pub enum IndexCandidate {
    /// A concrete on-disk path, e.g. `archive.tar.index.sqlite` next to the
    /// archive, or one rooted at an explicit `--index-folder`.
    Path(PathBuf),
    /// The archive itself is remote (`scheme://`-prefixed); indexing is
    /// passed straight through without ever touching local disk.
    Remote(String),
    /// Last-resort fallback: an ephemeral in-memory database, never
    /// persisted, rebuilt every run.
    Memory,
}

/// Builds the ordered candidate list of §4.5: an explicit `--index-file`
/// wins outright; otherwise try `<archive>.index.sqlite` beside the
/// archive, then the same filename under each configured index folder (in
/// order, first writable wins), then fall back to `:memory:`. A
/// `scheme://`-prefixed archive path short-circuits straight to `Remote`.
pub fn locate_candidates(archive_path: &Path, explicit: Option<PathBuf>, index_folders: &[PathBuf]) -> Vec<IndexCandidate> {
    if let Some(s) = archive_path.to_str() {
        if let Some(pos) = s.find("://") {
            if !s[..pos].contains('/') {
                return vec![IndexCandidate::Remote(s.to_string())];
            }
        }
    }

    if let Some(path) = explicit {
        return vec![IndexCandidate::Path(path)];
    }

    let mut candidates = Vec::new();
    let file_name = archive_path
        .file_name()
        .map(|n| format!("{}.index.sqlite", n.to_string_lossy()))
        .unwrap_or_else(|| "archive.index.sqlite".to_string());

    if let Some(parent) = archive_path.parent() {
        candidates.push(IndexCandidate::Path(parent.join(&file_name)));
    } else {
        candidates.push(IndexCandidate::Path(PathBuf::from(&file_name)));
    }

    for folder in index_folders {
        candidates.push(IndexCandidate::Path(folder.join(&file_name)));
    }

    candidates.push(IndexCandidate::Memory);
    candidates
}

/// The default index-folder search path: `$RATARKIT_INDEX_TMPDIR` first,
/// falling back to `$XDG_CACHE_HOME/ratarkit` (or the platform cache
/// directory `dirs::cache_dir()` resolves to) otherwise.
pub fn default_index_folders() -> Vec<PathBuf> {
    let mut folders = Vec::new();
    if let Ok(tmpdir) = std::env::var("RATARKIT_INDEX_TMPDIR") {
        folders.push(PathBuf::from(tmpdir));
    }
    if let Some(cache) = dirs::cache_dir() {
        folders.push(cache.join("ratarkit"));
    }
    folders
}

/// Owns one SQLite connection across the whole build→finalize→read
/// lifecycle. Wrapped in `Arc<Mutex<..>>` at the mount-layer boundary since
/// `rusqlite::Connection` is `!Sync` but FUSE-style concurrent readers need
/// to share one handle across threads.
pub struct SQLiteIndex {
    conn: Connection,
    state: IndexState,
    backend_name: String,
    parent_lru: LruCache<(String, String), ()>,
}

/// Backing-store mismatch between the index file on disk and the backend
/// attempting to open it; the caller must not delete the file and must
/// bubble this to a factory that can try a different backend.
#[derive(Debug, thiserror::Error)]
pub enum IndexOpenError {
    #[error("invalid index, safe to rebuild: {0}")]
    Invalid(String),
    #[error("mismatching index backend: found {found}, expected {expected}")]
    Mismatching { found: String, expected: String },
}

impl SQLiteIndex {
    /// Creates a fresh index at `candidate`, applying PRAGMAs and the core
    /// schema. Always starts in `Building` state.
    pub fn create(candidate: &IndexCandidate, backend_name: &str) -> Result<Self> {
        let conn = match candidate {
            IndexCandidate::Memory => Connection::open_in_memory()?,
            IndexCandidate::Path(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            IndexCandidate::Remote(uri) => {
                return Err(RatarkitError::InvalidIndex(format!(
                    "cannot build a local index for remote archive {uri}"
                )))
            }
        };
        conn.execute_batch(schema::PRAGMAS)?;
        conn.execute_batch(schema::CREATE_CORE_SCHEMA)?;
        conn.execute_batch(schema::CREATE_TEMP_SCHEMA)?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('backend', ?1)",
            [backend_name],
        )?;
        log::debug!("created index in state Building, backend={backend_name}");
        Ok(Self {
            conn,
            state: IndexState::Building,
            backend_name: backend_name.to_string(),
            parent_lru: LruCache::new(std::num::NonZeroUsize::new(crate::PARENT_LRU_SIZE).unwrap()),
        })
    }

    /// Opens an existing index file, running the validation checks of
    /// §4.5 in order: openable as SQLite, core tables present, no leftover
    /// temp tables (partially built), schema version compatible, backend
    /// name matches. `Invalid` is returned (and the caller should delete
    /// and rebuild) for the first three; `Mismatching` for the backend
    /// check, since the file is not corrupt, just built by someone else.
    pub fn open_existing(path: &Path, backend_name: &str) -> std::result::Result<Self, IndexOpenError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .map_err(|e| IndexOpenError::Invalid(format!("cannot open as sqlite: {e}")))?;

        let has_files_table: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='files'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| IndexOpenError::Invalid(format!("cannot query schema: {e}")))?
            > 0;
        if !has_files_table {
            return Err(IndexOpenError::Invalid("missing files table".into()));
        }

        let leftover_temp: i64 = conn
            .query_row(schema::TEMP_TABLES_PRESENT_QUERY, [], |row| row.get(0))
            .unwrap_or(0);
        if leftover_temp > 0 {
            return Err(IndexOpenError::Invalid("index was never finalized".into()));
        }

        let found_version: Option<String> = conn
            .query_row("SELECT version FROM versions WHERE name = 'index'", [], |row| row.get(0))
            .ok();
        match found_version {
            Some(v) if v == schema::SCHEMA_VERSION => {}
            Some(v) => return Err(IndexOpenError::Invalid(format!("unsupported schema version {v}"))),
            None => return Err(IndexOpenError::Invalid("no schema version recorded".into())),
        }

        let found_backend: Option<String> = conn
            .query_row("SELECT value FROM metadata WHERE key = 'backend'", [], |row| row.get(0))
            .ok();
        match found_backend {
            Some(b) if b == backend_name => {}
            Some(b) => {
                return Err(IndexOpenError::Mismatching { found: b, expected: backend_name.to_string() })
            }
            None => return Err(IndexOpenError::Invalid("no backend recorded".into())),
        }

        log::debug!("opened existing index at {path:?}, backend={backend_name}");
        Ok(Self {
            conn,
            state: IndexState::Finalized,
            backend_name: backend_name.to_string(),
            parent_lru: LruCache::new(std::num::NonZeroUsize::new(crate::PARENT_LRU_SIZE).unwrap()),
        })
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    fn require_building(&self) -> Result<()> {
        if self.state != IndexState::Building {
            return Err(RatarkitError::IndexNotOpen);
        }
        Ok(())
    }

    fn require_finalized(&self) -> Result<()> {
        if self.state != IndexState::Finalized {
            return Err(RatarkitError::IndexNotOpen);
        }
        Ok(())
    }

    /// Batches `rows` into `filestmp`, plus one `parentfolders` row per
    /// distinct parent directory among them. A small LRU of recently
    /// inserted parent paths (§6.4: capacity 16, reset to the most recent
    /// 8 on eviction) skips repeat inserts for files sharing a directory,
    /// since TAR entries are overwhelmingly emitted in directory order.
    pub fn set_file_infos(&mut self, rows: &[FileEntry]) -> Result<()> {
        self.require_building()?;
        let tx = self.conn.transaction()?;
        {
            let mut insert_file = tx.prepare(
                "INSERT INTO filestmp
                 (path, name, offsetheader, offset, size, mtime, mode, type, linkname, uid, gid, istar, issparse, isgenerated, recursiondepth)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            )?;
            let mut insert_parent = tx.prepare("INSERT INTO parentfolders (path, name) VALUES (?1, ?2)")?;

            for entry in rows {
                insert_file.execute(rusqlite::params![
                    entry.path,
                    entry.name,
                    entry.offset_header.map(|v| v as i64),
                    entry.offset_data as i64,
                    entry.size as i64,
                    entry.mtime,
                    entry.mode,
                    entry.type_raw,
                    entry.linkname,
                    entry.uid,
                    entry.gid,
                    entry.is_tar as i64,
                    entry.is_sparse as i64,
                    entry.is_generated as i64,
                    entry.recursion_depth,
                ])?;

                for (parent, name) in ancestor_parent_pairs(&entry.path) {
                    let key = (parent.clone(), name.clone());
                    if !self.parent_lru.contains(&key) {
                        insert_parent.execute(rusqlite::params![parent, name])?;
                        self.parent_lru.put(key, ());
                        if self.parent_lru.len() > crate::PARENT_LRU_SIZE {
                            while self.parent_lru.len() > crate::PARENT_LRU_RESET_TO {
                                self.parent_lru.pop_lru();
                            }
                        }
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_xattrs(&mut self, xattrs: &[XAttrRecord]) -> Result<()> {
        self.require_building()?;
        let tx = self.conn.transaction()?;
        for attr in xattrs {
            tx.execute(
                "INSERT INTO xattrs (offsetheader, key, value) VALUES (?1, ?2, ?3)",
                rusqlite::params![attr.offset_header as i64, attr.key, attr.value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_metadata(&mut self, entries: &[MetadataEntry]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for e in entries {
            tx.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
                rusqlite::params![e.key, e.value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Four-step finalize: (1) copy `filestmp` rows into `files`, (2)
    /// insert any `parentfolders` entries that have no corresponding row
    /// already in `files` as generated directories, (3) write version
    /// rows, (4) drop both temp tables. The synthesized-parent membership
    /// test uses a plain `NOT IN` subquery; the reference implementation
    /// falls back from a tuple-IN to string concatenation on old SQLite
    /// versions, but the bundled SQLite linked into this crate is fixed at
    /// build time, so that runtime fallback is unneeded here (noted in
    /// DESIGN.md as a simplification).
    pub fn finalize(&mut self) -> Result<()> {
        self.require_building()?;
        log::debug!("finalizing index");
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "INSERT INTO files
             (path, name, offsetheader, offset, size, mtime, mode, type, linkname, uid, gid, istar, issparse, isgenerated, recursiondepth)
             SELECT path, name, offsetheader, offset, size, mtime, mode, type, linkname, uid, gid, istar, issparse, isgenerated, recursiondepth
             FROM filestmp;",
        )?;
        tx.execute(
            "INSERT INTO files
             (path, name, offsetheader, offset, size, mtime, mode, type, linkname, uid, gid, istar, issparse, isgenerated, recursiondepth)
             SELECT DISTINCT pf.path, pf.name, NULL, 0, 0, 0.0, ?1, 53, '', 0, 0, 0, 0, 1, 0
             FROM parentfolders pf
             WHERE NOT EXISTS (
                 SELECT 1 FROM files f WHERE f.path = pf.path AND f.name = pf.name
             );",
            [crate::model::GENERATED_DIR_MODE],
        )?;
        versions::write_version_rows(&tx)?;
        tx.execute_batch("DROP TABLE IF EXISTS filestmp; DROP TABLE IF EXISTS parentfolders;")?;
        tx.commit()?;
        self.state = IndexState::Finalized;
        log::debug!("index finalized");
        Ok(())
    }

    /// Reopens the connection read-only via a `file:` URI, matching the
    /// intent of the reference's `check_same_thread=False` (which has no
    /// Rust equivalent on `rusqlite::Connection: !Sync`); callers that need
    /// cross-thread concurrent reads should additionally wrap the result in
    /// `Arc<Mutex<_>>`.
    pub fn reload_read_only(self, path: &Path) -> Result<Self> {
        self.require_finalized()?;
        drop(self.conn);
        let uri = format!("file:{}?mode=ro", path.display());
        let conn = Connection::open_with_flags(
            &uri,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )?;
        Ok(Self { conn, state: IndexState::Finalized, backend_name: self.backend_name, parent_lru: self.parent_lru })
    }

    /// Migrates an in-memory index to an on-disk file once `threshold_rows`
    /// is exceeded, via SQLite's native online backup API — a direct
    /// binding, not a reimplementation of the copy.
    pub fn migrate_to_disk(&mut self, dest: &Path, threshold_rows: u64) -> Result<bool> {
        let row_count: i64 = self.conn.query_row("SELECT COUNT(*) FROM filestmp", [], |row| row.get(0))
            .or_else(|_| self.conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0)))?;
        if (row_count as u64) < threshold_rows {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut dest_conn = Connection::open(dest)?;
        {
            let backup = rusqlite::backup::Backup::new(&self.conn, &mut dest_conn)?;
            backup.run_to_completion(100, std::time::Duration::from_millis(0), None)?;
        }
        self.conn = dest_conn;
        log::debug!("migrated in-memory index to {dest:?} after {row_count} rows");
        Ok(true)
    }

    /// Looks up `(path, name)` at a given `fileVersion` (matching the
    /// reference's convention): `0` or negative selects counting back from
    /// the latest (`-1` is the next-to-last), positive counts forward from
    /// the first/oldest (`1` is the first). Implemented as an
    /// `ORDER BY offsetheader {ASC|DESC} LIMIT 1 OFFSET n` query rather than
    /// fetching every row and indexing in memory, same as the reference.
    pub fn lookup(&self, path: &str, name: &str, version: i64) -> Result<Option<FileEntry>> {
        self.require_finalized()?;
        let (order, offset) = if version <= 0 { ("DESC", -version) } else { ("ASC", version - 1) };
        let sql = format!(
            "SELECT path, name, offsetheader, offset, size, mtime, mode, type, linkname, uid, gid, istar, issparse, isgenerated, recursiondepth
             FROM files WHERE path = ?1 AND name = ?2 ORDER BY offsetheader {order} LIMIT 1 OFFSET ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params![path, name, offset])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_entry(row)?))
        } else {
            Ok(None)
        }
    }

    /// Number of distinct `(path, name)` row-versions stored for one file,
    /// i.e. how many times a member at this path was overwritten in the
    /// archive. Matches the reference's `versions()`, which counts rows
    /// rather than listing a directory.
    pub fn version_count(&self, path: &str, name: &str) -> Result<usize> {
        self.require_finalized()?;
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE path = ?1 AND name = ?2",
            rusqlite::params![path, name],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    pub fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        self.require_finalized()?;
        let mut stmt = self.conn.prepare(
            "SELECT path, name, offsetheader, offset, size, mtime, mode, type, linkname, uid, gid, istar, issparse, isgenerated, recursiondepth
             FROM files WHERE path = ?1 ORDER BY name",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query([path])?;
        while let Some(row) = rows.next()? {
            out.push(row_to_entry(row)?);
        }
        Ok(out)
    }

    pub fn row_count(&self) -> Result<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?)
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn raw_connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }
}

fn row_to_entry(row: &rusqlite::Row) -> Result<FileEntry> {
    Ok(FileEntry {
        path: row.get(0)?,
        name: row.get(1)?,
        offset_header: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
        offset_data: row.get::<_, i64>(3)? as u64,
        size: row.get::<_, i64>(4)? as u64,
        mtime: row.get(5)?,
        mode: row.get(6)?,
        type_raw: row.get::<_, i64>(7)? as u8,
        linkname: row.get(8)?,
        uid: row.get(9)?,
        gid: row.get(10)?,
        is_tar: row.get::<_, i64>(11)? != 0,
        is_sparse: row.get::<_, i64>(12)? != 0,
        is_generated: row.get::<_, i64>(13)? != 0,
        recursion_depth: row.get::<_, i64>(14)? as u32,
    })
}

/// Splits `path` (a directory that a file lives in, e.g. `/deep/nested`)
/// into every ancestor `(parent, component)` pair up to the root:
/// `/deep/nested` -> `[("/", "deep"), ("/deep", "nested")]`. Mirrors the
/// reference's `_try_add_parent_folders`, which walks all of
/// `path.split("/")` rather than stopping at the immediate parent, so a
/// single file nested several directories deep still gets a generated row
/// for every ancestor, not just its direct parent. Returns an empty vec for
/// the root itself.
fn ancestor_parent_pairs(path: &str) -> Vec<(String, String)> {
    let parts: Vec<&str> = path.split('/').collect();
    let mut pairs = Vec::new();
    for i in 1..parts.len() {
        let name = parts[i];
        if name.is_empty() {
            continue;
        }
        let joined = parts[..i].join("/");
        let parent = if joined.is_empty() { "/".to_string() } else { joined };
        pairs.push((parent, name.to_string()));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(path: &str, name: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            name: name.to_string(),
            offset_header: Some(0),
            offset_data: 512,
            size: 4,
            mtime: 0.0,
            mode: crate::model::S_IFREG | 0o644,
            type_raw: b'0',
            linkname: String::new(),
            uid: 0,
            gid: 0,
            is_tar: false,
            is_sparse: false,
            is_generated: false,
            recursion_depth: 0,
        }
    }

    #[test]
    fn build_finalize_and_lookup_round_trips() {
        let mut index = SQLiteIndex::create(&IndexCandidate::Memory, "tar").unwrap();
        index.set_file_infos(&[sample_entry("/dir", "file.txt")]).unwrap();
        index.finalize().unwrap();

        let found = index.lookup("/dir", "file.txt", 0).unwrap().unwrap();
        assert_eq!(found.size, 4);

        let generated_parent = index.lookup("/", "dir", 0).unwrap();
        assert!(generated_parent.is_some());
        assert!(generated_parent.unwrap().is_generated);
    }

    #[test]
    fn cannot_lookup_before_finalize() {
        let index = SQLiteIndex::create(&IndexCandidate::Memory, "tar").unwrap();
        assert!(matches!(index.lookup("/", "x", 0), Err(RatarkitError::IndexNotOpen)));
    }

    #[test]
    fn idempotent_finalize_rejected_twice() {
        let mut index = SQLiteIndex::create(&IndexCandidate::Memory, "tar").unwrap();
        index.set_file_infos(&[sample_entry("/", "a.txt")]).unwrap();
        index.finalize().unwrap();
        assert!(matches!(index.finalize(), Err(RatarkitError::IndexNotOpen)));
    }

    #[test]
    fn ancestor_parent_pairs_walks_every_level() {
        assert_eq!(ancestor_parent_pairs("/a"), vec![("/".to_string(), "a".to_string())]);
        assert_eq!(
            ancestor_parent_pairs("/a/b"),
            vec![("/".to_string(), "a".to_string()), ("/a".to_string(), "b".to_string())]
        );
        assert_eq!(
            ancestor_parent_pairs("/deep/nested"),
            vec![("/".to_string(), "deep".to_string()), ("/deep".to_string(), "nested".to_string())]
        );
        assert_eq!(ancestor_parent_pairs("/"), Vec::<(String, String)>::new());
    }

    #[test]
    fn lookup_version_selects_oldest_and_latest() {
        let mut index = SQLiteIndex::create(&IndexCandidate::Memory, "tar").unwrap();
        let mut first = sample_entry("/", "overwritten.txt");
        first.offset_header = Some(0);
        first.size = 11;
        let mut second = sample_entry("/", "overwritten.txt");
        second.offset_header = Some(1024);
        second.size = 20;
        index.set_file_infos(&[first, second]).unwrap();
        index.finalize().unwrap();

        assert_eq!(index.lookup("/", "overwritten.txt", 0).unwrap().unwrap().size, 20);
        assert_eq!(index.lookup("/", "overwritten.txt", -1).unwrap().unwrap().size, 11);
        assert_eq!(index.lookup("/", "overwritten.txt", 1).unwrap().unwrap().size, 11);
        assert_eq!(index.lookup("/", "overwritten.txt", 2).unwrap().unwrap().size, 20);
        assert_eq!(index.version_count("/", "overwritten.txt").unwrap(), 2);
    }
}
