//! Read-only filesystem-shaped view over a finished [`SQLiteIndex`].
//!
//! `FileEntry::userdata` (defined in [`crate::model`]) is the opaque
//! per-layer token stack composed mount-source layers (union, version
//! selection, dereferencing — all out of scope here) would push and pop;
//! this crate implements exactly one concrete layer, `SQLiteIndexMountSource`,
//! which is the base of that stack.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use crate::error::{RatarkitError, Result};
use crate::index::SQLiteIndex;
use crate::model::FileEntry;
use crate::stencil::ReadSeek;

pub struct ListResult {
    pub entries: Vec<FileEntry>,
}

pub struct ModeListResult {
    pub names_and_modes: Vec<(String, u32)>,
}

#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub total_bytes: u64,
    pub files: u64,
}

/// Read-only mount-source contract. Implementors back a FUSE inode table
/// or, as here, a test harness driving the index directly.
pub trait MountSource: Send + Sync {
    fn list(&self, path: &str) -> Option<ListResult>;
    fn list_mode(&self, path: &str) -> Option<ModeListResult>;
    /// Looks up a full path (e.g. `/foo/bar`) at the given file version: `0`
    /// (or any non-positive number) counts back from the latest, `1` counts
    /// forward from the first/oldest (see [`crate::index::SQLiteIndex::lookup`]).
    fn lookup(&self, path: &str, version: i64) -> Option<FileEntry>;
    fn open(&self, entry: &FileEntry) -> std::io::Result<Box<dyn ReadSeek>>;

    fn read(&self, entry: &FileEntry, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let mut f = self.open(entry)?;
        f.seek(SeekFrom::Start(offset))?;
        f.read(buf)
    }

    fn versions(&self, path: &str) -> usize;
    fn is_immutable(&self) -> bool {
        true
    }
    fn list_xattr(&self, entry: &FileEntry) -> Vec<String>;
    fn get_xattr(&self, entry: &FileEntry, key: &str) -> Option<Vec<u8>>;
    fn statfs(&self) -> StatFs;
}

/// The concrete, fully built mount source: a finalized [`SQLiteIndex`]
/// plus the open archive stream it indexes, sufficient to resolve any
/// `FileEntry` back to its bytes via a stenciled cutout.
pub struct SQLiteIndexMountSource {
    index: Arc<Mutex<SQLiteIndex>>,
    archive: Arc<Mutex<dyn ReadSeek>>,
}

impl SQLiteIndexMountSource {
    pub fn new(index: Arc<Mutex<SQLiteIndex>>, archive: Arc<Mutex<dyn ReadSeek>>) -> Self {
        Self { index, archive }
    }

    /// A sparse TAR member's on-disk bytes are just its non-hole data,
    /// contiguous; the logical size (and any hole layout) only exists in
    /// the GNU/pax sparse map embedded in the member's header block. Cuts
    /// out the raw `[offset_header, offset_data+size)` block and hands it
    /// to the `tar` crate, whose `Entry` reader already expands sparse
    /// segments (real data interleaved with zero-filled holes) into the
    /// logical stream — the same trick the reference implementation's
    /// `open()` uses (cut the block, reopen it with `tarfile`, extract the
    /// single member inside).
    fn open_sparse(&self, entry: &FileEntry) -> std::io::Result<Box<dyn ReadSeek>> {
        let offset_header = entry
            .offset_header
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "sparse entry has no offset_header"))?;
        let block_size = entry.offset_data.saturating_sub(offset_header) + entry.size;
        let cutout = crate::stencil::StenciledFile::new(vec![(self.archive.clone(), offset_header, block_size)]);

        let mut tar = tar::Archive::new(cutout);
        let mut entries = tar.entries()?;
        let mut member = match entries.next() {
            Some(e) => e?,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "sparse member's raw TAR block contained no entry",
                ))
            }
        };
        let mut buf = Vec::with_capacity(entry.size as usize);
        member.read_to_end(&mut buf)?;
        Ok(Box::new(std::io::Cursor::new(buf)))
    }
}

/// Splits a full path like `/foo/bar` into `("/foo", "bar")`, the
/// `(path, name)` pair the `files` table indexes by.
fn split_full_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(idx) => (trimmed[..idx].to_string(), trimmed[idx + 1..].to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

impl MountSource for SQLiteIndexMountSource {
    fn list(&self, path: &str) -> Option<ListResult> {
        let index = self.index.lock().ok()?;
        let entries = index.list(path).ok()?;
        Some(ListResult { entries })
    }

    fn list_mode(&self, path: &str) -> Option<ModeListResult> {
        let list = self.list(path)?;
        Some(ModeListResult {
            names_and_modes: list.entries.into_iter().map(|e| (e.name, e.mode)).collect(),
        })
    }

    fn lookup(&self, path: &str, version: i64) -> Option<FileEntry> {
        let (dir, name) = split_full_path(path);
        let index = self.index.lock().ok()?;
        index.lookup(&dir, &name, version).ok().flatten()
    }

    fn open(&self, entry: &FileEntry) -> std::io::Result<Box<dyn ReadSeek>> {
        if entry.is_sparse {
            return self.open_sparse(entry);
        }
        let source = self.archive.clone();
        let offset = entry.offset_data;
        let size = entry.size;
        let cutout = crate::stencil::StenciledFile::new(vec![(source, offset, size)]);
        Ok(Box::new(cutout))
    }

    fn versions(&self, path: &str) -> usize {
        let (dir, name) = split_full_path(path);
        let Ok(index) = self.index.lock() else { return 0 };
        index.version_count(&dir, &name).unwrap_or(0)
    }

    fn list_xattr(&self, entry: &FileEntry) -> Vec<String> {
        let Some(offset_header) = entry.offset_header else { return Vec::new() };
        let Ok(index) = self.index.lock() else { return Vec::new() };
        read_all_xattrs(&index, offset_header).map(|pairs| pairs.into_iter().map(|(k, _)| k).collect()).unwrap_or_default()
    }

    fn get_xattr(&self, entry: &FileEntry, key: &str) -> Option<Vec<u8>> {
        let offset_header = entry.offset_header?;
        let index = self.index.lock().ok()?;
        let pairs = read_all_xattrs(&index, offset_header).ok()?;
        pairs.into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn statfs(&self) -> StatFs {
        let Ok(index) = self.index.lock() else {
            return StatFs { total_bytes: 0, files: 0 };
        };
        let files = index.row_count().unwrap_or(0).max(0) as u64;
        StatFs { total_bytes: 0, files }
    }
}

/// Returns all xattrs stored for the entry at `offset_header`, joining the
/// `xattrs` view the schema exposes, bypassing the `MountSource` trait's
/// simplified `list_xattr`/`get_xattr` pair (useful for `ratarkit stat`).
pub fn read_all_xattrs(index: &SQLiteIndex, offset_header: u64) -> Result<Vec<(String, Vec<u8>)>> {
    let conn = index.raw_connection();
    let mut stmt = conn.prepare("SELECT key, value FROM xattrs WHERE offsetheader = ?1")?;
    let rows = stmt
        .query_map([offset_header as i64], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(RatarkitError::from)?;
    Ok(rows)
}
