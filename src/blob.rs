//! Seekable streams backed by SQLite BLOB columns.
//!
//! `rusqlite::blob::Blob` already implements `Read + Write + Seek` for a
//! single row, so [`read_blob_cell`] is a thin wrapper rather than a
//! raw-SQL reimplementation. [`open_joined_blobs`] joins every BLOB row of
//! a table (in rowid order) into one logical stream via [`StenciledFile`],
//! since a `Blob` handle only ever addresses one row and borrows its
//! connection for as long as it's open — too short-lived to back a
//! multi-row stream, so the joined reader re-queries per read instead.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::{RatarkitError, Result};
use crate::stencil::{shared, SharedSource, StenciledFile};

/// Soft cap on how large a single in-memory buffer is allowed to grow
/// before [`WriteSqliteBlobs`] flushes it out as a row (§6.4).
pub const MAX_BLOB_SIZE: u64 = 256 * 1024 * 1024;

/// Opens a single BLOB cell read-only, via `rusqlite`'s native
/// `Connection::blob_open`, which already implements `Read + Seek` without
/// needing a raw-SQL reimplementation. Short-lived: callers that need the
/// handle to outlive one call site should go through [`open_joined_blobs`]
/// instead, since `rusqlite::blob::Blob` borrows its connection.
pub fn read_blob_cell(conn: &Connection, table: &str, column: &str, rowid: i64) -> Result<Vec<u8>> {
    let mut blob = conn.blob_open(rusqlite::DatabaseName::Main, table, column, rowid, true)?;
    let mut buf = Vec::new();
    blob.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Joins every BLOB row of `table.column`, ordered by `rowid`, into one
/// logical seekable stream.
pub fn open_joined_blobs(
    conn: &Arc<Mutex<Connection>>,
    table: &str,
    column: &str,
) -> Result<StenciledFile> {
    let guard = conn.lock().map_err(|_| RatarkitError::IndexNotOpen)?;
    let mut stmt = guard.prepare(&format!(
        "SELECT rowid, length({column}) FROM {table} ORDER BY rowid"
    ))?;
    let rows: Vec<(i64, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);
    drop(guard);

    let mut stencils = Vec::with_capacity(rows.len());
    for (rowid, len) in rows {
        if len <= 0 {
            continue;
        }
        let conn = conn.clone();
        let table = table.to_string();
        let column = column.to_string();
        let source: SharedSource = shared(RowBlobReader::new(conn, table, column, rowid));
        stencils.push((source, 0u64, len as u64));
    }
    Ok(StenciledFile::new(stencils))
}

/// Reads one blob row via plain SQL `substr`, re-opening the statement on
/// every read — used for the joined-across-rows case where holding one
/// `rusqlite::blob::Blob` per row for the stream's lifetime would exhaust
/// statement handles.
struct RowBlobReader {
    conn: Arc<Mutex<Connection>>,
    table: String,
    column: String,
    rowid: i64,
    position: u64,
}

impl RowBlobReader {
    fn new(conn: Arc<Mutex<Connection>>, table: String, column: String, rowid: i64) -> Self {
        Self { conn, table, column, rowid, position: 0 }
    }
}

impl Read for RowBlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let guard = self
            .conn
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "sqlite connection lock poisoned"))?;
        let data: Vec<u8> = guard
            .query_row(
                &format!(
                    "SELECT substr({col}, ?1, ?2) FROM {tbl} WHERE rowid = ?3",
                    col = self.column,
                    tbl = self.table
                ),
                rusqlite::params![self.position as i64 + 1, buf.len() as i64, self.rowid],
                |row| row.get(0),
            )
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for RowBlobReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos: i128 = match pos {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => {
                // Row length is re-queried lazily; callers only use
                // SeekFrom::End through the enclosing StenciledFile, which
                // already knows the total size, so this path is rarely hit.
                let guard = self.conn.lock().map_err(|_| {
                    io::Error::new(io::ErrorKind::Other, "sqlite connection lock poisoned")
                })?;
                let len: i64 = guard
                    .query_row(
                        &format!("SELECT length({}) FROM {} WHERE rowid = ?1", self.column, self.table),
                        [self.rowid],
                        |row| row.get(0),
                    )
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                len as i128 + delta as i128
            }
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative seek"));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

/// Forward-only sink writing sequential BLOB rows into `table(data)`.
/// Buffers in memory up to [`MAX_BLOB_SIZE`], inserting one row per full
/// buffer on flush. `seek` only ever reports the current logical end
/// position, matching the write-once semantics of the reference sink.
pub struct WriteSqliteBlobs<'c> {
    conn: &'c Connection,
    table: String,
    buffer: Vec<u8>,
    total_written: u64,
}

impl<'c> WriteSqliteBlobs<'c> {
    pub fn new(conn: &'c Connection, table: &str) -> Self {
        Self { conn, table: table.to_string(), buffer: Vec::new(), total_written: 0 }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.conn
            .execute(
                &format!("INSERT INTO {} (data) VALUES (?1)", self.table),
                rusqlite::params![self.buffer],
            )
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.buffer.clear();
        Ok(())
    }
}

impl<'c> Write for WriteSqliteBlobs<'c> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let space = (MAX_BLOB_SIZE - self.buffer.len() as u64) as usize;
            let take = space.min(remaining.len());
            self.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            written += take;
            self.total_written += take as u64;
            if self.buffer.len() as u64 >= MAX_BLOB_SIZE {
                self.flush_buffer()?;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }
}

impl<'c> Seek for WriteSqliteBlobs<'c> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.total_written),
            SeekFrom::End(0) => Ok(self.total_written),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "WriteSqliteBlobs only supports querying the current end position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_join_round_trips() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE blobs (data BLOB NOT NULL)").unwrap();

        {
            let mut w = WriteSqliteBlobs::new(&conn, "blobs");
            w.write_all(b"hello ").unwrap();
            w.write_all(b"world").unwrap();
            w.flush().unwrap();
        }

        let shared_conn = Arc::new(Mutex::new(conn));
        let mut joined = open_joined_blobs(&shared_conn, "blobs", "data").unwrap();
        let mut out = Vec::new();
        joined.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");
    }
}
