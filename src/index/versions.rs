//! Writes diagnostic rows into the `versions` table.
//!
//! `CARGO_PKG_VERSION` is only available at compile time for *this* crate,
//! not for its dependencies, without a build script — none is wired up in
//! this exercise, so the linked-codec versions below are hand-pinned to
//! match `Cargo.toml` and flagged in DESIGN.md as a build-script TODO.

use rusqlite::Connection;

use super::schema::{SCHEMA_VERSION, SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR, SCHEMA_VERSION_PATCH};
use crate::error::Result;
use crate::model::VersionRecord;

/// Versions of the decompression crates linked into this build. Keep in
/// sync with `Cargo.toml` by hand until a build script derives it.
pub const LINKED_CODEC_VERSIONS: &[(&str, &str)] =
    &[("flate2", "1.0"), ("bzip2", "0.4"), ("xz2", "0.1"), ("zstd", "0.13")];

pub fn write_version_rows(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO versions (name, version, major, minor, patch) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params!["index", SCHEMA_VERSION, SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR, SCHEMA_VERSION_PATCH],
    )?;
    for (name, version) in LINKED_CODEC_VERSIONS {
        let (major, minor, patch) = parse_semver_prefix(version);
        conn.execute(
            "INSERT OR REPLACE INTO versions (name, version, major, minor, patch) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![name, version, major, minor, patch],
        )?;
    }
    Ok(())
}

pub fn read_version_rows(conn: &Connection) -> Result<Vec<VersionRecord>> {
    let mut stmt = conn.prepare("SELECT name, version, major, minor, patch FROM versions")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(VersionRecord {
                name: row.get(0)?,
                version: row.get(1)?,
                major: row.get(2)?,
                minor: row.get(3)?,
                patch: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn parse_semver_prefix(version: &str) -> (u32, u32, u32) {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    (parts.next().unwrap_or(0), parts.next().unwrap_or(0), parts.next().unwrap_or(0))
}
