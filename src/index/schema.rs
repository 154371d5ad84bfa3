//! Schema DDL, executed once per fresh index via `execute_batch`.

/// Schema version stamped into the `versions` table and checked on open.
pub const SCHEMA_VERSION: &str = "0.7.0";
pub const SCHEMA_VERSION_MAJOR: u32 = 0;
pub const SCHEMA_VERSION_MINOR: u32 = 7;
pub const SCHEMA_VERSION_PATCH: u32 = 0;

/// Mandatory connection PRAGMAs, applied to every fresh connection
/// regardless of whether it is building or reading. `foreign_keys=OFF` is
/// SQLite's default; it is stated explicitly so the invariant is visible
/// at the call site rather than relying on an undocumented default.
pub const PRAGMAS: &str = "
PRAGMA locking_mode = EXCLUSIVE;
PRAGMA temp_store = MEMORY;
PRAGMA journal_mode = OFF;
PRAGMA synchronous = OFF;
PRAGMA foreign_keys = OFF;
";

/// Permanent tables and the `files` primary index, created once.
pub const CREATE_CORE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
    path            TEXT    NOT NULL,
    name            TEXT    NOT NULL,
    offsetheader    INTEGER,
    offset          INTEGER NOT NULL,
    size            INTEGER NOT NULL,
    mtime           REAL    NOT NULL,
    mode            INTEGER NOT NULL,
    type            INTEGER NOT NULL,
    linkname        TEXT    NOT NULL DEFAULT '',
    uid             INTEGER NOT NULL DEFAULT 0,
    gid             INTEGER NOT NULL DEFAULT 0,
    istar           INTEGER NOT NULL DEFAULT 0,
    issparse        INTEGER NOT NULL DEFAULT 0,
    isgenerated     INTEGER NOT NULL DEFAULT 0,
    recursiondepth  INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (path, name, offsetheader)
);

CREATE INDEX IF NOT EXISTS files_path_index ON files (path);

CREATE TABLE IF NOT EXISTS xattrkeys (
    id  INTEGER PRIMARY KEY,
    key TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS xattrsdata (
    offsetheader INTEGER NOT NULL,
    keyid        INTEGER NOT NULL REFERENCES xattrkeys(id),
    value        BLOB    NOT NULL,
    PRIMARY KEY (offsetheader, keyid)
);

CREATE VIEW IF NOT EXISTS xattrs AS
SELECT xattrsdata.offsetheader AS offsetheader, xattrkeys.key AS key, xattrsdata.value AS value
FROM xattrsdata JOIN xattrkeys ON xattrsdata.keyid = xattrkeys.id;

CREATE TRIGGER IF NOT EXISTS xattrs_insert INSTEAD OF INSERT ON xattrs
BEGIN
    INSERT OR IGNORE INTO xattrkeys (key) VALUES (NEW.key);
    INSERT INTO xattrsdata (offsetheader, keyid, value)
    VALUES (NEW.offsetheader, (SELECT id FROM xattrkeys WHERE key = NEW.key), NEW.value);
END;

CREATE TABLE IF NOT EXISTS metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS versions (
    name  TEXT NOT NULL,
    version TEXT NOT NULL,
    major INTEGER NOT NULL,
    minor INTEGER NOT NULL,
    patch INTEGER NOT NULL,
    PRIMARY KEY (name)
);
";

/// Optional seek-index tables, created lazily the first time an archive
/// actually needs one — most TAR archives are uncompressed or xz'd (whose
/// own footer index suffices), so these tables are often absent.
pub const CREATE_GZIPINDEX_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS gzipindexes (
    id   INTEGER PRIMARY KEY,
    path TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS gzipindex (
    indexid      INTEGER NOT NULL REFERENCES gzipindexes(id),
    data         BLOB    NOT NULL
);
";

pub const CREATE_GZTOOLINDEX_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS gztoolindex (
    data BLOB NOT NULL
);
";

pub const CREATE_BZIP2BLOCKS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bzip2blocks (
    realoffset    INTEGER NOT NULL,
    compressedoffset INTEGER NOT NULL
);
";

pub const CREATE_ZSTDBLOCKS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS zstdblocks (
    realoffset    INTEGER NOT NULL,
    compressedoffset INTEGER NOT NULL
);
";

/// Temp tables used only while building; must never survive `finalize`.
pub const CREATE_TEMP_SCHEMA: &str = "
CREATE TEMP TABLE IF NOT EXISTS filestmp (
    path            TEXT    NOT NULL,
    name            TEXT    NOT NULL,
    offsetheader    INTEGER,
    offset          INTEGER NOT NULL,
    size            INTEGER NOT NULL,
    mtime           REAL    NOT NULL,
    mode            INTEGER NOT NULL,
    type            INTEGER NOT NULL,
    linkname        TEXT    NOT NULL DEFAULT '',
    uid             INTEGER NOT NULL DEFAULT 0,
    gid             INTEGER NOT NULL DEFAULT 0,
    istar           INTEGER NOT NULL DEFAULT 0,
    issparse        INTEGER NOT NULL DEFAULT 0,
    isgenerated     INTEGER NOT NULL DEFAULT 0,
    recursiondepth  INTEGER NOT NULL DEFAULT 0
);

CREATE TEMP TABLE IF NOT EXISTS parentfolders (
    path TEXT NOT NULL,
    name TEXT NOT NULL
);
";

/// Returns true if any temp table from a prior, never-finalized build is
/// still present — such an index is rejected and deleted on open.
pub const TEMP_TABLES_PRESENT_QUERY: &str =
    "SELECT name FROM sqlite_temp_master WHERE name IN ('filestmp', 'parentfolders')";
