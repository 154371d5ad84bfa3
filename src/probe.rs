//! Magic-bytes and structural identification of container and compression
//! formats, with position-restore-on-exit guaranteed on every code path.

use std::io::{self, Read, Seek, SeekFrom};

use crate::stencil::ReadSeek;

/// A magic byte string expected at a fixed offset from the start of the
/// stream.
pub struct MagicRule {
    pub magic: &'static [u8],
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Tar,
    Zip,
    Rar,
    SevenZip,
    SquashFs,
    Asar,
    Sqlar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    Zlib,
    Lz4,
}

const GZIP_MAGIC: MagicRule = MagicRule { magic: &[0x1f, 0x8b], offset: 0 };
const BZIP2_MAGIC: MagicRule = MagicRule { magic: b"BZh", offset: 0 };
const XZ_MAGIC: MagicRule = MagicRule { magic: &[0xfd, b'7', b'z', b'X', b'Z', 0x00], offset: 0 };
const ZSTD_MAGIC: MagicRule = MagicRule { magic: &[0x28, 0xb5, 0x2f, 0xfd], offset: 0 };
const ZLIB_MAGIC_LO: u8 = 0x78;
const LZ4_MAGIC: MagicRule = MagicRule { magic: &[0x04, 0x22, 0x4d, 0x18], offset: 0 };

const ZIP_MAGIC: MagicRule = MagicRule { magic: b"PK\x03\x04", offset: 0 };
const ZIP_EMPTY_MAGIC: MagicRule = MagicRule { magic: b"PK\x05\x06", offset: 0 };
const RAR_MAGIC: MagicRule = MagicRule { magic: b"Rar!\x1a\x07", offset: 0 };
const SEVENZIP_MAGIC: MagicRule = MagicRule { magic: &[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c], offset: 0 };
const SQUASHFS_MAGIC_LE: MagicRule = MagicRule { magic: b"hsqs", offset: 0 };
const SQUASHFS_MAGIC_BE: MagicRule = MagicRule { magic: b"sqsh", offset: 0 };
const SQLAR_MAGIC: MagicRule = MagicRule { magic: b"SQLite format 3\x00", offset: 0 };

/// Restores the stream's position on drop, regardless of which branch of
/// the caller returns. Mirrors the `try/finally` discipline of the
/// reference prober.
struct PositionRestorer<R: Read + Seek + ?Sized> {
    reader: *mut R,
    original: u64,
}

impl<R: Read + Seek + ?Sized> PositionRestorer<R> {
    fn new(reader: &mut R) -> io::Result<Self> {
        let original = reader.stream_position()?;
        Ok(Self { reader: reader as *mut R, original })
    }
}

impl<R: Read + Seek + ?Sized> Drop for PositionRestorer<R> {
    fn drop(&mut self) {
        // SAFETY: `reader` was derived from a `&mut R` borrow that is not
        // held live by this guard (no lifetime parameter ties the two
        // together), so by the time `drop` runs any reborrows taken through
        // the original reference have already ended, restoring exclusive
        // access here.
        let _ = unsafe { &mut *self.reader }.seek(SeekFrom::Start(self.original));
    }
}

fn read_at<R: Read + Seek + ?Sized>(r: &mut R, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    r.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn matches_rule<R: Read + Seek + ?Sized>(r: &mut R, rule: &MagicRule) -> io::Result<bool> {
    let bytes = read_at(r, rule.offset, rule.magic.len())?;
    Ok(bytes == rule.magic)
}

/// Identify a single-stream compression format from its header magic.
/// Restores the stream position before returning.
pub fn probe_compression(r: &mut (impl ReadSeek + ?Sized)) -> io::Result<Option<CompressionFormat>> {
    let _restore = PositionRestorer::new(r)?;

    if matches_rule(r, &GZIP_MAGIC)? {
        return Ok(Some(CompressionFormat::Gzip));
    }
    if matches_rule(r, &BZIP2_MAGIC)? {
        return Ok(Some(CompressionFormat::Bzip2));
    }
    if matches_rule(r, &XZ_MAGIC)? {
        return Ok(Some(CompressionFormat::Xz));
    }
    if matches_rule(r, &ZSTD_MAGIC)? {
        return Ok(Some(CompressionFormat::Zstd));
    }
    if matches_rule(r, &LZ4_MAGIC)? {
        return Ok(Some(CompressionFormat::Lz4));
    }
    // zlib: first byte is always 0x78 for the default compression level
    // windows this crate supports; the second byte's low 5 bits form a
    // checksum of the first ((first*256+second) % 31 == 0).
    let header = read_at(r, 0, 2)?;
    if header.len() == 2 && header[0] == ZLIB_MAGIC_LO {
        let word = u16::from_be_bytes([header[0], header[1]]);
        if word % 31 == 0 {
            return Ok(Some(CompressionFormat::Zlib));
        }
    }
    Ok(None)
}

/// Identify an archive container format via magic bytes plus, for formats
/// without a fixed short magic (TAR), a structural checksum validation of
/// the first header block.
pub fn probe_container(r: &mut (impl ReadSeek + ?Sized)) -> io::Result<Option<ContainerFormat>> {
    let _restore = PositionRestorer::new(r)?;

    if matches_rule(r, &ZIP_MAGIC)? || matches_rule(r, &ZIP_EMPTY_MAGIC)? {
        return Ok(Some(ContainerFormat::Zip));
    }
    if matches_rule(r, &RAR_MAGIC)? {
        return Ok(Some(ContainerFormat::Rar));
    }
    if matches_rule(r, &SEVENZIP_MAGIC)? {
        return Ok(Some(ContainerFormat::SevenZip));
    }
    if matches_rule(r, &SQLAR_MAGIC)? {
        return Ok(Some(ContainerFormat::Sqlar));
    }
    if probe_squashfs(r)? {
        return Ok(Some(ContainerFormat::SquashFs));
    }
    if probe_asar(r)? {
        return Ok(Some(ContainerFormat::Asar));
    }
    if probe_tar_header(r)? {
        return Ok(Some(ContainerFormat::Tar));
    }
    Ok(None)
}

/// SquashFS superblocks are not always at offset 0 (AppImage-style
/// self-extracting prefixes); scan power-of-two-aligned offsets in the
/// first 1 MiB.
fn probe_squashfs<R: Read + Seek + ?Sized>(r: &mut R) -> io::Result<bool> {
    const SEARCH_WINDOW: u64 = 1024 * 1024;
    let mut offset = 0u64;
    while offset < SEARCH_WINDOW {
        let bytes = read_at(r, offset, 4)?;
        if bytes.as_slice() == SQUASHFS_MAGIC_LE.magic || bytes.as_slice() == SQUASHFS_MAGIC_BE.magic {
            return Ok(true);
        }
        offset = if offset == 0 { 4096 } else { offset * 2 };
    }
    Ok(false)
}

/// Electron ASAR archives open with a four-uint32-LE pickle header
/// (`pickle_size`, `header_size`, `json_size`, ...) rather than a fixed
/// magic string; validate the size relationships instead.
fn probe_asar<R: Read + Seek + ?Sized>(r: &mut R) -> io::Result<bool> {
    let head = read_at(r, 0, 16)?;
    if head.len() < 16 {
        return Ok(false);
    }
    let pickle_size = u32::from_le_bytes(head[0..4].try_into().unwrap()) as u64;
    let header_size = u32::from_le_bytes(head[4..8].try_into().unwrap()) as u64;
    let json_size = u32::from_le_bytes(head[8..12].try_into().unwrap()) as u64;
    if pickle_size == 0 || header_size == 0 || json_size == 0 {
        return Ok(false);
    }
    Ok(header_size == pickle_size + 4 && json_size <= header_size)
}

/// A POSIX TAR has no magic at offset 0; the per-entry checksum field at
/// byte offset 148 (8 bytes) must equal the sum of all 512 header bytes
/// with the checksum field itself treated as all spaces (0x20).
fn probe_tar_header<R: Read + Seek + ?Sized>(r: &mut R) -> io::Result<bool> {
    let block = read_at(r, 0, 512)?;
    if block.len() < 512 {
        return Ok(false);
    }
    let recorded = parse_octal(&block[148..156]);
    let recorded = match recorded {
        Some(v) => v,
        None => return Ok(false),
    };

    let mut unsigned_sum: u64 = 0;
    for (i, &b) in block.iter().enumerate() {
        unsigned_sum += if (148..156).contains(&i) { 0x20 } else { b as u64 };
    }
    Ok(unsigned_sum == recorded)
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(field).ok()?;
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if trimmed.is_empty() {
        return None;
    }
    u64::from_str_radix(trimmed, 8).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn detects_gzip_magic() {
        let mut cur = Cursor::new(vec![0x1f, 0x8b, 0x08, 0x00]);
        assert_eq!(probe_compression(&mut cur).unwrap(), Some(CompressionFormat::Gzip));
    }

    #[test]
    fn probe_restores_position() {
        let mut cur = Cursor::new(vec![0x1f, 0x8b, 0x08, 0x00, 0xff]);
        cur.seek(SeekFrom::Start(3)).unwrap();
        probe_compression(&mut cur).unwrap();
        assert_eq!(cur.stream_position().unwrap(), 3);
    }

    #[test]
    fn valid_tar_header_detected() {
        let mut block = vec![0u8; 512];
        block[0..8].copy_from_slice(b"file.txt");
        block[156] = b'0'; // regular file type
        let checksum_field = {
            block[148..156].copy_from_slice(b"        ");
            let sum: u64 = block.iter().map(|&b| b as u64).sum();
            format!("{:06o}\0 ", sum)
        };
        block[148..148 + checksum_field.len()].copy_from_slice(checksum_field.as_bytes());

        let mut cur = Cursor::new(block);
        assert_eq!(probe_container(&mut cur).unwrap(), Some(ContainerFormat::Tar));
    }

    #[test]
    fn garbage_is_not_a_tar() {
        let mut cur = Cursor::new(vec![0xaa; 512]);
        assert_eq!(probe_container(&mut cur).unwrap(), None);
    }
}
