//! Seekable streams composed of cut-outs of one or more underlying sources.
//!
//! [`StenciledFile`] presents the concatenation of N `(source, offset,
//! size)` cut-outs as a single seekable byte stream. [`JoinedFile`] is the
//! special case where every source is used whole. [`LambdaReaderFile`]
//! adapts a `pread`-shaped closure. [`FactoryJoinedFile`] opens one
//! underlying source at a time — used by the split-file joiner (§6.3) to
//! avoid exceeding the process file-descriptor limit.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

/// Blanket trait for anything that can act as an underlying source.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A source shared (and lock-serialized) across possibly many stenciled
/// views, mirroring the `fileObjectLock` discipline of the reference
/// implementation: every read acquires the lock around the underlying
/// seek+read pair.
pub type SharedSource = Arc<Mutex<dyn ReadSeek>>;

pub fn shared<R: ReadSeek + 'static>(r: R) -> SharedSource {
    Arc::new(Mutex::new(r))
}

struct Cutout {
    source: SharedSource,
    offset: u64,
    size: u64,
}

/// Seekable concatenation of cut-outs of one or more [`SharedSource`]s.
///
/// Cut-outs of size 0 are filtered at construction so that `read` never
/// has to skip them to avoid a short read being mistaken for EOF.
pub struct StenciledFile {
    cutouts: Vec<Cutout>,
    cumsizes: Vec<u64>,
    position: u64,
}

impl StenciledFile {
    /// `stencils`: `(source, offset, size)` triples, kept in order. The
    /// same source may appear more than once.
    pub fn new(stencils: Vec<(SharedSource, u64, u64)>) -> Self {
        let cutouts: Vec<Cutout> = stencils
            .into_iter()
            .filter(|(_, _, size)| *size > 0)
            .map(|(source, offset, size)| Cutout { source, offset, size })
            .collect();

        let mut cumsizes = Vec::with_capacity(cutouts.len() + 1);
        cumsizes.push(0u64);
        for c in &cutouts {
            cumsizes.push(cumsizes.last().unwrap() + c.size);
        }

        Self { cutouts, cumsizes, position: 0 }
    }

    pub fn total_size(&self) -> u64 {
        *self.cumsizes.last().unwrap_or(&0)
    }

    /// Index of the cut-out containing `offset`, via
    /// `bisect_right(cumsizes, offset+1) - 1`.
    fn find_cutout(&self, offset: u64) -> usize {
        // partition_point returns the first index i such that cumsizes[i] > offset.
        let idx = self.cumsizes.partition_point(|&c| c <= offset);
        idx.saturating_sub(1)
    }

    fn read_one(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let i = self.find_cutout(self.position);
        if i >= self.cutouts.len() {
            return Ok(0);
        }
        let cutout = &self.cutouts[i];
        let offset_in_cutout = self.position - self.cumsizes[i];
        debug_assert!(offset_in_cutout < cutout.size);

        let readable = (cutout.size - offset_in_cutout).min(buf.len() as u64) as usize;
        let mut guard = cutout
            .source
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "stenciled source lock poisoned"))?;
        guard.seek(SeekFrom::Start(cutout.offset + offset_in_cutout))?;
        let n = guard.read(&mut buf[..readable])?;
        drop(guard);
        self.position += n as u64;
        Ok(n)
    }
}

impl Read for StenciledFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read_one(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }
}

impl Seek for StenciledFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos: i128 = match pos {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.total_size() as i128 + delta as i128,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "trying to seek before the start of the file",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

/// Construct a [`StenciledFile`] that joins whole sources end to end.
pub fn joined_file(sources: Vec<SharedSource>) -> io::Result<StenciledFile> {
    let mut stencils = Vec::with_capacity(sources.len());
    for source in sources {
        let size = {
            let mut guard = source
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "lock poisoned"))?;
            guard.seek(SeekFrom::End(0))?
        };
        stencils.push((source, 0u64, size));
    }
    Ok(StenciledFile::new(stencils))
}

/// Adapts a `pread(offset, size) -> bytes` closure into a seekable stream.
pub struct LambdaReaderFile<F>
where
    F: FnMut(u64, usize) -> io::Result<Vec<u8>>,
{
    pread: F,
    size: u64,
    position: u64,
}

impl<F> LambdaReaderFile<F>
where
    F: FnMut(u64, usize) -> io::Result<Vec<u8>>,
{
    pub fn new(pread: F, size: u64) -> Self {
        Self { pread, size, position: 0 }
    }
}

impl<F> Read for LambdaReaderFile<F>
where
    F: FnMut(u64, usize) -> io::Result<Vec<u8>>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.position) as usize;
        let want = buf.len().min(remaining);
        if want == 0 {
            return Ok(0);
        }
        let data = (self.pread)(self.position, want)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl<F> Seek for LambdaReaderFile<F>
where
    F: FnMut(u64, usize) -> io::Result<Vec<u8>>,
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos: i128 = match pos {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.size as i128 + delta as i128,
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative seek"));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

/// Joins sources opened on demand via factory closures, keeping at most one
/// open at a time. Used to join split-file parts (§6.3) without exceeding
/// the file-descriptor limit.
pub struct FactoryJoinedFile<F>
where
    F: Fn(usize) -> io::Result<Box<dyn ReadSeek>>,
{
    factory: F,
    sizes: Vec<u64>,
    cumsizes: Vec<u64>,
    current: Option<(usize, Box<dyn ReadSeek>)>,
    position: u64,
}

impl<F> FactoryJoinedFile<F>
where
    F: Fn(usize) -> io::Result<Box<dyn ReadSeek>>,
{
    pub fn new(factory: F, sizes: Vec<u64>) -> Self {
        let mut cumsizes = Vec::with_capacity(sizes.len() + 1);
        cumsizes.push(0u64);
        for s in &sizes {
            cumsizes.push(cumsizes.last().unwrap() + s);
        }
        Self { factory, sizes, cumsizes, current: None, position: 0 }
    }

    fn total_size(&self) -> u64 {
        *self.cumsizes.last().unwrap_or(&0)
    }

    fn find_part(&self, offset: u64) -> usize {
        let idx = self.cumsizes.partition_point(|&c| c <= offset);
        idx.saturating_sub(1)
    }

    fn ensure_open(&mut self, idx: usize) -> io::Result<()> {
        if let Some((cur, _)) = &self.current {
            if *cur == idx {
                return Ok(());
            }
        }
        let file = (self.factory)(idx)?;
        self.current = Some((idx, file));
        Ok(())
    }
}

impl<F> Read for FactoryJoinedFile<F>
where
    F: Fn(usize) -> io::Result<Box<dyn ReadSeek>>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.sizes.is_empty() {
            return Ok(0);
        }
        let i = self.find_part(self.position);
        if i >= self.sizes.len() {
            return Ok(0);
        }
        self.ensure_open(i)?;
        let offset_in_part = self.position - self.cumsizes[i];
        let readable = (self.sizes[i] - offset_in_part).min(buf.len() as u64) as usize;

        let (_, file) = self.current.as_mut().unwrap();
        file.seek(SeekFrom::Start(offset_in_part))?;
        let n = file.read(&mut buf[..readable])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<F> Seek for FactoryJoinedFile<F>
where
    F: Fn(usize) -> io::Result<Box<dyn ReadSeek>>,
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos: i128 = match pos {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.total_size() as i128 + delta as i128,
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative seek"));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn stenciled_file_joins_cutouts() {
        let src = shared(Cursor::new(b"0123456789".to_vec()));
        let mut f = StenciledFile::new(vec![(src.clone(), 5, 3), (src, 0, 3)]);
        let mut out = Vec::new();
        f.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"567012");
    }

    #[test]
    fn stenciled_file_filters_zero_size_cutouts() {
        let src = shared(Cursor::new(b"abcdef".to_vec()));
        let f = StenciledFile::new(vec![(src.clone(), 0, 0), (src, 2, 3)]);
        assert_eq!(f.total_size(), 3);
    }

    #[test]
    fn seek_before_start_fails() {
        let src = shared(Cursor::new(b"abcdef".to_vec()));
        let mut f = StenciledFile::new(vec![(src, 0, 6)]);
        assert!(f.seek(SeekFrom::Start(0)).is_ok());
        assert!(f.seek(SeekFrom::Current(-1)).is_err());
    }

    #[test]
    fn seek_past_end_then_read_yields_eof() {
        let src = shared(Cursor::new(b"abcdef".to_vec()));
        let mut f = StenciledFile::new(vec![(src, 0, 6)]);
        f.seek(SeekFrom::Start(100)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn lambda_reader_file_reads_via_closure() {
        let data = b"hello world".to_vec();
        let mut f = LambdaReaderFile::new(
            |offset, size| Ok(data[offset as usize..offset as usize + size].to_vec()),
            data.len() as u64,
        );
        let mut out = Vec::new();
        f.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }
}
