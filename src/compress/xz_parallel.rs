//! Parallel xz reader: an LRU block cache plus a sequential-access
//! prefetcher, gated behind the `parallel` cargo feature exactly like the
//! teacher's `perf::compress_chunks_parallel` gates its own rayon use.
//!
//! Each worker opens the underlying archive file independently (xz streams
//! are block-seekable via the `.xz` index, so a worker only needs a byte
//! range, not shared decoder state) and decompresses one block into the
//! cache. The prefetcher widens its lookahead window exponentially as long
//! as accesses keep landing on consecutive blocks, and resets on any
//! out-of-order access.

use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::error::{RatarkitError, Result};

/// One decompressed xz block, keyed by its index in stream order.
type BlockCache = LruCache<u64, Arc<Vec<u8>>>;

/// Sequential-access streak tracker driving the prefetch window size.
struct Prefetcher {
    last_block: Option<u64>,
    streak: u32,
}

impl Prefetcher {
    fn new() -> Self {
        Self { last_block: None, streak: 0 }
    }

    /// Returns how many blocks ahead of `block` should be prefetched.
    fn observe(&mut self, block: u64) -> u32 {
        let sequential = self.last_block == Some(block.wrapping_sub(1));
        self.streak = if sequential { (self.streak + 1).min(6) } else { 0 };
        self.last_block = Some(block);
        if self.streak == 0 {
            0
        } else {
            1u32 << (self.streak - 1).min(4)
        }
    }
}

/// A block's byte range within the compressed xz stream and the
/// decompressed size it expands to, taken from the `.xz` block index.
#[derive(Debug, Clone, Copy)]
pub struct XzBlockRange {
    pub compressed_offset: u64,
    pub compressed_size: u64,
    pub decompressed_offset: u64,
    pub decompressed_size: u64,
}

/// Seekable reader over an xz stream that dispatches block decompression
/// to a worker pool and caches the results.
pub struct ParallelXzReader {
    path: PathBuf,
    blocks: Vec<XzBlockRange>,
    cache: Arc<Mutex<BlockCache>>,
    prefetcher: Prefetcher,
    position: u64,
    total_size: u64,
}

impl ParallelXzReader {
    pub fn new(path: PathBuf, blocks: Vec<XzBlockRange>, cache_capacity: usize) -> Result<Self> {
        let total_size = blocks.last().map(|b| b.decompressed_offset + b.decompressed_size).unwrap_or(0);
        let capacity = NonZeroUsize::new(cache_capacity.max(1))
            .ok_or_else(|| RatarkitError::Compression("zero-capacity xz block cache".into()))?;
        Ok(Self {
            path,
            blocks,
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
            prefetcher: Prefetcher::new(),
            position: 0,
            total_size,
        })
    }

    fn block_index_for(&self, offset: u64) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| offset >= b.decompressed_offset && offset < b.decompressed_offset + b.decompressed_size)
    }

    fn fetch_block(&self, index: usize) -> io::Result<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache.lock().unwrap().get(&(index as u64)) {
            return Ok(hit.clone());
        }
        let block = self.blocks[index];
        let decoded = decode_block(&self.path, block)?;
        let decoded = Arc::new(decoded);
        self.cache.lock().unwrap().put(index as u64, decoded.clone());
        Ok(decoded)
    }

    #[cfg(feature = "parallel")]
    fn prefetch(&self, start_index: usize, count: u32) {
        let indices: Vec<usize> =
            (start_index + 1..(start_index + 1 + count as usize).min(self.blocks.len())).collect();
        if indices.is_empty() {
            return;
        }
        rayon::scope(|scope| {
            for idx in indices {
                if self.cache.lock().unwrap().contains(&(idx as u64)) {
                    continue;
                }
                let path = self.path.clone();
                let block = self.blocks[idx];
                let cache = self.cache.clone();
                scope.spawn(move |_| {
                    if let Ok(decoded) = decode_block(&path, block) {
                        cache.lock().unwrap().put(idx as u64, Arc::new(decoded));
                    }
                });
            }
        });
    }

    #[cfg(not(feature = "parallel"))]
    fn prefetch(&self, _start_index: usize, _count: u32) {}
}

fn decode_block(path: &std::path::Path, block: XzBlockRange) -> io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(block.compressed_offset))?;
    let slice = (&mut file).take(block.compressed_size);
    let mut decoder = xz2::read::XzDecoder::new(slice);
    let mut out = Vec::with_capacity(block.decompressed_size as usize);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

impl Read for ParallelXzReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.total_size || buf.is_empty() {
            return Ok(0);
        }
        let Some(index) = self.block_index_for(self.position) else { return Ok(0) };
        let block = self.blocks[index];
        let data = self.fetch_block(index)?;

        let lookahead = self.prefetcher.observe(index as u64);
        if lookahead > 0 {
            self.prefetch(index, lookahead);
        }

        let offset_in_block = (self.position - block.decompressed_offset) as usize;
        let available = data.len().saturating_sub(offset_in_block);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&data[offset_in_block..offset_in_block + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for ParallelXzReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos: i128 = match pos {
            SeekFrom::Start(off) => off as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.total_size as i128 + delta as i128,
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

    #[test]
    fn prefetcher_widens_on_sequential_access_and_resets_on_jump() {
        let mut p = Prefetcher::new();
        assert_eq!(p.observe(0), 0);
        assert_eq!(p.observe(1), 1);
        assert_eq!(p.observe(2), 2);
        assert_eq!(p.observe(10), 0);
    }
}
