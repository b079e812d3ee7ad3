//! Block cache shared by readers that are expensive to re-read.
//!
//! A [`CacheZone`] is a bounded LRU store of fixed-size blocks. Many
//! [`CachedReader`]s can share one zone; each uses its own tag so that blocks
//! of different streams never collide.

use crate::reader::Reader;
use log::trace;
use lru::LruCache;
use std::cmp::min;
use std::io;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Size of one cached block in bytes.
pub const BLOCK_SIZE: u64 = 4096;

type CacheKey = (String, u64);

struct ZoneState {
    blocks: LruCache<CacheKey, Vec<u8>>,
    max_blocks: usize,
    hits: u64,
    queries: u64,
}

impl ZoneState {
    fn evict(&mut self) {
        while self.blocks.len() > self.max_blocks {
            if self.blocks.pop_lru().is_none() {
                break;
            }
        }
    }
}

/// A bounded LRU store of [`BLOCK_SIZE`] blocks keyed by `(tag, block id)`.
///
/// The zone never holds more than [`max_blocks()`](Self::max_blocks) blocks.
/// All methods take `&self`; the contents and counters are guarded by a
/// single mutex.
pub struct CacheZone {
    state: Mutex<ZoneState>,
}

impl std::fmt::Debug for CacheZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();

        f.debug_struct("CacheZone")
            .field("len", &state.blocks.len())
            .field("max_blocks", &state.max_blocks)
            .field("hits", &state.hits)
            .field("queries", &state.queries)
            .finish()
    }
}

impl CacheZone {
    pub fn new(max_blocks: usize) -> Self {
        Self {
            state: Mutex::new(ZoneState {
                blocks: LruCache::unbounded(),
                max_blocks,
                hits: 0,
                queries: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ZoneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces a block, evicting the least recently used blocks
    /// while the zone is over capacity.
    ///
    /// Only the first [`BLOCK_SIZE`] bytes of `data` are kept.
    pub fn store(&self, tag: &str, block_id: u64, data: &[u8]) {
        let data = &data[..min(data.len(), BLOCK_SIZE as usize)];
        let mut state = self.state();

        state.blocks.put((tag.to_owned(), block_id), data.to_vec());
        state.evict();

        trace!(
            "[CACHE] store {tag}#{block_id} ({} bytes, {} resident)",
            data.len(),
            state.blocks.len()
        );
    }

    /// Copies cached bytes of a block into `out`, starting `offset_in_block`
    /// bytes into the block.
    ///
    /// Returns the number of bytes copied, which is 0 on a miss and at most
    /// `out.len()`. A hit refreshes the block's LRU position.
    pub fn get(&self, tag: &str, block_id: u64, out: &mut [u8], offset_in_block: usize) -> usize {
        let mut state = self.state();
        state.queries += 1;

        let key = (tag.to_owned(), block_id);
        let copied = match state.blocks.get(&key) {
            Some(block) if offset_in_block < block.len() => {
                let n = min(block.len() - offset_in_block, out.len());

                out[..n].copy_from_slice(&block[offset_in_block..offset_in_block + n]);
                n
            }
            _ => 0,
        };

        if copied > 0 {
            state.hits += 1;
        }

        copied
    }

    /// Changes the capacity, evicting immediately if the zone is now over it.
    pub fn set_max_blocks(&self, max_blocks: usize) {
        let mut state = self.state();

        state.max_blocks = max_blocks;
        state.evict();
    }

    #[must_use]
    pub fn max_blocks(&self) -> usize {
        self.state().max_blocks
    }

    /// Returns the number of resident blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.state().hits
    }

    #[must_use]
    pub fn queries(&self) -> u64 {
        self.state().queries
    }

    /// Returns the fraction of [`get()`](Self::get) calls that were hits.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let state = self.state();

        if state.queries == 0 {
            0.0
        } else {
            state.hits as f64 / state.queries as f64
        }
    }
}

/// A [`Reader`] that serves repeated reads of its backing reader from a
/// [`CacheZone`].
///
/// Misses are fetched in one read per contiguous miss-run, widened to the
/// backing reader's [optimal block](Reader::advise_optimal_block) boundaries
/// so that a compressed run is decoded once and cached as a whole.
pub struct CachedReader {
    backing: Arc<dyn Reader>,
    zone: Arc<CacheZone>,
    tag: String,
}

impl std::fmt::Debug for CachedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedReader")
            .field("tag", &self.tag)
            .field("len", &self.backing.len())
            .finish_non_exhaustive()
    }
}

impl CachedReader {
    pub fn new(backing: Arc<dyn Reader>, zone: Arc<CacheZone>, tag: impl Into<String>) -> Self {
        Self {
            backing,
            zone,
            tag: tag.into(),
        }
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn zone(&self) -> &Arc<CacheZone> {
        &self.zone
    }

    /// Fetches `range` from the backing reader into `out` (which holds the
    /// bytes starting at `base`) and caches every block the read completes.
    fn fill_misses(&self, range: Range<u64>, base: u64, out: &mut [u8]) -> io::Result<()> {
        let len = self.backing.len();
        let first = self.backing.advise_optimal_block(range.start);
        let last = self.backing.advise_optimal_block(range.end - 1);
        let read_start = min(first.start, range.start);
        let read_end = min(last.end.max(range.end), len);

        trace!(
            "[CACHE] {} miss {:#x}..{:#x}, reading {:#x}..{:#x}",
            self.tag, range.start, range.end, read_start, read_end
        );

        let mut data = vec![0u8; (read_end - read_start) as usize];

        self.backing.read_exact_at(read_start, &mut data)?;

        let src = (range.start - read_start) as usize..(range.end - read_start) as usize;
        let dst = (range.start - base) as usize..(range.end - base) as usize;

        out[dst].copy_from_slice(&data[src]);

        let mut block = read_start.div_ceil(BLOCK_SIZE);

        loop {
            let block_start = block * BLOCK_SIZE;

            if block_start >= read_end {
                break;
            }

            let block_end = min(block_start + BLOCK_SIZE, read_end);

            // A partial block is only complete when it is the end of the stream.
            if block_end - block_start != BLOCK_SIZE && block_end != len {
                break;
            }

            let bytes = &data[(block_start - read_start) as usize..(block_end - read_start) as usize];

            self.zone.store(&self.tag, block, bytes);
            block += 1;
        }

        Ok(())
    }
}

impl Reader for CachedReader {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.backing.len();

        if buf.is_empty() || offset >= len {
            return Ok(0);
        }

        let end = min(offset + buf.len() as u64, len);
        let mut pos = offset;
        let mut miss_start = None;

        while pos < end {
            let block = pos / BLOCK_SIZE;
            let chunk_end = min((block + 1) * BLOCK_SIZE, end);
            let chunk = &mut buf[(pos - offset) as usize..(chunk_end - offset) as usize];
            let wanted = chunk.len();
            let got = self
                .zone
                .get(&self.tag, block, chunk, (pos % BLOCK_SIZE) as usize);

            if got == wanted {
                if let Some(start) = miss_start.take() {
                    self.fill_misses(start..pos, offset, buf)?;
                }
            } else if miss_start.is_none() {
                miss_start = Some(pos);
            }

            pos = chunk_end;
        }

        if let Some(start) = miss_start {
            self.fill_misses(start..end, offset, buf)?;
        }

        Ok((end - offset) as usize)
    }

    fn len(&self) -> u64 {
        self.backing.len()
    }

    fn advise_optimal_block(&self, offset: u64) -> Range<u64> {
        self.backing.advise_optimal_block(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemoryReader;

    /// A memory reader that advises fixed boundaries and records every read.
    struct BoundaryReader {
        data: Vec<u8>,
        boundaries: Vec<u64>,
        reads: Mutex<Vec<Range<u64>>>,
    }

    impl BoundaryReader {
        fn new(len: usize, boundaries: &[u64]) -> Self {
            Self {
                data: (0..len).map(|i| (i * 7 % 256) as u8).collect(),
                boundaries: boundaries.to_vec(),
                reads: Mutex::new(Vec::new()),
            }
        }

        fn is_boundary(&self, offset: u64) -> bool {
            offset == 0 || offset == self.len() || self.boundaries.contains(&offset)
        }
    }

    impl Reader for BoundaryReader {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            let n = MemoryReader::new(&self.data[..]).read_at(offset, buf)?;
            self.reads.lock().unwrap().push(offset..offset + n as u64);
            Ok(n)
        }

        fn len(&self) -> u64 {
            self.data.len() as u64
        }

        fn advise_optimal_block(&self, offset: u64) -> Range<u64> {
            if self.boundaries.is_empty() {
                return crate::reader::default_optimal_block(offset, self.len());
            }

            let start = self
                .boundaries
                .iter()
                .copied()
                .filter(|&b| b <= offset)
                .max()
                .unwrap_or(0);
            let end = self
                .boundaries
                .iter()
                .copied()
                .find(|&b| b > offset)
                .unwrap_or(self.len());

            start..end
        }
    }

    #[test]
    fn zone_round_trip() {
        let zone = CacheZone::new(10);
        let block: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        let mut out = [0u8; 100];

        zone.store("a", 3, &block);

        assert_eq!(zone.get("a", 3, &mut out, 10), 100);
        assert_eq!(&out[..], &block[10..110]);
        assert_eq!(zone.get("a", 3, &mut out, 4090), 6);
        assert_eq!(&out[..6], &block[4090..]);
        assert_eq!(zone.get("b", 3, &mut out, 0), 0);
        assert_eq!(zone.get("a", 4, &mut out, 0), 0);
        assert_eq!(zone.queries(), 4);
        assert_eq!(zone.hits(), 2);
        assert_eq!(zone.hit_rate(), 0.5);
    }

    #[test]
    fn zone_evicts_least_recently_used() {
        let zone = CacheZone::new(2);
        let mut out = [0u8; 1];

        zone.store("t", 0, &[0]);
        zone.store("t", 1, &[1]);
        // Touch block 0 so block 1 becomes the eviction candidate.
        assert_eq!(zone.get("t", 0, &mut out, 0), 1);
        zone.store("t", 2, &[2]);

        assert_eq!(zone.len(), 2);
        assert_eq!(zone.get("t", 1, &mut out, 0), 0);
        assert_eq!(zone.get("t", 0, &mut out, 0), 1);
        assert_eq!(zone.get("t", 2, &mut out, 0), 1);

        zone.set_max_blocks(1);
        assert_eq!(zone.len(), 1);
        assert_eq!(zone.get("t", 2, &mut out, 0), 1);
    }

    #[test]
    fn cached_reader_respects_zone_bound_and_boundaries() {
        let backing = Arc::new(BoundaryReader::new(20_000, &[4096, 12288]));
        let zone = Arc::new(CacheZone::new(50));
        let reader = CachedReader::new(backing.clone(), zone.clone(), "t");
        let mut out = Vec::new();
        let mut buf = [0u8; 500];
        let mut offset = 0;

        loop {
            let n = reader.read_at(offset, &mut buf).unwrap();

            if n == 0 {
                break;
            }

            out.extend_from_slice(&buf[..n]);
            offset += n as u64;
        }

        assert_eq!(out, backing.data);
        assert_eq!(zone.len(), 5);

        let reads = backing.reads.lock().unwrap();

        assert!(!reads.is_empty());
        for read in reads.iter() {
            assert!(backing.is_boundary(read.start), "read {read:?}");
            assert!(backing.is_boundary(read.end), "read {read:?}");
        }
    }

    #[test]
    fn cached_reader_serves_hits_without_backing_reads() {
        let backing = Arc::new(BoundaryReader::new(10_000, &[]));
        let zone = Arc::new(CacheZone::new(8));
        let reader = CachedReader::new(backing.clone(), zone, "t");
        let mut buf = vec![0u8; 10_000];

        reader.read_exact_at(0, &mut buf).unwrap();
        let reads = backing.reads.lock().unwrap().len();

        reader.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(backing.reads.lock().unwrap().len(), reads);
        assert_eq!(buf, backing.data);
    }

    #[test]
    fn cached_reader_merges_misses_around_hits() {
        let backing = Arc::new(BoundaryReader::new(5 * 4096, &[]));
        let zone = Arc::new(CacheZone::new(8));
        let reader = CachedReader::new(backing.clone(), zone.clone(), "t");
        let mut buf = vec![0u8; 5 * 4096];

        // Prime block 2 only.
        reader.read_exact_at(2 * 4096 + 10, &mut buf[..10]).unwrap();
        backing.reads.lock().unwrap().clear();

        reader.read_exact_at(0, &mut buf).unwrap();

        assert_eq!(buf, backing.data);
        assert_eq!(zone.len(), 5);
        assert_eq!(
            *backing.reads.lock().unwrap(),
            vec![0..8192, 12288..20480]
        );
    }

    #[test]
    fn cached_reader_clamps_to_len() {
        let backing = Arc::new(MemoryReader::new(vec![9u8; 100]));
        let reader = CachedReader::new(backing, Arc::new(CacheZone::new(4)), "t");
        let mut buf = [0u8; 64];

        assert_eq!(reader.read_at(90, &mut buf).unwrap(), 10);
        assert_eq!(reader.read_at(100, &mut buf).unwrap(), 0);
        assert_eq!(reader.zone().len(), 1);
    }
}
