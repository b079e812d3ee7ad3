use super::decompressor::{self, DecompressError, Decompressor};
use super::udif::{BlkxRun, BlkxTable, RunType, SECTOR_SIZE};
use crate::reader::{Reader, SubReader, default_optimal_block};
use log::debug;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::cmp::min;
use std::collections::BTreeMap;
use std::io;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};

/// Errors when reading a partition.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("no run covers sector {sector}"))]
    NoRunForSector { sector: u64 },

    #[snafu(display("run #{run} has unsupported type {kind:#x}"))]
    UnsupportedRun { run: usize, kind: u32 },

    #[snafu(display("cannot read raw run #{run}"))]
    ReadRaw { run: usize, source: io::Error },

    #[snafu(display("cannot decompress run #{run}"))]
    Decompress {
        run: usize,
        source: DecompressError,
    },
}

impl From<ReadError> for io::Error {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::UnsupportedRun { .. } => io::Error::new(io::ErrorKind::Unsupported, e),
            e => io::Error::other(e),
        }
    }
}

struct ActiveDecoder {
    run: usize,
    decompressor: Box<dyn Decompressor>,
}

/// A [`Reader`] over one partition of a UDIF image, decoding its block
/// table's runs on demand.
///
/// The most recently used decompressor is kept, so reading a compressed run
/// front to back in several calls decodes it only once.
pub struct DmgPartition {
    backing: Arc<dyn Reader>,
    table: Arc<BlkxTable>,
    /// First sector of each run that carries data -> run index.
    index: BTreeMap<u64, usize>,
    len: u64,
    decoder: Mutex<Option<ActiveDecoder>>,
}

impl std::fmt::Debug for DmgPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmgPartition")
            .field("len", &self.len)
            .field("runs", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl DmgPartition {
    /// Creates a reader for the partition described by `table`, whose
    /// compressed data lives in `backing`.
    pub fn new(backing: Arc<dyn Reader>, table: Arc<BlkxTable>) -> Self {
        let index = table
            .runs()
            .iter()
            .enumerate()
            .filter(|(_, run)| !run.kind.is_marker() && run.sector_count > 0)
            .map(|(i, run)| (run.sector_start, i))
            .collect();

        // Sector spans are range-checked when the table is parsed.
        Self {
            backing,
            len: table.sector_count() * SECTOR_SIZE,
            table,
            index,
            decoder: Mutex::new(None),
        }
    }

    pub fn table(&self) -> &BlkxTable {
        &self.table
    }

    /// Finds the run containing byte `offset` of the partition.
    fn run_at(&self, offset: u64) -> Result<(usize, &BlkxRun), ReadError> {
        let sector = offset / SECTOR_SIZE;
        let (_, &index) = self
            .index
            .range(..=sector)
            .next_back()
            .context(NoRunForSectorSnafu { sector })?;
        let run = &self.table.runs()[index];

        ensure!(sector < run.sector_end(), NoRunForSectorSnafu { sector });

        Ok((index, run))
    }

    fn read_compressed(
        &self,
        index: usize,
        run: &BlkxRun,
        offset_in_run: u64,
        out: &mut [u8],
    ) -> Result<(), ReadError> {
        let mut slot = self.decoder.lock().unwrap_or_else(PoisonError::into_inner);

        let reusable = matches!(
            &*slot,
            Some(active) if active.run == index && active.decompressor.position() <= offset_in_run
        );

        let mut active = match slot.take() {
            Some(active) if reusable => active,
            _ => {
                debug!(
                    "opening {:?} decoder for run #{index} ({} bytes at {:#x})",
                    run.kind,
                    run.comp_length,
                    self.table.data_start() + run.comp_offset
                );

                let input = SubReader::new(
                    self.backing.clone(),
                    self.table.data_start() + run.comp_offset,
                    run.comp_length,
                );

                ActiveDecoder {
                    run: index,
                    decompressor: decompressor::open(run.kind, Arc::new(input))
                        .context(DecompressSnafu { run: index })?,
                }
            }
        };

        active
            .decompressor
            .decompress(out, offset_in_run)
            .context(DecompressSnafu { run: index })?;

        *slot = Some(active);

        Ok(())
    }

    fn read_run(&self, offset: u64, out: &mut [u8]) -> Result<usize, ReadError> {
        let (index, run) = self.run_at(offset)?;
        let run_start = run.sector_start * SECTOR_SIZE;
        let offset_in_run = offset - run_start;
        let n = min(out.len() as u64, run.sector_end() * SECTOR_SIZE - offset) as usize;
        let out = &mut out[..n];

        match run.kind {
            RunType::ZeroFill | RunType::Unknown => out.fill(0),
            RunType::Raw => self
                .backing
                .read_exact_at(self.table.data_start() + run.comp_offset + offset_in_run, out)
                .context(ReadRawSnafu { run: index })?,
            kind if kind.is_compressed() => self.read_compressed(index, run, offset_in_run, out)?,
            kind => {
                return UnsupportedRunSnafu {
                    run: index,
                    kind: kind.to_raw(),
                }
                .fail();
            }
        }

        Ok(n)
    }
}

impl Reader for DmgPartition {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || offset >= self.len {
            return Ok(0);
        }

        let end = min(offset + buf.len() as u64, self.len);
        let mut pos = offset;

        while pos < end {
            let start = (pos - offset) as usize;
            let stop = (end - offset) as usize;

            pos += self.read_run(pos, &mut buf[start..stop])? as u64;
        }

        Ok((end - offset) as usize)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn advise_optimal_block(&self, offset: u64) -> Range<u64> {
        match self.run_at(offset) {
            Ok((_, run)) if run.kind.is_compressed() => {
                let start = run.sector_start * SECTOR_SIZE;
                let end = min(run.sector_end() * SECTOR_SIZE, self.len);

                start..end
            }
            _ => default_optimal_block(offset, self.len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemoryReader;
    use crate::testutil::{blkx_table_bytes, zlib_compress};

    fn run(kind: RunType, sector_start: u64, sector_count: u64, comp_offset: u64, comp_length: u64) -> BlkxRun {
        BlkxRun {
            kind,
            sector_start,
            sector_count,
            comp_offset,
            comp_length,
        }
    }

    /// Ten sectors of raw data, ten of zeros, ten of zlib.
    fn three_run_partition() -> (DmgPartition, Vec<u8>) {
        let raw: Vec<u8> = (0..5120u32).map(|i| (i % 199) as u8 + 1).collect();
        let packed: Vec<u8> = (0..5120u32).map(|i| (i % 7) as u8 + 50).collect();

        let compressed = zlib_compress(&packed);

        let mut backing = raw.clone();
        backing.extend_from_slice(&compressed);

        let runs = [
            run(RunType::Comment, 0, 0, 0, 0),
            run(RunType::Raw, 0, 10, 0, 5120),
            run(RunType::ZeroFill, 10, 10, 0, 0),
            run(RunType::Zlib, 20, 10, 5120, compressed.len() as u64),
            run(RunType::Terminator, 30, 0, 0, 0),
        ];
        let table = BlkxTable::from_bytes(&blkx_table_bytes(0, 30, &runs)).unwrap();

        let mut expected = raw;
        expected.extend_from_slice(&[0u8; 5120]);
        expected.extend_from_slice(&packed);

        (
            DmgPartition::new(Arc::new(MemoryReader::new(backing)), Arc::new(table)),
            expected,
        )
    }

    #[test]
    fn reads_each_run_kind_at_run_edges() {
        let (partition, expected) = three_run_partition();
        let mut sector = [0u8; 512];

        assert_eq!(partition.len(), 30 * 512);

        for index in [0u64, 9, 10, 19, 20, 29] {
            let offset = index * 512;
            partition.read_exact_at(offset, &mut sector).unwrap();
            assert_eq!(&sector[..], &expected[offset as usize..offset as usize + 512], "sector {index}");
        }
    }

    #[test]
    fn reads_across_runs_and_clamps_at_end() {
        let (partition, expected) = three_run_partition();
        let mut all = vec![0u8; expected.len() + 100];

        assert_eq!(partition.read_at(0, &mut all).unwrap(), expected.len());
        assert_eq!(&all[..expected.len()], &expected[..]);

        let mut tail = [0u8; 64];
        assert_eq!(partition.read_at(expected.len() as u64 - 10, &mut tail).unwrap(), 10);
        assert_eq!(partition.read_at(expected.len() as u64, &mut tail).unwrap(), 0);
    }

    #[test]
    fn reuses_and_reopens_decoder() {
        let (partition, expected) = three_run_partition();
        let mut buf = [0u8; 100];

        // Forward within the compressed run, then backwards.
        for offset in [20 * 512, 20 * 512 + 1000, 25 * 512, 20 * 512 + 3] {
            partition.read_exact_at(offset, &mut buf).unwrap();
            assert_eq!(&buf[..], &expected[offset as usize..offset as usize + 100]);
        }
    }

    #[test]
    fn advises_whole_compressed_runs() {
        let (partition, _) = three_run_partition();

        assert_eq!(partition.advise_optimal_block(25 * 512), 20 * 512..30 * 512);
        assert_eq!(partition.advise_optimal_block(5000), 4096..8192);
    }

    #[test]
    fn lookup_before_first_run_is_an_error() {
        let runs = [run(RunType::ZeroFill, 4, 4, 0, 0)];
        let table = BlkxTable::from_bytes(&blkx_table_bytes(0, 8, &runs)).unwrap();
        let partition = DmgPartition::new(Arc::new(MemoryReader::new(Vec::new())), Arc::new(table));
        let mut buf = [0u8; 16];

        assert!(partition.read_at(0, &mut buf).is_err());
        partition.read_exact_at(4 * 512, &mut buf).unwrap();
    }

    #[test]
    fn lookup_between_runs_is_an_error() {
        let runs = [
            run(RunType::ZeroFill, 0, 4, 0, 0),
            run(RunType::ZeroFill, 8, 4, 0, 0),
        ];
        let table = BlkxTable::from_bytes(&blkx_table_bytes(0, 12, &runs)).unwrap();
        let partition = DmgPartition::new(Arc::new(MemoryReader::new(Vec::new())), Arc::new(table));
        let mut buf = [0u8; 16];

        assert!(partition.read_at(5 * 512, &mut buf).is_err());
        assert!(partition.read_exact_at(4 * 512 - 8, &mut buf).is_err());
        partition.read_exact_at(3 * 512, &mut buf).unwrap();
        partition.read_exact_at(8 * 512, &mut buf).unwrap();
    }

    #[test]
    fn unknown_run_type_is_unsupported() {
        let runs = [run(RunType::Other(0x80000008), 0, 1, 0, 0)];
        let table = BlkxTable::from_bytes(&blkx_table_bytes(0, 1, &runs)).unwrap();
        let partition = DmgPartition::new(Arc::new(MemoryReader::new(Vec::new())), Arc::new(table));
        let mut buf = [0u8; 16];

        let err = partition.read_at(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
