//! On-disk UDIF structures: the `koly` trailer and `mish` block tables.

use snafu::{OptionExt, Snafu, ensure};
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

/// Size of a UDIF sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Size of the `koly` trailer at the end of an image.
pub const TRAILER_SIZE: u64 = 512;

const KOLY_SIGNATURE: &[u8; 4] = b"koly";
const MISH_SIGNATURE: &[u8; 4] = b"mish";

/// Errors when parsing UDIF structures from bytes.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseError {
    #[snafu(display("buffer is too short ({len} bytes)"))]
    TooShort { len: usize },

    #[snafu(display("invalid signature {signature:02x?}"))]
    InvalidSignature { signature: [u8; 4] },

    #[snafu(display("table declares {count} runs but holds only {available}"))]
    TruncatedRuns { count: u32, available: usize },

    #[snafu(display("sectors {start}+{count} do not fit in a 64-bit byte offset"))]
    SectorOverflow { start: u64, count: u64 },

    #[snafu(display("run #{run} data at {offset:#x}+{length:#x} does not fit in a 64-bit offset"))]
    DataOverflow { run: usize, offset: u64, length: u64 },
}

/// Returns the byte offset one past `count` sectors from `start`.
fn sector_span_end(start: u64, count: u64) -> Result<u64, ParseError> {
    start
        .checked_add(count)
        .and_then(|end| end.checked_mul(SECTOR_SIZE))
        .context(SectorOverflowSnafu { start, count })
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct ChecksumRaw {
    _kind: U32,
    _size: U32,
    _data: [U32; 32],
}

/// The `koly` trailer (512 bytes).
#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct KolyRaw {
    signature: [u8; 4],            // 0x000
    version: U32,                  // 0x004
    _header_size: U32,             // 0x008
    flags: U32,                    // 0x00C
    _running_data_fork: U64,       // 0x010
    data_fork_offset: U64,         // 0x018
    data_fork_length: U64,         // 0x020
    _rsrc_fork_offset: U64,        // 0x028
    _rsrc_fork_length: U64,        // 0x030
    _segment_number: U32,          // 0x038
    _segment_count: U32,           // 0x03C
    _segment_id: [u8; 16],         // 0x040
    _data_checksum: ChecksumRaw,   // 0x050
    xml_offset: U64,               // 0x0D8
    xml_length: U64,               // 0x0E0
    _reserved1: [u8; 120],         // 0x0E8
    _master_checksum: ChecksumRaw, // 0x160
    image_variant: U32,            // 0x1E8
    sector_count: U64,             // 0x1EC
    _reserved2: [U32; 3],          // 0x1F4
}

/// Header of a `mish` block table (204 bytes), followed by the runs.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct BlkxTableRaw {
    signature: [u8; 4],
    _info_version: U32,
    first_sector: U64,
    sector_count: U64,
    data_start: U64,
    decompress_buffer_requested: U32,
    _blocks_descriptor: U32,
    _reserved: [U32; 6],
    _checksum: ChecksumRaw,
    run_count: U32,
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct BlkxRunRaw {
    kind: U32,
    _reserved: U32,
    sector_start: U64,
    sector_count: U64,
    comp_offset: U64,
    comp_length: U64,
}

/// Parsed `koly` trailer.
#[derive(Debug, Clone, Copy)]
pub struct Trailer {
    version: u32,
    flags: u32,
    data_fork_offset: u64,
    data_fork_length: u64,
    xml_offset: u64,
    xml_length: u64,
    image_variant: u32,
    sector_count: u64,
}

impl Trailer {
    pub(crate) fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        let (raw, _) =
            KolyRaw::read_from_prefix(data).map_err(|_| TooShortSnafu { len: data.len() }.build())?;

        ensure!(
            &raw.signature == KOLY_SIGNATURE,
            InvalidSignatureSnafu {
                signature: raw.signature
            }
        );

        Ok(Self {
            version: raw.version.get(),
            flags: raw.flags.get(),
            data_fork_offset: raw.data_fork_offset.get(),
            data_fork_length: raw.data_fork_length.get(),
            xml_offset: raw.xml_offset.get(),
            xml_length: raw.xml_length.get(),
            image_variant: raw.image_variant.get(),
            sector_count: raw.sector_count.get(),
        })
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[must_use]
    pub fn data_fork_offset(&self) -> u64 {
        self.data_fork_offset
    }

    #[must_use]
    pub fn data_fork_length(&self) -> u64 {
        self.data_fork_length
    }

    /// Offset of the XML property list describing the partitions.
    #[must_use]
    pub fn xml_offset(&self) -> u64 {
        self.xml_offset
    }

    #[must_use]
    pub fn xml_length(&self) -> u64 {
        self.xml_length
    }

    #[must_use]
    pub fn image_variant(&self) -> u32 {
        self.image_variant
    }

    /// Number of sectors in the whole decoded disk.
    #[must_use]
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }
}

/// How the bytes of one run are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunType {
    ZeroFill,
    Raw,
    Unknown,
    Adc,
    Zlib,
    Bzip2,
    Lzfse,
    Comment,
    Terminator,
    Other(u32),
}

impl RunType {
    /// Returns `true` if reading the run requires a decompressor.
    #[must_use]
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Adc | Self::Zlib | Self::Bzip2 | Self::Lzfse)
    }

    /// Returns `true` for run types that carry no sectors.
    #[must_use]
    pub fn is_marker(self) -> bool {
        matches!(self, Self::Comment | Self::Terminator)
    }

    #[must_use]
    pub fn to_raw(self) -> u32 {
        match self {
            Self::ZeroFill => 0,
            Self::Raw => 1,
            Self::Unknown => 2,
            Self::Adc => 0x80000004,
            Self::Zlib => 0x80000005,
            Self::Bzip2 => 0x80000006,
            Self::Lzfse => 0x80000007,
            Self::Comment => 0x7ffffffe,
            Self::Terminator => 0xffffffff,
            Self::Other(v) => v,
        }
    }
}

impl From<u32> for RunType {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::ZeroFill,
            1 => Self::Raw,
            2 => Self::Unknown,
            0x80000004 => Self::Adc,
            0x80000005 => Self::Zlib,
            0x80000006 => Self::Bzip2,
            0x80000007 => Self::Lzfse,
            0x7ffffffe => Self::Comment,
            0xffffffff => Self::Terminator,
            v => Self::Other(v),
        }
    }
}

/// One run of a block table.
///
/// Sector numbers are relative to the start of the partition; the compressed
/// offset is relative to the table's data start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkxRun {
    pub kind: RunType,
    pub sector_start: u64,
    pub sector_count: u64,
    pub comp_offset: u64,
    pub comp_length: u64,
}

impl BlkxRun {
    /// Returns the first sector after this run.
    ///
    /// Never overflows for runs of a parsed [`BlkxTable`].
    #[must_use]
    pub fn sector_end(&self) -> u64 {
        self.sector_start + self.sector_count
    }
}

/// A parsed `mish` block table describing one partition.
#[derive(Debug, Clone)]
pub struct BlkxTable {
    first_sector: u64,
    sector_count: u64,
    data_start: u64,
    decompress_buffer_requested: u32,
    runs: Vec<BlkxRun>,
}

impl BlkxTable {
    /// Parses a block table, checking that every declared run is present.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        let (raw, rest) = BlkxTableRaw::read_from_prefix(data)
            .map_err(|_| TooShortSnafu { len: data.len() }.build())?;

        ensure!(
            &raw.signature == MISH_SIGNATURE,
            InvalidSignatureSnafu {
                signature: raw.signature
            }
        );

        let count = raw.run_count.get();
        let available = rest.len() / size_of::<BlkxRunRaw>();

        ensure!(
            count as usize <= available,
            TruncatedRunsSnafu { count, available }
        );

        let runs: Vec<BlkxRun> = rest
            .chunks_exact(size_of::<BlkxRunRaw>())
            .take(count as usize)
            .filter_map(|chunk| BlkxRunRaw::read_from_bytes(chunk).ok())
            .map(|run| BlkxRun {
                kind: run.kind.get().into(),
                sector_start: run.sector_start.get(),
                sector_count: run.sector_count.get(),
                comp_offset: run.comp_offset.get(),
                comp_length: run.comp_length.get(),
            })
            .collect();

        // Readers multiply sectors into bytes and add run offsets without
        // further checks.
        let data_start = raw.data_start.get();

        sector_span_end(raw.first_sector.get(), raw.sector_count.get())?;

        for (i, run) in runs.iter().enumerate() {
            sector_span_end(run.sector_start, run.sector_count)?;

            let length = run.comp_length.max(run.sector_count * SECTOR_SIZE);

            data_start
                .checked_add(run.comp_offset)
                .and_then(|offset| offset.checked_add(length))
                .context(DataOverflowSnafu {
                    run: i,
                    offset: run.comp_offset,
                    length,
                })?;
        }

        Ok(Self {
            first_sector: raw.first_sector.get(),
            sector_count: raw.sector_count.get(),
            data_start,
            decompress_buffer_requested: raw.decompress_buffer_requested.get(),
            runs,
        })
    }

    /// First sector of the partition within the decoded disk.
    #[must_use]
    pub fn first_sector(&self) -> u64 {
        self.first_sector
    }

    #[must_use]
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    /// Offset added to every run's compressed offset.
    #[must_use]
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// Largest decompressed run size the writer asked readers to budget for,
    /// in sectors.
    #[must_use]
    pub fn decompress_buffer_requested(&self) -> u32 {
        self.decompress_buffer_requested
    }

    pub fn runs(&self) -> &[BlkxRun] {
        &self.runs
    }
}
