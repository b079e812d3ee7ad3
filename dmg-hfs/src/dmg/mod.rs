//! UDIF (`.dmg`) disk images.
//!
//! A UDIF image stores its partitions as tables of runs, each run either raw,
//! zero-filled, or compressed with one of several codecs. The tables are
//! listed in an XML property list located through the `koly` trailer at the
//! end of the file.

use crate::cache::{CacheZone, CachedReader};
use crate::reader::Reader;
use log::{debug, info};
use plist::Value;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use std::io::Cursor;
use std::sync::Arc;

pub mod adc;
pub mod decompressor;
pub mod partition;
pub mod udif;

pub use self::partition::DmgPartition;
pub use self::udif::{BlkxRun, BlkxTable, RunType, SECTOR_SIZE, Trailer};

/// Largest XML property list accepted.
const MAX_XML_LENGTH: u64 = 64 * 1024 * 1024;

/// Errors for [`DmgDisk::open()`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("image is too small to hold a UDIF trailer"))]
    TooSmall,

    #[snafu(display("cannot read UDIF trailer"))]
    ReadTrailer { source: std::io::Error },

    #[snafu(display("cannot parse UDIF trailer"))]
    ParseTrailer { source: udif::ParseError },

    #[snafu(display("property list of {length} bytes at {offset:#x} is out of range"))]
    InvalidPlistRange { offset: u64, length: u64 },

    #[snafu(display("cannot read property list"))]
    ReadPlist { source: std::io::Error },

    #[snafu(display("cannot parse property list"))]
    ParsePlist { source: plist::Error },

    #[snafu(display("property list has no resource-fork/blkx array"))]
    NoBlkxArray,

    #[snafu(display("blkx entry #{entry} is invalid: {reason}"))]
    InvalidEntry { entry: usize, reason: &'static str },

    #[snafu(display("cannot parse block table of blkx entry #{entry}"))]
    ParseTable {
        entry: usize,
        source: udif::ParseError,
    },
}

/// Errors for [`DmgDisk::reader_for_partition()`].
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum PartitionError {
    #[snafu(display("partition #{index} does not exist"))]
    NotFound { index: usize },
}

/// Settings for [`DmgDisk::open_with_config()`].
#[derive(Debug, Clone)]
pub struct DmgConfig {
    /// Capacity of the cache zone shared by all partition readers, in 4 KiB
    /// blocks.
    pub cache_blocks: usize,
}

impl Default for DmgConfig {
    fn default() -> Self {
        Self {
            cache_blocks: 16384,
        }
    }
}

/// A partition as described by the image's property list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Human-readable name, e.g. `disk image`.
    pub name: String,
    /// Partition type, e.g. `Apple_HFS`.
    pub kind: String,
    /// Offset of the partition within the decoded disk, in bytes.
    pub offset: u64,
    /// Size of the partition in bytes.
    pub size: u64,
}

impl PartitionInfo {
    /// Returns `true` for partition types that hold an HFS+ or HFSX volume.
    #[must_use]
    pub fn is_hfs(&self) -> bool {
        matches!(self.kind.as_str(), "Apple_HFS" | "Apple_HFSX")
    }
}

/// An opened UDIF image.
///
/// Partition readers share one [`CacheZone`], so decoded runs are kept across
/// reads of the same partition.
#[must_use]
pub struct DmgDisk {
    reader: Arc<dyn Reader>,
    trailer: Trailer,
    partitions: Vec<PartitionInfo>,
    tables: Vec<Arc<BlkxTable>>,
    zone: Arc<CacheZone>,
}

impl std::fmt::Debug for DmgDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmgDisk")
            .field("trailer", &self.trailer)
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

impl DmgDisk {
    /// Returns `true` if `reader` ends with a UDIF trailer.
    #[must_use]
    pub fn is_dmg(reader: &dyn Reader) -> bool {
        let len = reader.len();

        if len < udif::TRAILER_SIZE {
            return false;
        }

        let mut signature = [0u8; 4];

        reader
            .read_exact_at(len - udif::TRAILER_SIZE, &mut signature)
            .is_ok()
            && &signature == b"koly"
    }

    /// Opens a UDIF image with the default [`DmgConfig`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// use dmg_hfs::dmg::DmgDisk;
    /// use dmg_hfs::reader::FileReader;
    /// use std::sync::Arc;
    ///
    /// let disk = DmgDisk::open(Arc::new(FileReader::open("image.dmg")?))?;
    ///
    /// for (i, partition) in disk.partitions().iter().enumerate() {
    ///     println!("#{i}: {} ({})", partition.name, partition.kind);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn open(reader: Arc<dyn Reader>) -> Result<Self, OpenError> {
        Self::open_with_config(reader, &DmgConfig::default())
    }

    pub fn open_with_config(reader: Arc<dyn Reader>, config: &DmgConfig) -> Result<Self, OpenError> {
        let len = reader.len();

        ensure!(len >= udif::TRAILER_SIZE, TooSmallSnafu);

        let mut raw = [0u8; udif::TRAILER_SIZE as usize];

        reader
            .read_exact_at(len - udif::TRAILER_SIZE, &mut raw)
            .context(ReadTrailerSnafu)?;

        let trailer = Trailer::from_bytes(&raw).context(ParseTrailerSnafu)?;

        // Read the property list.
        let (offset, length) = (trailer.xml_offset(), trailer.xml_length());

        ensure!(
            length <= MAX_XML_LENGTH && offset.checked_add(length).is_some_and(|end| end <= len),
            InvalidPlistRangeSnafu { offset, length }
        );

        let mut xml = vec![0u8; length as usize];

        reader.read_exact_at(offset, &mut xml).context(ReadPlistSnafu)?;

        let plist = Value::from_reader_xml(Cursor::new(xml)).context(ParsePlistSnafu)?;
        let (partitions, tables) = load_partitions(&plist)?;

        info!(
            "opened UDIF image: {} bytes, {} partitions",
            len,
            partitions.len()
        );

        Ok(Self {
            reader,
            trailer,
            partitions,
            tables,
            zone: Arc::new(CacheZone::new(config.cache_blocks)),
        })
    }

    pub fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    /// Returns the block table of partition `index`.
    pub fn partition_table(&self, index: usize) -> Option<&BlkxTable> {
        self.tables.get(index).map(|t| t.as_ref())
    }

    /// Returns the index of the first partition holding an HFS+ or HFSX
    /// volume.
    #[must_use]
    pub fn find_hfs_partition(&self) -> Option<usize> {
        self.partitions.iter().position(PartitionInfo::is_hfs)
    }

    /// Returns the cache zone shared by the partition readers.
    pub fn zone(&self) -> &Arc<CacheZone> {
        &self.zone
    }

    /// Creates a cached reader over the decoded bytes of partition `index`.
    pub fn reader_for_partition(&self, index: usize) -> Result<Arc<dyn Reader>, PartitionError> {
        let table = self.tables.get(index).context(NotFoundSnafu { index })?;
        let partition = DmgPartition::new(self.reader.clone(), table.clone());

        debug!(
            "partition #{index}: {} runs, {} bytes",
            table.runs().len(),
            partition.len()
        );

        Ok(Arc::new(CachedReader::new(
            Arc::new(partition),
            self.zone.clone(),
            format!("partition-{index}"),
        )))
    }
}

/// Splits `"name (type : n)"` into name and type.
fn parse_name_and_type(value: &str) -> (String, String) {
    let Some(paren) = value.find('(') else {
        return (value.trim().to_owned(), String::new());
    };

    let name = value[..paren].trim().to_owned();
    let rest = &value[paren + 1..];
    let kind = match rest.find(':') {
        Some(colon) => rest[..colon].trim(),
        None => rest.trim_end_matches(')').trim(),
    };

    (name, kind.to_owned())
}

fn entry_id(dict: &plist::Dictionary) -> Option<i64> {
    match dict.get("ID")? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Integer(n) => n.as_signed(),
        _ => None,
    }
}

fn load_partitions(plist: &Value) -> Result<(Vec<PartitionInfo>, Vec<Arc<BlkxTable>>), OpenError> {
    let entries = plist
        .as_dictionary()
        .and_then(|d| d.get("resource-fork"))
        .and_then(Value::as_dictionary)
        .and_then(|d| d.get("blkx"))
        .and_then(Value::as_array)
        .context(NoBlkxArraySnafu)?;

    let mut partitions = Vec::new();
    let mut tables = Vec::new();

    for (entry, value) in entries.iter().enumerate() {
        let dict = value.as_dictionary().context(InvalidEntrySnafu {
            entry,
            reason: "not a dictionary",
        })?;

        let id = entry_id(dict).context(InvalidEntrySnafu {
            entry,
            reason: "missing ID",
        })?;

        // Negative IDs describe the driver descriptor map.
        if id < 0 {
            continue;
        }

        let name = dict
            .get("Name")
            .or_else(|| dict.get("CFName"))
            .and_then(Value::as_string)
            .context(InvalidEntrySnafu {
                entry,
                reason: "missing Name",
            })?;

        let data = dict
            .get("Data")
            .and_then(Value::as_data)
            .context(InvalidEntrySnafu {
                entry,
                reason: "missing Data",
            })?;

        let table = BlkxTable::from_bytes(data).context(ParseTableSnafu { entry })?;
        let (name, kind) = parse_name_and_type(name);

        partitions.push(PartitionInfo {
            name,
            kind,
            offset: table.first_sector() * SECTOR_SIZE,
            size: table.sector_count() * SECTOR_SIZE,
        });
        tables.push(Arc::new(table));
    }

    Ok((partitions, tables))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::DmgBuilder;

    #[test]
    fn parses_partition_names() {
        assert_eq!(
            parse_name_and_type("Apple (Apple_partition_map : 1)"),
            ("Apple".to_owned(), "Apple_partition_map".to_owned())
        );
        assert_eq!(
            parse_name_and_type("disk image (Apple_HFS : 4)"),
            ("disk image".to_owned(), "Apple_HFS".to_owned())
        );
        assert_eq!(
            parse_name_and_type("Protective Master Boot Record (MBR : 0)"),
            ("Protective Master Boot Record".to_owned(), "MBR".to_owned())
        );
        assert_eq!(
            parse_name_and_type("whole disk"),
            ("whole disk".to_owned(), String::new())
        );
    }

    #[test]
    fn opens_image_and_reads_partitions() {
        let first: Vec<u8> = (0..40_000u32).map(|i| (i % 241) as u8).collect();
        let second: Vec<u8> = (0..9000u32).map(|i| (i % 3) as u8).collect();

        let image = DmgBuilder::new()
            .partition("first (Apple_Free : 1)", &first, 8)
            .partition("second (Apple_HFS : 2)", &second, 3)
            .build();
        let reader: Arc<dyn Reader> = Arc::new(crate::reader::MemoryReader::new(image));

        assert!(DmgDisk::is_dmg(reader.as_ref()));

        let disk = DmgDisk::open(reader).unwrap();

        assert_eq!(disk.partitions().len(), 2);
        assert_eq!(disk.partitions()[1].name, "second");
        assert_eq!(disk.partitions()[1].kind, "Apple_HFS");
        assert_eq!(disk.find_hfs_partition(), Some(1));

        for (index, expected) in [(0usize, &first), (1, &second)] {
            let partition = disk.reader_for_partition(index).unwrap();
            let padded = expected.len().div_ceil(512) * 512;
            let mut out = vec![0xffu8; padded];

            assert_eq!(partition.len(), padded as u64);
            partition.read_exact_at(0, &mut out).unwrap();
            assert_eq!(&out[..expected.len()], &expected[..]);
            assert!(out[expected.len()..].iter().all(|&b| b == 0));
        }

        assert!(disk.reader_for_partition(2).is_err());
        assert!(!disk.zone().is_empty());
    }

    #[test]
    fn rejects_non_udif() {
        let reader: Arc<dyn Reader> = Arc::new(crate::reader::MemoryReader::new(vec![0u8; 4096]));

        assert!(!DmgDisk::is_dmg(reader.as_ref()));
        assert!(matches!(
            DmgDisk::open(reader),
            Err(OpenError::ParseTrailer { .. })
        ));
    }
}
