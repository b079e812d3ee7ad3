use crate::cache::{BLOCK_SIZE, CacheZone};
use crate::hfs::attributes::AttributeTree;
use crate::hfs::catalog::{ATTRIBUTES_FILE_ID, CATALOG_FILE_ID, CatalogTree, EXTENTS_FILE_ID};
use crate::hfs::extents::ExtentsOverflowTree;
use crate::hfs::fork::HfsFork;
use crate::hfs::ondisk::{
    ForkData, MasterDirectoryBlockRaw, SIGNATURE_HFS, SIGNATURE_HFS_PLUS, SIGNATURE_HFSX,
    VOLUME_HEADER_OFFSET, VolumeHeaderRaw,
};
use crate::hfs::{Error, InvalidBlockSizeSnafu, InvalidSignatureSnafu, PlainHfsSnafu, ReadSnafu};
use crate::reader::{Reader, SubReader};
use log::{debug, info};
use snafu::{ResultExt, ensure};
use std::sync::Arc;
use zerocopy::FromBytes;

/// Volumes smaller than this get their cache zones capped to half their
/// size.
const SMALL_VOLUME: u64 = 50 * 1024 * 1024;

/// Sector size used by the HFS wrapper's allocation block start.
const WRAPPER_SECTOR_SIZE: u64 = 512;

/// Settings for [`HfsVolume::open_with_config()`].
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Capacity of the zone caching file data, in 4 KiB blocks.
    pub file_cache_blocks: usize,
    /// Capacity of the zone caching B-tree nodes, in 4 KiB blocks.
    pub tree_cache_blocks: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            file_cache_blocks: 16384,
            tree_cache_blocks: 4096,
        }
    }
}

/// An opened HFS+ or HFSX volume.
#[must_use]
pub struct HfsVolume {
    reader: Arc<dyn Reader>,
    header: VolumeHeaderRaw,
    embedded_offset: u64,
    file_zone: Arc<CacheZone>,
    tree_zone: Arc<CacheZone>,
    overflow: Arc<ExtentsOverflowTree>,
    attributes: Option<AttributeTree>,
}

impl std::fmt::Debug for HfsVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfsVolume")
            .field("hfsx", &self.is_hfsx())
            .field("block_size", &self.block_size())
            .field("total_blocks", &self.header.total_blocks.get())
            .field("embedded_offset", &self.embedded_offset)
            .finish_non_exhaustive()
    }
}

fn read_header(reader: &dyn Reader) -> Result<[u8; 512], Error> {
    let mut raw = [0u8; 512];

    reader
        .read_exact_at(VOLUME_HEADER_OFFSET, &mut raw)
        .context(ReadSnafu {
            what: "volume header",
            offset: VOLUME_HEADER_OFFSET,
        })?;

    Ok(raw)
}

/// Finds the HFS+ volume embedded in an HFS wrapper volume.
fn unwrap_embedded(reader: &Arc<dyn Reader>, raw: &[u8]) -> Result<SubReader, Error> {
    let (mdb, _) = MasterDirectoryBlockRaw::read_from_prefix(raw).map_err(|_| PlainHfsSnafu.build())?;

    ensure!(mdb.embed_signature.get() == SIGNATURE_HFS_PLUS, PlainHfsSnafu);

    let block_size = u64::from(mdb.allocation_block_size.get());
    let offset = u64::from(mdb.allocation_block_start.get()) * WRAPPER_SECTOR_SIZE
        + u64::from(mdb.embed_start_block.get()) * block_size;
    let len = u64::from(mdb.embed_block_count.get()) * block_size;

    debug!("HFS wrapper: embedded volume at {offset:#x}, {len} bytes");

    Ok(SubReader::new(reader.clone(), offset, len))
}

impl HfsVolume {
    /// Opens the volume in `reader` with the default [`VolumeConfig`].
    pub fn open(reader: Arc<dyn Reader>) -> Result<Self, Error> {
        Self::open_with_config(reader, &VolumeConfig::default())
    }

    pub fn open_with_config(reader: Arc<dyn Reader>, config: &VolumeConfig) -> Result<Self, Error> {
        let mut raw = read_header(reader.as_ref())?;
        let mut reader = reader;
        let mut embedded_offset = 0;

        if u16::from_be_bytes([raw[0], raw[1]]) == SIGNATURE_HFS {
            let embedded = unwrap_embedded(&reader, &raw)?;

            embedded_offset = embedded.offset();
            reader = Arc::new(embedded);
            raw = read_header(reader.as_ref())?;
        }

        let (header, _) = VolumeHeaderRaw::read_from_prefix(&raw)
            .map_err(|_| InvalidSignatureSnafu { signature: 0u16 }.build())?;
        let signature = header.signature.get();

        ensure!(
            signature == SIGNATURE_HFS_PLUS || signature == SIGNATURE_HFSX,
            InvalidSignatureSnafu { signature }
        );

        let block_size = header.block_size.get();

        ensure!(
            block_size >= 512 && block_size.is_power_of_two(),
            InvalidBlockSizeSnafu { block_size }
        );

        let volume_size = u64::from(block_size) * u64::from(header.total_blocks.get());
        let (mut file_blocks, mut tree_blocks) = (config.file_cache_blocks, config.tree_cache_blocks);

        if volume_size < SMALL_VOLUME {
            let cap = ((volume_size / BLOCK_SIZE / 2) as usize).max(1);

            file_blocks = file_blocks.min(cap);
            tree_blocks = tree_blocks.min(cap);
        }

        let tree_zone = Arc::new(CacheZone::new(tree_blocks));
        let extents_fork = HfsFork::new(
            reader.clone(),
            block_size,
            &ForkData::from(&header.extents_file),
            EXTENTS_FILE_ID,
            false,
            None,
        );
        let overflow = Arc::new(ExtentsOverflowTree::open(Arc::new(extents_fork), tree_zone.clone())?);

        let attributes_file = ForkData::from(&header.attributes_file);
        let attributes = if attributes_file.logical_size > 0 {
            let fork = HfsFork::new(
                reader.clone(),
                block_size,
                &attributes_file,
                ATTRIBUTES_FILE_ID,
                false,
                Some(overflow.clone()),
            );

            Some(AttributeTree::open(Arc::new(fork), tree_zone.clone())?)
        } else {
            None
        };

        info!(
            "opened {} volume: {} blocks of {} bytes, {} files, {} folders",
            if signature == SIGNATURE_HFSX { "HFSX" } else { "HFS+" },
            header.total_blocks.get(),
            block_size,
            header.file_count.get(),
            header.folder_count.get()
        );

        Ok(Self {
            reader,
            header,
            embedded_offset,
            file_zone: Arc::new(CacheZone::new(file_blocks)),
            tree_zone,
            overflow,
            attributes,
        })
    }

    /// Opens the catalog tree.
    pub fn root_catalog_tree(self: &Arc<Self>) -> Result<CatalogTree, Error> {
        let fork = self.open_fork(&ForkData::from(&self.header.catalog_file), CATALOG_FILE_ID, false);

        CatalogTree::open(self.clone(), fork)
    }

    /// Creates a reader over a fork of file `file_id`.
    pub fn open_fork(&self, fork: &ForkData, file_id: u32, resource_fork: bool) -> HfsFork {
        HfsFork::new(
            self.reader.clone(),
            self.block_size(),
            fork,
            file_id,
            resource_fork,
            Some(self.overflow.clone()),
        )
    }

    /// Reader over the HFS+ volume, past any HFS wrapper.
    pub fn reader(&self) -> &Arc<dyn Reader> {
        &self.reader
    }

    #[must_use]
    pub fn is_hfsx(&self) -> bool {
        self.header.signature.get() == SIGNATURE_HFSX
    }

    /// Offset of the HFS+ volume inside an HFS wrapper, 0 if not wrapped.
    #[must_use]
    pub fn embedded_offset(&self) -> u64 {
        self.embedded_offset
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.header.block_size.get()
    }

    /// Total size of the volume in bytes.
    #[must_use]
    pub fn volume_size(&self) -> u64 {
        u64::from(self.block_size()) * u64::from(self.header.total_blocks.get())
    }

    /// Returns the total and free space in bytes.
    #[must_use]
    pub fn usage(&self) -> (u64, u64) {
        let block_size = u64::from(self.block_size());

        (
            block_size * u64::from(self.header.total_blocks.get()),
            block_size * u64::from(self.header.free_blocks.get()),
        )
    }

    #[must_use]
    pub fn file_count(&self) -> u32 {
        self.header.file_count.get()
    }

    #[must_use]
    pub fn folder_count(&self) -> u32 {
        self.header.folder_count.get()
    }

    /// Creation date in seconds since 1904-01-01, local time.
    #[must_use]
    pub fn create_date(&self) -> u32 {
        self.header.create_date.get()
    }

    /// Zone caching file contents.
    pub fn file_zone(&self) -> &Arc<CacheZone> {
        &self.file_zone
    }

    /// Zone caching B-tree nodes.
    pub fn tree_zone(&self) -> &Arc<CacheZone> {
        &self.tree_zone
    }

    pub fn overflow_tree(&self) -> &Arc<ExtentsOverflowTree> {
        &self.overflow
    }

    /// The attributes tree, absent on volumes without an attributes file.
    pub fn attributes(&self) -> Option<&AttributeTree> {
        self.attributes.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hfs::ErrorKind;
    use crate::hfs::catalog::{CatalogRecord, ROOT_FOLDER_ID};
    use crate::reader::MemoryReader;
    use crate::testutil::VolumeBuilder;

    #[test]
    fn opens_volume_and_caps_small_zones() {
        let volume = HfsVolume::open(VolumeBuilder::new().build_reader()).unwrap();

        assert!(!volume.is_hfsx());
        assert_eq!(volume.block_size(), 4096);
        assert_eq!(volume.embedded_offset(), 0);
        assert!(volume.attributes().is_some());

        let cap = (volume.volume_size() / BLOCK_SIZE / 2) as usize;
        assert!(volume.volume_size() < SMALL_VOLUME);
        assert_eq!(volume.file_zone().max_blocks(), cap.max(1));
        assert_eq!(volume.tree_zone().max_blocks(), cap.max(1));

        let (total, free) = volume.usage();
        assert_eq!(total, volume.volume_size());
        assert!(free < total);
    }

    #[test]
    fn reads_fragmented_file_through_overflow_extents() {
        let mut builder = VolumeBuilder::new();
        let data: Vec<u8> = (0..12 * 4096u32).map(|i| (i % 251) as u8).collect();
        builder.fragmented_file(ROOT_FOLDER_ID, "fragmented", &data, 12);

        let volume = Arc::new(HfsVolume::open(builder.build_reader()).unwrap());
        let catalog = volume.root_catalog_tree().unwrap();
        let fork = catalog.open_file("/fragmented", false).unwrap();

        let mut out = vec![0u8; data.len()];
        fork.read_exact_at(0, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(fork.extent_count(), 12);

        let lookups = volume.overflow_tree().lookup_count();
        assert!(lookups >= 1);

        // The extent list is kept: reading again makes no new lookups.
        fork.read_exact_at(0, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(volume.overflow_tree().lookup_count(), lookups);
    }

    #[test]
    fn unwraps_embedded_volume() {
        let mut builder = VolumeBuilder::new().wrapped();
        builder.file(ROOT_FOLDER_ID, "inside", b"wrapped data");

        let volume = Arc::new(HfsVolume::open(builder.build_reader()).unwrap());
        assert!(volume.embedded_offset() > 0);

        let catalog = volume.root_catalog_tree().unwrap();
        let CatalogRecord::File(file) = catalog.stat("/inside").unwrap() else {
            panic!("expected a file");
        };
        assert_eq!(file.data_fork.logical_size, 12);
    }

    #[test]
    fn rejects_unknown_signatures() {
        let reader: Arc<dyn Reader> = Arc::new(MemoryReader::new(vec![0u8; 8192]));
        let err = HfsVolume::open(reader).unwrap_err();

        assert!(matches!(err, Error::InvalidSignature { signature: 0 }));
        assert_eq!(err.kind(), ErrorKind::Io);

        // A plain HFS volume without an embedded HFS+ volume.
        let mut data = vec![0u8; 8192];
        data[1024..1026].copy_from_slice(&SIGNATURE_HFS.to_be_bytes());
        let reader: Arc<dyn Reader> = Arc::new(MemoryReader::new(data));

        assert!(matches!(HfsVolume::open(reader), Err(Error::PlainHfs)));
    }
}
