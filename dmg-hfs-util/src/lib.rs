//! Library for inspecting and extracting HFS+ volumes stored in disk images.
//!
//! An image is either a UDIF (`.dmg`) file holding an `Apple_HFS` or
//! `Apple_HFSX` partition, or a bare volume. [`open_image()`] tells them apart
//! by the `koly` trailer and returns an [`Image`] ready for path-based access.
//!
//! # Example
//!
//! ```no_run
//! use dmg_hfs_util::{OpenOptions, SilentProgress, VolumeExtractor, open_image};
//!
//! let image = open_image("installer.dmg".as_ref(), &OpenOptions::default()).expect("failed to open image");
//! let extractor = VolumeExtractor::new(image.filesystem(), SilentProgress, false);
//! extractor.extract("output/").expect("extraction failed");
//! ```
//!
//! # Custom progress reporting
//!
//! Implement the [`ExtractProgress`] trait to receive per-file updates during
//! extraction.

pub mod extract;
pub mod progress;

pub use self::extract::{ExtractError, VolumeExtractor};
pub use self::progress::{ExtractProgress, SilentProgress};

#[cfg(feature = "cli")]
pub use self::progress::ConsoleProgress;

use dmg_hfs::dmg::{DmgConfig, DmgDisk, PartitionInfo};
use dmg_hfs::hfs::{Filesystem, HfsVolume, VolumeConfig};
use dmg_hfs::reader::{FileReader, MemoryReader, Reader};
use log::info;
use snafu::{OptionExt, ResultExt, Snafu};
use std::path::Path;
use std::sync::Arc;

/// Errors that can occur when opening an image.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum OpenImageError {
    #[snafu(display("failed to open file"))]
    OpenFile { source: std::io::Error },

    #[snafu(display("failed to memory map file"))]
    MmapFile { source: std::io::Error },

    #[snafu(display("failed to parse UDIF image"))]
    OpenDmg { source: dmg_hfs::dmg::OpenError },

    #[snafu(display("image has no HFS+ partition"))]
    NoHfsPartition,

    #[snafu(display("cannot open partition"))]
    OpenPartition {
        source: dmg_hfs::dmg::PartitionError,
    },

    #[snafu(display("failed to open HFS+ volume"))]
    OpenVolume { source: dmg_hfs::hfs::Error },
}

/// Settings for [`open_image()`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Partition to open in a UDIF image; the first HFS+ partition if unset.
    pub partition: Option<usize>,
    pub dmg: DmgConfig,
    pub volume: VolumeConfig,
}

/// An opened image: the UDIF container, if any, and the volume in it.
#[derive(Debug)]
pub struct Image {
    disk: Option<(DmgDisk, usize)>,
    filesystem: Filesystem,
}

impl Image {
    /// The UDIF container, absent for a bare volume.
    pub fn disk(&self) -> Option<&DmgDisk> {
        self.disk.as_ref().map(|(disk, _)| disk)
    }

    /// The partition holding the volume, absent for a bare volume.
    pub fn partition(&self) -> Option<&PartitionInfo> {
        self.disk
            .as_ref()
            .and_then(|(disk, index)| disk.partitions().get(*index))
    }

    #[must_use]
    pub fn partition_index(&self) -> Option<usize> {
        self.disk.as_ref().map(|(_, index)| *index)
    }

    pub fn filesystem(&self) -> &Filesystem {
        &self.filesystem
    }
}

/// Opens the volume in `reader`, looking inside it first if it is a UDIF
/// image.
pub fn open_reader(reader: Arc<dyn Reader>, options: &OpenOptions) -> Result<Image, OpenImageError> {
    let (volume_reader, disk) = if DmgDisk::is_dmg(reader.as_ref()) {
        let disk = DmgDisk::open_with_config(reader, &options.dmg).context(OpenDmgSnafu)?;
        let index = match options.partition {
            Some(index) => index,
            None => disk.find_hfs_partition().context(NoHfsPartitionSnafu)?,
        };

        info!("using partition #{index}");

        (
            disk.reader_for_partition(index).context(OpenPartitionSnafu)?,
            Some((disk, index)),
        )
    } else {
        (reader, None)
    };

    let volume = HfsVolume::open_with_config(volume_reader, &options.volume).context(OpenVolumeSnafu)?;
    let filesystem = Filesystem::new(Arc::new(volume)).context(OpenVolumeSnafu)?;

    Ok(Image { disk, filesystem })
}

/// Opens an image file with positional reads.
pub fn open_image(path: &Path, options: &OpenOptions) -> Result<Image, OpenImageError> {
    let file = FileReader::open(path).context(OpenFileSnafu)?;

    open_reader(Arc::new(file), options)
}

/// Opens an image file through a memory map.
///
/// # Safety
///
/// This function uses `unsafe` internally to create a memory map. The caller
/// must ensure the file is not modified or truncated while the returned
/// `Image` is in use.
pub unsafe fn open_image_mmap(path: &Path, options: &OpenOptions) -> Result<Image, OpenImageError> {
    let file = std::fs::File::open(path).context(OpenFileSnafu)?;
    let raw = unsafe { memmap2::Mmap::map(&file).context(MmapFileSnafu)? };

    open_reader(Arc::new(MemoryReader::new(raw)), options)
}
