//! Path-based access to a volume, with `stat`-like metadata and extended
//! attributes.

use crate::cache::CachedReader;
use crate::hfs::catalog::{CatalogRecord, CatalogTree};
use crate::hfs::fork::HfsFork;
use crate::hfs::ondisk::{OWNER_FLAG_COMPRESSED, SYMLINK_FILE_TYPE};
use crate::hfs::volume::HfsVolume;
use crate::hfs::{
    AttributeNotFoundSnafu, Error, ErrorKind, NoAttributesFileSnafu, NotPermittedSnafu, ReadSnafu,
    UnsupportedSnafu,
};
use crate::reader::Reader;
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Path suffix selecting the resource fork of a file.
pub const RESOURCE_FORK_SUFFIX: &str = "#..namedfork#rsrc";

pub const XATTR_RESOURCE_FORK: &str = "com.apple.ResourceFork";
pub const XATTR_FINDER_INFO: &str = "com.apple.FinderInfo";

/// Attribute holding the header of a decmpfs-compressed file.
const XATTR_DECMPFS: &str = "com.apple.decmpfs";
const DECMPFS_MAGIC: u32 = u32::from_le_bytes(*b"fpmc");

/// Seconds between 1904-01-01 and 1970-01-01.
const APPLE_EPOCH_OFFSET: u32 = 2_082_844_800;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFBLK: u32 = 0o060000;

/// Converts an HFS+ timestamp to seconds since the Unix epoch. Zero stays
/// zero.
#[must_use]
pub fn apple_to_unix_time(time: u32) -> i64 {
    if time == 0 {
        0
    } else {
        i64::from(time.wrapping_sub(APPLE_EPOCH_OFFSET))
    }
}

/// Metadata of a file or folder, in the shape of `struct stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Catalog node ID.
    pub id: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    /// Logical size of the fork in bytes.
    pub size: u64,
    /// Allocation blocks used by the fork.
    pub blocks: u64,
    pub block_size: u32,
    pub rdev: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub birthtime: i64,
}

impl FileStat {
    fn from_record(record: &CatalogRecord, resource_fork: bool) -> Self {
        let permissions = record.permissions();
        let dates = record.dates();
        let mut stat = Self {
            id: record.id(),
            mode: u32::from(permissions.file_mode),
            uid: permissions.owner_id,
            gid: permissions.group_id,
            nlink: 1,
            size: 0,
            blocks: 0,
            block_size: 512,
            rdev: 0,
            atime: apple_to_unix_time(dates.access),
            mtime: apple_to_unix_time(dates.content_mod),
            ctime: apple_to_unix_time(dates.attribute_mod),
            birthtime: apple_to_unix_time(dates.create),
        };

        if let CatalogRecord::File(file) = record {
            let fork = if resource_fork {
                &file.resource_fork
            } else {
                &file.data_fork
            };

            stat.size = fork.logical_size;
            stat.blocks = u64::from(fork.total_blocks);

            if matches!(stat.mode & S_IFMT, S_IFCHR | S_IFBLK) {
                stat.rdev = permissions.special;
            }
        }

        if stat.mode == 0 {
            stat.mode = if record.is_folder() {
                S_IFDIR | 0o555
            } else {
                S_IFREG | 0o444
            };
        }

        stat
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// Strips [`RESOURCE_FORK_SUFFIX`] from `path`.
fn split_fork(path: &str) -> (&str, bool) {
    match path.strip_suffix(RESOURCE_FORK_SUFFIX) {
        Some(path) => (path, true),
        None => (path, false),
    }
}

/// Finder info with the fields Apple does not expose zeroed: document ID,
/// date added and write generation counter.
fn visible_finder_info(record: &CatalogRecord) -> [u8; 32] {
    let mut info = record.finder_info();

    info[16..24].fill(0);
    info[28..32].fill(0);
    info
}

/// Reads a whole fork into memory.
fn read_fork(fork: &HfsFork) -> Result<Vec<u8>, Error> {
    let mut data = vec![0u8; fork.len() as usize];

    fork.read_exact_at(0, &mut data).context(ReadSnafu {
        what: "fork contents",
        offset: 0u64,
    })?;

    Ok(data)
}

/// A volume and its catalog, addressed by path.
///
/// # Example
///
/// ```no_run
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use dmg_hfs::hfs::{Filesystem, HfsVolume};
/// use dmg_hfs::reader::FileReader;
/// use std::sync::Arc;
///
/// let volume = HfsVolume::open(Arc::new(FileReader::open("volume.hfs")?))?;
/// let fs = Filesystem::new(Arc::new(volume))?;
/// let file = fs.open_file("/Applications/Foo.app/Contents/Info.plist")?;
///
/// let mut data = vec![0u8; file.len() as usize];
/// file.read_exact_at(0, &mut data)?;
/// # Ok(())
/// # }
/// ```
pub struct Filesystem {
    volume: Arc<HfsVolume>,
    catalog: CatalogTree,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    pub fn new(volume: Arc<HfsVolume>) -> Result<Self, Error> {
        let catalog = volume.root_catalog_tree()?;

        Ok(Self { volume, catalog })
    }

    pub fn volume(&self) -> &Arc<HfsVolume> {
        &self.volume
    }

    pub fn catalog(&self) -> &CatalogTree {
        &self.catalog
    }

    /// Returns the metadata of `path`, or of its resource fork when it ends
    /// with [`RESOURCE_FORK_SUFFIX`].
    pub fn stat(&self, path: &str) -> Result<FileStat, Error> {
        let (path, resource_fork) = split_fork(path);
        let record = self.catalog.stat(path)?;

        self.stat_record(&record, resource_fork)
    }

    fn stat_record(&self, record: &CatalogRecord, resource_fork: bool) -> Result<FileStat, Error> {
        let mut stat = FileStat::from_record(record, resource_fork);

        if let CatalogRecord::File(file) = record {
            if !resource_fork && stat.size == 0 && file.permissions.owner_flags & OWNER_FLAG_COMPRESSED != 0 {
                if let Some(size) = self.decmpfs_size(file.file_id)? {
                    stat.size = size;
                }
            }
        }

        Ok(stat)
    }

    /// Uncompressed size recorded in the decmpfs header of a compressed
    /// file.
    fn decmpfs_size(&self, file_id: u32) -> Result<Option<u64>, Error> {
        let Some(attributes) = self.volume.attributes() else {
            return Ok(None);
        };

        let Some(header) = attributes.get(file_id, XATTR_DECMPFS)? else {
            return Ok(None);
        };

        let (Some(magic), Some(size)) = (header.get(0..4), header.get(8..16)) else {
            return Ok(None);
        };

        if u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]) != DECMPFS_MAGIC {
            return Ok(None);
        }

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(size);

        Ok(Some(u64::from_le_bytes(bytes)))
    }

    /// Lists the folder at `path` with the metadata of each entry.
    pub fn list_directory(&self, path: &str) -> Result<BTreeMap<String, FileStat>, Error> {
        self.catalog
            .list_directory(path)?
            .into_iter()
            .map(|(name, record)| Ok((name, self.stat_record(&record, false)?)))
            .collect()
    }

    /// Opens the data fork of `path`, or its resource fork when it ends with
    /// [`RESOURCE_FORK_SUFFIX`].
    ///
    /// The returned reader caches file contents in the volume's file zone.
    pub fn open_file(&self, path: &str) -> Result<Arc<dyn Reader>, Error> {
        let (path, resource_fork) = split_fork(path);

        if !resource_fork {
            if let CatalogRecord::File(file) = self.catalog.stat(path)? {
                if file.data_fork.logical_size == 0 && file.permissions.owner_flags & OWNER_FLAG_COMPRESSED != 0 {
                    return UnsupportedSnafu {
                        what: "reading decmpfs-compressed files",
                    }
                    .fail();
                }
            }
        }

        let fork = self.catalog.open_file(path, resource_fork)?;
        let tag = format!(
            "file-{}-{}",
            fork.file_id(),
            if resource_fork { "rsrc" } else { "data" }
        );

        Ok(Arc::new(CachedReader::new(
            Arc::new(fork),
            self.volume.file_zone().clone(),
            tag,
        )))
    }

    /// Returns the target of the symbolic link at `path`.
    pub fn read_link(&self, path: &str) -> Result<String, Error> {
        let record = self.catalog.stat(path)?;
        let is_link = match &record {
            CatalogRecord::File(file) => {
                u32::from(file.permissions.file_mode) & S_IFMT == S_IFLNK || file.file_type() == SYMLINK_FILE_TYPE
            }
            CatalogRecord::Folder(_) => false,
        };

        if !is_link {
            return NotPermittedSnafu {
                path,
                operation: "readlink",
            }
            .fail();
        }

        let data = read_fork(&self.catalog.open_file(path, false)?)?;

        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Lists the extended attribute names of `path`.
    pub fn list_xattr(&self, path: &str) -> Result<Vec<String>, Error> {
        let (path, _) = split_fork(path);
        let record = self.catalog.stat(path)?;
        let mut names = Vec::new();

        if let CatalogRecord::File(file) = &record {
            if file.resource_fork.logical_size != 0 {
                names.push(XATTR_RESOURCE_FORK.to_owned());
            }
        }

        if visible_finder_info(&record) != [0u8; 32] {
            names.push(XATTR_FINDER_INFO.to_owned());
        }

        if let Some(attributes) = self.volume.attributes() {
            names.extend(attributes.get_all(record.id())?.into_keys());
        }

        Ok(names)
    }

    /// Returns the value of extended attribute `name` of `path`.
    pub fn get_xattr(&self, path: &str, name: &str) -> Result<Vec<u8>, Error> {
        let (path, _) = split_fork(path);

        match name {
            XATTR_RESOURCE_FORK => {
                let fork = match self.catalog.open_file(path, true) {
                    Ok(fork) => fork,
                    Err(e) if e.kind() == ErrorKind::IsADirectory => {
                        return NotPermittedSnafu {
                            path,
                            operation: "reading a folder's resource fork",
                        }
                        .fail();
                    }
                    Err(e) => return Err(e),
                };

                if fork.len() == 0 {
                    return AttributeNotFoundSnafu { name }.fail();
                }

                read_fork(&fork)
            }
            XATTR_FINDER_INFO => {
                let record = self.catalog.stat(path)?;

                Ok(visible_finder_info(&record).to_vec())
            }
            _ => {
                let record = self.catalog.stat(path)?;
                let attributes = self.volume.attributes().context(NoAttributesFileSnafu)?;

                attributes
                    .get(record.id(), name)?
                    .context(AttributeNotFoundSnafu { name })
            }
        }
    }

    /// Returns the total and free space of the volume in bytes.
    #[must_use]
    pub fn usage(&self) -> (u64, u64) {
        self.volume.usage()
    }

    #[must_use]
    pub fn is_hfsx(&self) -> bool {
        self.volume.is_hfsx()
    }

    #[must_use]
    pub fn volume_size(&self) -> u64 {
        self.volume.volume_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hfs::catalog::ROOT_FOLDER_ID;
    use crate::testutil::{FileOptions, VolumeBuilder};

    fn filesystem(builder: VolumeBuilder) -> Filesystem {
        let volume = HfsVolume::open(builder.build_reader()).unwrap();

        Filesystem::new(Arc::new(volume)).unwrap()
    }

    fn sample() -> Filesystem {
        let mut builder = VolumeBuilder::new();
        let docs = builder.folder(ROOT_FOLDER_ID, "Docs");

        builder.file_with(
            docs,
            "notes.txt",
            b"some notes",
            FileOptions {
                mode: 0o100640,
                uid: 501,
                gid: 20,
                resource_fork: b"resource bytes".to_vec(),
                finder_info: {
                    let mut info = [0u8; 32];
                    info[0..4].copy_from_slice(b"TEXT");
                    info[16..20].copy_from_slice(&7u32.to_be_bytes()); // document id
                    info
                },
                content_mod_date: APPLE_EPOCH_OFFSET + 1_000_000,
                ..FileOptions::default()
            },
        );
        builder.file_with(
            docs,
            "link",
            b"notes.txt",
            FileOptions {
                mode: S_IFLNK | 0o755,
                ..FileOptions::default()
            },
        );
        builder.file(docs, "plain", b"");
        builder.attribute(docs, "user.tag", b"blue");

        filesystem(builder)
    }

    #[test]
    fn converts_apple_times() {
        assert_eq!(apple_to_unix_time(0), 0);
        assert_eq!(apple_to_unix_time(APPLE_EPOCH_OFFSET), 0);
        assert_eq!(apple_to_unix_time(APPLE_EPOCH_OFFSET + 86400), 86400);
    }

    #[test]
    fn stats_files_and_forks() {
        let fs = sample();

        let stat = fs.stat("/Docs/notes.txt").unwrap();
        assert_eq!(stat.mode, 0o100640);
        assert_eq!((stat.uid, stat.gid), (501, 20));
        assert_eq!(stat.size, 10);
        assert_eq!(stat.mtime, 1_000_000);
        assert!(stat.is_file());

        let stat = fs.stat("/Docs/notes.txt#..namedfork#rsrc").unwrap();
        assert_eq!(stat.size, 14);

        let stat = fs.stat("/Docs").unwrap();
        assert!(stat.is_dir());
        assert_eq!(stat.mode, S_IFDIR | 0o555);

        let stat = fs.stat("/Docs/plain").unwrap();
        assert_eq!(stat.mode, S_IFREG | 0o444);
        assert_eq!(stat.atime, 0);
    }

    #[test]
    fn lists_and_reads_files() {
        let fs = sample();
        let entries = fs.list_directory("/Docs").unwrap();

        assert_eq!(entries.keys().collect::<Vec<_>>(), ["link", "notes.txt", "plain"]);
        assert!(entries["link"].is_symlink());

        let file = fs.open_file("/Docs/notes.txt").unwrap();
        let mut data = vec![0u8; file.len() as usize];
        file.read_exact_at(0, &mut data).unwrap();
        assert_eq!(data, b"some notes");

        let rsrc = fs.open_file("/Docs/notes.txt#..namedfork#rsrc").unwrap();
        assert_eq!(rsrc.len(), 14);

        assert_eq!(fs.read_link("/Docs/link").unwrap(), "notes.txt");
        assert_eq!(
            fs.read_link("/Docs/plain").unwrap_err().kind(),
            ErrorKind::OperationNotPermitted
        );
        assert!(!fs.volume().file_zone().is_empty());
    }

    #[test]
    fn exposes_extended_attributes() {
        let fs = sample();

        let names = fs.list_xattr("/Docs/notes.txt").unwrap();
        assert_eq!(names, [XATTR_RESOURCE_FORK, XATTR_FINDER_INFO]);

        let info = fs.get_xattr("/Docs/notes.txt", XATTR_FINDER_INFO).unwrap();
        assert_eq!(&info[0..4], b"TEXT");
        assert!(info[16..20].iter().all(|&b| b == 0));

        assert_eq!(
            fs.get_xattr("/Docs/notes.txt", XATTR_RESOURCE_FORK).unwrap(),
            b"resource bytes"
        );
        assert_eq!(fs.list_xattr("/Docs").unwrap(), ["user.tag"]);
        assert_eq!(fs.get_xattr("/Docs", "user.tag").unwrap(), b"blue");

        let err = fs.get_xattr("/Docs", XATTR_RESOURCE_FORK).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationNotPermitted);

        let err = fs.get_xattr("/Docs/plain", XATTR_RESOURCE_FORK).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AttributeNotFound);

        let err = fs.get_xattr("/Docs/plain", "user.none").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AttributeNotFound);
    }

    #[test]
    fn missing_attributes_file_is_no_data() {
        let mut builder = VolumeBuilder::new().without_attributes();
        builder.file(ROOT_FOLDER_ID, "f", b"x");

        let fs = filesystem(builder);

        assert!(fs.list_xattr("/f").unwrap().is_empty());
        assert_eq!(fs.get_xattr("/f", "user.x").unwrap_err().kind(), ErrorKind::NoData);
    }

    #[test]
    fn reports_volume_usage() {
        let fs = sample();
        let (total, free) = fs.usage();

        assert_eq!(total, fs.volume_size());
        assert!(free <= total);
        assert!(!fs.is_hfsx());
    }
}
