//! The catalog file: folder hierarchy and per-file metadata.
//!
//! Records are keyed by `(parent folder ID, name)`. A path is resolved one
//! element at a time, searching the children of the folder found so far.

use crate::hfs::btree::{BTree, BTreeNode, KeyComparator};
use crate::hfs::fork::HfsFork;
use crate::hfs::ondisk::{
    BsdInfo, CatalogDates, CatalogFile, CatalogFolder, CatalogKeyRaw, FILE_RECORD, FOLDER_RECORD,
};
use crate::hfs::unicode;
use crate::hfs::volume::HfsVolume;
use crate::hfs::{
    DuplicateRecordSnafu, Error, FileNotFoundSnafu, IsADirectorySnafu, NotADirectorySnafu,
};
use log::{debug, trace};
use snafu::{OptionExt, ensure};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use zerocopy::FromBytes;

/// Parent ID of the root folder.
pub const ROOT_PARENT_ID: u32 = 1;
pub const ROOT_FOLDER_ID: u32 = 2;
pub const EXTENTS_FILE_ID: u32 = 3;
pub const CATALOG_FILE_ID: u32 = 4;
pub const ATTRIBUTES_FILE_ID: u32 = 8;

/// `key_compare_type` of an HFSX catalog comparing names as binary.
pub const BINARY_COMPARE: u8 = 0xBC;

/// Folder holding the targets of file hard links.
const PRIVATE_DATA_FOLDER: &str = "\0\0\0\0HFS+ Private Data";

/// Names hidden from listings of the root folder, besides those starting
/// with NUL.
const HIDDEN_ROOT_NAMES: [&str; 3] = [
    ".HFS+ Private Directory Data\r",
    ".journal",
    ".journal_info_block",
];

/// A folder or file record of the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRecord {
    Folder(CatalogFolder),
    File(CatalogFile),
}

impl CatalogRecord {
    /// Decodes a leaf record, or `None` for thread records and unknown
    /// record types.
    fn from_bytes(data: &[u8]) -> Option<Self> {
        let record_type = u16::from_be_bytes([*data.first()?, *data.get(1)?]);

        match record_type {
            FOLDER_RECORD => CatalogFolder::from_bytes(data).map(Self::Folder),
            FILE_RECORD => CatalogFile::from_bytes(data).map(Self::File),
            _ => None,
        }
    }

    /// Catalog node ID of the folder or file.
    #[must_use]
    pub fn id(&self) -> u32 {
        match self {
            Self::Folder(f) => f.folder_id,
            Self::File(f) => f.file_id,
        }
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        matches!(self, Self::Folder(_))
    }

    #[must_use]
    pub fn permissions(&self) -> &BsdInfo {
        match self {
            Self::Folder(f) => &f.permissions,
            Self::File(f) => &f.permissions,
        }
    }

    #[must_use]
    pub fn dates(&self) -> &CatalogDates {
        match self {
            Self::Folder(f) => &f.dates,
            Self::File(f) => &f.dates,
        }
    }

    /// Finder info as exposed by `com.apple.FinderInfo`: the 16 bytes of
    /// user info followed by the 16 bytes of extended info.
    #[must_use]
    pub fn finder_info(&self) -> [u8; 32] {
        let (user, extended) = match self {
            Self::Folder(f) => (&f.user_info, &f.finder_info),
            Self::File(f) => (&f.user_info, &f.finder_info),
        };

        let mut out = [0u8; 32];
        out[..16].copy_from_slice(user);
        out[16..].copy_from_slice(extended);
        out
    }
}

/// Splits a catalog key into parent ID and UTF-16 name.
fn parse_key(key: &[u8]) -> Option<(u32, Vec<u16>)> {
    let (raw, rest) = CatalogKeyRaw::read_from_prefix(key).ok()?;
    let name_bytes = rest.get(..raw.name_length.get() as usize * 2)?;

    Some((raw.parent_id.get(), unicode::units_from_be(name_bytes)))
}

/// Matches every record whose parent is a given folder.
struct ParentComparator(u32);

impl KeyComparator for ParentComparator {
    fn compare(&self, record_key: &[u8]) -> Ordering {
        match CatalogKeyRaw::read_from_prefix(record_key) {
            Ok((key, _)) => key.parent_id.get().cmp(&self.0),
            Err(_) => Ordering::Less,
        }
    }
}

/// The catalog B-tree of a volume.
pub struct CatalogTree {
    tree: BTree,
    volume: Arc<HfsVolume>,
    case_sensitive: bool,
    private_folder: Option<u32>,
}

impl std::fmt::Debug for CatalogTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogTree")
            .field("tree", &self.tree)
            .field("case_sensitive", &self.case_sensitive)
            .field("private_folder", &self.private_folder)
            .finish_non_exhaustive()
    }
}

impl CatalogTree {
    pub(crate) fn open(volume: Arc<HfsVolume>, fork: HfsFork) -> Result<Self, Error> {
        let tree = BTree::open("catalog", Arc::new(fork), volume.tree_zone().clone())?;
        let case_sensitive = volume.is_hfsx() && tree.header().key_compare_type == BINARY_COMPARE;

        let mut catalog = Self {
            tree,
            volume,
            case_sensitive,
            private_folder: None,
        };

        let name = unicode::encode(PRIVATE_DATA_FOLDER);

        if let Some(CatalogRecord::Folder(folder)) =
            catalog.find_child(ROOT_FOLDER_ID, Some(&name), PRIVATE_DATA_FOLDER)?
        {
            debug!("catalog: hard link folder is #{}", folder.folder_id);
            catalog.private_folder = Some(folder.folder_id);
        }

        Ok(catalog)
    }

    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    /// Returns `true` if names are compared as binary (HFSX only).
    #[must_use]
    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn names_equal(&self, a: &[u16], b: &[u16]) -> bool {
        if self.case_sensitive {
            a == b
        } else {
            unicode::eq_folded(a, b)
        }
    }

    /// Calls `f` with the key name and record of every folder and file
    /// directly inside `parent_id`.
    fn for_each_child(
        &self,
        parent_id: u32,
        mut f: impl FnMut(Vec<u16>, CatalogRecord) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let leaves: Vec<BTreeNode> = self.tree.find_leaf_nodes(&ParentComparator(parent_id))?;

        for leaf in &leaves {
            for i in 0..leaf.record_count() {
                let Some((parent, name)) = parse_key(leaf.record_key(i)) else {
                    continue;
                };

                if parent != parent_id {
                    continue;
                }

                if let Some(record) = CatalogRecord::from_bytes(leaf.record_data(i)) {
                    f(name, record)?;
                }
            }
        }

        Ok(())
    }

    /// Finds the child of `parent_id` named `name`, or its only child when
    /// `name` is `None`.
    fn find_child(&self, parent_id: u32, name: Option<&[u16]>, path: &str) -> Result<Option<CatalogRecord>, Error> {
        let mut found = None;

        self.for_each_child(parent_id, |key_name, record| {
            if name.is_some_and(|name| !self.names_equal(name, &key_name)) {
                return Ok(());
            }

            ensure!(
                found.is_none(),
                DuplicateRecordSnafu {
                    path,
                    name: unicode::decode(&key_name)
                }
            );

            found = Some(record);
            Ok(())
        })?;

        Ok(found)
    }

    /// Replaces a hard link by the file it points to.
    fn resolve_hard_link(&self, record: CatalogRecord, path: &str) -> Result<CatalogRecord, Error> {
        let (CatalogRecord::File(file), Some(private)) = (&record, self.private_folder) else {
            return Ok(record);
        };

        if !file.is_hard_link() {
            return Ok(record);
        }

        let target = format!("iNode{}", file.permissions.special);

        trace!("catalog: {path} is a hard link to {target}");

        match self.find_child(private, Some(&unicode::encode(&target)), path)? {
            Some(target) => Ok(target),
            None => Ok(record),
        }
    }

    /// Resolves `path` to its catalog record.
    ///
    /// Elements are separated by `/`; a `:` in an element stands for a `/`
    /// in the on-disk name.
    pub fn stat(&self, path: &str) -> Result<CatalogRecord, Error> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);

        let mut record = self
            .find_child(ROOT_PARENT_ID, None, path)?
            .context(FileNotFoundSnafu { path })?;

        for element in trimmed.split('/').filter(|e| !e.is_empty()) {
            let CatalogRecord::Folder(folder) = &record else {
                return FileNotFoundSnafu { path }.fail();
            };

            let name = unicode::encode(&element.replace(':', "/"));

            record = self
                .find_child(folder.folder_id, Some(&name), path)?
                .context(FileNotFoundSnafu { path })?;
        }

        self.resolve_hard_link(record, path)
    }

    /// Lists the folder at `path`, keyed by display name (`/` in on-disk
    /// names becomes `:`).
    ///
    /// Volume metadata entries are left out of the root folder's listing.
    pub fn list_directory(&self, path: &str) -> Result<BTreeMap<String, CatalogRecord>, Error> {
        let CatalogRecord::Folder(folder) = self.stat(path)? else {
            return NotADirectorySnafu { path }.fail();
        };

        let mut contents = BTreeMap::new();

        self.for_each_child(folder.folder_id, |name, record| {
            let name = unicode::decode(&name);

            if folder.folder_id == ROOT_FOLDER_ID
                && (name.starts_with('\0') || HIDDEN_ROOT_NAMES.contains(&name.as_str()))
            {
                return Ok(());
            }

            let record = self.resolve_hard_link(record, path)?;

            contents.insert(name.replace('/', ":"), record);
            Ok(())
        })?;

        Ok(contents)
    }

    /// Opens the data or resource fork of the file at `path`.
    pub fn open_file(&self, path: &str, resource_fork: bool) -> Result<HfsFork, Error> {
        match self.stat(path)? {
            CatalogRecord::Folder(_) => IsADirectorySnafu { path }.fail(),
            CatalogRecord::File(file) => {
                let fork = if resource_fork {
                    &file.resource_fork
                } else {
                    &file.data_fork
                };

                Ok(self.volume.open_fork(fork, file.file_id, resource_fork))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hfs::ErrorKind;
    use crate::reader::Reader;
    use crate::testutil::VolumeBuilder;

    fn catalog(builder: VolumeBuilder) -> CatalogTree {
        let volume = HfsVolume::open(builder.build_reader()).unwrap();

        Arc::new(volume).root_catalog_tree().unwrap()
    }

    fn sample() -> VolumeBuilder {
        let mut builder = VolumeBuilder::new();
        let docs = builder.folder(ROOT_FOLDER_ID, "Documents");
        let nested = builder.folder(docs, "Nested");

        builder.file(docs, "ReadMe.txt", b"hello world");
        builder.file(nested, "a/b", b"slash");
        builder.file(ROOT_FOLDER_ID, ".journal", b"");
        builder.file(ROOT_FOLDER_ID, "top", b"top level");

        for i in 0..200 {
            builder.file(nested, &format!("file{i:03}"), format!("contents {i}").as_bytes());
        }

        builder
    }

    #[test]
    fn resolves_paths_case_insensitively() {
        let catalog = catalog(sample());

        assert!(catalog.stat("/").unwrap().is_folder());
        assert_eq!(catalog.stat("").unwrap().id(), ROOT_FOLDER_ID);
        assert!(catalog.stat("/Documents/").unwrap().is_folder());

        let CatalogRecord::File(file) = catalog.stat("/documents/README.TXT").unwrap() else {
            panic!("expected a file");
        };
        assert_eq!(file.data_fork.logical_size, 11);

        assert!(catalog.stat("/Documents/Nested/a:b").is_ok());
        assert!(catalog.stat("/Documents/Nested/file150").is_ok());

        let err = catalog.stat("/Documents/missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);

        let err = catalog.stat("/top/below").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
    }

    #[test]
    fn binary_compare_is_case_sensitive() {
        let catalog = catalog(sample().hfsx());

        assert!(catalog.is_case_sensitive());
        assert!(catalog.stat("/Documents/ReadMe.txt").is_ok());
        assert!(catalog.stat("/documents/readme.txt").is_err());
    }

    #[test]
    fn lists_directories_across_leaves() {
        let catalog = catalog(sample());

        let nested = catalog.list_directory("/Documents/Nested").unwrap();
        assert_eq!(nested.len(), 201);
        assert!(nested.contains_key("a:b"));
        assert!(nested.contains_key("file199"));

        let root = catalog.list_directory("/").unwrap();
        let names: Vec<&str> = root.keys().map(String::as_str).collect();
        assert_eq!(names, ["Documents", "top"]);

        let err = catalog.list_directory("/top").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotADirectory);
    }

    #[test]
    fn follows_hard_links() {
        let mut builder = sample();
        builder.hard_link(ROOT_FOLDER_ID, "link", b"shared contents");

        let catalog = catalog(builder);
        let CatalogRecord::File(file) = catalog.stat("/link").unwrap() else {
            panic!("expected a file");
        };

        assert!(!file.is_hard_link());
        assert_eq!(file.data_fork.logical_size, 15);

        let fork = catalog.open_file("/link", false).unwrap();
        let mut buf = vec![0u8; 15];
        fork.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(buf, b"shared contents");

        // The private folder stays hidden.
        assert!(!catalog.list_directory("/").unwrap().keys().any(|k| k.starts_with('\0')));
    }

    #[test]
    fn open_file_rejects_folders() {
        let catalog = catalog(sample());
        let err = catalog.open_file("/Documents", false).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::IsADirectory);
    }
}
