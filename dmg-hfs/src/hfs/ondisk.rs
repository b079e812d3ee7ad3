//! On-disk structures of HFS+ volumes.
//!
//! All multi-byte fields are big-endian. The `*Raw` types mirror the disk
//! layout exactly; the plain types are decoded copies handed out by the
//! public API.
//!
//! See Apple's TN1150 "HFS Plus Volume Format" for the field semantics.

use zerocopy::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Offset of the volume header (and of the HFS master directory block).
pub const VOLUME_HEADER_OFFSET: u64 = 1024;

pub const SIGNATURE_HFS_PLUS: u16 = 0x482B; // 'H+'
pub const SIGNATURE_HFSX: u16 = 0x4858; // 'HX'
pub const SIGNATURE_HFS: u16 = 0x4244; // 'BD'

pub const FOLDER_RECORD: u16 = 1;
pub const FILE_RECORD: u16 = 2;
pub const FOLDER_THREAD_RECORD: u16 = 3;
pub const FILE_THREAD_RECORD: u16 = 4;

/// Attribute record holding its value inline.
pub const ATTR_INLINE_DATA: u32 = 0x10;

/// Finder type of a file hard link.
pub const HARD_LINK_FILE_TYPE: u32 = u32::from_be_bytes(*b"hlnk");
/// Finder creator of a file hard link.
pub const HARD_LINK_CREATOR: u32 = u32::from_be_bytes(*b"hfs+");
/// Finder type of a symbolic link.
pub const SYMLINK_FILE_TYPE: u32 = u32::from_be_bytes(*b"slnk");

/// `BsdInfo::owner_flags` bit set on decmpfs-compressed files.
pub const OWNER_FLAG_COMPRESSED: u8 = 0x20;

/// Extent descriptor (8 bytes).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ExtentDescriptorRaw {
    pub start_block: U32,
    pub block_count: U32,
}

/// Fork data (80 bytes).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ForkDataRaw {
    pub logical_size: U64,           // 0x00
    pub clump_size: U32,             // 0x08
    pub total_blocks: U32,           // 0x0C
    pub extents: [ExtentDescriptorRaw; 8], // 0x10
}

/// Volume header (512 bytes at offset 1024).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct VolumeHeaderRaw {
    pub signature: U16,            // 0x00
    pub version: U16,              // 0x02
    pub attributes: U32,           // 0x04
    pub last_mounted_version: U32, // 0x08
    pub journal_info_block: U32,   // 0x0C
    pub create_date: U32,          // 0x10
    pub modify_date: U32,          // 0x14
    pub backup_date: U32,          // 0x18
    pub checked_date: U32,         // 0x1C
    pub file_count: U32,           // 0x20
    pub folder_count: U32,         // 0x24
    pub block_size: U32,           // 0x28
    pub total_blocks: U32,         // 0x2C
    pub free_blocks: U32,          // 0x30
    pub next_allocation: U32,      // 0x34
    pub rsrc_clump_size: U32,      // 0x38
    pub data_clump_size: U32,      // 0x3C
    pub next_catalog_id: U32,      // 0x40
    pub write_count: U32,          // 0x44
    pub encodings_bitmap: U64,     // 0x48
    pub finder_info: [U32; 8],     // 0x50
    pub allocation_file: ForkDataRaw, // 0x70
    pub extents_file: ForkDataRaw,    // 0xC0
    pub catalog_file: ForkDataRaw,    // 0x110
    pub attributes_file: ForkDataRaw, // 0x160
    pub startup_file: ForkDataRaw,    // 0x1B0
}

/// Leading part of an HFS master directory block (130 bytes at offset 1024),
/// up to the extent of an embedded HFS+ volume.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MasterDirectoryBlockRaw {
    pub signature: U16,            // 0x00
    pub _dates_and_counts: [u8; 18], // 0x02
    pub allocation_block_size: U32, // 0x14
    pub _clump_size: U32,          // 0x18
    pub allocation_block_start: U16, // 0x1C
    pub _volume_info: [u8; 94],    // 0x1E
    pub embed_signature: U16,      // 0x7C
    pub embed_start_block: U16,    // 0x7E
    pub embed_block_count: U16,    // 0x80
}

/// B-tree node descriptor (14 bytes).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct NodeDescriptorRaw {
    pub forward_link: U32,
    pub backward_link: U32,
    pub kind: i8,
    pub height: u8,
    pub num_records: U16,
    pub _reserved: U16,
}

/// B-tree header record (106 bytes), the first record of node 0.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct HeaderRecordRaw {
    pub tree_depth: U16,       // 0x00
    pub root_node: U32,        // 0x02
    pub leaf_records: U32,     // 0x06
    pub first_leaf_node: U32,  // 0x0A
    pub last_leaf_node: U32,   // 0x0E
    pub node_size: U16,        // 0x12
    pub max_key_length: U16,   // 0x14
    pub total_nodes: U32,      // 0x16
    pub free_nodes: U32,       // 0x1A
    pub _reserved1: U16,       // 0x1E
    pub clump_size: U32,       // 0x20
    pub btree_type: u8,        // 0x24
    pub key_compare_type: u8,  // 0x25
    pub attributes: U32,       // 0x26
    pub _reserved3: [U32; 16], // 0x2A
}

/// Fixed part of a catalog key; the UTF-16BE name follows.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CatalogKeyRaw {
    pub key_length: U16,
    pub parent_id: U32,
    pub name_length: U16,
}

/// Extents overflow key (12 bytes).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ExtentKeyRaw {
    pub key_length: U16,
    pub fork_type: u8,
    pub _pad: u8,
    pub file_id: U32,
    pub start_block: U32,
}

/// Fixed part of an attribute key; the UTF-16BE name follows.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AttributeKeyRaw {
    pub key_length: U16,
    pub _pad: U16,
    pub file_id: U32,
    pub start_block: U32,
    pub name_length: U16,
}

/// Header of an inline attribute record (16 bytes); the value follows.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AttributeInlineRaw {
    pub record_type: U32,
    pub _reserved: [u8; 8],
    pub attr_size: U32,
}

/// BSD ownership and permissions (16 bytes).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BsdInfoRaw {
    pub owner_id: U32,
    pub group_id: U32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: U16,
    /// Link count, hard link inode number or raw device, depending on the
    /// record.
    pub special: U32,
}

/// Catalog folder record (88 bytes).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CatalogFolderRaw {
    pub record_type: U16,        // 0x00
    pub flags: U16,              // 0x02
    pub valence: U32,            // 0x04
    pub folder_id: U32,          // 0x08
    pub create_date: U32,        // 0x0C
    pub content_mod_date: U32,   // 0x10
    pub attribute_mod_date: U32, // 0x14
    pub access_date: U32,        // 0x18
    pub backup_date: U32,        // 0x1C
    pub permissions: BsdInfoRaw, // 0x20
    pub user_info: [u8; 16],     // 0x30
    pub finder_info: [u8; 16],   // 0x40
    pub text_encoding: U32,      // 0x50
    pub folder_count: U32,       // 0x54
}

/// Catalog file record (248 bytes).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CatalogFileRaw {
    pub record_type: U16,        // 0x00
    pub flags: U16,              // 0x02
    pub _reserved1: U32,         // 0x04
    pub file_id: U32,            // 0x08
    pub create_date: U32,        // 0x0C
    pub content_mod_date: U32,   // 0x10
    pub attribute_mod_date: U32, // 0x14
    pub access_date: U32,        // 0x18
    pub backup_date: U32,        // 0x1C
    pub permissions: BsdInfoRaw, // 0x20
    pub user_info: [u8; 16],     // 0x30
    pub finder_info: [u8; 16],   // 0x40
    pub text_encoding: U32,      // 0x50
    pub _reserved2: U32,         // 0x54
    pub data_fork: ForkDataRaw,  // 0x58
    pub resource_fork: ForkDataRaw, // 0xA8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl From<&ExtentDescriptorRaw> for ExtentDescriptor {
    fn from(raw: &ExtentDescriptorRaw) -> Self {
        Self {
            start_block: raw.start_block.get(),
            block_count: raw.block_count.get(),
        }
    }
}

/// Size and first eight extents of a fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; 8],
}

impl From<&ForkDataRaw> for ForkData {
    fn from(raw: &ForkDataRaw) -> Self {
        Self {
            logical_size: raw.logical_size.get(),
            clump_size: raw.clump_size.get(),
            total_blocks: raw.total_blocks.get(),
            extents: raw.extents.each_ref().map(ExtentDescriptor::from),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    pub special: u32,
}

impl From<&BsdInfoRaw> for BsdInfo {
    fn from(raw: &BsdInfoRaw) -> Self {
        Self {
            owner_id: raw.owner_id.get(),
            group_id: raw.group_id.get(),
            admin_flags: raw.admin_flags,
            owner_flags: raw.owner_flags,
            file_mode: raw.file_mode.get(),
            special: raw.special.get(),
        }
    }
}

/// Timestamps of a catalog record, in seconds since 1904-01-01 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CatalogDates {
    pub create: u32,
    pub content_mod: u32,
    pub attribute_mod: u32,
    pub access: u32,
    pub backup: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFolder {
    pub flags: u16,
    /// Number of direct children.
    pub valence: u32,
    pub folder_id: u32,
    pub dates: CatalogDates,
    pub permissions: BsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
    pub folder_count: u32,
}

impl CatalogFolder {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let (raw, _) = CatalogFolderRaw::read_from_prefix(data).ok()?;

        Some(Self {
            flags: raw.flags.get(),
            valence: raw.valence.get(),
            folder_id: raw.folder_id.get(),
            dates: CatalogDates {
                create: raw.create_date.get(),
                content_mod: raw.content_mod_date.get(),
                attribute_mod: raw.attribute_mod_date.get(),
                access: raw.access_date.get(),
                backup: raw.backup_date.get(),
            },
            permissions: BsdInfo::from(&raw.permissions),
            user_info: raw.user_info,
            finder_info: raw.finder_info,
            text_encoding: raw.text_encoding.get(),
            folder_count: raw.folder_count.get(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFile {
    pub flags: u16,
    pub file_id: u32,
    pub dates: CatalogDates,
    pub permissions: BsdInfo,
    pub user_info: [u8; 16],
    pub finder_info: [u8; 16],
    pub text_encoding: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
}

impl CatalogFile {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let (raw, _) = CatalogFileRaw::read_from_prefix(data).ok()?;

        Some(Self {
            flags: raw.flags.get(),
            file_id: raw.file_id.get(),
            dates: CatalogDates {
                create: raw.create_date.get(),
                content_mod: raw.content_mod_date.get(),
                attribute_mod: raw.attribute_mod_date.get(),
                access: raw.access_date.get(),
                backup: raw.backup_date.get(),
            },
            permissions: BsdInfo::from(&raw.permissions),
            user_info: raw.user_info,
            finder_info: raw.finder_info,
            text_encoding: raw.text_encoding.get(),
            data_fork: ForkData::from(&raw.data_fork),
            resource_fork: ForkData::from(&raw.resource_fork),
        })
    }

    /// Finder file type, e.g. `hlnk`.
    #[must_use]
    pub fn file_type(&self) -> u32 {
        u32::from_be_bytes([self.user_info[0], self.user_info[1], self.user_info[2], self.user_info[3]])
    }

    /// Finder creator code, e.g. `hfs+`.
    #[must_use]
    pub fn creator(&self) -> u32 {
        u32::from_be_bytes([self.user_info[4], self.user_info[5], self.user_info[6], self.user_info[7]])
    }

    /// Returns `true` for a file hard link, whose data lives in an `iNode`
    /// file of the private metadata folder.
    #[must_use]
    pub fn is_hard_link(&self) -> bool {
        self.file_type() == HARD_LINK_FILE_TYPE && self.creator() == HARD_LINK_CREATOR
    }
}
