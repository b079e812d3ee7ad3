//! Encoders for every run codec, B-tree files, HFS+ volumes and UDIF images,
//! assembled in memory.

use crate::dmg::udif::{BlkxRun, RunType};
use crate::hfs::btree::{NodeKind, TreeAttributes};
use crate::hfs::catalog::{BINARY_COMPARE, ROOT_FOLDER_ID, ROOT_PARENT_ID};
use crate::hfs::extents::DATA_FORK;
use crate::hfs::ondisk::{
    ATTR_INLINE_DATA, AttributeInlineRaw, AttributeKeyRaw, CatalogFileRaw, CatalogFolderRaw,
    ExtentDescriptorRaw, ExtentKeyRaw, FILE_RECORD, FILE_THREAD_RECORD, FOLDER_RECORD,
    FOLDER_THREAD_RECORD, ForkDataRaw, HARD_LINK_CREATOR, HARD_LINK_FILE_TYPE, HeaderRecordRaw,
    MasterDirectoryBlockRaw, SIGNATURE_HFS, SIGNATURE_HFS_PLUS, SIGNATURE_HFSX, VolumeHeaderRaw,
};
use crate::hfs::unicode;
use crate::reader::{MemoryReader, Reader};
use plist::{Dictionary, Value};
use std::cmp::Ordering;
use std::io::Write;
use std::sync::Arc;
use zerocopy::big_endian::{U16, U32, U64};
use zerocopy::{FromZeros, IntoBytes};

pub fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn bzip2_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn lzfse_compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    lzfse_rust::encode_bytes(data, &mut out).unwrap();
    out
}

/// Encodes `data` with ADC literal chunks, using a 3-byte back-reference
/// whenever the bytes `period` back repeat for at least 4 bytes.
pub fn adc_compress(data: &[u8], period: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut literal: Vec<u8> = Vec::new();
    let mut pos = 0;

    let flush = |literal: &mut Vec<u8>, out: &mut Vec<u8>| {
        for chunk in literal.chunks(0x80) {
            out.push(0x80 | (chunk.len() - 1) as u8);
            out.extend_from_slice(chunk);
        }
        literal.clear();
    };

    while pos < data.len() {
        let mut len = 0;

        if period > 0 && pos >= period {
            while len < 67 && pos + len < data.len() && data[pos + len] == data[pos + len - period] {
                len += 1;
            }
        }

        if len >= 4 {
            flush(&mut literal, &mut out);
            out.push(0x40 | (len - 4) as u8);
            out.extend_from_slice(&((period - 1) as u16).to_be_bytes());
            pos += len;
        } else {
            literal.push(data[pos]);
            pos += 1;
        }
    }

    flush(&mut literal, &mut out);
    out
}

/// Serializes a `mish` block table whose runs address the image directly
/// (data start 0).
pub fn blkx_table_bytes(first_sector: u64, sector_count: u64, runs: &[BlkxRun]) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(b"mish");
    out.extend_from_slice(&1u32.to_be_bytes());
    out.extend_from_slice(&first_sector.to_be_bytes());
    out.extend_from_slice(&sector_count.to_be_bytes());
    out.extend_from_slice(&0u64.to_be_bytes());
    out.extend_from_slice(&2048u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&[0u8; 24]);
    out.extend_from_slice(&[0u8; 136]);
    out.extend_from_slice(&(runs.len() as u32).to_be_bytes());

    for run in runs {
        out.extend_from_slice(&run.kind.to_raw().to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&run.sector_start.to_be_bytes());
        out.extend_from_slice(&run.sector_count.to_be_bytes());
        out.extend_from_slice(&run.comp_offset.to_be_bytes());
        out.extend_from_slice(&run.comp_length.to_be_bytes());
    }

    out
}

/// Serializes a `koly` trailer pointing at an XML property list.
pub fn koly_trailer_bytes(xml_offset: u64, xml_length: u64, sector_count: u64) -> Vec<u8> {
    let mut out = vec![0u8; 512];

    out[0..4].copy_from_slice(b"koly");
    out[4..8].copy_from_slice(&4u32.to_be_bytes());
    out[8..12].copy_from_slice(&512u32.to_be_bytes());
    out[0xD8..0xE0].copy_from_slice(&xml_offset.to_be_bytes());
    out[0xE0..0xE8].copy_from_slice(&xml_length.to_be_bytes());
    out[0x1EC..0x1F4].copy_from_slice(&sector_count.to_be_bytes());

    out
}

/// Builds a UDIF image, rotating the run codecs across chunks.
#[derive(Default)]
pub struct DmgBuilder {
    partitions: Vec<(String, Vec<u8>, usize)>,
}

impl DmgBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a partition named like `"disk image (Apple_HFS : 1)"`, split in
    /// runs of `sectors_per_run` sectors. Data is zero-padded to whole
    /// sectors.
    pub fn partition(mut self, name: &str, data: &[u8], sectors_per_run: usize) -> Self {
        self.partitions.push((name.to_owned(), data.to_vec(), sectors_per_run));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut first_sector = 0u64;
        let mut chunk_number = 0usize;

        let ddm_runs = [terminator(0, 0)];
        let mut entries = vec![blkx_entry(-1, "Driver Descriptor Map (DDM : -1)", blkx_table_bytes(0, 0, &ddm_runs))];

        for (name, data, sectors_per_run) in &self.partitions {
            let mut padded = data.clone();
            padded.resize(data.len().div_ceil(512) * 512, 0);

            let sectors = padded.len() as u64 / 512;
            let mut runs = Vec::new();

            for (i, chunk) in padded.chunks(sectors_per_run * 512).enumerate() {
                let (kind, encoded) = if chunk.iter().all(|&b| b == 0) {
                    (RunType::ZeroFill, Vec::new())
                } else {
                    chunk_number += 1;

                    match chunk_number % 5 {
                        1 => (RunType::Raw, chunk.to_vec()),
                        2 => (RunType::Zlib, zlib_compress(chunk)),
                        3 => (RunType::Bzip2, bzip2_compress(chunk)),
                        4 => (RunType::Adc, adc_compress(chunk, 3)),
                        _ => (RunType::Lzfse, lzfse_compress(chunk)),
                    }
                };

                runs.push(BlkxRun {
                    kind,
                    sector_start: (i * sectors_per_run) as u64,
                    sector_count: chunk.len() as u64 / 512,
                    comp_offset: out.len() as u64,
                    comp_length: encoded.len() as u64,
                });
                out.extend_from_slice(&encoded);
            }

            runs.push(terminator(sectors, out.len() as u64));

            let id = entries.len() as i64 - 1;
            entries.push(blkx_entry(id, name, blkx_table_bytes(first_sector, sectors, &runs)));
            first_sector += sectors;
        }

        let mut resource_fork = Dictionary::new();
        resource_fork.insert("blkx".to_owned(), Value::Array(entries));

        let mut root = Dictionary::new();
        root.insert("resource-fork".to_owned(), Value::Dictionary(resource_fork));

        let mut xml = Vec::new();
        Value::Dictionary(root).to_writer_xml(&mut xml).unwrap();

        let xml_offset = out.len() as u64;
        out.extend_from_slice(&xml);
        out.extend_from_slice(&koly_trailer_bytes(xml_offset, xml.len() as u64, first_sector));
        out
    }
}

fn terminator(sector_start: u64, comp_offset: u64) -> BlkxRun {
    BlkxRun {
        kind: RunType::Terminator,
        sector_start,
        sector_count: 0,
        comp_offset,
        comp_length: 0,
    }
}

fn blkx_entry(id: i64, name: &str, table: Vec<u8>) -> Value {
    let mut entry = Dictionary::new();

    entry.insert("Attributes".to_owned(), Value::String("0x0050".to_owned()));
    entry.insert("Data".to_owned(), Value::Data(table));
    entry.insert("ID".to_owned(), Value::String(id.to_string()));
    entry.insert("Name".to_owned(), Value::String(name.to_owned()));

    Value::Dictionary(entry)
}

const DESCRIPTOR_SIZE: usize = 14;

fn node_fits(size: usize, records: &[(Vec<u8>, Vec<u8>)]) -> bool {
    let used: usize = records.iter().map(|(k, d)| k.len() + d.len()).sum();

    DESCRIPTOR_SIZE + used + 2 * (records.len() + 1) <= size
}

fn linked_node(
    size: usize,
    kind: NodeKind,
    height: u8,
    forward_link: u32,
    backward_link: u32,
    records: &[(Vec<u8>, Vec<u8>)],
) -> Vec<u8> {
    assert!(node_fits(size, records), "records overflow a {size}-byte node");

    let mut out = vec![0u8; size];

    out[0..4].copy_from_slice(&forward_link.to_be_bytes());
    out[4..8].copy_from_slice(&backward_link.to_be_bytes());
    out[8] = kind.to_raw() as u8;
    out[9] = height;
    out[10..12].copy_from_slice(&(records.len() as u16).to_be_bytes());

    let mut pos = DESCRIPTOR_SIZE;

    for (i, (key, data)) in records.iter().enumerate() {
        out[size - 2 * (i + 1)..size - 2 * i].copy_from_slice(&(pos as u16).to_be_bytes());
        out[pos..pos + key.len()].copy_from_slice(key);
        pos += key.len();
        out[pos..pos + data.len()].copy_from_slice(data);
        pos += data.len();
    }

    let free = size - 2 * (records.len() + 1);
    out[free..free + 2].copy_from_slice(&(pos as u16).to_be_bytes());

    out
}

/// Lays out one B-tree node holding `records` (key with its length field,
/// then data), with the offset table at the end.
pub fn node_bytes(
    size: usize,
    kind: NodeKind,
    height: u8,
    forward_link: u32,
    records: &[(Vec<u8>, Vec<u8>)],
) -> Vec<u8> {
    linked_node(size, kind, height, forward_link, 0, records)
}

/// Builds a complete B-tree file from records sorted in key order.
pub struct TreeBuilder {
    node_size: usize,
    max_key_length: u16,
    key_compare_type: u8,
}

impl TreeBuilder {
    pub fn new(node_size: usize, max_key_length: u16) -> Self {
        Self {
            node_size,
            max_key_length,
            key_compare_type: 0xCF,
        }
    }

    pub fn key_compare_type(mut self, key_compare_type: u8) -> Self {
        self.key_compare_type = key_compare_type;
        self
    }

    /// Returns the header node (node 0) of a tree.
    pub fn header_node(node_size: usize, depth: u16, root: u32, total_nodes: u32, max_key_length: u16) -> Vec<u8> {
        Self::new(node_size, max_key_length).header(depth, root, 0, (0, 0), total_nodes)
    }

    fn header(&self, depth: u16, root: u32, leaf_records: u32, leaves: (u32, u32), total_nodes: u32) -> Vec<u8> {
        let mut header = HeaderRecordRaw::new_zeroed();

        header.tree_depth = U16::new(depth);
        header.root_node = U32::new(root);
        header.leaf_records = U32::new(leaf_records);
        header.first_leaf_node = U32::new(leaves.0);
        header.last_leaf_node = U32::new(leaves.1);
        header.node_size = U16::new(self.node_size as u16);
        header.max_key_length = U16::new(self.max_key_length);
        header.total_nodes = U32::new(total_nodes);
        header.clump_size = U32::new(self.node_size as u32);
        header.key_compare_type = self.key_compare_type;
        header.attributes = U32::new((TreeAttributes::BIG_KEYS | TreeAttributes::VARIABLE_INDEX_KEYS).bits());

        // Header record, user data record, map record.
        let mut map = vec![0u8; self.node_size - 256];
        for node in 0..(total_nodes as usize).min(map.len() * 8) {
            map[node / 8] |= 0x80 >> (node % 8);
        }

        let records = [
            (header.as_bytes().to_vec(), Vec::new()),
            (vec![0u8; 128], Vec::new()),
            (map, Vec::new()),
        ];

        linked_node(self.node_size, NodeKind::Header, 0, 0, 0, &records)
    }

    /// Packs `records` into sibling nodes appended to `nodes` (node `i` of
    /// the tree is `nodes[i - 1]`), returning the first key and index of
    /// each new node.
    fn pack(
        &self,
        nodes: &mut Vec<Vec<u8>>,
        kind: NodeKind,
        height: u8,
        records: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Vec<(Vec<u8>, u32)> {
        let mut groups: Vec<Vec<(Vec<u8>, Vec<u8>)>> = Vec::new();
        let mut current = Vec::new();

        for record in records {
            current.push(record);

            if !node_fits(self.node_size, &current) {
                let last = current.pop().unwrap();
                groups.push(std::mem::take(&mut current));
                current.push(last);
            }
        }

        if !current.is_empty() {
            groups.push(current);
        }

        let first = nodes.len() as u32 + 1;
        let count = groups.len() as u32;
        let mut level = Vec::new();

        for (i, group) in groups.into_iter().enumerate() {
            let index = first + i as u32;
            let forward = if index + 1 < first + count { index + 1 } else { 0 };
            let backward = if index > first { index - 1 } else { 0 };

            level.push((group[0].0.clone(), index));
            nodes.push(linked_node(self.node_size, kind, height, forward, backward, &group));
        }

        level
    }

    pub fn build(&self, records: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<u8> {
        let leaf_records = records.len() as u32;
        let mut nodes = Vec::new();
        let mut level = self.pack(&mut nodes, NodeKind::Leaf, 1, records);
        let leaves = (if level.is_empty() { 0 } else { 1 }, nodes.len() as u32);
        let mut depth = u16::from(!level.is_empty());

        while level.len() > 1 {
            depth += 1;

            let entries = level
                .into_iter()
                .map(|(key, index)| (key, index.to_be_bytes().to_vec()))
                .collect();

            level = self.pack(&mut nodes, NodeKind::Index, depth as u8, entries);
        }

        let root = level.first().map_or(0, |&(_, index)| index);
        let mut out = self.header(depth, root, leaf_records, leaves, nodes.len() as u32 + 1);

        for node in nodes {
            out.extend_from_slice(&node);
        }

        out
    }
}

/// An extents overflow record holding up to eight extents.
pub fn extent_record(file_id: u32, fork_type: u8, start_block: u32, extents: &[(u32, u32)]) -> (Vec<u8>, Vec<u8>) {
    let mut key = ExtentKeyRaw::new_zeroed();

    key.key_length = U16::new(10);
    key.fork_type = fork_type;
    key.file_id = U32::new(file_id);
    key.start_block = U32::new(start_block);

    let mut data = vec![0u8; 64];

    for (slot, &(start, count)) in data.chunks_exact_mut(8).zip(extents) {
        slot[0..4].copy_from_slice(&start.to_be_bytes());
        slot[4..8].copy_from_slice(&count.to_be_bytes());
    }

    (key.as_bytes().to_vec(), data)
}

/// An inline attribute record.
pub fn attribute_record(file_id: u32, name: &str, value: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let units = unicode::encode(name);
    let mut key = AttributeKeyRaw::new_zeroed();

    key.key_length = U16::new(12 + 2 * units.len() as u16);
    key.file_id = U32::new(file_id);
    key.name_length = U16::new(units.len() as u16);

    let mut key = key.as_bytes().to_vec();
    key.extend(units.iter().flat_map(|u| u.to_be_bytes()));

    let mut header = AttributeInlineRaw::new_zeroed();
    header.record_type = U32::new(ATTR_INLINE_DATA);
    header.attr_size = U32::new(value.len() as u32);

    let mut data = header.as_bytes().to_vec();
    data.extend_from_slice(value);

    (key, data)
}

fn catalog_key(parent_id: u32, name: &[u16]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + name.len() * 2);

    key.extend_from_slice(&(6 + 2 * name.len() as u16).to_be_bytes());
    key.extend_from_slice(&parent_id.to_be_bytes());
    key.extend_from_slice(&(name.len() as u16).to_be_bytes());
    key.extend(name.iter().flat_map(|u| u.to_be_bytes()));
    key
}

fn thread_record(record_type: u16, parent_id: u32, name: &[u16]) -> Vec<u8> {
    let mut data = Vec::with_capacity(10 + name.len() * 2);

    data.extend_from_slice(&record_type.to_be_bytes());
    data.extend_from_slice(&[0, 0]);
    data.extend_from_slice(&parent_id.to_be_bytes());
    data.extend_from_slice(&(name.len() as u16).to_be_bytes());
    data.extend(name.iter().flat_map(|u| u.to_be_bytes()));
    data
}

/// Metadata of a file added with [`VolumeBuilder::file_with()`].
#[derive(Debug, Clone, Default)]
pub struct FileOptions {
    /// BSD mode including the file type bits, 0 for none.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub owner_flags: u8,
    pub special: u32,
    pub resource_fork: Vec<u8>,
    /// User info followed by extended Finder info.
    pub finder_info: [u8; 32],
    pub content_mod_date: u32,
}

enum EntryKind {
    Folder,
    File {
        data: Vec<u8>,
        options: FileOptions,
        extent_count: usize,
    },
}

struct Entry {
    parent: u32,
    name: String,
    id: u32,
    kind: EntryKind,
}

const VOLUME_BLOCK_SIZE: usize = 4096;
const TREE_NODE_SIZE: usize = 4096;
const FREE_BLOCKS: usize = 8;
const PRIVATE_DATA_FOLDER: &str = "\0\0\0\0HFS+ Private Data";

/// Appends forks to a volume image in whole allocation blocks.
struct Allocator {
    image: Vec<u8>,
}

impl Allocator {
    fn block(&self) -> u32 {
        (self.image.len() / VOLUME_BLOCK_SIZE) as u32
    }

    /// Stores `data` in fresh blocks, returning its extent.
    fn store(&mut self, data: &[u8]) -> (u32, u32) {
        let start = self.block();
        let blocks = data.len().div_ceil(VOLUME_BLOCK_SIZE);

        self.image.extend_from_slice(data);
        self.image.resize((start as usize + blocks) * VOLUME_BLOCK_SIZE, 0);

        if blocks == 0 { (0, 0) } else { (start, blocks as u32) }
    }

    /// Leaves one block unused.
    fn skip(&mut self) {
        self.image.resize(self.image.len() + VOLUME_BLOCK_SIZE, 0);
    }
}

fn fork_raw(logical_size: usize, extents: &[(u32, u32)]) -> ForkDataRaw {
    let mut fork = ForkDataRaw::new_zeroed();

    fork.logical_size = U64::new(logical_size as u64);
    fork.total_blocks = U32::new(extents.iter().map(|&(_, count)| count).sum());

    for (slot, &(start, count)) in fork.extents.iter_mut().zip(extents) {
        *slot = ExtentDescriptorRaw {
            start_block: U32::new(start),
            block_count: U32::new(count),
        };
    }

    fork
}

/// Builds an HFS+ (or HFSX) volume with 4 KiB allocation blocks.
///
/// Every volume has a root folder, the extents overflow file and, unless
/// [`without_attributes()`](Self::without_attributes) is called, an
/// attributes file.
pub struct VolumeBuilder {
    entries: Vec<Entry>,
    attributes: Vec<(u32, String, Vec<u8>)>,
    next_id: u32,
    private_folder: Option<u32>,
    hfsx: bool,
    wrapped: bool,
    with_attributes: bool,
}

impl Default for VolumeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeBuilder {
    pub fn new() -> Self {
        Self {
            entries: vec![Entry {
                parent: ROOT_PARENT_ID,
                name: "Untitled".to_owned(),
                id: ROOT_FOLDER_ID,
                kind: EntryKind::Folder,
            }],
            attributes: Vec::new(),
            next_id: 16,
            private_folder: None,
            hfsx: false,
            wrapped: false,
            with_attributes: true,
        }
    }

    /// Makes an HFSX volume comparing names as binary.
    pub fn hfsx(mut self) -> Self {
        self.hfsx = true;
        self
    }

    /// Embeds the volume in an HFS wrapper.
    pub fn wrapped(mut self) -> Self {
        self.wrapped = true;
        self
    }

    pub fn without_attributes(mut self) -> Self {
        self.with_attributes = false;
        self
    }

    fn add(&mut self, parent: u32, name: &str, kind: EntryKind) -> u32 {
        let id = self.next_id;

        self.next_id += 1;
        self.entries.push(Entry {
            parent,
            name: name.to_owned(),
            id,
            kind,
        });

        id
    }

    pub fn folder(&mut self, parent: u32, name: &str) -> u32 {
        self.add(parent, name, EntryKind::Folder)
    }

    pub fn file(&mut self, parent: u32, name: &str, data: &[u8]) -> u32 {
        self.file_with(parent, name, data, FileOptions::default())
    }

    pub fn file_with(&mut self, parent: u32, name: &str, data: &[u8], options: FileOptions) -> u32 {
        self.add(
            parent,
            name,
            EntryKind::File {
                data: data.to_vec(),
                options,
                extent_count: 1,
            },
        )
    }

    /// Adds a file whose data is split in `extent_count` extents separated by
    /// unused blocks. Extents past the eighth go to the overflow file.
    pub fn fragmented_file(&mut self, parent: u32, name: &str, data: &[u8], extent_count: usize) -> u32 {
        assert!(extent_count <= data.len().div_ceil(VOLUME_BLOCK_SIZE));

        self.add(
            parent,
            name,
            EntryKind::File {
                data: data.to_vec(),
                options: FileOptions::default(),
                extent_count,
            },
        )
    }

    /// Adds a hard link whose target lives in the private data folder.
    pub fn hard_link(&mut self, parent: u32, name: &str, data: &[u8]) -> u32 {
        let private = match self.private_folder {
            Some(id) => id,
            None => {
                let id = self.folder(ROOT_FOLDER_ID, PRIVATE_DATA_FOLDER);
                self.private_folder = Some(id);
                id
            }
        };

        let inode = self.next_id;
        self.file(private, &format!("iNode{inode}"), data);

        let mut finder_info = [0u8; 32];
        finder_info[0..4].copy_from_slice(&HARD_LINK_FILE_TYPE.to_be_bytes());
        finder_info[4..8].copy_from_slice(&HARD_LINK_CREATOR.to_be_bytes());

        self.file_with(
            parent,
            name,
            b"",
            FileOptions {
                special: inode,
                finder_info,
                ..FileOptions::default()
            },
        )
    }

    /// Adds an inline extended attribute to file or folder `id`.
    pub fn attribute(&mut self, id: u32, name: &str, value: &[u8]) {
        self.attributes.push((id, name.to_owned(), value.to_vec()));
    }

    fn compare_names(&self, a: &[u16], b: &[u16]) -> Ordering {
        if self.hfsx { a.cmp(b) } else { unicode::compare_folded(a, b) }
    }

    /// Stores the data fork of a file, returning its extents and any
    /// overflow records.
    fn store_data_fork(
        alloc: &mut Allocator,
        id: u32,
        data: &[u8],
        extent_count: usize,
    ) -> (Vec<(u32, u32)>, Vec<(Vec<u8>, Vec<u8>)>) {
        if extent_count <= 1 {
            let extent = alloc.store(data);
            return (if extent.1 == 0 { Vec::new() } else { vec![extent] }, Vec::new());
        }

        let blocks = data.len().div_ceil(VOLUME_BLOCK_SIZE);
        let (base, extra) = (blocks / extent_count, blocks % extent_count);
        let mut extents = Vec::new();
        let mut block = 0;

        for i in 0..extent_count {
            let count = base + usize::from(i < extra);
            let start = block * VOLUME_BLOCK_SIZE;
            let end = ((block + count) * VOLUME_BLOCK_SIZE).min(data.len());

            extents.push(alloc.store(&data[start..end]));
            alloc.skip();
            block += count;
        }

        let mut overflow = Vec::new();
        let mut fork_block = extents[..8.min(extents.len())].iter().map(|e| e.1).sum::<u32>();

        for group in extents.get(8..).unwrap_or_default().chunks(8) {
            overflow.push(extent_record(id, DATA_FORK, fork_block, group));
            fork_block += group.iter().map(|e| e.1).sum::<u32>();
        }

        (extents, overflow)
    }

    /// Assembles the volume image.
    pub fn build(&self) -> Vec<u8> {
        let mut alloc = Allocator {
            image: vec![0u8; VOLUME_BLOCK_SIZE],
        };
        let mut catalog: Vec<(u32, Vec<u16>, Vec<u8>, Vec<u8>)> = Vec::new();
        let mut overflow = Vec::new();
        let (mut files, mut folders) = (0u32, 0u32);

        for entry in &self.entries {
            let name = unicode::encode(&entry.name);

            let (record, thread_type) = match &entry.kind {
                EntryKind::Folder => {
                    let mut folder = CatalogFolderRaw::new_zeroed();

                    folder.record_type = U16::new(FOLDER_RECORD);
                    folder.folder_id = U32::new(entry.id);
                    folder.valence = U32::new(self.entries.iter().filter(|e| e.parent == entry.id).count() as u32);

                    if entry.id != ROOT_FOLDER_ID {
                        folders += 1;
                    }

                    (folder.as_bytes().to_vec(), FOLDER_THREAD_RECORD)
                }
                EntryKind::File {
                    data,
                    options,
                    extent_count,
                } => {
                    let (extents, records) = Self::store_data_fork(&mut alloc, entry.id, data, *extent_count);
                    let rsrc = alloc.store(&options.resource_fork);
                    let rsrc_extents = if rsrc.1 == 0 { Vec::new() } else { vec![rsrc] };
                    let mut file = CatalogFileRaw::new_zeroed();

                    file.record_type = U16::new(FILE_RECORD);
                    file.file_id = U32::new(entry.id);
                    file.content_mod_date = U32::new(options.content_mod_date);
                    file.permissions.owner_id = U32::new(options.uid);
                    file.permissions.group_id = U32::new(options.gid);
                    file.permissions.owner_flags = options.owner_flags;
                    file.permissions.file_mode = U16::new(options.mode as u16);
                    file.permissions.special = U32::new(options.special);
                    file.user_info.copy_from_slice(&options.finder_info[..16]);
                    file.finder_info.copy_from_slice(&options.finder_info[16..]);
                    file.data_fork = fork_raw(data.len(), &extents);
                    file.resource_fork = fork_raw(options.resource_fork.len(), &rsrc_extents);

                    overflow.extend(records);
                    files += 1;

                    (file.as_bytes().to_vec(), FILE_THREAD_RECORD)
                }
            };

            catalog.push((entry.id, Vec::new(), catalog_key(entry.id, &[]), thread_record(thread_type, entry.parent, &name)));
            catalog.push((entry.parent, name.clone(), catalog_key(entry.parent, &name), record));
        }

        catalog.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| self.compare_names(&a.1, &b.1)));

        let key_compare_type = if self.hfsx { BINARY_COMPARE } else { 0xCF };
        let catalog_tree = TreeBuilder::new(TREE_NODE_SIZE, 516)
            .key_compare_type(key_compare_type)
            .build(catalog.into_iter().map(|(_, _, key, data)| (key, data)).collect());
        let catalog_extent = alloc.store(&catalog_tree);

        // Ordered by file ID, fork type, then start block.
        overflow.sort_by(|a, b| {
            let order = |key: &[u8]| (key[4..8].to_vec(), key[2], key[8..12].to_vec());
            order(&a.0).cmp(&order(&b.0))
        });

        let extents_tree = TreeBuilder::new(TREE_NODE_SIZE, 10).build(overflow);
        let extents_extent = alloc.store(&extents_tree);

        let attributes = self.with_attributes.then(|| {
            let mut attributes = self.attributes.clone();
            attributes.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| unicode::encode(&a.1).cmp(&unicode::encode(&b.1))));

            let records = attributes
                .iter()
                .map(|(id, name, value)| attribute_record(*id, name, value))
                .collect();
            let tree = TreeBuilder::new(TREE_NODE_SIZE, 266).build(records);
            let extent = alloc.store(&tree);

            (tree.len(), extent)
        });

        for _ in 0..FREE_BLOCKS {
            alloc.skip();
        }

        let total_blocks = alloc.block();
        let mut header = VolumeHeaderRaw::new_zeroed();

        header.signature = U16::new(if self.hfsx { SIGNATURE_HFSX } else { SIGNATURE_HFS_PLUS });
        header.version = U16::new(if self.hfsx { 5 } else { 4 });
        header.file_count = U32::new(files);
        header.folder_count = U32::new(folders);
        header.block_size = U32::new(VOLUME_BLOCK_SIZE as u32);
        header.total_blocks = U32::new(total_blocks);
        header.free_blocks = U32::new(FREE_BLOCKS as u32);
        header.next_catalog_id = U32::new(self.next_id);
        header.catalog_file = fork_raw(catalog_tree.len(), &[catalog_extent]);
        header.extents_file = fork_raw(extents_tree.len(), &[extents_extent]);

        if let Some((len, extent)) = attributes {
            header.attributes_file = fork_raw(len, &[extent]);
        }

        let mut image = alloc.image;
        image[1024..1536].copy_from_slice(header.as_bytes());

        if !self.wrapped {
            return image;
        }

        // Wrapper allocation blocks start at sector 8; the volume is in
        // block 1.
        let mut mdb = MasterDirectoryBlockRaw::new_zeroed();

        mdb.signature = U16::new(SIGNATURE_HFS);
        mdb.allocation_block_size = U32::new(VOLUME_BLOCK_SIZE as u32);
        mdb.allocation_block_start = U16::new(8);
        mdb.embed_signature = U16::new(SIGNATURE_HFS_PLUS);
        mdb.embed_start_block = U16::new(1);
        mdb.embed_block_count = U16::new(total_blocks as u16);

        let mut wrapper = vec![0u8; 2 * VOLUME_BLOCK_SIZE];
        wrapper[1024..1024 + size_of::<MasterDirectoryBlockRaw>()].copy_from_slice(mdb.as_bytes());
        wrapper.extend_from_slice(&image);
        wrapper
    }

    pub fn build_reader(&self) -> Arc<dyn Reader> {
        Arc::new(MemoryReader::new(self.build()))
    }
}
