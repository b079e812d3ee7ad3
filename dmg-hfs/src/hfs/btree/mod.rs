//! The B-tree engine shared by the catalog, extents overflow and attributes
//! files.
//!
//! Nodes are read through a [`CachedReader`] on the volume's tree zone.
//! Searches are driven by a [`KeyComparator`] that orders raw record keys
//! against whatever the caller is looking for.

use crate::cache::{CacheZone, CachedReader};
use crate::hfs::ondisk::{HeaderRecordRaw, NodeDescriptorRaw};
use crate::hfs::{
    CorruptNodeSnafu, Error, InvalidHeaderNodeSnafu, InvalidNodeSizeSnafu, ReadSnafu, TreeTooDeepSnafu,
    UnexpectedNodeKindSnafu,
};
use crate::reader::Reader;
use bitflags::bitflags;
use log::{trace, warn};
use snafu::{OptionExt, ResultExt, ensure};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use zerocopy::FromBytes;

pub use self::node::{BTreeNode, NodeKind};

mod node;

/// Deepest tree accepted while descending; HFS+ trees stay far below this.
const MAX_DEPTH: usize = 16;

bitflags! {
    /// Attributes of a B-tree, from its header record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TreeAttributes: u32 {
        const BAD_CLOSE = 0x1;
        const BIG_KEYS = 0x2;
        const VARIABLE_INDEX_KEYS = 0x4;
    }
}

/// Orders record keys against a search key.
pub trait KeyComparator {
    /// Compares `record_key` (starting with its length field) to the search
    /// key: [`Ordering::Less`] means the record sorts before it.
    fn compare(&self, record_key: &[u8]) -> Ordering;
}

/// Fields of a B-tree header record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeHeader {
    pub depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub btree_type: u8,
    /// `0xBC` for binary name comparison on HFSX catalogs, `0xCF` for case
    /// folding.
    pub key_compare_type: u8,
    pub attributes: TreeAttributes,
}

impl From<&HeaderRecordRaw> for BTreeHeader {
    fn from(raw: &HeaderRecordRaw) -> Self {
        Self {
            depth: raw.tree_depth.get(),
            root_node: raw.root_node.get(),
            leaf_records: raw.leaf_records.get(),
            first_leaf_node: raw.first_leaf_node.get(),
            last_leaf_node: raw.last_leaf_node.get(),
            node_size: raw.node_size.get(),
            max_key_length: raw.max_key_length.get(),
            total_nodes: raw.total_nodes.get(),
            free_nodes: raw.free_nodes.get(),
            btree_type: raw.btree_type,
            key_compare_type: raw.key_compare_type,
            attributes: TreeAttributes::from_bits_retain(raw.attributes.get()),
        }
    }
}

/// An on-disk B-tree stored in a fork.
pub struct BTree {
    name: &'static str,
    reader: CachedReader,
    header: BTreeHeader,
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("name", &self.name)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl BTree {
    /// Opens the tree stored in `fork`, caching its nodes in `zone`.
    pub fn open(name: &'static str, fork: Arc<dyn Reader>, zone: Arc<CacheZone>) -> Result<Self, Error> {
        let reader = CachedReader::new(fork, zone, name);
        let mut buf = [0u8; size_of::<NodeDescriptorRaw>() + size_of::<HeaderRecordRaw>()];

        reader.read_exact_at(0, &mut buf).context(ReadSnafu {
            what: "B-tree header",
            offset: 0u64,
        })?;

        let (descriptor, rest) = NodeDescriptorRaw::read_from_prefix(&buf)
            .map_err(|_| InvalidHeaderNodeSnafu { tree: name }.build())?;

        ensure!(
            NodeKind::from(descriptor.kind) == NodeKind::Header,
            InvalidHeaderNodeSnafu { tree: name }
        );

        let (raw, _) = HeaderRecordRaw::read_from_prefix(rest)
            .map_err(|_| InvalidHeaderNodeSnafu { tree: name }.build())?;
        let header = BTreeHeader::from(&raw);

        ensure!(
            header.node_size.is_power_of_two() && (512..=32768).contains(&header.node_size),
            InvalidNodeSizeSnafu {
                tree: name,
                node_size: header.node_size
            }
        );

        trace!(
            "{name} tree: depth {}, root #{}, {} leaf records, node size {}",
            header.depth, header.root_node, header.leaf_records, header.node_size
        );

        Ok(Self {
            name,
            reader,
            header,
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn header(&self) -> &BTreeHeader {
        &self.header
    }

    /// Reads and decodes node `index`.
    pub fn read_node(&self, index: u32) -> Result<BTreeNode, Error> {
        let size = self.header.node_size as usize;
        let offset = u64::from(index) * size as u64;
        let mut data = vec![0u8; size];

        trace!("{} tree: reading node #{index}", self.name);

        self.reader.read_exact_at(offset, &mut data).context(ReadSnafu {
            what: "B-tree node",
            offset,
        })?;

        let fixed_index_key = if self.header.attributes.contains(TreeAttributes::VARIABLE_INDEX_KEYS) {
            None
        } else {
            Some(self.header.max_key_length)
        };

        BTreeNode::parse(self.name, index, data, fixed_index_key)
    }

    /// Descends from the root to the leaf that may hold the search key.
    ///
    /// With `wildcard` the search stops before the first record comparing
    /// equal, so that every matching record is at or after the returned
    /// leaf. Returns `None` for an empty tree.
    pub fn find_leaf_node(&self, comparator: &dyn KeyComparator, wildcard: bool) -> Result<Option<BTreeNode>, Error> {
        if self.header.root_node == 0 {
            return Ok(None);
        }

        self.traverse_tree(self.header.root_node, comparator, wildcard)
            .map(Some)
    }

    fn traverse_tree(&self, start: u32, comparator: &dyn KeyComparator, wildcard: bool) -> Result<BTreeNode, Error> {
        let mut index = start;

        for _ in 0..MAX_DEPTH {
            let node = self.read_node(index)?;

            match node.kind() {
                NodeKind::Leaf => return Ok(node),
                NodeKind::Index => {
                    let corrupt = move |reason: &'static str| CorruptNodeSnafu {
                        tree: self.name,
                        node: index,
                        reason,
                    };

                    ensure!(node.record_count() > 0, corrupt("empty index node"));

                    let position = descend_position(&node, comparator, wildcard);

                    index = node
                        .child_pointer(position)
                        .context(corrupt("index record without child pointer"))?;
                }
                kind => {
                    return UnexpectedNodeKindSnafu {
                        tree: self.name,
                        node: index,
                        kind,
                    }
                    .fail();
                }
            }
        }

        TreeTooDeepSnafu {
            tree: self.name,
            max_depth: MAX_DEPTH,
        }
        .fail()
    }

    /// Collects the run of leaves that may hold records matching
    /// `comparator`, in key order.
    pub fn find_leaf_nodes(&self, comparator: &dyn KeyComparator) -> Result<Vec<BTreeNode>, Error> {
        let Some(first) = self.find_leaf_node(comparator, true)? else {
            return Ok(Vec::new());
        };

        let mut visited = HashSet::from([first.index()]);
        let mut leaves = vec![first];

        loop {
            let link = leaves[leaves.len() - 1].forward_link();

            if link == 0 {
                break;
            }

            if !visited.insert(link) {
                warn!("{} tree: leaf link loop at node #{link}", self.name);
                break;
            }

            let node = self.read_node(link)?;

            ensure!(
                node.kind() == NodeKind::Leaf,
                UnexpectedNodeKindSnafu {
                    tree: self.name,
                    node: link,
                    kind: node.kind()
                }
            );

            if node.record_count() == 0 || comparator.compare(node.record_key(0)) == Ordering::Greater {
                break;
            }

            leaves.push(node);
        }

        Ok(leaves)
    }
}

/// Index of the last record of an index node whose key sorts before the
/// search key (or equal to it unless `wildcard`), or 0 if there is none.
fn descend_position(node: &BTreeNode, comparator: &dyn KeyComparator, wildcard: bool) -> usize {
    let before = |i: usize| match comparator.compare(node.record_key(i)) {
        Ordering::Less => true,
        Ordering::Equal => !wildcard,
        Ordering::Greater => false,
    };

    let (mut lo, mut hi) = (0, node.record_count());

    while lo < hi {
        let mid = lo + (hi - lo) / 2;

        if before(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    lo.saturating_sub(1)
}
