use crate::hfs::ondisk::NodeDescriptorRaw;
use crate::hfs::{CorruptNodeSnafu, Error};
use snafu::ensure;
use std::ops::Range;
use zerocopy::FromBytes;

const DESCRIPTOR_SIZE: usize = size_of::<NodeDescriptorRaw>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Index,
    Header,
    Map,
    Other(i8),
}

impl From<i8> for NodeKind {
    fn from(v: i8) -> Self {
        match v {
            -1 => Self::Leaf,
            0 => Self::Index,
            1 => Self::Header,
            2 => Self::Map,
            v => Self::Other(v),
        }
    }
}

impl NodeKind {
    #[must_use]
    pub fn to_raw(self) -> i8 {
        match self {
            Self::Leaf => -1,
            Self::Index => 0,
            Self::Header => 1,
            Self::Map => 2,
            Self::Other(v) => v,
        }
    }
}

struct Record {
    key: Range<usize>,
    data: Range<usize>,
}

/// One decoded B-tree node.
///
/// Record offsets are validated when the node is parsed, so accessing a
/// record never reads outside the node buffer.
pub struct BTreeNode {
    index: u32,
    data: Vec<u8>,
    kind: NodeKind,
    height: u8,
    forward_link: u32,
    backward_link: u32,
    records: Vec<Record>,
}

impl std::fmt::Debug for BTreeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeNode")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("height", &self.height)
            .field("forward_link", &self.forward_link)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl BTreeNode {
    /// Decodes node `index` from its `data`.
    ///
    /// In keyed nodes (leaf and index) every record starts with a key whose
    /// first two bytes hold its length. When `fixed_index_key` is set, index
    /// node keys always occupy that many bytes after the length field.
    pub(crate) fn parse(
        tree: &'static str,
        index: u32,
        data: Vec<u8>,
        fixed_index_key: Option<u16>,
    ) -> Result<Self, Error> {
        let corrupt = |reason: &'static str| CorruptNodeSnafu {
            tree,
            node: index,
            reason,
        };

        let (descriptor, _) =
            NodeDescriptorRaw::read_from_prefix(&data).map_err(|_| corrupt("too small").build())?;

        let kind = NodeKind::from(descriptor.kind);
        let count = descriptor.num_records.get() as usize;
        let size = data.len();

        // The offset table holds one entry per record plus the free space
        // offset, stored back to front from the end of the node.
        ensure!(
            (count + 1) * 2 + DESCRIPTOR_SIZE <= size,
            corrupt("offset table overlaps the descriptor")
        );

        let table_start = size - (count + 1) * 2;
        let offset_at = |i: usize| {
            let pos = size - 2 * (i + 1);
            u16::from_be_bytes([data[pos], data[pos + 1]]) as usize
        };

        let mut records = Vec::with_capacity(count);

        for i in 0..count {
            let start = offset_at(i);
            let next = offset_at(i + 1);
            let end = if next > start && next <= table_start {
                next
            } else {
                table_start
            };

            ensure!(
                start >= DESCRIPTOR_SIZE && start < end,
                corrupt("record offset out of range")
            );

            let record = match kind {
                NodeKind::Leaf | NodeKind::Index => {
                    ensure!(start + 2 <= end, corrupt("record too short for its key"));

                    let key_len = match (kind, fixed_index_key) {
                        (NodeKind::Index, Some(len)) => len as usize,
                        _ => u16::from_be_bytes([data[start], data[start + 1]]) as usize,
                    };
                    let key_end = start + 2 + key_len;

                    ensure!(key_end <= end, corrupt("key exceeds its record"));

                    Record {
                        key: start..key_end,
                        data: key_end..end,
                    }
                }
                _ => Record {
                    key: start..start,
                    data: start..end,
                },
            };

            records.push(record);
        }

        Ok(Self {
            index,
            kind,
            height: descriptor.height,
            forward_link: descriptor.forward_link.get(),
            backward_link: descriptor.backward_link.get(),
            records,
            data,
        })
    }

    /// Node number within its tree.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[must_use]
    pub fn height(&self) -> u8 {
        self.height
    }

    /// Next node on the same level, 0 for none.
    #[must_use]
    pub fn forward_link(&self) -> u32 {
        self.forward_link
    }

    #[must_use]
    pub fn backward_link(&self) -> u32 {
        self.backward_link
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Key and data of record `i`, or `None` past the last record.
    ///
    /// The key starts with its 2-byte length field.
    #[must_use]
    pub fn record(&self, i: usize) -> Option<(&[u8], &[u8])> {
        let record = self.records.get(i)?;

        Some((&self.data[record.key.clone()], &self.data[record.data.clone()]))
    }

    /// Key of record `i`; callers iterate `0..record_count()`.
    pub(crate) fn record_key(&self, i: usize) -> &[u8] {
        &self.data[self.records[i].key.clone()]
    }

    /// Data of record `i`; callers iterate `0..record_count()`.
    pub(crate) fn record_data(&self, i: usize) -> &[u8] {
        &self.data[self.records[i].data.clone()]
    }

    /// Child node referenced by index record `i`.
    pub(crate) fn child_pointer(&self, i: usize) -> Option<u32> {
        let data = self.record_data(i);

        data.get(..4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::node_bytes;

    fn key(parent: u32) -> Vec<u8> {
        let mut key = vec![0, 6];
        key.extend_from_slice(&parent.to_be_bytes());
        key.extend_from_slice(&[0, 0]);
        key
    }

    #[test]
    fn parses_leaf_records() {
        let records = vec![
            (key(1), b"first".to_vec()),
            (key(2), b"second record".to_vec()),
        ];
        let node = BTreeNode::parse("test", 7, node_bytes(512, NodeKind::Leaf, 1, 9, &records), None).unwrap();

        assert_eq!(node.index(), 7);
        assert_eq!(node.kind(), NodeKind::Leaf);
        assert_eq!(node.forward_link(), 9);
        assert_eq!(node.record_count(), 2);
        assert_eq!(node.record_key(1), &key(2)[..]);
        assert_eq!(node.record_data(0), b"first");
        assert_eq!(node.record_data(1), b"second record");
    }

    #[test]
    fn record_past_the_end_is_none() {
        let records = vec![(key(3), b"only".to_vec())];
        let node = BTreeNode::parse("test", 2, node_bytes(512, NodeKind::Leaf, 1, 0, &records), None).unwrap();

        assert_eq!(node.record(0), Some((&key(3)[..], &b"only"[..])));
        assert_eq!(node.record(1), None);
        assert_eq!(node.record(usize::MAX), None);
    }

    #[test]
    fn index_keys_may_be_fixed_length() {
        // Key length field says 6, but the tree pads index keys to 10.
        let mut padded = key(5);
        padded.extend_from_slice(&[0; 4]);

        let records = vec![(padded, 42u32.to_be_bytes().to_vec())];
        let data = node_bytes(512, NodeKind::Index, 2, 0, &records);

        let node = BTreeNode::parse("test", 1, data.clone(), Some(10)).unwrap();
        assert_eq!(node.child_pointer(0), Some(42));

        let node = BTreeNode::parse("test", 1, data, None).unwrap();
        assert_eq!(node.child_pointer(0), Some(0));
    }

    #[test]
    fn rejects_bad_offsets() {
        let records = vec![(key(1), vec![1, 2, 3])];
        let mut data = node_bytes(512, NodeKind::Leaf, 1, 0, &records);

        // Point record 0 into the descriptor.
        data[510..512].copy_from_slice(&4u16.to_be_bytes());
        assert!(BTreeNode::parse("test", 1, data.clone(), None).is_err());

        // Claim more records than the node can hold.
        data[10..12].copy_from_slice(&300u16.to_be_bytes());
        assert!(BTreeNode::parse("test", 1, data, None).is_err());
    }
}
