use crate::cache::CacheZone;
use crate::hfs::Error;
use crate::hfs::btree::{BTree, KeyComparator};
use crate::hfs::ondisk::{ATTR_INLINE_DATA, AttributeInlineRaw, AttributeKeyRaw};
use crate::hfs::unicode;
use crate::reader::Reader;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use zerocopy::FromBytes;

struct AttributeKey {
    file_id: u32,
    name: Vec<u16>,
}

fn parse_key(key: &[u8]) -> Option<AttributeKey> {
    let (raw, rest) = AttributeKeyRaw::read_from_prefix(key).ok()?;
    let name = rest.get(..raw.name_length.get() as usize * 2)?;

    Some(AttributeKey {
        file_id: raw.file_id.get(),
        name: unicode::units_from_be(name),
    })
}

/// Returns the value of an inline attribute record, or `None` for fork and
/// extent records.
fn inline_value(data: &[u8]) -> Option<&[u8]> {
    let (raw, rest) = AttributeInlineRaw::read_from_prefix(data).ok()?;

    if raw.record_type.get() != ATTR_INLINE_DATA {
        return None;
    }

    rest.get(..raw.attr_size.get() as usize)
}

/// Matches every attribute of one file.
struct FileComparator(u32);

impl KeyComparator for FileComparator {
    fn compare(&self, record_key: &[u8]) -> Ordering {
        match AttributeKeyRaw::read_from_prefix(record_key) {
            Ok((key, _)) => key.file_id.get().cmp(&self.0),
            Err(_) => Ordering::Less,
        }
    }
}

/// Matches one attribute of one file by name.
struct NameComparator<'a> {
    file_id: u32,
    name: &'a [u16],
}

impl KeyComparator for NameComparator<'_> {
    fn compare(&self, record_key: &[u8]) -> Ordering {
        match parse_key(record_key) {
            Some(key) => key
                .file_id
                .cmp(&self.file_id)
                .then_with(|| key.name.as_slice().cmp(self.name)),
            None => Ordering::Less,
        }
    }
}

/// The attributes file, holding extended attributes keyed by file and name.
///
/// Only values stored inline in the tree are returned.
#[derive(Debug)]
pub struct AttributeTree {
    tree: BTree,
}

impl AttributeTree {
    pub fn open(fork: Arc<dyn Reader>, zone: Arc<CacheZone>) -> Result<Self, Error> {
        Ok(Self {
            tree: BTree::open("attributes", fork, zone)?,
        })
    }

    /// Returns every inline attribute of file `file_id` by name.
    pub fn get_all(&self, file_id: u32) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        let leaves = self.tree.find_leaf_nodes(&FileComparator(file_id))?;
        let mut attributes = BTreeMap::new();

        for leaf in &leaves {
            for i in 0..leaf.record_count() {
                let Some(key) = parse_key(leaf.record_key(i)) else {
                    continue;
                };

                if key.file_id != file_id {
                    continue;
                }

                if let Some(value) = inline_value(leaf.record_data(i)) {
                    attributes.insert(unicode::decode(&key.name), value.to_vec());
                }
            }
        }

        Ok(attributes)
    }

    /// Returns the inline attribute `name` of file `file_id`, if any.
    pub fn get(&self, file_id: u32, name: &str) -> Result<Option<Vec<u8>>, Error> {
        let name = unicode::encode(name);
        let comparator = NameComparator {
            file_id,
            name: &name,
        };

        let Some(leaf) = self.tree.find_leaf_node(&comparator, false)? else {
            return Ok(None);
        };

        let value = (0..leaf.record_count())
            .filter(|&i| parse_key(leaf.record_key(i)).is_some_and(|key| key.file_id == file_id && key.name == name))
            .find_map(|i| inline_value(leaf.record_data(i)))
            .map(<[u8]>::to_vec);

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemoryReader;
    use crate::testutil::{TreeBuilder, attribute_record};

    fn tree() -> AttributeTree {
        // A fork-data record (type 0x20) is not an inline value.
        let (fork_key, _) = attribute_record(21, "big", b"");

        let mut records = vec![
            attribute_record(16, "com.apple.quarantine", b"0081;"),
            attribute_record(20, "user.a", b"A"),
            attribute_record(20, "user.b", b"BB"),
            (fork_key, 0x20u32.to_be_bytes().repeat(4)),
        ];

        for i in 0..100 {
            records.push(attribute_record(30 + i, "user.padding", &[i as u8; 40]));
        }

        let bytes = TreeBuilder::new(512, 266).build(records);

        AttributeTree::open(Arc::new(MemoryReader::new(bytes)), Arc::new(CacheZone::new(64))).unwrap()
    }

    #[test]
    fn lists_attributes_of_a_file() {
        let tree = tree();
        let all = tree.get_all(20).unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(all["user.a"], b"A");
        assert_eq!(all["user.b"], b"BB");
        assert!(tree.get_all(21).unwrap().is_empty());
        assert_eq!(tree.get_all(129).unwrap()["user.padding"], [99u8; 40]);
    }

    #[test]
    fn gets_attribute_by_name() {
        let tree = tree();

        assert_eq!(tree.get(20, "user.b").unwrap().unwrap(), b"BB");
        assert_eq!(tree.get(16, "com.apple.quarantine").unwrap().unwrap(), b"0081;");
        assert_eq!(tree.get(77, "user.padding").unwrap().unwrap(), [47u8; 40]);
        assert!(tree.get(20, "user.c").unwrap().is_none());
        assert!(tree.get(21, "big").unwrap().is_none());
    }
}
