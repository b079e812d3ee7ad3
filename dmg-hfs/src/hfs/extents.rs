use crate::cache::CacheZone;
use crate::hfs::btree::{BTree, KeyComparator};
use crate::hfs::ondisk::{ExtentDescriptor, ExtentDescriptorRaw, ExtentKeyRaw};
use crate::hfs::{Error, ExtentGapSnafu};
use crate::reader::Reader;
use log::debug;
use snafu::ensure;
use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use zerocopy::FromBytes;

pub const DATA_FORK: u8 = 0x00;
pub const RESOURCE_FORK: u8 = 0xFF;

/// Matches every extent record of one fork, whatever its start block.
///
/// Overflow keys sort by file ID, then fork type, then start block, so one
/// fork's records are contiguous in the leaf chain.
struct ForkComparator {
    file_id: u32,
    fork_type: u8,
}

impl KeyComparator for ForkComparator {
    fn compare(&self, record_key: &[u8]) -> Ordering {
        match ExtentKeyRaw::read_from_prefix(record_key) {
            Ok((key, _)) => (key.file_id.get(), key.fork_type).cmp(&(self.file_id, self.fork_type)),
            Err(_) => Ordering::Less,
        }
    }
}

/// The extents overflow file, holding the extents of forks that do not fit
/// in the eight descriptors of their catalog record.
pub struct ExtentsOverflowTree {
    tree: BTree,
    lookups: AtomicUsize,
}

impl std::fmt::Debug for ExtentsOverflowTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentsOverflowTree")
            .field("tree", &self.tree)
            .field("lookups", &self.lookup_count())
            .finish()
    }
}

impl ExtentsOverflowTree {
    pub fn open(fork: Arc<dyn Reader>, zone: Arc<CacheZone>) -> Result<Self, Error> {
        Ok(Self {
            tree: BTree::open("extents", fork, zone)?,
            lookups: AtomicUsize::new(0),
        })
    }

    /// Returns the extents of a fork starting at allocation block
    /// `start_block` of the fork.
    ///
    /// The first record found must start exactly at `start_block`. An empty
    /// result means the tree has no more extents for the fork.
    pub fn find_extents_for_file(
        &self,
        file_id: u32,
        resource_fork: bool,
        start_block: u32,
    ) -> Result<Vec<ExtentDescriptor>, Error> {
        self.lookups.fetch_add(1, AtomicOrdering::Relaxed);

        let fork_type = if resource_fork { RESOURCE_FORK } else { DATA_FORK };
        let leaves = self.tree.find_leaf_nodes(&ForkComparator { file_id, fork_type })?;
        let mut extents = Vec::new();
        let mut first = true;

        for leaf in &leaves {
            for i in 0..leaf.record_count() {
                let Ok((key, _)) = ExtentKeyRaw::read_from_prefix(leaf.record_key(i)) else {
                    continue;
                };

                if key.file_id.get() != file_id || key.fork_type != fork_type {
                    continue;
                }

                // Extents already listed by the caller.
                if key.start_block.get() < start_block {
                    continue;
                }

                if first {
                    ensure!(
                        key.start_block.get() == start_block,
                        ExtentGapSnafu {
                            file_id,
                            expected: start_block,
                            found: key.start_block.get()
                        }
                    );
                    first = false;
                }

                let Ok((descriptors, _)) = <[ExtentDescriptorRaw; 8]>::read_from_prefix(leaf.record_data(i)) else {
                    continue;
                };

                extents.extend(
                    descriptors
                        .iter()
                        .map(ExtentDescriptor::from)
                        .take_while(|e| e.block_count != 0),
                );
            }
        }

        debug!(
            "extents: {} overflow extents for file #{file_id} from block {start_block}",
            extents.len()
        );

        Ok(extents)
    }

    /// Number of lookups made so far.
    #[must_use]
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(AtomicOrdering::Relaxed)
    }
}
