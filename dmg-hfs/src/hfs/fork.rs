use crate::hfs::extents::ExtentsOverflowTree;
use crate::hfs::ondisk::{ExtentDescriptor, ForkData};
use crate::hfs::{Error, MissingExtentSnafu};
use crate::reader::Reader;
use std::cmp::min;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

/// A [`Reader`] over the data or resource fork of one file.
///
/// Reads are mapped through the fork's extents onto the volume. Extents past
/// the first eight are fetched from the extents overflow tree the first time
/// a read needs them and kept for later reads.
pub struct HfsFork {
    volume: Arc<dyn Reader>,
    block_size: u32,
    file_id: u32,
    resource_fork: bool,
    logical_size: u64,
    extents: Mutex<Vec<ExtentDescriptor>>,
    overflow: Option<Arc<ExtentsOverflowTree>>,
}

impl std::fmt::Debug for HfsFork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfsFork")
            .field("file_id", &self.file_id)
            .field("resource_fork", &self.resource_fork)
            .field("logical_size", &self.logical_size)
            .finish_non_exhaustive()
    }
}

impl HfsFork {
    /// Creates a fork of file `file_id` whose allocation blocks of
    /// `block_size` bytes live in `volume`.
    ///
    /// Without an `overflow` tree only the eight extents of `fork` are used;
    /// this is the case for the extents overflow file itself.
    pub fn new(
        volume: Arc<dyn Reader>,
        block_size: u32,
        fork: &ForkData,
        file_id: u32,
        resource_fork: bool,
        overflow: Option<Arc<ExtentsOverflowTree>>,
    ) -> Self {
        let extents = fork
            .extents
            .iter()
            .copied()
            .take_while(|e| e.block_count != 0)
            .collect();

        Self {
            volume,
            block_size,
            file_id,
            resource_fork,
            logical_size: fork.logical_size,
            extents: Mutex::new(extents),
            overflow,
        }
    }

    #[must_use]
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    #[must_use]
    pub fn is_resource_fork(&self) -> bool {
        self.resource_fork
    }

    /// Number of extents known so far.
    #[must_use]
    pub fn extent_count(&self) -> usize {
        self.extents.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Finds the extent holding allocation block `block` of the fork,
    /// returning it with the fork block it starts at.
    fn find_extent(&self, block: u64) -> Result<(ExtentDescriptor, u64), Error> {
        loop {
            let (known, covered) = {
                let extents = self.extents.lock().unwrap_or_else(PoisonError::into_inner);
                let mut first = 0u64;

                for extent in extents.iter() {
                    let end = first + u64::from(extent.block_count);

                    if block < end {
                        return Ok((*extent, first));
                    }

                    first = end;
                }

                (extents.len(), first)
            };

            let missing = MissingExtentSnafu {
                file_id: self.file_id,
                block,
            };

            let (Some(overflow), Ok(start)) = (&self.overflow, u32::try_from(covered)) else {
                return missing.fail();
            };

            if self.file_id == 0 {
                return missing.fail();
            }

            let more = overflow.find_extents_for_file(self.file_id, self.resource_fork, start)?;

            if more.is_empty() {
                return missing.fail();
            }

            let mut extents = self.extents.lock().unwrap_or_else(PoisonError::into_inner);

            // Another reader may have extended the list meanwhile.
            if extents.len() == known {
                extents.extend(more);
            }
        }
    }
}

impl Reader for HfsFork {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || offset >= self.logical_size {
            return Ok(0);
        }

        let block_size = u64::from(self.block_size);
        let end = min(offset + buf.len() as u64, self.logical_size);
        let mut pos = offset;

        while pos < end {
            let (extent, first_block) = self.find_extent(pos / block_size)?;
            let in_extent = pos - first_block * block_size;
            let available = u64::from(extent.block_count) * block_size - in_extent;
            let n = min(available, end - pos) as usize;
            let done = (pos - offset) as usize;
            let volume_offset = u64::from(extent.start_block) * block_size + in_extent;

            let read = self.volume.read_at(volume_offset, &mut buf[done..done + n])?;

            pos += read as u64;

            if read < n {
                break;
            }
        }

        Ok((pos - offset) as usize)
    }

    fn len(&self) -> u64 {
        self.logical_size
    }
}
