//! A library for random-access reads of HFS+ and HFSX volumes, including
//! volumes stored inside UDIF (`.dmg`) disk images.
//!
//! Everything is built from composable [`Reader`](reader::Reader)s:
//!
//! - [`reader`]: positional readers over memory, files and byte ranges
//! - [`cache`]: a shared LRU block cache placed in front of slow readers
//! - [`dmg`]: UDIF trailer and block tables, plus on-demand decompression of
//!   zlib, bzip2, ADC and LZFSE runs
//! - [`hfs`]: the HFS+ volume header, B-trees (catalog, extents overflow,
//!   attributes), forks and a path-based [`Filesystem`](hfs::Filesystem)
//!
//! All readers take `&self` and are `Send + Sync`, so a volume can be shared
//! across threads via [`Arc`](std::sync::Arc).
//!
//! # Example
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use dmg_hfs::dmg::DmgDisk;
//! use dmg_hfs::hfs::{Filesystem, HfsVolume};
//! use dmg_hfs::reader::FileReader;
//! use std::sync::Arc;
//!
//! let disk = DmgDisk::open(Arc::new(FileReader::open("image.dmg")?))?;
//! let index = disk.find_hfs_partition().ok_or("no HFS+ partition")?;
//! let volume = HfsVolume::open(disk.reader_for_partition(index)?)?;
//! let fs = Filesystem::new(Arc::new(volume))?;
//!
//! for (name, stat) in fs.list_directory("/")? {
//!     println!("{name}: {} bytes", stat.size);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod dmg;
pub mod hfs;
pub mod reader;

/// Builders for synthetic images, for this crate's tests and those of
/// dependent crates.
#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod testutil;
