//! HFS+ and HFSX volumes.
//!
//! [`HfsVolume`] reads the volume header and owns the trees every lookup
//! goes through. [`CatalogTree`] resolves paths to catalog records, and
//! [`HfsFork`] turns a record's extents into a [`Reader`](crate::reader::Reader).
//! [`Filesystem`] combines them into a path-based API with `stat`-like
//! metadata and extended attributes.

use snafu::Snafu;
use std::io;

pub mod attributes;
pub mod btree;
pub mod catalog;
pub mod extents;
pub mod filesystem;
pub mod fork;
pub mod ondisk;
pub(crate) mod unicode;
pub mod volume;

pub use self::attributes::AttributeTree;
pub use self::btree::{BTree, BTreeHeader, BTreeNode, KeyComparator, NodeKind};
pub use self::catalog::{CatalogRecord, CatalogTree};
pub use self::extents::ExtentsOverflowTree;
pub use self::filesystem::{FileStat, Filesystem};
pub use self::fork::HfsFork;
pub use self::ondisk::{BsdInfo, CatalogFile, CatalogFolder, ExtentDescriptor, ForkData};
pub use self::volume::{HfsVolume, VolumeConfig};

/// Broad category of an [`Error`], used by bindings to pick an errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Io,
    FileNotFound,
    AttributeNotFound,
    NoData,
    OperationNotPermitted,
    FunctionNotImplemented,
    NotADirectory,
    IsADirectory,
}

/// Errors raised while reading an HFS+ volume.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("cannot read {what} at offset {offset:#x}"))]
    Read {
        what: &'static str,
        offset: u64,
        source: io::Error,
    },

    #[snafu(display("unknown volume signature {signature:#06x}"))]
    InvalidSignature { signature: u16 },

    #[snafu(display("plain HFS volume without an embedded HFS+ volume"))]
    PlainHfs,

    #[snafu(display("invalid allocation block size {block_size}"))]
    InvalidBlockSize { block_size: u32 },

    #[snafu(display("{tree} tree: node #0 is not a header node"))]
    InvalidHeaderNode { tree: &'static str },

    #[snafu(display("{tree} tree: invalid node size {node_size}"))]
    InvalidNodeSize { tree: &'static str, node_size: u16 },

    #[snafu(display("{tree} tree: node #{node} is corrupt: {reason}"))]
    CorruptNode {
        tree: &'static str,
        node: u32,
        reason: &'static str,
    },

    #[snafu(display("{tree} tree: node #{node} has unexpected kind {kind:?}"))]
    UnexpectedNodeKind {
        tree: &'static str,
        node: u32,
        kind: NodeKind,
    },

    #[snafu(display("{tree} tree is deeper than {max_depth} levels"))]
    TreeTooDeep { tree: &'static str, max_depth: usize },

    #[snafu(display(
        "overflow extents of file #{file_id} start at block {found}, expected {expected}"
    ))]
    ExtentGap {
        file_id: u32,
        expected: u32,
        found: u32,
    },

    #[snafu(display("no extent of file #{file_id} covers allocation block {block}"))]
    MissingExtent { file_id: u32, block: u64 },

    #[snafu(display("{path}: no such file or directory"))]
    FileNotFound { path: String },

    #[snafu(display("{path}: multiple catalog records named {name:?}"))]
    DuplicateRecord { path: String, name: String },

    #[snafu(display("{path}: catalog record is malformed"))]
    MalformedRecord { path: String },

    #[snafu(display("{path}: not a directory"))]
    NotADirectory { path: String },

    #[snafu(display("{path}: is a directory"))]
    IsADirectory { path: String },

    #[snafu(display("{path}: {operation} is not permitted"))]
    NotPermitted {
        path: String,
        operation: &'static str,
    },

    #[snafu(display("attribute {name:?} not found"))]
    AttributeNotFound { name: String },

    #[snafu(display("volume has no attributes file"))]
    NoAttributesFile,

    #[snafu(display("{what} is not supported"))]
    Unsupported { what: &'static str },
}

impl Error {
    /// Returns the category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FileNotFound { .. } => ErrorKind::FileNotFound,
            Self::AttributeNotFound { .. } => ErrorKind::AttributeNotFound,
            Self::NoAttributesFile => ErrorKind::NoData,
            Self::NotPermitted { .. } => ErrorKind::OperationNotPermitted,
            Self::Unsupported { .. } => ErrorKind::FunctionNotImplemented,
            Self::NotADirectory { .. } => ErrorKind::NotADirectory,
            Self::IsADirectory { .. } => ErrorKind::IsADirectory,
            Self::Read { source, .. } if source.kind() == io::ErrorKind::Unsupported => {
                ErrorKind::FunctionNotImplemented
            }
            _ => ErrorKind::Io,
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match e.kind() {
            ErrorKind::FileNotFound => io::ErrorKind::NotFound,
            ErrorKind::OperationNotPermitted => io::ErrorKind::PermissionDenied,
            ErrorKind::FunctionNotImplemented => io::ErrorKind::Unsupported,
            ErrorKind::NotADirectory => io::ErrorKind::NotADirectory,
            ErrorKind::IsADirectory => io::ErrorKind::IsADirectory,
            _ => io::ErrorKind::Other,
        };

        io::Error::new(kind, e)
    }
}
