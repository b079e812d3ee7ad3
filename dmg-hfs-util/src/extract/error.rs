use snafu::Snafu;
use std::path::PathBuf;

/// Errors that can occur during volume extraction.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
#[non_exhaustive]
pub enum ExtractError {
    #[snafu(display("cannot list {path} on the volume: {source}"))]
    ListDirectoryFailed {
        path: String,
        source: dmg_hfs::hfs::Error,
    },

    #[snafu(display("unsupported file name in volume path: {path}"))]
    UnsupportedFileName { path: String },

    #[snafu(display("cannot open {path} on the volume: {source}"))]
    OpenFileFailed {
        path: String,
        source: dmg_hfs::hfs::Error,
    },

    #[snafu(display("cannot read {path} from the volume: {source}"))]
    ReadFileFailed {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("cannot read link {path} on the volume: {source}"))]
    ReadLinkFailed {
        path: String,
        source: dmg_hfs::hfs::Error,
    },

    #[snafu(display("cannot create directory {}: {source}", path.display()))]
    CreateDirectoryFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot create file {}: {source}", path.display()))]
    CreateFileFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot create symbolic link {}: {source}", path.display()))]
    CreateSymlinkFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot write to {}: {source}", path.display()))]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}
