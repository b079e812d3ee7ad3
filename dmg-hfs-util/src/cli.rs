use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "dmg-hfs-util")]
#[command(about = "HFS+ volume and DMG image utility", long_about = None)]
pub struct Cli {
    /// Increase logging verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Arguments shared by every subcommand.
#[derive(Debug, Args)]
pub struct ImageArgs {
    /// Path to the DMG image or raw HFS+ volume
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,

    /// Partition of a DMG image to open (defaults to the first HFS+ one)
    #[arg(short, long, value_name = "INDEX")]
    pub partition: Option<usize>,

    /// Capacity of the file data cache, in 4 KiB blocks
    #[arg(long, value_name = "BLOCKS")]
    pub file_cache: Option<usize>,

    /// Capacity of the B-tree node cache, in 4 KiB blocks
    #[arg(long, value_name = "BLOCKS")]
    pub tree_cache: Option<usize>,

    /// Read the image through a memory map instead of positional reads
    #[arg(long)]
    pub mmap: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Display information about an image and its volume
    Info {
        #[command(flatten)]
        image: ImageArgs,
    },

    /// List a folder
    Ls {
        #[command(flatten)]
        image: ImageArgs,

        /// Folder on the volume
        #[arg(value_name = "PATH", default_value = "/")]
        path: String,
    },

    /// Write a file to standard output
    Cat {
        #[command(flatten)]
        image: ImageArgs,

        /// File on the volume; append `#..namedfork#rsrc` for its resource fork
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// Display the metadata of a file or folder
    Stat {
        #[command(flatten)]
        image: ImageArgs,

        /// File or folder on the volume
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// List extended attributes, or print one
    Xattr {
        #[command(flatten)]
        image: ImageArgs,

        /// File or folder on the volume
        #[arg(value_name = "PATH")]
        path: String,

        /// Attribute to print
        #[arg(value_name = "NAME")]
        name: Option<String>,
    },

    /// Extract a volume to a directory
    Extract {
        #[command(flatten)]
        image: ImageArgs,

        /// Output directory (defaults to the image name)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Overwrite existing files
        #[arg(short, long)]
        force: bool,

        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },
}
