mod error;

pub use self::error::ExtractError;

use self::error::{
    CreateDirectoryFailedSnafu, CreateFileFailedSnafu, ListDirectoryFailedSnafu, OpenFileFailedSnafu,
    ReadFileFailedSnafu, ReadLinkFailedSnafu, UnsupportedFileNameSnafu, WriteFailedSnafu,
};
use crate::progress::ExtractProgress;
use dmg_hfs::hfs::{ErrorKind, Filesystem};
use dmg_hfs::reader::Reader;
use log::debug;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use snafu::{ResultExt, ensure};
use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Extracts the contents of a volume to a directory.
pub struct VolumeExtractor<'a, P: ExtractProgress> {
    fs: &'a Filesystem,
    progress: P,
    overwrite: bool,
}

impl<'a, P: ExtractProgress> VolumeExtractor<'a, P> {
    /// Creates a new extractor for the given volume.
    ///
    /// If `overwrite` is `true`, existing files will be replaced during extraction.
    /// Otherwise, extraction will fail if an output file already exists.
    pub fn new(fs: &'a Filesystem, progress: P, overwrite: bool) -> Self {
        Self {
            fs,
            progress,
            overwrite,
        }
    }

    /// Extracts the whole volume to the specified directory.
    pub fn extract(&self, output: impl AsRef<Path>) -> Result<(), ExtractError> {
        self.extract_path("/", output)
    }

    /// Extracts the folder at `path` on the volume to the specified directory.
    ///
    /// Directories and symbolic links are created sequentially, then all
    /// files are extracted in parallel using rayon.
    pub fn extract_path(&self, path: &str, output: impl AsRef<Path>) -> Result<(), ExtractError> {
        let output = output.as_ref();

        // Phase 1: Walk the folder tree and collect all work items.
        let mut work = Work::default();

        collect_items(self.fs, path, output, &mut work)?;

        self.progress.start(work.files.len());

        // Phase 2: Create all directories, then links.
        create_dir_all(output).context(CreateDirectoryFailedSnafu { path: output })?;

        for dir in &work.dirs {
            self.progress.directory(dir);
            create_dir_all(dir).context(CreateDirectoryFailedSnafu { path: dir })?;
        }

        for link in &work.links {
            self.extract_link(link)?;
        }

        // Phase 3: Extract all files in parallel.
        work.files
            .par_iter()
            .try_for_each(|file| self.extract_file(file))?;

        self.progress.completed();

        Ok(())
    }

    fn extract_link(&self, link: &LinkWork) -> Result<(), ExtractError> {
        let target = self
            .fs
            .read_link(&link.volume_path)
            .context(ReadLinkFailedSnafu {
                path: &link.volume_path,
            })?;

        #[cfg(unix)]
        {
            if self.overwrite && link.output_path.symlink_metadata().is_ok() {
                std::fs::remove_file(&link.output_path)
                    .context(error::CreateSymlinkFailedSnafu { path: &link.output_path })?;
            }

            std::os::unix::fs::symlink(&target, &link.output_path)
                .context(error::CreateSymlinkFailedSnafu { path: &link.output_path })?;
        }

        #[cfg(not(unix))]
        self.progress.skipped(
            &link.output_path,
            &format!("symbolic link to {target} is not supported here"),
        );

        Ok(())
    }

    /// Extracts a single file to disk.
    ///
    /// Called from rayon worker threads in parallel.
    fn extract_file(&self, work: &FileWork) -> Result<(), ExtractError> {
        let reader = match self.fs.open_file(&work.volume_path) {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::FunctionNotImplemented => {
                self.progress.skipped(&work.output_path, &e.to_string());
                return Ok(());
            }
            Err(e) => {
                return Err(e).context(OpenFileFailedSnafu {
                    path: &work.volume_path,
                });
            }
        };

        self.progress.file(&work.output_path, reader.len());

        let mut opts = OpenOptions::new();
        opts.write(true);

        if self.overwrite {
            opts.create(true).truncate(true);
        } else {
            opts.create_new(true);
        }

        let mut dest = opts.open(&work.output_path).context(CreateFileFailedSnafu {
            path: &work.output_path,
        })?;

        let mut buffer = vec![0u8; 1024 * 1024];
        let mut offset = 0u64;

        loop {
            let read = match reader.read_at(offset, &mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(e).context(ReadFileFailedSnafu {
                        path: &work.volume_path,
                    });
                }
            };

            dest.write_all(&buffer[..read]).context(WriteFailedSnafu {
                path: &work.output_path,
            })?;

            offset += read as u64;
        }

        self.progress.file_completed(offset);

        Ok(())
    }
}

/// A file to be extracted, collected during the folder walk.
struct FileWork {
    volume_path: String,
    output_path: PathBuf,
}

struct LinkWork {
    volume_path: String,
    output_path: PathBuf,
}

#[derive(Default)]
struct Work {
    dirs: Vec<PathBuf>,
    files: Vec<FileWork>,
    links: Vec<LinkWork>,
}

/// Recursively walks a folder and collects all directories, files and links
/// into flat lists for later extraction.
fn collect_items(fs: &Filesystem, path: &str, output: &Path, work: &mut Work) -> Result<(), ExtractError> {
    let items = fs
        .list_directory(path)
        .context(ListDirectoryFailedSnafu { path })?;

    for (name, stat) in items {
        let item_path = if path.ends_with('/') {
            format!("{path}{name}")
        } else {
            format!("{path}/{name}")
        };

        ensure!(
            !matches!(name.as_str(), "" | "." | "..") && !name.contains('\0'),
            UnsupportedFileNameSnafu { path: item_path }
        );

        let item_output = output.join(&name);

        if stat.is_dir() {
            work.dirs.push(item_output.clone());
            collect_items(fs, &item_path, &item_output, work)?;
        } else if stat.is_symlink() {
            work.links.push(LinkWork {
                volume_path: item_path,
                output_path: item_output,
            });
        } else if stat.is_file() {
            work.files.push(FileWork {
                volume_path: item_path,
                output_path: item_output,
            });
        } else {
            debug!("skipping special file {item_path} (mode {:o})", stat.mode);
        }
    }

    Ok(())
}
