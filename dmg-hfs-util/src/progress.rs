use std::path::Path;

/// Trait for receiving extraction progress updates.
///
/// All methods take `&self` (not `&mut self`) so the progress reporter can be
/// shared across threads during parallel extraction.
pub trait ExtractProgress: Send + Sync {
    /// Called once the volume has been walked, before anything is written.
    fn start(&self, _total_files: usize) {}

    /// Called when creating a directory.
    fn directory(&self, _path: &Path) {}

    /// Called when starting to extract a file.
    fn file(&self, _path: &Path, _size: u64) {}

    /// Called when a file has been fully extracted.
    fn file_completed(&self, _written: u64) {}

    /// Called when an item is skipped (e.g., a compressed file).
    fn skipped(&self, _path: &Path, _reason: &str) {}

    /// Called when extraction is complete.
    fn completed(&self) {}
}

impl<T: ExtractProgress + ?Sized> ExtractProgress for &T {
    fn start(&self, total_files: usize) {
        (**self).start(total_files);
    }

    fn directory(&self, path: &Path) {
        (**self).directory(path);
    }

    fn file(&self, path: &Path, size: u64) {
        (**self).file(path, size);
    }

    fn file_completed(&self, written: u64) {
        (**self).file_completed(written);
    }

    fn skipped(&self, path: &Path, reason: &str) {
        (**self).skipped(path, reason);
    }

    fn completed(&self) {
        (**self).completed();
    }
}

/// A no-op progress implementation that discards all updates.
pub struct SilentProgress;

impl ExtractProgress for SilentProgress {}

/// Console progress reporter using an indicatif progress bar.
///
/// Files are counted on a bar that redraws at a fixed rate; skipped items are
/// printed above it.
#[cfg(feature = "cli")]
pub struct ConsoleProgress {
    bar: indicatif::ProgressBar,
}

#[cfg(feature = "cli")]
impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            bar: indicatif::ProgressBar::hidden(),
        }
    }
}

#[cfg(feature = "cli")]
impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cli")]
impl ExtractProgress for ConsoleProgress {
    fn start(&self, total_files: usize) {
        self.bar
            .set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.set_length(total_files as u64);
        self.bar.set_position(0);

        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos}/{len} files [{elapsed_precise}]")
        {
            self.bar.set_style(style.progress_chars("━╸─"));
        }

        self.bar.reset();
    }

    fn file_completed(&self, _written: u64) {
        self.bar.inc(1);
    }

    fn skipped(&self, path: &Path, reason: &str) {
        self.bar
            .println(format!("skipped {}: {reason}", path.display()));
    }

    fn completed(&self) {
        let total = self.bar.position();
        self.bar.finish_and_clear();
        println!("Extraction complete ({} files).", total);
    }
}
