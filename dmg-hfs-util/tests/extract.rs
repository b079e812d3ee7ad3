use dmg_hfs::hfs::catalog::ROOT_FOLDER_ID;
use dmg_hfs::reader::Reader;
use dmg_hfs::testutil::{DmgBuilder, FileOptions, VolumeBuilder};
use dmg_hfs_util::{ExtractError, ExtractProgress, OpenImageError, OpenOptions, VolumeExtractor, open_image};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

fn sample_volume() -> VolumeBuilder {
    let mut builder = VolumeBuilder::new();
    let docs = builder.folder(ROOT_FOLDER_ID, "Documents");
    let nested = builder.folder(docs, "Nested");

    builder.file(ROOT_FOLDER_ID, "readme.txt", b"hello from the volume\n");
    builder.file(docs, "empty", b"");
    builder.file(nested, "pattern.bin", &pattern(20_000));
    builder.fragmented_file(ROOT_FOLDER_ID, "fragmented.bin", &pattern(12 * 4096 + 77), 10);
    builder.hard_link(docs, "linked.txt", b"shared contents");

    builder
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn write_image(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn dmg_image(volume: &[u8]) -> Vec<u8> {
    DmgBuilder::new()
        .partition("Protective Master Boot Record (MBR : 0)", &[0u8; 512], 1)
        .partition("disk image (Apple_HFS : 1)", volume, 16)
        .build()
}

fn assert_sample_extracted(out: &Path) {
    assert_eq!(
        std::fs::read(out.join("readme.txt")).unwrap(),
        b"hello from the volume\n"
    );
    assert_eq!(std::fs::read(out.join("Documents/empty")).unwrap(), b"");
    assert_eq!(
        std::fs::read(out.join("Documents/Nested/pattern.bin")).unwrap(),
        pattern(20_000)
    );
    assert_eq!(
        std::fs::read(out.join("fragmented.bin")).unwrap(),
        pattern(12 * 4096 + 77)
    );
    assert_eq!(
        std::fs::read(out.join("Documents/linked.txt")).unwrap(),
        b"shared contents"
    );
    assert!(!out.join("\0\0\0\0HFS+ Private Data").exists());
}

#[derive(Default)]
struct CountingProgress {
    total: AtomicUsize,
    files: AtomicUsize,
    completed: AtomicUsize,
    directories: AtomicUsize,
    skipped: Mutex<Vec<PathBuf>>,
    finished: AtomicUsize,
}

impl ExtractProgress for CountingProgress {
    fn start(&self, total_files: usize) {
        self.total.store(total_files, Ordering::SeqCst);
    }

    fn directory(&self, _path: &Path) {
        self.directories.fetch_add(1, Ordering::SeqCst);
    }

    fn file(&self, _path: &Path, _size: u64) {
        self.files.fetch_add(1, Ordering::SeqCst);
    }

    fn file_completed(&self, _written: u64) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn skipped(&self, path: &Path, _reason: &str) {
        self.skipped.lock().unwrap().push(path.to_path_buf());
    }

    fn completed(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn open_dmg_selects_hfs_partition() {
    let dir = tempfile::tempdir().unwrap();
    let volume = sample_volume().build();
    let path = write_image(dir.path(), "sample.dmg", &dmg_image(&volume));

    let image = open_image(&path, &OpenOptions::default()).unwrap();

    assert_eq!(image.partition_index(), Some(1));
    assert_eq!(image.partition().unwrap().name, "disk image");
    assert_eq!(image.partition().unwrap().kind, "Apple_HFS");
    assert_eq!(image.disk().unwrap().partitions().len(), 2);
    assert!(!image.filesystem().is_hfsx());

    let entries = image.filesystem().list_directory("/").unwrap();
    let names: Vec<&str> = entries.keys().map(String::as_str).collect();

    assert_eq!(names, ["Documents", "fragmented.bin", "readme.txt"]);
}

#[test]
fn open_dmg_with_explicit_partition() {
    let dir = tempfile::tempdir().unwrap();
    let volume = sample_volume().build();
    let path = write_image(dir.path(), "sample.dmg", &dmg_image(&volume));

    let options = OpenOptions {
        partition: Some(0),
        ..OpenOptions::default()
    };

    // The first partition is a boot record, not a volume.
    let err = open_image(&path, &options).unwrap_err();
    assert!(matches!(err, OpenImageError::OpenVolume { .. }), "{err:?}");

    let options = OpenOptions {
        partition: Some(5),
        ..OpenOptions::default()
    };

    let err = open_image(&path, &options).unwrap_err();
    assert!(matches!(err, OpenImageError::OpenPartition { .. }), "{err:?}");
}

#[test]
fn open_dmg_without_hfs_partition() {
    let dir = tempfile::tempdir().unwrap();
    let data = DmgBuilder::new()
        .partition("Apple_Free (Apple_Free : 1)", &[0u8; 1024], 1)
        .build();
    let path = write_image(dir.path(), "empty.dmg", &data);

    let err = open_image(&path, &OpenOptions::default()).unwrap_err();
    assert!(matches!(err, OpenImageError::NoHfsPartition), "{err:?}");
}

#[test]
fn open_raw_volume() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "volume.hfs", &sample_volume().hfsx().build());

    let image = open_image(&path, &OpenOptions::default()).unwrap();

    assert!(image.disk().is_none());
    assert!(image.partition().is_none());
    assert!(image.filesystem().is_hfsx());
    assert_eq!(image.filesystem().stat("/readme.txt").unwrap().size, 22);
}

#[test]
fn open_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = open_image(&dir.path().join("missing.dmg"), &OpenOptions::default()).unwrap_err();

    assert!(matches!(err, OpenImageError::OpenFile { .. }), "{err:?}");
}

#[test]
fn open_mmap_matches_positional_reads() {
    let dir = tempfile::tempdir().unwrap();
    let volume = sample_volume().build();
    let path = write_image(dir.path(), "sample.dmg", &dmg_image(&volume));

    let image = unsafe { dmg_hfs_util::open_image_mmap(&path, &OpenOptions::default()).unwrap() };
    let reader = image
        .filesystem()
        .open_file("/Documents/Nested/pattern.bin")
        .unwrap();
    let mut data = vec![0u8; reader.len() as usize];

    reader.read_exact_at(0, &mut data).unwrap();
    assert_eq!(data, pattern(20_000));
}

#[test]
fn extract_dmg() {
    let dir = tempfile::tempdir().unwrap();
    let volume = sample_volume().build();
    let path = write_image(dir.path(), "sample.dmg", &dmg_image(&volume));
    let out = dir.path().join("out");

    let image = open_image(&path, &OpenOptions::default()).unwrap();
    let progress = CountingProgress::default();

    VolumeExtractor::new(image.filesystem(), &progress, false)
        .extract(&out)
        .unwrap();

    assert_sample_extracted(&out);
    assert_eq!(progress.total.load(Ordering::SeqCst), 5);
    assert_eq!(progress.files.load(Ordering::SeqCst), 5);
    assert_eq!(progress.completed.load(Ordering::SeqCst), 5);
    assert_eq!(progress.directories.load(Ordering::SeqCst), 2);
    assert_eq!(progress.finished.load(Ordering::SeqCst), 1);
    assert!(progress.skipped.lock().unwrap().is_empty());
}

#[test]
fn extract_wrapped_volume() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "wrapped.hfs", &sample_volume().wrapped().build());
    let out = dir.path().join("out");

    let image = open_image(&path, &OpenOptions::default()).unwrap();

    VolumeExtractor::new(image.filesystem(), dmg_hfs_util::SilentProgress, false)
        .extract(&out)
        .unwrap();

    assert_sample_extracted(&out);
}

#[test]
fn extract_subfolder() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "volume.hfs", &sample_volume().build());
    let out = dir.path().join("docs");

    let image = open_image(&path, &OpenOptions::default()).unwrap();

    VolumeExtractor::new(image.filesystem(), dmg_hfs_util::SilentProgress, false)
        .extract_path("/Documents", &out)
        .unwrap();

    assert_eq!(
        std::fs::read(out.join("Nested/pattern.bin")).unwrap(),
        pattern(20_000)
    );
    assert!(!out.join("readme.txt").exists());
}

#[test]
fn extract_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "volume.hfs", &sample_volume().build());
    let out = dir.path().join("out");

    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("readme.txt"), b"stale").unwrap();

    let image = open_image(&path, &OpenOptions::default()).unwrap();
    let err = VolumeExtractor::new(image.filesystem(), dmg_hfs_util::SilentProgress, false)
        .extract(&out)
        .unwrap_err();

    assert!(matches!(err, ExtractError::CreateFileFailed { .. }), "{err:?}");
    assert_eq!(std::fs::read(out.join("readme.txt")).unwrap(), b"stale");

    VolumeExtractor::new(image.filesystem(), dmg_hfs_util::SilentProgress, true)
        .extract(&out)
        .unwrap();

    assert_sample_extracted(&out);
}

#[test]
fn extract_skips_compressed_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = VolumeBuilder::new();
    let id = builder.file_with(
        ROOT_FOLDER_ID,
        "compressed",
        b"",
        FileOptions {
            owner_flags: 0x20,
            ..FileOptions::default()
        },
    );
    builder.file(ROOT_FOLDER_ID, "plain", b"plain");

    let mut header = b"fpmc".to_vec();
    header.extend_from_slice(&3u32.to_le_bytes());
    header.extend_from_slice(&1234u64.to_le_bytes());
    builder.attribute(id, "com.apple.decmpfs", &header);

    let path = write_image(dir.path(), "volume.hfs", &builder.build());
    let out = dir.path().join("out");
    let image = open_image(&path, &OpenOptions::default()).unwrap();
    let progress = CountingProgress::default();

    assert_eq!(image.filesystem().stat("/compressed").unwrap().size, 1234);

    VolumeExtractor::new(image.filesystem(), &progress, false)
        .extract(&out)
        .unwrap();

    assert_eq!(std::fs::read(out.join("plain")).unwrap(), b"plain");
    assert!(!out.join("compressed").exists());
    assert_eq!(*progress.skipped.lock().unwrap(), [out.join("compressed")]);
}

#[cfg(unix)]
#[test]
fn extract_symlink() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = VolumeBuilder::new();

    builder.file(ROOT_FOLDER_ID, "target.txt", b"pointed at");
    builder.file_with(
        ROOT_FOLDER_ID,
        "link",
        b"target.txt",
        FileOptions {
            mode: 0o120755,
            ..FileOptions::default()
        },
    );

    let path = write_image(dir.path(), "volume.hfs", &builder.build());
    let out = dir.path().join("out");
    let image = open_image(&path, &OpenOptions::default()).unwrap();

    VolumeExtractor::new(image.filesystem(), dmg_hfs_util::SilentProgress, false)
        .extract(&out)
        .unwrap();

    assert_eq!(
        std::fs::read_link(out.join("link")).unwrap(),
        Path::new("target.txt")
    );
    assert_eq!(std::fs::read(out.join("link")).unwrap(), b"pointed at");

    // A second run with overwrite replaces the link instead of failing.
    VolumeExtractor::new(image.filesystem(), dmg_hfs_util::SilentProgress, true)
        .extract(&out)
        .unwrap();

    assert_eq!(
        std::fs::read_link(out.join("link")).unwrap(),
        Path::new("target.txt")
    );
}
