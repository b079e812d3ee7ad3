use std::cmp::min;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

/// Granularity advised by readers that have no better knowledge of their
/// backing storage.
pub const DEFAULT_OPTIMAL_BLOCK: u64 = 4096;

/// Encapsulates a random-access byte source.
///
/// Every read specifies its own offset, so a reader can be shared between
/// threads behind an [`Arc`] without a cursor to synchronize. Readers are
/// stacked: a file inside a volume inside a compressed partition inside an
/// image file is four readers deep.
pub trait Reader: Send + Sync {
    /// Reads bytes at the given offset into `buf`.
    ///
    /// Returns the number of bytes actually read. A short read indicates
    /// the end of the reader was reached.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// Returns [`io::ErrorKind::UnexpectedEof`] if the reader ends before the
    /// buffer is filled.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut total = 0;

        while total < buf.len() {
            let n = self.read_at(offset + total as u64, &mut buf[total..])?;

            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("unexpected EOF at offset {:#x}", offset + total as u64),
                ));
            }

            total += n;
        }

        Ok(())
    }

    /// Returns the total length in bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the reader is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the byte range that is cheapest to read as a unit around
    /// `offset`.
    ///
    /// Readers that decode data in chunks (compressed runs, for example)
    /// report the whole chunk so a cache in front of them can take all of it
    /// in one read.
    fn advise_optimal_block(&self, offset: u64) -> Range<u64> {
        default_optimal_block(offset, self.len())
    }
}

/// Computes the [`DEFAULT_OPTIMAL_BLOCK`]-aligned window around `offset`,
/// clamped to `len`.
#[must_use]
pub fn default_optimal_block(offset: u64, len: u64) -> Range<u64> {
    let start = offset & !(DEFAULT_OPTIMAL_BLOCK - 1);
    let end = min(start + DEFAULT_OPTIMAL_BLOCK, len);

    start..end.max(start)
}

impl<R: Reader + ?Sized> Reader for Arc<R> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }

    fn advise_optimal_block(&self, offset: u64) -> Range<u64> {
        (**self).advise_optimal_block(offset)
    }
}

impl<R: Reader + ?Sized> Reader for Box<R> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn len(&self) -> u64 {
        (**self).len()
    }

    fn advise_optimal_block(&self, offset: u64) -> Range<u64> {
        (**self).advise_optimal_block(offset)
    }
}

/// A reader over bytes already in memory (a `Vec<u8>`, a memory map, ...).
///
/// Reads are pure slice indexing.
pub struct MemoryReader<T = Vec<u8>> {
    data: T,
}

impl<T: AsRef<[u8]>> MemoryReader<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }

    /// Returns the underlying bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_ref()
    }
}

impl<T: AsRef<[u8]>> std::fmt::Debug for MemoryReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReader")
            .field("len", &self.data.as_ref().len())
            .finish()
    }
}

impl<T: AsRef<[u8]> + Send + Sync> Reader for MemoryReader<T> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.as_ref();

        if offset >= data.len() as u64 {
            return Ok(0);
        }

        let start = offset as usize;
        let n = min(buf.len(), data.len() - start);

        buf[..n].copy_from_slice(&data[start..start + n]);

        Ok(n)
    }

    fn len(&self) -> u64 {
        self.data.as_ref().len() as u64
    }
}

/// A reader over a file on disk using positional reads.
///
/// The length is captured when the reader is created.
pub struct FileReader {
    file: File,
    len: u64,
}

impl FileReader {
    /// Opens `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::from_file(File::open(path)?)
    }

    pub fn from_file(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();

        Ok(Self { file, len })
    }

    #[cfg(unix)]
    fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)
    }
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Reader for FileReader {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }

        let want = min(buf.len() as u64, self.len - offset) as usize;
        let mut total = 0;

        while total < want {
            match self.pread(offset + total as u64, &mut buf[total..want]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// A byte-range view onto a parent reader.
///
/// Reads are clamped to the view; offsets are relative to its start.
#[derive(Clone)]
pub struct SubReader {
    parent: Arc<dyn Reader>,
    offset: u64,
    len: u64,
}

impl SubReader {
    /// Creates a view of `len` bytes starting at `offset` in `parent`.
    ///
    /// The view is truncated if it would extend past the end of `parent`.
    pub fn new(parent: Arc<dyn Reader>, offset: u64, len: u64) -> Self {
        let len = min(len, parent.len().saturating_sub(offset));

        Self {
            parent,
            offset,
            len,
        }
    }

    /// Returns the offset of this view within its parent.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl std::fmt::Debug for SubReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubReader")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Reader for SubReader {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }

        let n = min(buf.len() as u64, self.len - offset) as usize;

        self.parent.read_at(self.offset + offset, &mut buf[..n])
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn advise_optimal_block(&self, offset: u64) -> Range<u64> {
        let parent = self.parent.advise_optimal_block(self.offset + offset);
        let start = parent.start.saturating_sub(self.offset).min(self.len);
        let end = parent.end.saturating_sub(self.offset).min(self.len);

        start..end.max(start)
    }
}

/// A cursor over a [`Reader`], implementing [`Read`] and [`Seek`].
///
/// This is useful when you need to pass a file to APIs that expect standard
/// I/O traits (e.g. `io::copy`). Each cursor keeps its own position.
pub struct ReaderCursor<R: Reader> {
    reader: R,
    pos: u64,
}

impl<R: Reader> ReaderCursor<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, pos: 0 }
    }

    /// Returns the current position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Reader> std::fmt::Debug for ReaderCursor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderCursor")
            .field("len", &self.reader.len())
            .field("pos", &self.pos)
            .finish()
    }
}

impl<R: Reader> Read for ReaderCursor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Reader> Seek for ReaderCursor<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.reader.len();

        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => len as i64 + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };

        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        }

        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn numbered(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn memory_reader_clamps_at_end() {
        let reader = MemoryReader::new(numbered(100));
        let mut buf = [0u8; 40];

        assert_eq!(reader.read_at(80, &mut buf).unwrap(), 20);
        assert_eq!(&buf[..20], &numbered(100)[80..]);
        assert_eq!(reader.read_at(100, &mut buf).unwrap(), 0);
        assert!(reader.read_exact_at(90, &mut buf).is_err());
    }

    #[test]
    fn default_advice_is_aligned_and_clamped() {
        assert_eq!(default_optimal_block(5000, 100_000), 4096..8192);
        assert_eq!(default_optimal_block(5000, 6000), 4096..6000);
        assert_eq!(default_optimal_block(0, 0), 0..0);
    }

    #[test]
    fn sub_reader_translates_reads_and_advice() {
        let parent: Arc<dyn Reader> = Arc::new(MemoryReader::new(numbered(20_000)));
        let sub = SubReader::new(parent, 1000, 10_000);
        let mut buf = [0u8; 16];

        assert_eq!(sub.len(), 10_000);
        assert_eq!(sub.read_at(0, &mut buf).unwrap(), 16);
        assert_eq!(&buf[..], &numbered(20_000)[1000..1016]);
        assert_eq!(sub.read_at(9_990, &mut buf).unwrap(), 10);

        // Parent window 4096..8192 seen from offset 1000.
        assert_eq!(sub.advise_optimal_block(4000), 3096..7192);
        // First parent window 0..4096 starts before the view.
        assert_eq!(sub.advise_optimal_block(10), 0..3096);
        // Parent window 8192..12288 is clamped to the view.
        assert_eq!(sub.advise_optimal_block(9_999), 7192..10_000);
    }

    #[test]
    fn sub_reader_truncated_by_parent() {
        let parent: Arc<dyn Reader> = Arc::new(MemoryReader::new(numbered(100)));

        assert_eq!(SubReader::new(parent.clone(), 60, 100).len(), 40);
        assert_eq!(SubReader::new(parent, 200, 100).len(), 0);
    }

    #[test]
    fn file_reader_reads_positionally() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&numbered(10_000)).unwrap();

        let reader = FileReader::from_file(file).unwrap();
        let mut buf = vec![0u8; 3000];

        assert_eq!(reader.len(), 10_000);
        assert_eq!(reader.read_at(8000, &mut buf).unwrap(), 2000);
        assert_eq!(&buf[..2000], &numbered(10_000)[8000..]);
        reader.read_exact_at(100, &mut buf).unwrap();
        assert_eq!(&buf[..], &numbered(10_000)[100..3100]);
    }

    #[test]
    fn cursor_reads_and_seeks() {
        let mut cursor = ReaderCursor::new(MemoryReader::new(numbered(300)));
        let mut buf = [0u8; 10];

        cursor.seek(SeekFrom::End(-5)).unwrap();
        assert_eq!(cursor.read(&mut buf).unwrap(), 5);
        assert_eq!(cursor.position(), 300);
        assert!(cursor.seek(SeekFrom::Current(-400)).is_err());

        let mut all = Vec::new();
        cursor.seek(SeekFrom::Start(0)).unwrap();
        cursor.read_to_end(&mut all).unwrap();
        assert_eq!(all, numbered(300));
    }
}
