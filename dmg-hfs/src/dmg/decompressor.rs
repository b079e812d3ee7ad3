//! Decoders for the compressed run types of a block table.
//!
//! A decompressor is opened over the compressed bytes of one run and produces
//! the run's decompressed bytes in order. It keeps its state between calls, so
//! sequential reads of one run decode the stream only once; moving backwards
//! requires a new decompressor.

use super::adc::{self, AdcError};
use super::udif::RunType;
use crate::reader::Reader;
use flate2::FlushDecompress;
use snafu::{ResultExt, Snafu, ensure};
use std::cmp::min;
use std::sync::Arc;

/// Size of the read-ahead buffer over the compressed input.
const INPUT_BUFFER_SIZE: usize = 8192;

/// Size of the scratch buffer used to skip forward.
const SKIP_BUFFER_SIZE: usize = 4096;

/// Bytes of ADC output kept before the window slides.
const ADC_WINDOW_LIMIT: usize = 0x20000;

/// Errors from decoding a compressed run.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DecompressError {
    #[snafu(display("cannot read compressed data at offset {offset:#x}"))]
    ReadInput {
        offset: u64,
        source: std::io::Error,
    },

    #[snafu(display("zlib stream is corrupt"))]
    Zlib { source: flate2::DecompressError },

    #[snafu(display("bzip2 stream is corrupt"))]
    Bzip2 { source: bzip2::Error },

    #[snafu(display("LZFSE stream is corrupt: {message}"))]
    Lzfse { message: String },

    #[snafu(display("ADC stream is corrupt"))]
    Adc { source: AdcError },

    #[snafu(display("stream ended after {produced} bytes, {wanted} needed"))]
    EndedEarly { produced: u64, wanted: u64 },

    #[snafu(display("cannot seek backwards from {position} to {offset}"))]
    BackwardSeek { position: u64, offset: u64 },

    #[snafu(display("run type {kind:?} is not compressed"))]
    NotCompressed { kind: RunType },
}

type Result<T, E = DecompressError> = std::result::Result<T, E>;

/// A decoder positioned somewhere in the decompressed bytes of one run.
pub trait Decompressor: Send {
    /// Returns the number of decompressed bytes produced so far.
    fn position(&self) -> u64;

    /// Produces the next bytes of the stream into `output`.
    ///
    /// Returns fewer bytes than requested only at the end of the stream.
    fn produce(&mut self, output: &mut [u8]) -> Result<usize>;

    /// Fills `output` with the decompressed bytes starting at `offset`.
    ///
    /// Bytes between the current position and `offset` are decoded and
    /// discarded.
    fn decompress(&mut self, output: &mut [u8], offset: u64) -> Result<()> {
        let position = self.position();

        ensure!(offset >= position, BackwardSeekSnafu { position, offset });

        let mut skip = [0u8; SKIP_BUFFER_SIZE];

        while self.position() < offset {
            let n = min(SKIP_BUFFER_SIZE as u64, offset - self.position()) as usize;

            if self.produce(&mut skip[..n])? == 0 {
                return EndedEarlySnafu {
                    produced: self.position(),
                    wanted: offset,
                }
                .fail();
            }
        }

        let produced = self.produce(output)?;

        ensure!(
            produced == output.len(),
            EndedEarlySnafu {
                produced: self.position(),
                wanted: offset + output.len() as u64,
            }
        );

        Ok(())
    }
}

/// Opens the decompressor for `kind` over the compressed bytes in `input`.
pub fn open(kind: RunType, input: Arc<dyn Reader>) -> Result<Box<dyn Decompressor>> {
    let decompressor: Box<dyn Decompressor> = match kind {
        RunType::Zlib => Box::new(Streaming::new(
            ZlibCodec(flate2::Decompress::new(true)),
            input,
        )),
        RunType::Bzip2 => Box::new(Streaming::new(
            Bzip2Codec(bzip2::Decompress::new(false)),
            input,
        )),
        RunType::Adc => Box::new(AdcDecompressor::new(input)),
        RunType::Lzfse => Box::new(LzfseDecompressor::new(input)),
        kind => return NotCompressedSnafu { kind }.fail(),
    };

    Ok(decompressor)
}

/// Buffered sequential access to the compressed bytes of a run.
struct RunInput {
    reader: Arc<dyn Reader>,
    pos: u64,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl RunInput {
    fn new(reader: Arc<dyn Reader>) -> Self {
        Self {
            reader,
            pos: 0,
            buf: vec![0u8; INPUT_BUFFER_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Returns the buffered bytes, reading more if none are left.
    ///
    /// An empty slice means the end of the run.
    fn fill(&mut self) -> Result<&[u8]> {
        if self.start == self.end {
            self.refill()?;
        }

        Ok(&self.buf[self.start..self.end])
    }

    /// Moves the unconsumed bytes to the front and appends more input.
    ///
    /// Returns `false` if nothing could be added.
    fn refill(&mut self) -> Result<bool> {
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;

        let n = self
            .reader
            .read_at(self.pos, &mut self.buf[self.end..])
            .context(ReadInputSnafu { offset: self.pos })?;

        self.pos += n as u64;
        self.end += n;

        Ok(n > 0)
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
    }
}

/// One step of a streaming decoder.
trait StreamCodec: Send {
    /// Decodes from `input` into `output`, returning the bytes consumed, the
    /// bytes produced and whether the stream has ended.
    fn step(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize, bool)>;
}

struct ZlibCodec(flate2::Decompress);

impl StreamCodec for ZlibCodec {
    fn step(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize, bool)> {
        let (total_in, total_out) = (self.0.total_in(), self.0.total_out());
        let status = self
            .0
            .decompress(input, output, FlushDecompress::None)
            .context(ZlibSnafu)?;

        Ok((
            (self.0.total_in() - total_in) as usize,
            (self.0.total_out() - total_out) as usize,
            status == flate2::Status::StreamEnd,
        ))
    }
}

struct Bzip2Codec(bzip2::Decompress);

impl StreamCodec for Bzip2Codec {
    fn step(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize, bool)> {
        let (total_in, total_out) = (self.0.total_in(), self.0.total_out());
        let status = self.0.decompress(input, output).context(Bzip2Snafu)?;

        Ok((
            (self.0.total_in() - total_in) as usize,
            (self.0.total_out() - total_out) as usize,
            status == bzip2::Status::StreamEnd,
        ))
    }
}

/// Drives a [`StreamCodec`] over a run's input.
struct Streaming<C> {
    codec: C,
    input: RunInput,
    position: u64,
    finished: bool,
}

impl<C: StreamCodec> Streaming<C> {
    fn new(codec: C, input: Arc<dyn Reader>) -> Self {
        Self {
            codec,
            input: RunInput::new(input),
            position: 0,
            finished: false,
        }
    }
}

impl<C: StreamCodec> Decompressor for Streaming<C> {
    fn position(&self) -> u64 {
        self.position
    }

    fn produce(&mut self, output: &mut [u8]) -> Result<usize> {
        let mut done = 0;

        while done < output.len() && !self.finished {
            let input = self.input.fill()?;
            let exhausted = input.is_empty();
            let (consumed, produced, finished) = self.codec.step(input, &mut output[done..])?;

            self.input.consume(consumed);
            self.position += produced as u64;
            self.finished = finished;
            done += produced;

            // No progress: the codec needs more contiguous input than is buffered.
            if consumed == 0 && produced == 0 && !finished && (exhausted || !self.input.refill()?) {
                break;
            }
        }

        Ok(done)
    }
}

/// ADC decoder over a sliding window of recent output.
struct AdcDecompressor {
    input: RunInput,
    window: Box<[u8]>,
    /// Stream position of `window[0]`.
    window_base: u64,
    /// Number of valid bytes in `window`.
    filled: usize,
    position: u64,
}

impl AdcDecompressor {
    fn new(input: Arc<dyn Reader>) -> Self {
        Self {
            input: RunInput::new(input),
            window: vec![0u8; ADC_WINDOW_LIMIT + adc::MAX_CHUNK_OUTPUT].into_boxed_slice(),
            window_base: 0,
            filled: 0,
            position: 0,
        }
    }
}

impl Decompressor for AdcDecompressor {
    fn position(&self) -> u64 {
        self.position
    }

    fn produce(&mut self, output: &mut [u8]) -> Result<usize> {
        let mut done = 0;

        while done < output.len() {
            let available = (self.position - self.window_base) as usize;

            if available < self.filled {
                let n = min(self.filled - available, output.len() - done);

                output[done..done + n].copy_from_slice(&self.window[available..available + n]);
                done += n;
                self.position += n as u64;
                continue;
            }

            // Everything decoded has been handed out; keep only the lookback.
            if self.filled >= ADC_WINDOW_LIMIT {
                let keep = adc::MAX_DISTANCE;
                let drop = self.filled - keep;

                self.window.copy_within(drop..self.filled, 0);
                self.filled = keep;
                self.window_base += drop as u64;
            }

            let input = self.input.fill()?;

            if input.is_empty() {
                break;
            }

            let (consumed, written) =
                adc::decompress(input, &mut self.window, self.filled).context(AdcSnafu)?;

            self.input.consume(consumed);

            if written == self.filled && !self.input.refill()? {
                break;
            }

            self.filled = written;
        }

        Ok(done)
    }
}

/// LZFSE decoder; LZFSE blocks are decoded whole, so the run is decoded in
/// one call and kept.
struct LzfseDecompressor {
    input: Arc<dyn Reader>,
    decoded: Option<Vec<u8>>,
    position: u64,
}

impl LzfseDecompressor {
    fn new(input: Arc<dyn Reader>) -> Self {
        Self {
            input,
            decoded: None,
            position: 0,
        }
    }

    fn decoded(&mut self) -> Result<&[u8]> {
        if self.decoded.is_none() {
            let mut compressed = vec![0u8; self.input.len() as usize];

            self.input
                .read_exact_at(0, &mut compressed)
                .context(ReadInputSnafu { offset: 0u64 })?;

            let mut decoded = Vec::new();

            lzfse_rust::decode_bytes(&compressed, &mut decoded).map_err(|e| {
                LzfseSnafu {
                    message: e.to_string(),
                }
                .build()
            })?;

            self.decoded = Some(decoded);
        }

        Ok(self.decoded.as_deref().unwrap_or_default())
    }
}

impl Decompressor for LzfseDecompressor {
    fn position(&self) -> u64 {
        self.position
    }

    fn produce(&mut self, output: &mut [u8]) -> Result<usize> {
        let position = self.position as usize;
        let decoded = self.decoded()?;
        let n = min(decoded.len().saturating_sub(position), output.len());

        output[..n].copy_from_slice(&decoded[position..position + n]);
        self.position += n as u64;

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemoryReader;
    use crate::testutil::{adc_compress, bzip2_compress, lzfse_compress, zlib_compress};

    fn sample(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| if (i / 300) % 2 == 0 { (i % 13) as u8 } else { (i * 7919 % 251) as u8 })
            .collect()
    }

    fn open_over(kind: RunType, compressed: Vec<u8>) -> Box<dyn Decompressor> {
        open(kind, Arc::new(MemoryReader::new(compressed))).unwrap()
    }

    fn check_codec(kind: RunType, encode: fn(&[u8]) -> Vec<u8>) {
        let data = sample(300_000);
        let compressed = encode(&data);

        // Whole stream in one call.
        let mut whole = vec![0u8; data.len()];
        open_over(kind, compressed.clone()).decompress(&mut whole, 0).unwrap();
        assert_eq!(whole, data, "{kind:?}");

        // Sequential slices on one decoder, skipping forward between them.
        let mut decoder = open_over(kind, compressed.clone());
        let mut buf = vec![0u8; 5000];
        for offset in [0usize, 5000, 77_777, 200_000, 295_000] {
            decoder.decompress(&mut buf, offset as u64).unwrap();
            assert_eq!(buf, data[offset..offset + 5000], "{kind:?} at {offset}");
        }

        // Going back is refused.
        assert!(matches!(
            decoder.decompress(&mut buf, 0),
            Err(DecompressError::BackwardSeek { .. })
        ));

        // Asking for more than the stream holds fails.
        let mut too_long = vec![0u8; data.len() + 1];
        assert!(matches!(
            open_over(kind, compressed).decompress(&mut too_long, 0),
            Err(DecompressError::EndedEarly { .. })
        ));
    }

    #[test]
    fn zlib_runs() {
        check_codec(RunType::Zlib, zlib_compress);
    }

    #[test]
    fn bzip2_runs() {
        check_codec(RunType::Bzip2, bzip2_compress);
    }

    #[test]
    fn lzfse_runs() {
        check_codec(RunType::Lzfse, lzfse_compress);
    }

    #[test]
    fn adc_runs_across_window_slides() {
        check_codec(RunType::Adc, |data| adc_compress(data, 13));
    }

    #[test]
    fn truncated_zlib_stream_fails() {
        let data = sample(50_000);
        let mut compressed = zlib_compress(&data);
        compressed.truncate(compressed.len() / 2);

        let mut out = vec![0u8; data.len()];
        assert!(open_over(RunType::Zlib, compressed).decompress(&mut out, 0).is_err());
    }

    #[test]
    fn raw_runs_have_no_decompressor() {
        assert!(open(RunType::Raw, Arc::new(MemoryReader::new(Vec::new()))).is_err());
    }
}
