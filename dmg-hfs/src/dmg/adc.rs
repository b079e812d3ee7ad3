//! Apple Data Compression (ADC) decoder.
//!
//! An ADC stream is a sequence of chunks, each either a literal run or a
//! back-reference into the bytes already produced:
//!
//! | first byte  | header | length           | distance               |
//! |-------------|--------|------------------|------------------------|
//! | `1xxxxxxx`  | 1      | `(b & 0x7f) + 1` | literal follows        |
//! | `01xxxxxx`  | 3      | `(b & 0x3f) + 4` | next two bytes + 1     |
//! | `00xxxxyy`  | 2      | `xxxx + 3`       | `yy:next byte` + 1     |

use byteorder::{BigEndian, ByteOrder};
use snafu::{Snafu, ensure};

/// Longest output a single chunk can produce.
pub const MAX_CHUNK_OUTPUT: usize = 0x80;

/// Farthest a back-reference can reach.
pub const MAX_DISTANCE: usize = 0x10000;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AdcError {
    #[snafu(display(
        "back-reference at input offset {input_offset} reaches {distance} bytes back from output offset {output_offset}"
    ))]
    InvalidBackReference {
        input_offset: usize,
        output_offset: usize,
        distance: usize,
    },
}

enum Chunk {
    Literal { len: usize },
    Copy { header: usize, len: usize, distance: usize },
}

/// Decodes the chunk starting at `input[0]`, or `None` if its header is not
/// complete yet.
fn parse_chunk(input: &[u8]) -> Option<Chunk> {
    let byte = *input.first()?;

    if byte & 0x80 != 0 {
        Some(Chunk::Literal {
            len: (byte & 0x7f) as usize + 1,
        })
    } else if byte & 0x40 != 0 {
        let offset = BigEndian::read_u16(input.get(1..3)?) as usize;

        Some(Chunk::Copy {
            header: 3,
            len: (byte & 0x3f) as usize + 4,
            distance: offset + 1,
        })
    } else {
        let low = *input.get(1)? as usize;

        Some(Chunk::Copy {
            header: 2,
            len: ((byte & 0x3f) >> 2) as usize + 3,
            distance: (((byte & 0x03) as usize) << 8 | low) + 1,
        })
    }
}

/// Decodes as many whole chunks of `input` as fit into `output`, writing from
/// `restart_index`.
///
/// Back-references may reach into `output[..restart_index]`, so a caller can
/// resume a stream by keeping the tail of its previous output in front of
/// `restart_index`. Decoding stops at the first chunk that is incomplete in
/// `input` or does not fit in `output`.
///
/// Returns the number of input bytes consumed and the output index after the
/// last byte written.
pub fn decompress(
    input: &[u8],
    output: &mut [u8],
    restart_index: usize,
) -> Result<(usize, usize), AdcError> {
    let mut inp = 0;
    let mut outp = restart_index;

    while let Some(chunk) = parse_chunk(&input[inp..]) {
        match chunk {
            Chunk::Literal { len } => {
                if inp + 1 + len > input.len() || outp + len > output.len() {
                    break;
                }

                output[outp..outp + len].copy_from_slice(&input[inp + 1..inp + 1 + len]);
                inp += 1 + len;
                outp += len;
            }
            Chunk::Copy {
                header,
                len,
                distance,
            } => {
                if outp + len > output.len() {
                    break;
                }

                ensure!(
                    distance <= outp,
                    InvalidBackReferenceSnafu {
                        input_offset: inp,
                        output_offset: outp,
                        distance,
                    }
                );

                // Source and destination may overlap; copy forward byte by byte.
                for i in outp..outp + len {
                    output[i] = output[i - distance];
                }

                inp += header;
                outp += len;
            }
        }
    }

    Ok((inp, outp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::adc_compress;

    #[test]
    fn decodes_all_chunk_kinds() {
        // "abcd", then 18 bytes from 4 back, then 5 bytes from 2 back.
        let input = [0x83, b'a', b'b', b'c', b'd', 0x3c, 0x03, 0x41, 0x00, 0x01];
        let mut output = [0u8; 64];

        let (consumed, written) = decompress(&input, &mut output, 0).unwrap();

        assert_eq!(consumed, input.len());
        assert_eq!(written, 4 + 18 + 5);
        assert_eq!(&output[..22], b"abcdabcdabcdabcdabcdab");
        assert_eq!(&output[22..27], b"ababa");
    }

    #[test]
    fn stops_before_incomplete_chunk() {
        let input = [0x83, b'a', b'b', b'c', b'd', 0x85, b'x'];
        let mut output = [0u8; 64];

        assert_eq!(decompress(&input, &mut output, 0).unwrap(), (5, 4));
        assert_eq!(decompress(&input[..6], &mut output, 0).unwrap(), (5, 4));
    }

    #[test]
    fn stops_when_output_is_full() {
        let input = [0x83, b'a', b'b', b'c', b'd', 0x83, b'e', b'f', b'g', b'h'];
        let mut output = [0u8; 6];

        assert_eq!(decompress(&input, &mut output, 0).unwrap(), (5, 4));
    }

    #[test]
    fn rejects_reference_before_start() {
        let input = [0x80, b'a', 0x00, 0x05];
        let mut output = [0u8; 16];

        assert!(decompress(&input, &mut output, 0).is_err());
    }

    #[test]
    fn resuming_matches_single_pass() {
        let data: Vec<u8> = (0..20_000u32)
            .map(|i| if i % 1000 < 700 { (i % 97) as u8 } else { (i * 31 % 251) as u8 })
            .collect();
        let encoded = adc_compress(&data, 97);

        let mut whole = vec![0u8; data.len()];
        let (consumed, written) = decompress(&encoded, &mut whole, 0).unwrap();
        assert_eq!((consumed, written), (encoded.len(), data.len()));
        assert_eq!(whole, data);

        // Feed the stream in uneven pieces, resuming at the previous end.
        let mut resumed = vec![0u8; data.len()];
        let mut inp = 0;
        let mut outp = 0;

        for piece in [1usize, 2, 50, 333, 4096].iter().cycle() {
            if inp == encoded.len() {
                break;
            }

            let end = (inp + piece).min(encoded.len());
            let (used, next) = decompress(&encoded[inp..end], &mut resumed, outp).unwrap();

            inp += used;
            outp = next;
        }

        assert_eq!(outp, data.len());
        assert_eq!(resumed, data);
    }
}
