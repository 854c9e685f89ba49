// Sources:
// - https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-xca/5655f4a3-6ba4-489b-959f-e1f407c52f15

//! LZNT1 decompression, as used by NTFS compressed attributes.
//!
//! The input is a sequence of chunks, each covering at most 4096 bytes of
//! output. A chunk starts with a 2-byte header: the low 12 bits hold the
//! stored size minus one, bit 15 says whether the chunk is compressed. A
//! compressed chunk is a series of groups, each led by a flag byte whose bits
//! (least significant first) select a literal byte or a 2-byte backreference.

use log::debug;

use crate::error::{NtfsError, Result};

pub const CHUNK_SIZE: usize = 4096;

const CHUNK_COMPRESSED: u16 = 0x8000;
const CHUNK_SIZE_MASK: u16 = 0x0FFF;

/// Decompress a whole compression unit. `cluster_size` is used to skip the
/// padding that follows a zero-length chunk header.
pub fn decompress(input: &[u8], cluster_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut pos = 0usize;
    while pos + 2 <= input.len() {
        let header = u16::from_le_bytes([input[pos], input[pos + 1]]);
        if header == 0 {
            // end of data inside the unit
            break;
        }
        let stored = (header & CHUNK_SIZE_MASK) as usize + 1;
        if header & CHUNK_SIZE_MASK == 0 {
            // empty chunk: the rest of this cluster is padding
            let next = if cluster_size > 0 {
                (pos / cluster_size + 1) * cluster_size
            } else {
                input.len()
            };
            debug!("Zero-sized LZNT1 chunk at {}, skipping to {}.", pos, next);
            pos = next;
            continue;
        }
        let body_start = pos + 2;
        let body_end = body_start + stored;
        if body_end > input.len() {
            return Err(NtfsError::MalformedCompressedData(format!(
                "chunk at {} declares {} bytes, only {} remain",
                pos,
                stored,
                input.len() - body_start
            )));
        }
        let body = &input[body_start..body_end];
        if header & CHUNK_COMPRESSED != 0 {
            decompress_chunk(body, &mut out)?;
        } else {
            out.extend_from_slice(body);
        }
        pos = body_end;
    }
    Ok(out)
}

/// Expand one compressed chunk body, appending to `out`.
fn decompress_chunk(body: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let chunk_start = out.len();
    let mut i = 0usize;
    while i < body.len() {
        let flags = body[i];
        i += 1;
        for bit in 0..8 {
            if i >= body.len() {
                break;
            }
            if flags & (1 << bit) == 0 {
                out.push(body[i]);
                i += 1;
                continue;
            }
            if i + 2 > body.len() {
                return Err(NtfsError::MalformedCompressedData(format!(
                    "backreference token truncated at byte {}",
                    i
                )));
            }
            let token = u16::from_le_bytes([body[i], body[i + 1]]);
            i += 2;

            let position = out.len() - chunk_start;
            let (offset, length) = split_token(token, position)?;
            if offset > position {
                return Err(NtfsError::BackreferenceOutOfRange { offset, position });
            }
            // copies may overlap their own output
            let from = out.len() - offset;
            for k in 0..length {
                let b = out[from + k];
                out.push(b);
            }
        }
        if out.len() - chunk_start > CHUNK_SIZE {
            return Err(NtfsError::MalformedCompressedData(format!(
                "chunk expands past {} bytes",
                CHUNK_SIZE
            )));
        }
    }
    Ok(())
}

/// Split a backreference token into (offset, length). The offset field grows
/// as the position inside the chunk grows: 4 bits at the start, 12 at the end.
fn split_token(token: u16, position: usize) -> Result<(usize, usize)> {
    if position == 0 || position > CHUNK_SIZE {
        return Err(NtfsError::BackreferenceOutOfRange {
            offset: 0,
            position,
        });
    }
    let mut length_bits = 12u32;
    let mut p = position - 1;
    while p >= 0x10 {
        p >>= 1;
        length_bits -= 1;
    }
    let offset = (token >> length_bits) as usize + 1;
    let length = (token & ((1u16 << length_bits) - 1)) as usize + 3;
    Ok((offset, length))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(compressed: bool, body: &[u8]) -> Vec<u8> {
        let mut header = (body.len() as u16 - 1) & CHUNK_SIZE_MASK;
        if compressed {
            header |= CHUNK_COMPRESSED | 0x3000;
        } else {
            header |= 0x3000;
        }
        let mut v = header.to_le_bytes().to_vec();
        v.extend_from_slice(body);
        v
    }

    #[test]
    fn literal_group() {
        let data = chunk(true, &[0x00, b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h']);
        assert_eq!(decompress(&data, 4096).unwrap(), b"abcdefgh");
    }

    #[test]
    fn backreference_to_previous_byte_repeats_it() {
        // flag 0x10: four literals then a token; offset 1, length 4
        let body = [0x10, b'a', b'b', b'c', b'd', 0x01, 0x00];
        let data = chunk(true, &body);
        assert_eq!(data[0..2], 0xB006u16.to_le_bytes());
        assert_eq!(decompress(&data, 4096).unwrap(), b"abcddddd");
    }

    #[test]
    fn backreference_copies_earlier_run() {
        // offset 4 -> (3 << 12), length 4 -> 1
        let token: u16 = (3 << 12) | 1;
        let mut body = vec![0x10, b'a', b'b', b'c', b'd'];
        body.extend_from_slice(&token.to_le_bytes());
        assert_eq!(decompress(&chunk(true, &body), 4096).unwrap(), b"abcdabcd");
    }

    #[test]
    fn offset_field_widens_with_position() {
        assert_eq!(split_token(0x1002, 16).unwrap(), (2, 5));
        // past 16 bytes one more bit belongs to the offset
        assert_eq!(split_token(0x1002, 17).unwrap(), (3, 5));
        assert_eq!(split_token(0xFFFF, 4096).unwrap(), (4096, 18));
    }

    #[test]
    fn backreference_at_chunk_start_is_rejected() {
        let body = [0x01, 0x00, 0x00];
        assert!(matches!(
            decompress(&chunk(true, &body), 4096),
            Err(NtfsError::BackreferenceOutOfRange { position: 0, .. })
        ));
    }

    #[test]
    fn offset_before_chunk_start_is_rejected() {
        // at position 2 an offset of 3 reaches before the chunk
        let token: u16 = 2 << 12;
        let mut body = vec![0x04, b'x', b'y'];
        body.extend_from_slice(&token.to_le_bytes());
        assert!(matches!(
            decompress(&chunk(true, &body), 4096),
            Err(NtfsError::BackreferenceOutOfRange {
                offset: 3,
                position: 2
            })
        ));
    }

    #[test]
    fn stored_chunk_then_compressed_chunk() {
        let mut data = chunk(false, b"raw!");
        data.extend(chunk(true, &[0x00, b'z']));
        data.extend([0, 0]);
        assert_eq!(decompress(&data, 4096).unwrap(), b"raw!z");
    }

    #[test]
    fn truncated_chunk_is_malformed() {
        let mut data = chunk(true, &[0x00, b'a', b'b', b'c']);
        data.truncate(4);
        assert!(matches!(
            decompress(&data, 4096),
            Err(NtfsError::MalformedCompressedData(_))
        ));
    }
}
