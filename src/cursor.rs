//! Bounds-checked little-endian reader over a byte slice.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{NtfsError, Result};

/// A read position over an immutable byte window. The position can be moved
/// freely; every read checks that it stays inside the window.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u48(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u48(self.take(6)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// Slice of `len` bytes at an absolute offset, without moving the cursor.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        check_range(self.data.len(), offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let out = self.slice(self.pos, n)?;
        self.pos += n;
        Ok(out)
    }
}

pub(crate) fn check_range(size: usize, offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(NtfsError::OutOfBounds { offset, len, size }),
    }
}

/// Decode a UTF-16LE byte run, replacing invalid sequences.
pub(crate) fn utf16le_to_string(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_and_tracks_position() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09];
        let mut c = ByteCursor::new(&data);
        assert_eq!(c.read_u8().unwrap(), 0x01);
        assert_eq!(c.read_u16().unwrap(), 0x0302);
        assert_eq!(c.position(), 3);
        c.set_position(1);
        assert_eq!(c.read_u64().unwrap(), 0x0908_0706_0504_0302);
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn out_of_bounds_is_an_error_not_a_panic() {
        let data = [0u8; 4];
        let mut c = ByteCursor::at(&data, 2);
        match c.read_u32() {
            Err(NtfsError::OutOfBounds { offset, len, size }) => {
                assert_eq!((offset, len, size), (2, 4, 4));
            }
            other => panic!("unexpected {:?}", other),
        }
        // failed read leaves the position alone
        assert_eq!(c.position(), 2);
        assert!(c.slice(usize::MAX, 2).is_err());
    }

    #[test]
    fn u48_reads_six_bytes() {
        let data = [0x05, 0, 0, 0, 0, 0, 0x07, 0x00];
        let mut c = ByteCursor::new(&data);
        assert_eq!(c.read_u48().unwrap(), 5);
        assert_eq!(c.read_u16().unwrap(), 7);
    }
}
