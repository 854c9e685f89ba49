// Sources:
// - https://learn.microsoft.com/en-us/windows/win32/devnotes/multi-sector-header

//! Update-sequence ("fix-up") handling shared by FILE and INDX records.
//!
//! On disk, the last two bytes of every sector of a multi-sector structure hold
//! the same placeholder value; the real bytes live in the update-sequence array
//! near the start of the structure. Decoding verifies the placeholders and puts
//! the real bytes back. Encoding writes the placeholders again so a shared read
//! buffer returns to its on-disk representation.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::cursor::{ByteCursor, check_range};
use crate::error::{NtfsError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct FixUp {
    pub placeholder: [u8; 2],
    /// Original tail bytes, one pair per sector.
    pub values: Vec<[u8; 2]>,
}

impl FixUp {
    /// Read the update-sequence array: `count` 2-byte words at `offset`, the
    /// first one being the placeholder.
    pub fn read(buf: &[u8], offset: usize, count: usize) -> Result<Self> {
        if count == 0 {
            return Ok(Self::default());
        }
        let mut cur = ByteCursor::at(buf, offset);
        let placeholder = cur.read_array::<2>()?;
        let mut values = Vec::with_capacity(count - 1);
        for _ in 1..count {
            values.push(cur.read_array::<2>()?);
        }
        Ok(Self {
            placeholder,
            values,
        })
    }

    pub fn sector_count(&self) -> usize {
        self.values.len()
    }

    /// Verify every sector tail against the placeholder, then substitute the
    /// stored original bytes. The buffer is untouched when verification fails.
    pub fn apply(&self, buf: &mut [u8], sector_size: usize) -> Result<()> {
        for (i, _) in self.values.iter().enumerate() {
            let tail = sector_tail(buf.len(), i, sector_size)?;
            let found = [buf[tail], buf[tail + 1]];
            if found != self.placeholder {
                warn!("Fix-up mismatch in sector {} of a multi-sector record.", i);
                return Err(NtfsError::FixUpMismatch {
                    sector: i,
                    expected: u16::from_le_bytes(self.placeholder),
                    found: u16::from_le_bytes(found),
                });
            }
        }
        for (i, value) in self.values.iter().enumerate() {
            let tail = (i + 1) * sector_size - 2;
            buf[tail..tail + 2].copy_from_slice(value);
        }
        debug!("Applied fix-up over {} sectors.", self.values.len());
        Ok(())
    }

    /// Put the placeholder back at every sector tail.
    pub fn undo(&self, buf: &mut [u8], sector_size: usize) -> Result<()> {
        for i in 0..self.values.len() {
            let tail = sector_tail(buf.len(), i, sector_size)?;
            buf[tail..tail + 2].copy_from_slice(&self.placeholder);
        }
        Ok(())
    }
}

fn sector_tail(buf_len: usize, sector: usize, sector_size: usize) -> Result<usize> {
    if sector_size < 2 {
        return Err(NtfsError::OutOfBounds {
            offset: 0,
            len: sector_size,
            size: buf_len,
        });
    }
    let tail = (sector + 1) * sector_size - 2;
    check_range(buf_len, tail, 2)?;
    Ok(tail)
}
