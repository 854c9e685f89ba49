//! Mapping-pairs ("data run") codec for non-resident attributes.
//!
//! Each run starts with a header byte: the low nibble is the width of the
//! length field, the high nibble the width of the LCN delta field. A missing
//! delta field marks a sparse run. Deltas are signed and relative to the
//! previous non-sparse run.

use serde::{Deserialize, Serialize};

use crate::error::{NtfsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DataRun {
    /// Run length in clusters.
    pub length: u64,
    /// LCN delta relative to the previous run (absolute for the first one).
    pub offset: i64,
    pub sparse: bool,
}

impl DataRun {
    pub fn new(length: u64, offset: i64) -> Self {
        Self {
            length,
            offset,
            sparse: false,
        }
    }

    pub fn sparse(length: u64) -> Self {
        Self {
            length,
            offset: 0,
            sparse: true,
        }
    }
}

/// A run placed on the volume: where it starts inside the attribute (VCN) and
/// where it lives on disk (LCN, `None` for holes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Extent {
    pub vcn: u64,
    pub lcn: Option<u64>,
    pub length: u64,
}

pub fn decode_run_list(raw: &[u8]) -> Result<Vec<DataRun>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < raw.len() && raw[pos] != 0 {
        let hdr = raw[pos];
        pos += 1;
        let len_sz = (hdr & 0x0F) as usize;
        let ofs_sz = (hdr >> 4) as usize;
        if len_sz == 0 || len_sz > 8 || ofs_sz > 8 {
            return Err(NtfsError::MalformedRunList(format!(
                "bad run header 0x{:02X} at byte {}",
                hdr,
                pos - 1
            )));
        }
        if pos + len_sz + ofs_sz > raw.len() {
            return Err(NtfsError::MalformedRunList(format!(
                "run at byte {} needs {} bytes, only {} left",
                pos - 1,
                len_sz + ofs_sz,
                raw.len() - pos
            )));
        }

        let mut run_len = 0u64;
        for i in 0..len_sz {
            run_len |= (raw[pos + i] as u64) << (8 * i);
        }
        pos += len_sz;

        if ofs_sz == 0 {
            out.push(DataRun::sparse(run_len));
            continue;
        }

        let mut ofs = 0i64;
        for i in 0..ofs_sz {
            ofs |= (raw[pos + i] as i64) << (8 * i);
        }
        // sign-extend negative offsets
        if ofs_sz < 8 && (raw[pos + ofs_sz - 1] & 0x80) != 0 {
            ofs |= !0i64 << (ofs_sz * 8);
        }
        pos += ofs_sz;

        out.push(DataRun::new(run_len, ofs));
    }
    Ok(out)
}

pub fn encode_run_list(runs: &[DataRun]) -> Vec<u8> {
    let mut out = Vec::new();
    for run in runs {
        let len_sz = unsigned_width(run.length);
        let ofs_sz = if run.sparse { 0 } else { signed_width(run.offset) };
        out.push(((ofs_sz as u8) << 4) | len_sz as u8);
        out.extend_from_slice(&run.length.to_le_bytes()[..len_sz]);
        out.extend_from_slice(&run.offset.to_le_bytes()[..ofs_sz]);
    }
    out.push(0);
    out
}

/// Turn relative runs into absolute extents.
pub fn resolve_extents(runs: &[DataRun]) -> Result<Vec<Extent>> {
    let mut extents = Vec::with_capacity(runs.len());
    let mut vcn = 0u64;
    let mut lcn = 0i64;
    for run in runs {
        let placed = if run.sparse {
            None
        } else {
            lcn = lcn.checked_add(run.offset).ok_or_else(|| {
                NtfsError::MalformedRunList("LCN overflow".to_string())
            })?;
            if lcn < 0 {
                return Err(NtfsError::MalformedRunList(format!(
                    "run at VCN {} resolves to negative LCN {}",
                    vcn, lcn
                )));
            }
            Some(lcn as u64)
        };
        extents.push(Extent {
            vcn,
            lcn: placed,
            length: run.length,
        });
        vcn += run.length;
    }
    Ok(extents)
}

pub fn total_clusters(runs: &[DataRun]) -> u64 {
    runs.iter().map(|r| r.length).sum()
}

fn unsigned_width(v: u64) -> usize {
    let bits = 64 - v.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

fn signed_width(v: i64) -> usize {
    (1..=8)
        .find(|&n| {
            if n == 8 {
                return true;
            }
            let half = 1i64 << (8 * n - 1);
            v >= -half && v < half
        })
        .unwrap_or(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_run() {
        // length 0x18 clusters at LCN 0x5634
        let raw = [0x21, 0x18, 0x34, 0x56, 0x00];
        let runs = decode_run_list(&raw).unwrap();
        assert_eq!(runs, vec![DataRun::new(0x18, 0x5634)]);
    }

    #[test]
    fn one_byte_ff_offset_is_minus_one() {
        let raw = [0x11, 0x04, 0x20, 0x11, 0x02, 0xFF, 0x00];
        let runs = decode_run_list(&raw).unwrap();
        assert_eq!(runs[1], DataRun::new(2, -1));
        let ext = resolve_extents(&runs).unwrap();
        assert_eq!(ext[1].lcn, Some(0x1F));
        assert_eq!(ext[1].vcn, 4);
    }

    #[test]
    fn missing_offset_field_is_sparse() {
        let raw = [0x01, 0x10, 0x00];
        let runs = decode_run_list(&raw).unwrap();
        assert_eq!(runs, vec![DataRun::sparse(16)]);
        assert_eq!(resolve_extents(&runs).unwrap()[0].lcn, None);
    }

    #[test]
    fn encoded_runs_decode_to_the_same_tuples() {
        let runs = vec![
            DataRun::new(1, 0x7F),
            DataRun::new(0x80, 0x80),
            DataRun::new(2, -0x80),
            DataRun::new(0x1234, 0x12_3456),
            DataRun::sparse(0x10),
            DataRun::new(0xFFFF_FFFF, -0x0123_4567_89AB),
            DataRun::new(3, i64::MIN + 1),
            DataRun::new(u64::MAX, i64::MAX),
            DataRun::new(7, -1),
        ];
        let raw = encode_run_list(&runs);
        assert_eq!(*raw.last().unwrap(), 0);
        assert_eq!(decode_run_list(&raw).unwrap(), runs);
        assert_eq!(raw[0], 0x11);
        // +0x80 needs two bytes once signed, -0x80 only one
        assert_eq!(raw[3], 0x21);
        assert_eq!(raw[7], 0x11);
    }

    #[test]
    fn truncated_run_is_malformed() {
        let raw = [0x31, 0x10, 0x00, 0x01];
        assert!(matches!(
            decode_run_list(&raw),
            Err(NtfsError::MalformedRunList(_))
        ));
    }

    #[test]
    fn negative_absolute_lcn_is_rejected() {
        let runs = [DataRun::new(1, 5), DataRun::new(1, -6)];
        assert!(resolve_extents(&runs).is_err());
    }
}
