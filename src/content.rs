//! Attribute materialization: turns a decoded attribute into its logical
//! bytes, resolving data runs, sparse holes and LZNT1 compression units.

use log::debug;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};

use crate::error::{NtfsError, Result};
use crate::lznt1;
use crate::mft::{Attribute, NonResidentHeader};
use crate::runlist::{
    DataRun, Extent, decode_run_list, encode_run_list, resolve_extents, total_clusters,
};

/// Positioned reads against the volume.
pub trait VolumeRead {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl<T: Read + Seek> VolumeRead for T {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)?;
        Ok(())
    }
}

/// How an attribute's content has to be read, chosen from its header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPlan {
    Resident,
    NonresidentPlain,
    NonresidentSparse,
    NonresidentCompressed,
}

impl ReadPlan {
    pub fn of(attr: &Attribute) -> Self {
        match attr {
            Attribute::Resident { .. } => ReadPlan::Resident,
            Attribute::NonResident { non_resident, .. } => {
                if attr.is_compressed() && non_resident.compression_unit > 0 {
                    ReadPlan::NonresidentCompressed
                } else if attr.is_sparse() {
                    ReadPlan::NonresidentSparse
                } else {
                    ReadPlan::NonresidentPlain
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum UnitKind {
    Sparse,
    Uncompressed,
    Compressed,
}

/// One compression unit of a compressed attribute.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompressionUnit {
    pub vcn: u64,
    /// Length in clusters; shorter than the unit size only for the last one.
    pub clusters: u64,
    pub kind: UnitKind,
    /// Physical pieces holding the unit's stored bytes, in order.
    pub pieces: Vec<Extent>,
}

/// Read the full logical content of `attr`.
pub fn materialize<R: VolumeRead + ?Sized>(
    attr: &Attribute,
    reader: &mut R,
    cluster_size: u64,
) -> Result<Vec<u8>> {
    let plan = ReadPlan::of(attr);
    debug!("Materializing {:?} attribute with plan {:?}.", attr.attr_type(), plan);
    match attr {
        Attribute::Resident { value, .. } => Ok(value.clone()),
        Attribute::NonResident {
            non_resident,
            run_list,
            ..
        } => {
            let runs = decode_run_list(run_list)?;
            let mut data = match plan {
                ReadPlan::NonresidentCompressed => {
                    let unit_clusters = compression_unit_clusters(non_resident)?;
                    let mapped = check_sizes(non_resident, &runs, cluster_size, unit_clusters)?;
                    read_compressed(reader, &runs, cluster_size, unit_clusters, mapped)?
                }
                _ => {
                    let mapped = check_sizes(non_resident, &runs, cluster_size, 1)?;
                    read_runs(reader, &runs, cluster_size, mapped)?
                }
            };
            finish(&mut data, non_resident);
            Ok(data)
        }
    }
}

/// Group a run list into compression units of `unit_clusters` clusters.
pub fn classify_units(runs: &[DataRun], unit_clusters: u64) -> Result<Vec<CompressionUnit>> {
    if unit_clusters == 0 {
        return Err(NtfsError::MalformedCompressionUnit(
            "compression unit of zero clusters".to_string(),
        ));
    }
    let mut units = Vec::new();
    let mut pieces: Vec<Extent> = Vec::new();
    let mut unit_vcn = 0u64;
    let mut filled = 0u64;

    for extent in resolve_extents(runs)? {
        let mut consumed = 0u64;
        while consumed < extent.length {
            let take = (extent.length - consumed).min(unit_clusters - filled);
            pieces.push(Extent {
                vcn: extent.vcn + consumed,
                lcn: extent.lcn.map(|l| l + consumed),
                length: take,
            });
            consumed += take;
            filled += take;
            if filled == unit_clusters {
                units.push(close_unit(unit_vcn, filled, std::mem::take(&mut pieces))?);
                unit_vcn += filled;
                filled = 0;
            }
        }
    }
    if filled > 0 {
        units.push(close_unit(unit_vcn, filled, pieces)?);
    }
    Ok(units)
}

fn close_unit(vcn: u64, clusters: u64, pieces: Vec<Extent>) -> Result<CompressionUnit> {
    let mut seen_hole = false;
    let mut seen_data = false;
    for p in &pieces {
        match p.lcn {
            None => seen_hole = true,
            Some(_) if seen_hole => {
                return Err(NtfsError::MalformedCompressionUnit(format!(
                    "stored clusters at VCN {} follow a hole inside the unit at VCN {}",
                    p.vcn, vcn
                )));
            }
            Some(_) => seen_data = true,
        }
    }
    let kind = match (seen_data, seen_hole) {
        (false, _) => UnitKind::Sparse,
        (true, false) => UnitKind::Uncompressed,
        (true, true) => UnitKind::Compressed,
    };
    // keep only what has to be read
    let pieces = pieces.into_iter().filter(|p| p.lcn.is_some()).collect();
    Ok(CompressionUnit {
        vcn,
        clusters,
        kind,
        pieces,
    })
}

/// Join the pieces of one attribute spread over several records (listed in
/// an $ATTRIBUTE_LIST) into a single attribute covering every VCN.
pub fn merge_pieces(mut pieces: Vec<Attribute>) -> Result<Option<Attribute>> {
    pieces.sort_by_key(|a| a.lowest_vcn());
    if pieces.len() <= 1 || pieces[0].is_resident() {
        return Ok(pieces.into_iter().next());
    }

    let mut extents = Vec::new();
    let mut highest = 0u64;
    for piece in &pieces {
        if let Attribute::NonResident {
            non_resident,
            run_list,
            ..
        } = piece
        {
            for e in resolve_extents(&decode_run_list(run_list)?)? {
                extents.push(Extent {
                    vcn: e.vcn + non_resident.lowest_vcn,
                    ..e
                });
            }
            highest = highest.max(non_resident.highest_vcn);
        }
    }

    let mut runs = Vec::with_capacity(extents.len());
    let mut prev_lcn = 0i64;
    let mut next_vcn = 0u64;
    for e in &extents {
        if e.vcn > next_vcn {
            runs.push(DataRun::sparse(e.vcn - next_vcn));
        }
        next_vcn = e.vcn + e.length;
        match e.lcn {
            Some(lcn) => {
                runs.push(DataRun::new(e.length, lcn as i64 - prev_lcn));
                prev_lcn = lcn as i64;
            }
            None => runs.push(DataRun::sparse(e.length)),
        }
    }
    debug!("Merged {} attribute pieces into {} runs.", pieces.len(), runs.len());

    let mut merged = pieces.swap_remove(0);
    if let Attribute::NonResident {
        non_resident,
        run_list,
        ..
    } = &mut merged
    {
        non_resident.highest_vcn = highest;
        *run_list = encode_run_list(&runs);
    }
    Ok(Some(merged))
}

/* Private helpers */

/// Largest compression unit accepted, as a power of two in clusters.
const MAX_COMPRESSION_UNIT: u16 = 16;

fn compression_unit_clusters(nr: &NonResidentHeader) -> Result<u64> {
    if nr.compression_unit > MAX_COMPRESSION_UNIT {
        return Err(NtfsError::MalformedCompressionUnit(format!(
            "compression unit exponent {} is too large",
            nr.compression_unit
        )));
    }
    Ok(1u64 << nr.compression_unit)
}

/// Bytes mapped by `runs`, checked against the sizes the header declares.
/// The runs must fit the allocation, the allocation must not exceed the
/// runs (rounded up to a compression unit) and the actual size must fit
/// both.
fn check_sizes(
    nr: &NonResidentHeader,
    runs: &[DataRun],
    cluster_size: u64,
    unit_clusters: u64,
) -> Result<u64> {
    let mapped = total_clusters(runs)
        .checked_mul(cluster_size)
        .ok_or_else(|| NtfsError::MalformedRunList("run list size overflows".to_string()))?;

    // extension parts only cover their own VCN range
    if nr.lowest_vcn > 0 {
        let span = nr
            .highest_vcn
            .saturating_sub(nr.lowest_vcn)
            .saturating_add(1)
            .saturating_mul(cluster_size);
        if mapped > span {
            return Err(NtfsError::ReadPastAllocated {
                needed: mapped,
                allocated: span,
            });
        }
        return Ok(mapped);
    }

    if mapped > nr.allocated_size {
        return Err(NtfsError::ReadPastAllocated {
            needed: mapped,
            allocated: nr.allocated_size,
        });
    }
    let unit_bytes = unit_clusters.saturating_mul(cluster_size).max(1);
    let covered = mapped.div_ceil(unit_bytes).saturating_mul(unit_bytes);
    if nr.allocated_size > covered {
        return Err(NtfsError::MalformedRunList(format!(
            "allocated size {} exceeds the {} bytes mapped by the runs",
            nr.allocated_size, mapped
        )));
    }
    if nr.real_size > mapped {
        return Err(NtfsError::ReadPastAllocated {
            needed: nr.real_size,
            allocated: mapped,
        });
    }
    Ok(mapped)
}

fn read_runs<R: VolumeRead + ?Sized>(
    reader: &mut R,
    runs: &[DataRun],
    cluster_size: u64,
    mapped: u64,
) -> Result<Vec<u8>> {
    let mut out = vec![0u8; mapped as usize];
    for extent in resolve_extents(runs)? {
        let start = (extent.vcn * cluster_size) as usize;
        let len = (extent.length * cluster_size) as usize;
        match extent.lcn {
            Some(lcn) => reader.read_at(lcn * cluster_size, &mut out[start..start + len])?,
            None => debug!("Hole of {} clusters at VCN {}.", extent.length, extent.vcn),
        }
    }
    Ok(out)
}

fn read_compressed<R: VolumeRead + ?Sized>(
    reader: &mut R,
    runs: &[DataRun],
    cluster_size: u64,
    unit_clusters: u64,
    mapped: u64,
) -> Result<Vec<u8>> {
    let units = classify_units(runs, unit_clusters)?;
    debug!(
        "{} compression units of {} clusters.",
        units.len(),
        unit_clusters
    );
    let mut out = Vec::with_capacity(mapped as usize);
    for unit in &units {
        let unit_bytes = (unit.clusters * cluster_size) as usize;
        match unit.kind {
            UnitKind::Sparse => out.resize(out.len() + unit_bytes, 0),
            UnitKind::Uncompressed => out.extend(read_pieces(reader, &unit.pieces, cluster_size)?),
            UnitKind::Compressed => {
                let stored = read_pieces(reader, &unit.pieces, cluster_size)?;
                let mut plain = lznt1::decompress(&stored, cluster_size as usize)?;
                if plain.len() > unit_bytes {
                    return Err(NtfsError::MalformedCompressionUnit(format!(
                        "unit at VCN {} expands to {} bytes, more than its {}",
                        unit.vcn,
                        plain.len(),
                        unit_bytes
                    )));
                }
                plain.resize(unit_bytes, 0);
                out.extend(plain);
            }
        }
    }
    Ok(out)
}

fn read_pieces<R: VolumeRead + ?Sized>(
    reader: &mut R,
    pieces: &[Extent],
    cluster_size: u64,
) -> Result<Vec<u8>> {
    let total: u64 = pieces.iter().map(|p| p.length).sum();
    let mut buf = vec![0u8; (total * cluster_size) as usize];
    let mut at = 0usize;
    for p in pieces {
        let len = (p.length * cluster_size) as usize;
        if let Some(lcn) = p.lcn {
            reader.read_at(lcn * cluster_size, &mut buf[at..at + len])?;
        }
        at += len;
    }
    Ok(buf)
}

/// Zero everything past the valid data length and cut to the actual size.
fn finish(data: &mut Vec<u8>, nr: &NonResidentHeader) {
    if nr.lowest_vcn > 0 {
        return;
    }
    let real = nr.real_size as usize;
    let valid = (nr.initialized_size as usize).min(real);
    if valid < data.len() {
        let end = real.min(data.len());
        if valid < end {
            data[valid..end].fill(0);
        }
    }
    data.truncate(real);
}
