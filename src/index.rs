// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf (INDEX_ROOT, INDEX_ALLOCATION)

//! Index B-tree codec ($INDEX_ROOT / $INDEX_ALLOCATION) and the lookup
//! and listing logic used for `$I30` directory indexes.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::cursor::ByteCursor;
use crate::error::{NtfsError, Result};
use crate::fixup::FixUp;
use crate::mft::{AttributeType, FileNameAttr, FileReference};

pub const INDEX_ENTRY_CHILD: u32 = 0x01;
pub const INDEX_ENTRY_LAST: u32 = 0x02;
pub const INDEX_NODE_HAS_CHILDREN: u32 = 0x01;

const ENTRY_HEADER_LEN: usize = 0x10;
const NODE_HEADER_OFFSET: usize = 0x18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Collation {
    Binary,
    FileName,
    UnicodeString,
    NtofsUlong,
    NtofsSid,
    NtofsSecurityHash,
    NtofsUlongs,
    Other(u32),
}

impl From<u32> for Collation {
    fn from(v: u32) -> Self {
        match v {
            0x00 => Collation::Binary,
            0x01 => Collation::FileName,
            0x02 => Collation::UnicodeString,
            0x10 => Collation::NtofsUlong,
            0x11 => Collation::NtofsSid,
            0x12 => Collation::NtofsSecurityHash,
            0x13 => Collation::NtofsUlongs,
            other => Collation::Other(other),
        }
    }
}

impl Collation {
    /// Order two names. File names compare case-insensitively; everything
    /// else falls back to an ordinal compare of the code units.
    pub fn compare(&self, a: &[u16], b: &[u16]) -> Ordering {
        match self {
            Collation::FileName | Collation::UnicodeString => a
                .iter()
                .map(|&u| upcase(u))
                .cmp(b.iter().map(|&u| upcase(u))),
            _ => a.cmp(b),
        }
    }

    /// Total order for listings: collation first, then ordinal.
    pub fn sort_order(&self, a: &[u16], b: &[u16]) -> Ordering {
        self.compare(a, b).then_with(|| a.cmp(b))
    }
}

fn upcase(u: u16) -> u16 {
    match u {
        0x61..=0x7A => u - 0x20,
        0x00..=0x7F => u,
        _ => char::from_u32(u as u32)
            .and_then(|c| {
                let mut up = c.to_uppercase();
                match (up.next(), up.next()) {
                    (Some(x), None) if (x as u32) <= 0xFFFF => Some(x as u16),
                    _ => None,
                }
            })
            .unwrap_or(u),
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IndexNodeHeader {
    /// Offsets are relative to the start of this header.
    pub entries_offset: u32,
    pub entries_end: u32,
    pub allocated_end: u32,
    pub flags: u32,
}

impl IndexNodeHeader {
    pub fn has_children(&self) -> bool {
        self.flags & INDEX_NODE_HAS_CHILDREN != 0
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexEntry {
    pub reference: FileReference,
    pub length: u16,
    pub flags: u32,
    pub key: Vec<u8>,
    /// Decoded key for `$FILE_NAME` indexes.
    pub file_name: Option<FileNameAttr>,
    pub child_vcn: Option<u64>,
}

impl IndexEntry {
    pub fn is_last(&self) -> bool {
        self.flags & INDEX_ENTRY_LAST != 0
    }

    pub fn name_units(&self) -> Option<&[u16]> {
        self.file_name.as_ref().map(|f| f.name_units.as_slice())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IndexNode {
    pub header: IndexNodeHeader,
    pub entries: Vec<IndexEntry>,
}

impl IndexNode {
    /// Decode a node whose header starts at `start` in `buf`.
    fn parse(buf: &[u8], start: usize, indexed: AttributeType) -> Result<Self> {
        let mut cur = ByteCursor::at(buf, start);
        let header = IndexNodeHeader {
            entries_offset: cur.read_u32()?,
            entries_end: cur.read_u32()?,
            allocated_end: cur.read_u32()?,
            flags: cur.read_u32()?,
        };
        let end = (start + header.entries_end as usize).min(buf.len());
        let mut off = start + header.entries_offset as usize;
        let mut entries = Vec::new();
        loop {
            if off + ENTRY_HEADER_LEN > end {
                warn!("Index node ends at {} without a terminal entry.", end);
                break;
            }
            let entry = parse_entry(&buf[..end], off, indexed)?;
            let last = entry.is_last();
            off += entry.length as usize;
            entries.push(entry);
            if last {
                break;
            }
        }
        Ok(Self { header, entries })
    }

    /// Entries that carry a key (everything but the terminal entry).
    pub fn keyed(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter().filter(|e| !e.is_last())
    }
}

fn parse_entry(buf: &[u8], off: usize, indexed: AttributeType) -> Result<IndexEntry> {
    let mut cur = ByteCursor::at(buf, off);
    let reference = FileReference::from_u64(cur.read_u64()?);
    let length = cur.read_u16()?;
    let key_length = cur.read_u16()? as usize;
    let flags = cur.read_u32()?;

    let len = length as usize;
    if len < ENTRY_HEADER_LEN || off + len > buf.len() {
        return Err(NtfsError::MalformedIndexEntry {
            offset: off,
            reason: format!("entry length {} with {} bytes left", len, buf.len() - off),
        });
    }
    let last = flags & INDEX_ENTRY_LAST != 0;
    let key = if key_length > 0 && !last {
        if ENTRY_HEADER_LEN + key_length > len {
            return Err(NtfsError::MalformedIndexEntry {
                offset: off,
                reason: format!("key of {} bytes overruns the entry", key_length),
            });
        }
        cur.slice(off + ENTRY_HEADER_LEN, key_length)?.to_vec()
    } else {
        Vec::new()
    };
    let child_vcn = if flags & INDEX_ENTRY_CHILD != 0 {
        if len < ENTRY_HEADER_LEN + 8 {
            return Err(NtfsError::MalformedIndexEntry {
                offset: off,
                reason: "child flag set on a too short entry".to_string(),
            });
        }
        Some(ByteCursor::at(buf, off + len - 8).read_u64()?)
    } else {
        None
    };
    let file_name = if indexed == AttributeType::FileName && !key.is_empty() {
        Some(FileNameAttr::parse(&key)?)
    } else {
        None
    };
    Ok(IndexEntry {
        reference,
        length,
        flags,
        key,
        file_name,
        child_vcn,
    })
}

/// Decoded `$INDEX_ROOT` value.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexRoot {
    pub indexed_type: AttributeType,
    pub collation: Collation,
    pub record_size: u32,
    pub clusters_per_record: u8,
    pub node: IndexNode,
}

impl IndexRoot {
    pub fn parse(value: &[u8]) -> Result<Self> {
        let mut cur = ByteCursor::new(value);
        let indexed_type = AttributeType::from(cur.read_u32()?);
        let collation = Collation::from(cur.read_u32()?);
        let record_size = cur.read_u32()?;
        let clusters_per_record = cur.read_u8()?;
        let node = IndexNode::parse(value, 0x10, indexed_type)?;
        Ok(Self {
            indexed_type,
            collation,
            record_size,
            clusters_per_record,
            node,
        })
    }

    pub fn is_large(&self) -> bool {
        self.node.header.has_children()
    }
}

/// One INDX node stored in the allocation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexRecord {
    pub vcn: u64,
    pub lsn: u64,
    pub fixup: FixUp,
    pub node: IndexNode,
}

impl IndexRecord {
    /// Decode an INDX record in place; the fix-up is reversed before
    /// returning.
    pub fn parse(buf: &mut [u8], sector_size: usize, indexed: AttributeType) -> Result<Self> {
        let mut cur = ByteCursor::new(buf);
        let magic = cur.read_array::<4>()?;
        if &magic != b"INDX" {
            return Err(NtfsError::InvalidIndexMagic(magic));
        }
        let usa_offset = cur.read_u16()? as usize;
        let usa_count = cur.read_u16()? as usize;
        let lsn = cur.read_u64()?;
        let vcn = cur.read_u64()?;
        let fixup = FixUp::read(buf, usa_offset, usa_count)?;

        fixup.apply(buf, sector_size)?;
        let node = IndexNode::parse(buf, NODE_HEADER_OFFSET, indexed);
        fixup.undo(buf, sector_size)?;

        Ok(Self {
            vcn,
            lsn,
            fixup,
            node: node?,
        })
    }
}

/// All INDX records of an `$INDEX_ALLOCATION` stream.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IndexAllocation {
    pub records: Vec<IndexRecord>,
}

impl IndexAllocation {
    /// Split a materialized allocation into records. Slots whose `$BITMAP` bit
    /// is clear, and never-written (zeroed) slots, are skipped.
    pub fn parse(
        data: &[u8],
        record_size: usize,
        sector_size: usize,
        indexed: AttributeType,
        bitmap: Option<&[u8]>,
    ) -> Result<Self> {
        if record_size < sector_size.max(NODE_HEADER_OFFSET + 0x10) {
            return Err(NtfsError::InvalidIndexRecordSize {
                size: record_size,
                sector_size,
            });
        }
        let mut records = Vec::new();
        for (slot, raw) in data.chunks_exact(record_size).enumerate() {
            if let Some(bits) = bitmap {
                let in_use = bits
                    .get(slot / 8)
                    .is_some_and(|byte| byte & (1 << (slot % 8)) != 0);
                if !in_use {
                    debug!("Index slot {} is free in the bitmap.", slot);
                    continue;
                }
            }
            if raw[..4] == [0, 0, 0, 0] {
                continue;
            }
            let mut buf = raw.to_vec();
            records.push(IndexRecord::parse(&mut buf, sector_size, indexed)?);
        }
        Ok(Self { records })
    }

    /// Find the record for `vcn`: direct slot first, linear scan otherwise.
    pub fn lookup_vcn(&self, vcn: u64) -> Option<&IndexRecord> {
        if let Some(rec) = self.records.get(vcn as usize) {
            if rec.vcn == vcn {
                return Some(rec);
            }
        }
        self.records.iter().find(|r| r.vcn == vcn)
    }
}

/// Look `name` up in an index using its collation. Misses are `Ok(None)`.
pub fn find<'a>(
    root: &'a IndexRoot,
    allocation: Option<&'a IndexAllocation>,
    name: &str,
) -> Result<Option<&'a IndexEntry>> {
    let key: Vec<u16> = name.encode_utf16().collect();
    let collation = root.collation;
    let mut node = &root.node;
    let mut visited = HashSet::new();

    loop {
        if !node.header.has_children() {
            let keyed: Vec<&IndexEntry> = node.keyed().collect();
            let found = keyed
                .binary_search_by(|e| collation.compare(e.name_units().unwrap_or(&[]), &key))
                .ok()
                .map(|i| keyed[i]);
            return Ok(found);
        }

        let mut next = None;
        for entry in &node.entries {
            if entry.is_last() {
                next = entry.child_vcn;
                break;
            }
            match collation.compare(&key, entry.name_units().unwrap_or(&[])) {
                Ordering::Equal => return Ok(Some(entry)),
                Ordering::Less => {
                    next = entry.child_vcn;
                    break;
                }
                Ordering::Greater => {}
            }
        }

        let Some(vcn) = next else {
            return Ok(None);
        };
        if !visited.insert(vcn) {
            return Err(NtfsError::IndexLoop(vcn));
        }
        let alloc = allocation.ok_or(NtfsError::MissingAttribute("$INDEX_ALLOCATION"))?;
        debug!("Descending into index record VCN {}.", vcn);
        node = &alloc
            .lookup_vcn(vcn)
            .ok_or(NtfsError::IndexRecordNotFound(vcn))?
            .node;
    }
}

/// Every keyed entry of the index (root and all allocation records), sorted.
pub fn list_children<'a>(
    root: &'a IndexRoot,
    allocation: Option<&'a IndexAllocation>,
) -> Vec<&'a IndexEntry> {
    let mut entries: Vec<&IndexEntry> = root.node.keyed().collect();
    if let Some(alloc) = allocation {
        for rec in &alloc.records {
            entries.extend(rec.node.keyed());
        }
    }
    let collation = root.collation;
    entries.sort_by(|a, b| {
        collation.sort_order(a.name_units().unwrap_or(&[]), b.name_units().unwrap_or(&[]))
    });
    entries
}

/// A directory child as presented to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub file_id: u64,
    pub sequence: u16,
    pub name: String,
    pub namespace: u8,
    pub is_dir: bool,
    pub size: u64,
    pub flags: u32,
}

impl DirectoryEntry {
    pub fn from_index_entry(entry: &IndexEntry) -> Option<Self> {
        let fname = entry.file_name.as_ref()?;
        Some(DirectoryEntry {
            file_id: entry.reference.record,
            sequence: entry.reference.sequence,
            name: fname.name.clone(),
            namespace: fname.namespace,
            is_dir: fname.is_dir(),
            size: fname.real_size,
            flags: entry.flags,
        })
    }

    pub fn reference(&self) -> FileReference {
        FileReference {
            record: self.file_id,
            sequence: self.sequence,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mft::tests::{file_name_value, protect};

    const SECTOR: usize = 512;
    const INDX_SIZE: usize = 1024;

    fn entry(name: Option<&str>, record: u64, child: Option<u64>, dir: bool) -> Vec<u8> {
        let key = name
            .map(|n| file_name_value(n, 5, if dir { 0x1000_0000 } else { 0x20 }, 1))
            .unwrap_or_default();
        let mut len = (ENTRY_HEADER_LEN + key.len() + 7) & !7;
        if child.is_some() {
            len += 8;
        }
        let mut flags = 0u32;
        if child.is_some() {
            flags |= INDEX_ENTRY_CHILD;
        }
        if name.is_none() {
            flags |= INDEX_ENTRY_LAST;
        }
        let mut e = vec![0u8; len];
        e[0..8].copy_from_slice(&(record | (1 << 48)).to_le_bytes());
        e[8..10].copy_from_slice(&(len as u16).to_le_bytes());
        e[10..12].copy_from_slice(&(key.len() as u16).to_le_bytes());
        e[12..16].copy_from_slice(&flags.to_le_bytes());
        e[16..16 + key.len()].copy_from_slice(&key);
        if let Some(vcn) = child {
            e[len - 8..].copy_from_slice(&vcn.to_le_bytes());
        }
        e
    }

    fn node_header(entries: &[Vec<u8>], flags: u32, allocated: usize) -> Vec<u8> {
        let body: Vec<u8> = entries.concat();
        let mut h = vec![0u8; 0x10];
        h[0..4].copy_from_slice(&0x10u32.to_le_bytes());
        h[4..8].copy_from_slice(&((0x10 + body.len()) as u32).to_le_bytes());
        h[8..12].copy_from_slice(&(allocated.max(0x10 + body.len()) as u32).to_le_bytes());
        h[12..16].copy_from_slice(&flags.to_le_bytes());
        h.extend(body);
        h
    }

    fn root_value(entries: &[Vec<u8>], large: bool) -> Vec<u8> {
        let mut v = vec![0u8; 0x10];
        v[0..4].copy_from_slice(&0x30u32.to_le_bytes());
        v[4..8].copy_from_slice(&1u32.to_le_bytes());
        v[8..12].copy_from_slice(&(INDX_SIZE as u32).to_le_bytes());
        v[12] = 1;
        v.extend(node_header(entries, if large { INDEX_NODE_HAS_CHILDREN } else { 0 }, 0));
        v
    }

    fn indx_record(vcn: u64, entries: &[Vec<u8>], large: bool) -> Vec<u8> {
        let mut r = vec![0u8; INDX_SIZE];
        r[0..4].copy_from_slice(b"INDX");
        r[4..6].copy_from_slice(&0x28u16.to_le_bytes());
        r[6..8].copy_from_slice(&3u16.to_le_bytes());
        r[0x10..0x18].copy_from_slice(&vcn.to_le_bytes());
        let flags = if large { INDEX_NODE_HAS_CHILDREN } else { 0 };
        let mut node = node_header(entries, flags, INDX_SIZE - 0x18);
        // entries start right after the USA
        node[0..4].copy_from_slice(&0x28u32.to_le_bytes());
        let end = u32::from_le_bytes([node[4], node[5], node[6], node[7]]) + 0x18;
        node[4..8].copy_from_slice(&end.to_le_bytes());
        r[0x18..0x28].copy_from_slice(&node[..0x10]);
        r[0x40..0x40 + node.len() - 0x10].copy_from_slice(&node[0x10..]);
        protect(&mut r, 0x28, 0x0505);
        r
    }

    fn names(entries: &[&IndexEntry]) -> Vec<String> {
        entries
            .iter()
            .filter_map(|e| e.file_name.as_ref().map(|f| f.name.clone()))
            .collect()
    }

    #[test]
    fn leaf_root_binary_search() {
        let root = IndexRoot::parse(&root_value(
            &[
                entry(Some("bob"), 30, None, false),
                entry(Some("frank"), 31, None, false),
                entry(Some("zoe"), 32, None, false),
                entry(None, 0, None, false),
            ],
            false,
        ))
        .unwrap();
        assert_eq!(root.collation, Collation::FileName);
        assert!(!root.is_large());
        let hit = find(&root, None, "FRANK").unwrap().unwrap();
        assert_eq!(hit.reference.record, 31);
        assert!(find(&root, None, "mary").unwrap().is_none());
    }

    #[test]
    fn descends_between_frank_and_zoe() {
        let root = IndexRoot::parse(&root_value(
            &[
                entry(Some("bob"), 30, Some(0), false),
                entry(Some("frank"), 31, Some(0), false),
                entry(Some("zoe"), 32, Some(1), false),
                entry(None, 0, Some(0), false),
            ],
            true,
        ))
        .unwrap();
        // VCN 1 sits in slot 0, so the direct lookup misses and the scan hits
        let mut data = indx_record(1, &[entry(Some("mary"), 40, None, false), entry(None, 0, None, false)], false);
        data.extend(indx_record(0, &[entry(Some("aaron"), 41, None, false), entry(None, 0, None, false)], false));
        let alloc = IndexAllocation::parse(&data, INDX_SIZE, SECTOR, AttributeType::FileName, None).unwrap();
        assert_eq!(alloc.records.len(), 2);
        assert_eq!(alloc.lookup_vcn(1).unwrap().vcn, 1);

        let hit = find(&root, Some(&alloc), "Mary").unwrap().unwrap();
        assert_eq!(hit.reference.record, 40);
        assert!(find(&root, Some(&alloc), "nina").unwrap().is_none());
        assert_eq!(find(&root, Some(&alloc), "zoe").unwrap().unwrap().reference.record, 32);

        let listed = list_children(&root, Some(&alloc));
        assert_eq!(names(&listed), vec!["aaron", "bob", "frank", "mary", "zoe"]);
    }

    #[test]
    fn missing_child_record_is_an_error() {
        let root = IndexRoot::parse(&root_value(
            &[entry(Some("zoe"), 32, Some(7), false), entry(None, 0, None, false)],
            true,
        ))
        .unwrap();
        let alloc = IndexAllocation::default();
        assert!(matches!(
            find(&root, Some(&alloc), "mary"),
            Err(NtfsError::IndexRecordNotFound(7))
        ));
    }

    #[test]
    fn bitmap_and_zero_slots_are_skipped() {
        let mut data = indx_record(0, &[entry(Some("a"), 50, None, false), entry(None, 0, None, false)], false);
        data.extend(vec![0u8; INDX_SIZE]);
        data.extend(indx_record(2, &[entry(Some("c"), 52, None, false), entry(None, 0, None, false)], false));
        let all = IndexAllocation::parse(&data, INDX_SIZE, SECTOR, AttributeType::FileName, None).unwrap();
        assert_eq!(all.records.len(), 2);
        let masked =
            IndexAllocation::parse(&data, INDX_SIZE, SECTOR, AttributeType::FileName, Some(&[0b001])).unwrap();
        assert_eq!(masked.records.len(), 1);
        assert_eq!(masked.records[0].vcn, 0);
    }

    #[test]
    fn undersized_index_records_are_rejected() {
        let data = vec![0xFFu8; 64];
        for size in [0, 3, 0x20, 256] {
            assert!(matches!(
                IndexAllocation::parse(&data, size, SECTOR, AttributeType::FileName, None),
                Err(NtfsError::InvalidIndexRecordSize { .. })
            ));
        }
    }

    #[test]
    fn bad_magic_is_an_integrity_error() {
        let mut data = indx_record(0, &[entry(None, 0, None, false)], false);
        data[0..4].copy_from_slice(b"XXXX");
        let err = IndexAllocation::parse(&data, INDX_SIZE, SECTOR, AttributeType::FileName, None).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn collation_ignores_case_but_listing_is_stable() {
        let a: Vec<u16> = "Readme".encode_utf16().collect();
        let b: Vec<u16> = "README".encode_utf16().collect();
        assert_eq!(Collation::FileName.compare(&a, &b), Ordering::Equal);
        assert_eq!(Collation::FileName.sort_order(&b, &a), Ordering::Less);
        assert_eq!(Collation::Binary.compare(&a, &b), Ordering::Greater);
        let e: Vec<u16> = "é".encode_utf16().collect();
        let big_e: Vec<u16> = "É".encode_utf16().collect();
        assert_eq!(Collation::FileName.compare(&e, &big_e), Ordering::Equal);
    }
}
