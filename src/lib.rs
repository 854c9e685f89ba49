// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

use std::collections::HashSet;
use std::io::{Read, Seek};

use log::{debug, error, info, warn};

use content::{VolumeRead, materialize, merge_pieces};
use index::{Collation, DirectoryEntry, IndexAllocation, IndexRoot};
use mft::{Attribute, AttributeType, FileNameAttr, FileReference, MftRecord, parse_attribute_list};
use pbs::{PartitionBootSector, VolumeGeometry};
use runlist::decode_run_list;
use stream::{MftIteratorOptions, MftLayout, MftRecords, MftStream};

pub mod content;
pub mod cursor;
pub mod error;
pub mod fixup;
pub mod index;
pub mod lznt1;
pub mod mft;
pub mod pbs;
pub mod runlist;
pub mod stream;

pub use error::{NtfsError, Result};

/// Records scanned for the volume root before giving up.
pub const ROOT_SEARCH_LIMIT: u64 = 50;

const I30: Option<&str> = Some("$I30");

/// An NTFS volume opened over any `Read + Seek` body.
pub struct Ntfs<T: Read + Seek> {
    pub pbs: PartitionBootSector,
    pub geometry: VolumeGeometry,
    pub body: T,
    stream: MftStream,
    root: Option<u64>,
}

impl<T: Read + Seek> Ntfs<T> {
    /// Read the boot sector and map the $MFT from its own record 0.
    pub fn new(mut body: T) -> Result<Self> {
        let mut sector = vec![0u8; 512];
        body.read_at(0, &mut sector)?;
        let pbs = PartitionBootSector::from_bytes(&sector)?;
        if let Err(e) = pbs.validate() {
            error!("The boot sector is not a valid NTFS boot sector.");
            return Err(e);
        }
        let geometry = pbs.geometry();
        let stream = load_mft_stream(&mut body, &pbs, geometry)?;
        info!(
            "NTFS volume: {} byte clusters, {} byte records, {} MFT records.",
            geometry.cluster_size,
            geometry.record_size,
            stream.record_count()
        );
        Ok(Self {
            pbs,
            geometry,
            body,
            stream,
            root: None,
        })
    }

    pub fn mft_records_count(&self) -> u64 {
        self.stream.record_count()
    }

    pub fn mft_layout(&self) -> &MftLayout {
        self.stream.layout()
    }

    /// Records fetched per refill of the sequential MFT buffer.
    pub fn set_buffer_size(&mut self, records: usize) {
        self.stream.set_buffer_size(records);
    }

    /// Read record `file_id` without checking any sequence number.
    pub fn get_file_id(&mut self, file_id: u64) -> Result<MftRecord> {
        let rec = self.stream.read_record_at(&mut self.body, file_id)?;
        debug!("MFT entry {} read.", file_id);
        Ok(rec)
    }

    /// Read the record a reference points to, rejecting stale references.
    pub fn get_file_ref(&mut self, reference: FileReference) -> Result<MftRecord> {
        let rec = self.get_file_id(reference.record)?;
        if !reference.matches(&rec) {
            return Err(NtfsError::StaleReference {
                record: reference.record,
                expected: reference.sequence,
                found: rec.header.sequence_number,
            });
        }
        Ok(rec)
    }

    /// Enumerate the MFT through the buffered stream.
    pub fn records(&mut self, options: MftIteratorOptions) -> Result<MftRecords<'_, T>> {
        self.stream.records(&mut self.body, options)
    }

    /// Logical content of a single attribute.
    pub fn materialize(&mut self, attr: &Attribute) -> Result<Vec<u8>> {
        materialize(attr, &mut self.body, self.geometry.cluster_size)
    }

    /// Every piece of an attribute, following the $ATTRIBUTE_LIST into
    /// extension records when the base record has one.
    pub fn attribute_pieces(
        &mut self,
        record: &MftRecord,
        attr_type: AttributeType,
        name: Option<&str>,
    ) -> Result<Vec<Attribute>> {
        let mut pieces: Vec<Attribute> = record
            .attributes
            .iter()
            .filter(|a| a.matches(attr_type, name))
            .cloned()
            .collect();

        if let Some(list_attr) = record.attribute(AttributeType::AttributeList) {
            let list = parse_attribute_list(&self.materialize(list_attr)?)?;
            let mut seen = HashSet::new();
            for entry in list
                .iter()
                .filter(|e| e.attr_type == attr_type && e.name.as_deref() == name)
            {
                if entry.reference.record == record.id || !seen.insert(entry.reference.record) {
                    continue;
                }
                debug!(
                    "{:?} of record {} continues in record {}.",
                    attr_type, record.id, entry.reference.record
                );
                let ext = self.get_file_ref(entry.reference)?;
                pieces.extend(
                    ext.attributes
                        .iter()
                        .filter(|a| a.matches(attr_type, name))
                        .cloned(),
                );
            }
        }
        Ok(pieces)
    }

    /// Materialized content of the named (or unnamed) attribute, if present.
    pub fn attribute_data(
        &mut self,
        record: &MftRecord,
        attr_type: AttributeType,
        name: Option<&str>,
    ) -> Result<Option<Vec<u8>>> {
        match merge_pieces(self.attribute_pieces(record, attr_type, name)?)? {
            Some(attr) => Ok(Some(self.materialize(&attr)?)),
            None => Ok(None),
        }
    }

    /// Read the unnamed $DATA stream of `record`.
    pub fn read_file(&mut self, record: &MftRecord) -> Result<Vec<u8>> {
        self.read_stream(record, None)
    }

    /// Read a $DATA stream by name (`None` for the default stream).
    pub fn read_stream(&mut self, record: &MftRecord, name: Option<&str>) -> Result<Vec<u8>> {
        self.attribute_data(record, AttributeType::Data, name)?
            .ok_or(NtfsError::MissingAttribute("$DATA"))
    }

    /// Load the `$I30` index of a directory record. `None` when the record
    /// has no index root.
    pub fn load_index(
        &mut self,
        record: &MftRecord,
    ) -> Result<Option<(IndexRoot, Option<IndexAllocation>)>> {
        let Some(root_data) = self.attribute_data(record, AttributeType::IndexRoot, I30)? else {
            return Ok(None);
        };
        let root = IndexRoot::parse(&root_data)?;
        if !root.is_large() {
            return Ok(Some((root, None)));
        }

        info!("Directory {} uses a non-resident index, walking it.", record.id);
        let data = self
            .attribute_data(record, AttributeType::IndexAllocation, I30)?
            .ok_or(NtfsError::MissingAttribute("$INDEX_ALLOCATION"))?;
        let bitmap = self.attribute_data(record, AttributeType::Bitmap, I30)?;
        let record_size = if root.record_size > 0 {
            root.record_size as usize
        } else {
            self.geometry.index_record_size as usize
        };
        let alloc = IndexAllocation::parse(
            &data,
            record_size,
            self.geometry.sector_size as usize,
            root.indexed_type,
            bitmap.as_deref(),
        )?;
        Ok(Some((root, Some(alloc))))
    }

    /// List every child entry of the directory whose MFT record is `dir_id`,
    /// in collation order. The `.` self entry and DOS-only names are left out.
    pub fn list_dir(&mut self, dir_id: u64) -> Result<Vec<DirectoryEntry>> {
        let rec = self.get_file_id(dir_id)?;
        let (root, alloc) = self
            .load_index(&rec)?
            .ok_or(NtfsError::MissingAttribute("$INDEX_ROOT"))?;

        let mut seen = HashSet::<(u64, String)>::new();
        let entries = index::list_children(&root, alloc.as_ref())
            .into_iter()
            .filter_map(DirectoryEntry::from_index_entry)
            .filter(|e| e.name != "." && e.namespace != FileNameAttr::NAMESPACE_DOS)
            .filter(|e| seen.insert((e.file_id, e.name.clone())))
            .collect();
        Ok(entries)
    }

    /// Look a single name up in a directory through its index.
    pub fn find_in_dir(&mut self, dir_id: u64, name: &str) -> Result<Option<DirectoryEntry>> {
        let rec = self.get_file_id(dir_id)?;
        let Some((root, alloc)) = self.load_index(&rec)? else {
            return Ok(None);
        };
        let hit = index::find(&root, alloc.as_ref(), name)?;
        Ok(hit.and_then(DirectoryEntry::from_index_entry))
    }

    /// MFT index of the root directory: the first in-use record, within the
    /// first `ROOT_SEARCH_LIMIT`, whose name is `.`.
    pub fn find_root(&mut self) -> Result<u64> {
        if let Some(root) = self.root {
            return Ok(root);
        }
        let mut found = None;
        for rec in self
            .stream
            .records(&mut self.body, MftIteratorOptions::in_use())?
        {
            let rec = match rec {
                Ok(rec) => rec,
                Err(e) if e.is_integrity() => {
                    warn!("Skipping damaged MFT record: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if rec.id >= ROOT_SEARCH_LIMIT {
                break;
            }
            if rec.is_dir() && rec.file_names().iter().any(|f| f.name == ".") {
                found = Some(rec.id);
                break;
            }
        }
        let root = found.ok_or(NtfsError::RootNotFound(ROOT_SEARCH_LIMIT))?;
        info!("Volume root is MFT record {}.", root);
        self.root = Some(root);
        Ok(root)
    }

    /// Resolve a `\`-separated path from the root. `/` works as well.
    pub fn resolve_path(&mut self, path: &str) -> Result<Option<MftRecord>> {
        let mut current = self.find_root()?;
        for component in path.split(['\\', '/']).filter(|c| !c.is_empty()) {
            match self.find_in_dir(current, component)? {
                Some(entry) => current = entry.file_id,
                None => {
                    debug!("'{}' not found under record {}.", component, current);
                    return Ok(None);
                }
            }
        }
        self.get_file_id(current).map(Some)
    }

    /// Depth-first search for `name` (case-insensitive) from the root.
    /// Returns the full path and the matching entry.
    pub fn search(&mut self, name: &str) -> Result<Option<(String, DirectoryEntry)>> {
        let wanted: Vec<u16> = name.encode_utf16().collect();
        let root = self.find_root()?;
        let mut visited = HashSet::new();
        let mut stack = vec![(root, String::new())];

        while let Some((dir_id, dir_path)) = stack.pop() {
            if !visited.insert(dir_id) {
                warn!("Directory {} reached twice, skipping.", dir_id);
                continue;
            }
            let entries = match self.list_dir(dir_id) {
                Ok(entries) => entries,
                Err(e) if e.is_integrity() => {
                    warn!("Skipping directory {}: {}", dir_id, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut subdirs = Vec::new();
            for entry in entries {
                let path = format!("{}\\{}", dir_path, entry.name);
                let units: Vec<u16> = entry.name.encode_utf16().collect();
                if Collation::FileName.compare(&units, &wanted).is_eq() {
                    return Ok(Some((path, entry)));
                }
                if entry.is_dir && entry.file_id != dir_id {
                    subdirs.push((entry.file_id, path));
                }
            }
            // first child is explored first
            stack.extend(subdirs.into_iter().rev());
        }
        Ok(None)
    }
}

/// Build the MFT stream from record 0, following its $ATTRIBUTE_LIST when the
/// $MFT's own $DATA is split over extension records.
fn load_mft_stream<T: Read + Seek>(
    body: &mut T,
    pbs: &PartitionBootSector,
    geometry: VolumeGeometry,
) -> Result<MftStream> {
    debug!("Loading MFT run-list.");
    let mut raw = vec![0u8; geometry.record_size as usize];
    body.read_at(pbs.mft_address(), &mut raw)?;
    let rec0 = MftRecord::parse(&mut raw, geometry.sector_size as usize, 0)?;

    let data = rec0
        .attribute_named(AttributeType::Data, None)
        .ok_or(NtfsError::MissingAttribute("$DATA"))?;
    let mut stream = stream_for(data, geometry)?;

    if let Some(list_attr) = rec0.attribute(AttributeType::AttributeList) {
        let list_data = materialize(list_attr, body, geometry.cluster_size)?;
        let mut pieces = vec![data.clone()];
        for entry in parse_attribute_list(&list_data)?
            .iter()
            .filter(|e| e.attr_type == AttributeType::Data && e.name.is_none())
            .filter(|e| e.reference.record != 0)
        {
            let ext = stream.read_record_at(body, entry.reference.record)?;
            pieces.extend(
                ext.attributes
                    .iter()
                    .filter(|a| a.matches(AttributeType::Data, None))
                    .cloned(),
            );
        }
        if pieces.len() > 1 {
            info!("$MFT data is split over {} records.", pieces.len());
            if let Some(merged) = merge_pieces(pieces)? {
                stream = stream_for(&merged, geometry)?;
            }
        }
    }
    Ok(stream)
}

fn stream_for(data: &Attribute, geometry: VolumeGeometry) -> Result<MftStream> {
    let Attribute::NonResident { run_list, .. } = data else {
        return Err(NtfsError::MissingAttribute("non-resident $MFT $DATA"));
    };
    let layout = MftLayout::new(
        &decode_run_list(run_list)?,
        geometry.cluster_size,
        geometry.record_size,
    )?;
    Ok(MftStream::new(layout, geometry.sector_size as usize))
}
