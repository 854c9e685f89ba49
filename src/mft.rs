// Sources:
// - https://dubeyko.com/development/FileSystems/NTFS/ntfsdoc.pdf
// - https://en.wikipedia.org/wiki/NTFS

use chrono::{TimeZone, Utc};
use log::{debug, warn};
use prettytable::{Table, row};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

use crate::cursor::{ByteCursor, utf16le_to_string};
use crate::error::{NtfsError, Result};
use crate::fixup::FixUp;

pub const RECORD_IN_USE: u16 = 0x0001;
pub const RECORD_IS_DIRECTORY: u16 = 0x0002;
pub const RECORD_IS_EXTENSION: u16 = 0x0004;
pub const RECORD_IS_VIEW_INDEX: u16 = 0x0008;

pub const ATTR_FLAG_COMPRESSION_MASK: u16 = 0x00FF;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTR_FLAG_SPARSE: u16 = 0x8000;

pub const FILE_ATTR_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTR_DUP_INDEX_PRESENT: u32 = 0x1000_0000;

const END_OF_ATTRIBUTES: u32 = 0xFFFF_FFFF;
const RESIDENT_HEADER_LEN: usize = 0x18;
const NON_RESIDENT_HEADER_LEN: usize = 0x40;

/// Multi-sector signature of a FILE record slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum RecordSignature {
    /// Zeroed slot that was never written.
    #[default]
    Empty,
    File,
    /// Marked bad by chkdsk.
    Baad,
}

/// 48-bit record index plus the 16-bit sequence number it expects to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct FileReference {
    pub record: u64,
    pub sequence: u16,
}

impl FileReference {
    pub fn from_u64(raw: u64) -> Self {
        Self {
            record: raw & 0x0000_FFFF_FFFF_FFFF,
            sequence: (raw >> 48) as u16,
        }
    }

    pub fn to_u64(self) -> u64 {
        (self.record & 0x0000_FFFF_FFFF_FFFF) | ((self.sequence as u64) << 48)
    }

    pub fn is_null(&self) -> bool {
        self.record == 0 && self.sequence == 0
    }

    /// Canonical validity rule: the target record must carry the same sequence.
    pub fn matches(&self, record: &MftRecord) -> bool {
        record.header.sequence_number == self.sequence
    }
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (seq {})", self.record, self.sequence)
    }
}

/// Header found at the very beginning of every **FILE** record (offset 0).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FileRecordHeader {
    pub signature: RecordSignature,
    pub usa_offset: u16,
    pub usa_count: u16,
    pub fixup: FixUp,
    pub lsn: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    pub base_file_record: FileReference,
    pub next_attr_id: u16,
    /// Only present in records written by NTFS 3.1+ (USA at 0x30).
    pub record_number: Option<u32>,
}

impl FileRecordHeader {
    pub fn in_use(&self) -> bool {
        self.flags & RECORD_IN_USE != 0
    }

    pub fn is_dir(&self) -> bool {
        self.flags & RECORD_IS_DIRECTORY != 0
    }

    pub fn is_extension(&self) -> bool {
        self.flags & RECORD_IS_EXTENSION != 0
    }

    pub fn is_view_index(&self) -> bool {
        self.flags & RECORD_IS_VIEW_INDEX != 0
    }
}

/// Common header part for resident & non‑resident attributes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttributeHeaderCommon {
    pub attr_type: AttributeType,
    pub length: u32,
    pub non_resident: bool,
    pub name_length: u8,
    pub name_offset: u16,
    pub flags: u16,
    pub id: u16,
    pub name: Option<String>,
}

/// Additional 8‑byte header present only when the attribute is resident
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResidentHeader {
    pub value_length: u32,
    pub value_offset: u16,
    pub resident_flags: u8, // 1 = indexed
}

/// Additional header present only when the attribute is non‑resident
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NonResidentHeader {
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub mapping_pairs_offset: u16,
    /// log2 of the compression unit size in clusters; 0 when uncompressed.
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub real_size: u64,
    pub initialized_size: u64,
    /// Clusters physically allocated, only stored for compressed attributes.
    pub compressed_size: Option<u64>,
}

/// High‑level representation of a single attribute (header + raw value bytes).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum Attribute {
    Resident {
        header: AttributeHeaderCommon,
        resident: ResidentHeader,
        value: Vec<u8>,
    },
    NonResident {
        header: AttributeHeaderCommon,
        non_resident: NonResidentHeader,
        run_list: Vec<u8>,
    },
}

impl Attribute {
    pub fn header(&self) -> &AttributeHeaderCommon {
        match self {
            Attribute::Resident { header, .. } | Attribute::NonResident { header, .. } => header,
        }
    }

    pub fn attr_type(&self) -> AttributeType {
        self.header().attr_type
    }

    pub fn name(&self) -> Option<&str> {
        self.header().name.as_deref()
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, Attribute::Resident { .. })
    }

    pub fn is_compressed(&self) -> bool {
        self.header().flags & ATTR_FLAG_COMPRESSION_MASK != 0
    }

    pub fn is_sparse(&self) -> bool {
        self.header().flags & ATTR_FLAG_SPARSE != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.header().flags & ATTR_FLAG_ENCRYPTED != 0
    }

    pub fn lowest_vcn(&self) -> u64 {
        match self {
            Attribute::Resident { .. } => 0,
            Attribute::NonResident { non_resident, .. } => non_resident.lowest_vcn,
        }
    }

    /// Logical size of the content.
    pub fn data_size(&self) -> u64 {
        match self {
            Attribute::Resident { resident, .. } => resident.value_length as u64,
            Attribute::NonResident { non_resident, .. } => non_resident.real_size,
        }
    }

    /// Same type and same name (`None` for the unnamed attribute).
    pub fn matches(&self, attr_type: AttributeType, name: Option<&str>) -> bool {
        self.attr_type() == attr_type && self.name() == name
    }
}

/// Represents an Alternate Data Stream (named $DATA attribute).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataStream {
    pub name: String,
    pub size: u64,
    pub resident: bool,
}

/// A decoded MFT record. Records read from never-used slots come back with
/// an `Empty` signature and no attributes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MftRecord {
    pub id: u64,
    pub header: FileRecordHeader,
    pub attributes: Vec<Attribute>,
}

impl MftRecord {
    /// Decode a record in place. The fix-up is applied while attributes are
    /// read and undone before returning, so `raw` ends up byte-identical to
    /// what was passed in.
    pub fn parse(raw: &mut [u8], sector_size: usize, id: u64) -> Result<Self> {
        let header = parse_header(raw)?;
        if header.signature == RecordSignature::Empty {
            debug!("MFT entry {} is an empty slot.", id);
            return Ok(Self::empty(id));
        }
        if header.signature == RecordSignature::Baad {
            warn!("MFT entry {} carries the BAAD signature.", id);
        }

        header.fixup.apply(raw, sector_size)?;
        let attributes = parse_attributes(raw, &header, id);
        header.fixup.undo(raw, sector_size)?;

        Ok(MftRecord {
            id,
            header,
            attributes: attributes?,
        })
    }

    /// Decode a record from a read-only buffer.
    pub fn from_bytes(raw: &[u8], sector_size: usize, id: u64) -> Result<Self> {
        let mut buf = raw.to_vec();
        Self::parse(&mut buf, sector_size, id)
    }

    pub fn empty(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.header.signature == RecordSignature::Empty
    }

    pub fn in_use(&self) -> bool {
        self.header.in_use()
    }

    pub fn is_dir(&self) -> bool {
        self.header.is_dir()
    }

    /// The reference other structures use to point at this record.
    pub fn reference(&self) -> FileReference {
        FileReference {
            record: self.id,
            sequence: self.header.sequence_number,
        }
    }

    pub fn attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type() == attr_type)
    }

    pub fn attribute_named(&self, attr_type: AttributeType, name: Option<&str>) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.matches(attr_type, name))
    }

    pub fn attributes_of(&self, attr_type: AttributeType) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(move |a| a.attr_type() == attr_type)
    }

    /// List every $FILE_NAME attribute found (there may be 2 – long & DOS).
    pub fn file_names(&self) -> Vec<FileNameAttr> {
        self.attributes
            .iter()
            .filter_map(|a| {
                if let Attribute::Resident { value, header, .. } = a {
                    (header.attr_type == AttributeType::FileName)
                        .then(|| FileNameAttr::parse(value).ok())
                } else {
                    None
                }
            })
            .flatten()
            .collect()
    }

    /// The Win32/POSIX name when there is one, otherwise whatever is present.
    pub fn primary_name(&self) -> Option<String> {
        let names = self.file_names();
        names
            .iter()
            .find(|f| f.namespace != FileNameAttr::NAMESPACE_DOS)
            .or(names.first())
            .map(|f| f.name.clone())
    }

    /// Parent directory MFT reference (from the first $FILE_NAME attribute).
    pub fn parent(&self) -> Option<FileReference> {
        self.file_names().first().map(|f| f.parent)
    }

    pub fn standard_information(&self) -> Option<StandardInformation> {
        self.attributes.iter().find_map(|a| {
            if let Attribute::Resident { value, header, .. } = a {
                if header.attr_type == AttributeType::StandardInformation {
                    return StandardInformation::from_bytes(value);
                }
            }
            None
        })
    }

    /// Extract Alternate Data Streams (named $DATA attributes).
    pub fn alternate_data_streams(&self) -> Vec<DataStream> {
        self.attributes
            .iter()
            .filter_map(|a| match a {
                Attribute::Resident {
                    header, resident, ..
                } if header.attr_type == AttributeType::Data && header.name_length > 0 => {
                    Some(DataStream {
                        name: header.name.clone().unwrap_or_default(),
                        size: resident.value_length as u64,
                        resident: true,
                    })
                }
                Attribute::NonResident {
                    header,
                    non_resident,
                    ..
                } if header.attr_type == AttributeType::Data && header.name_length > 0 => {
                    Some(DataStream {
                        name: header.name.clone().unwrap_or_default(),
                        size: non_resident.real_size,
                        resident: false,
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Convert record to a human‑readable table string.
    pub fn to_string(&self) -> String {
        let mut out = String::new();

        //  Header
        let mut hdr = Table::new();
        hdr.add_row(row!["MFT Entry Header Values"]);
        hdr.add_row(row![b -> "Entry", self.id]);
        hdr.add_row(row![b -> "Signature", format!("{:?}", self.header.signature)]);
        hdr.add_row(row![b -> "Sequence", self.header.sequence_number]);
        hdr.add_row(row![b -> "$LogFile Sequence Number", self.header.lsn]);
        hdr.add_row(row![b -> "Flags", record_flags_to_string(self.header.flags)]);
        hdr.add_row(row![b -> "Links", self.header.hard_link_count]);
        hdr.add_row(row![b -> "Used / Allocated", format!("{} / {}", self.header.bytes_in_use, self.header.bytes_allocated)]);
        if !self.header.base_file_record.is_null() {
            hdr.add_row(row![b -> "Base Record", self.header.base_file_record]);
        }
        out.push_str(&hdr.to_string());
        out.push('\n');

        //  Attributes overview
        let mut attrs = Table::new();
        attrs.add_row(row!["Attributes", "Name", "Status", "Size", "Flags"]);
        for a in &self.attributes {
            let header = a.header();
            let status = if a.is_resident() { "Resident" } else { "Non‑resident" };
            attrs.add_row(row![
                format!(
                    "{:?} (0x{:X}‑#{})",
                    header.attr_type,
                    header.attr_type.code(),
                    header.id
                ),
                header.name.clone().unwrap_or_else(|| "N/A".to_string()),
                status,
                format!("{}", a.data_size()),
                attribute_flags_to_string(header.flags)
            ]);
        }
        out.push('\n');
        out.push_str(&attrs.to_string());

        //  $STANDARD_INFORMATION
        if let Some(std) = self.standard_information() {
            let mut t = Table::new();
            t.add_row(row!["$STANDARD_INFORMATION"]);
            t.add_row(row![b -> "Created", std.created]);
            t.add_row(row![b -> "File Modified", std.modified]);
            t.add_row(row![b -> "MFT Modified", std.mft_modified]);
            t.add_row(row![b -> "Accessed", std.accessed]);
            t.add_row(row![b -> "Flags", si_flags_to_string(std.file_attrs)]);
            t.add_row(row![b -> "Owner ID", std.owner_id.map_or("‑".into(), |v| v.to_string())]);
            t.add_row(
                row![b -> "Security ID", std.security_id.map_or("‑".into(), |v| v.to_string())],
            );
            if let Some(q) = std.quota_charged {
                t.add_row(row![b -> "Quota Charged", q]);
            }
            if let Some(u) = std.usn {
                t.add_row(row![b -> "Last USN", u]);
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }

        //  All FILE_NAME attributes
        let names = self.file_names();
        if !names.is_empty() {
            let mut t = Table::new();
            t.add_row(row!["$FILE_NAME Attributes"]);
            for fname in names {
                t.add_row(row![b -> "Name", fname.name.clone()]);
                t.add_row(row![b -> "Namespace", namespace_to_string(fname.namespace)]);
                t.add_row(row![b -> "Parent MFT", fname.parent]);
                t.add_row(row![b -> "Allocated", fname.allocated_size]);
                t.add_row(row![b -> "Actual", fname.real_size]);
                t.add_row(row!["Flags", si_flags_to_string(fname.flags)]);
                t.add_row(row![b -> "Timestamps", ""]);
                t.add_row(row!["‑ Created", fname.created]);
                t.add_row(row!["‑ Modified", fname.modified]);
                t.add_row(row!["‑ MFT Mod", fname.mft_modified]);
                t.add_row(row!["‑ Accessed", fname.accessed]);
                t.add_row(row!["", ""]); // blank separator
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }

        //  Alternate Data Streams
        let ads = self.alternate_data_streams();
        if !ads.is_empty() {
            let mut t = Table::new();
            t.add_row(row!["Alternate Data Streams"]);
            t.add_row(row![b -> "Name", "Size", "Resident"]);
            for s in ads {
                t.add_row(row![s.name, s.size, if s.resident { "Yes" } else { "No" }]);
            }
            out.push('\n');
            out.push_str(&t.to_string());
        }

        out
    }

    /// Serialize to JSON (uses `serde`).
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "header": &self.header,
            "attributes": &self.attributes,
            "file_names": self.file_names().into_iter().map(|f| f.to_json()).collect::<Vec<_>>(),
            "ads": self.alternate_data_streams(),
        })
    }
}

/*  Private helpers  */

fn parse_header(buf: &[u8]) -> Result<FileRecordHeader> {
    let mut cursor = ByteCursor::new(buf);
    let raw_signature = cursor.read_array::<4>()?;
    let signature = match &raw_signature {
        [0, 0, 0, 0] => return Ok(FileRecordHeader::default()),
        b"FILE" => RecordSignature::File,
        b"BAAD" => RecordSignature::Baad,
        _ => return Err(NtfsError::InvalidSignature(raw_signature)),
    };
    let usa_offset = cursor.read_u16()?;
    let usa_count = cursor.read_u16()?;
    let lsn = cursor.read_u64()?;
    let sequence_number = cursor.read_u16()?;
    let hard_link_count = cursor.read_u16()?;
    let attrs_offset = cursor.read_u16()?;
    let flags = cursor.read_u16()?;
    let bytes_in_use = cursor.read_u32()?;
    let bytes_allocated = cursor.read_u32()?;
    let base_file_record = FileReference::from_u64(cursor.read_u64()?);
    let next_attr_id = cursor.read_u16()?;
    let record_number = if usa_offset >= 0x30 {
        cursor.skip(2)?;
        Some(cursor.read_u32()?)
    } else {
        None
    };
    let fixup = FixUp::read(buf, usa_offset as usize, usa_count as usize)?;

    Ok(FileRecordHeader {
        signature,
        usa_offset,
        usa_count,
        fixup,
        lsn,
        sequence_number,
        hard_link_count,
        attrs_offset,
        flags,
        bytes_in_use,
        bytes_allocated,
        base_file_record,
        next_attr_id,
        record_number,
    })
}

fn parse_attributes(buf: &[u8], header: &FileRecordHeader, id: u64) -> Result<Vec<Attribute>> {
    let end = (header.bytes_in_use as usize).min(buf.len());
    let mut offset = header.attrs_offset as usize;
    let mut attributes = Vec::new();
    loop {
        if offset + 4 > end {
            warn!("MFT entry {} has no attribute terminator before byte {}.", id, end);
            return Err(NtfsError::AttributeOverrun {
                offset,
                declared: 4,
                remaining: end.saturating_sub(offset),
            });
        }
        let attr_type_num = ByteCursor::at(buf, offset).read_u32()?;
        if attr_type_num == END_OF_ATTRIBUTES {
            break;
        }
        let (attr, stride) = parse_attribute(&buf[offset..end], offset)?;
        attributes.push(attr);
        offset += stride;
    }
    Ok(attributes)
}

/// Parse one attribute at the start of `slice`; returns the attribute and the
/// byte stride to the next one.
fn parse_attribute(slice: &[u8], record_offset: usize) -> Result<(Attribute, usize)> {
    let mut cursor = ByteCursor::new(slice);
    let attr_type = AttributeType::from(cursor.read_u32()?);
    let length = cursor.read_u32()?;
    let non_resident = cursor.read_u8()? != 0;
    let name_length = cursor.read_u8()?;
    let name_offset = cursor.read_u16()?;
    let flags = cursor.read_u16()?;
    let id = cursor.read_u16()?;

    let name = if name_length > 0 {
        let raw = cursor.slice(name_offset as usize, name_length as usize * 2)?;
        Some(utf16le_to_string(raw))
    } else {
        None
    };

    let common = AttributeHeaderCommon {
        attr_type,
        length,
        non_resident,
        name_length,
        name_offset,
        flags,
        id,
        name,
    };

    let declared = length as usize;
    let declared_ok = declared >= RESIDENT_HEADER_LEN && declared <= slice.len();
    // bytes the content may occupy
    let area = if declared_ok { declared } else { slice.len() };

    let (attr, content_end) = if !non_resident {
        let value_length = cursor.read_u32()?;
        let value_offset = cursor.read_u16()?;
        let resident_flags = cursor.read_u8()?;
        let value = cursor
            .slice(value_offset as usize, value_length as usize)?
            .to_vec();
        let content_end = value_offset as usize + value_length as usize;
        (
            Attribute::Resident {
                header: common,
                resident: ResidentHeader {
                    value_length,
                    value_offset,
                    resident_flags,
                },
                value,
            },
            content_end,
        )
    } else {
        let lowest_vcn = cursor.read_u64()?;
        let highest_vcn = cursor.read_u64()?;
        let mapping_pairs_offset = cursor.read_u16()?;
        let compression_unit = cursor.read_u16()?;
        cursor.skip(4)?;
        let allocated_size = cursor.read_u64()?;
        let real_size = cursor.read_u64()?;
        let initialized_size = cursor.read_u64()?;
        let compressed_size = if compression_unit > 0 && mapping_pairs_offset as usize >= 0x48 {
            Some(cursor.read_u64()?)
        } else {
            None
        };

        let run_start = mapping_pairs_offset as usize;
        if run_start < NON_RESIDENT_HEADER_LEN || run_start > area {
            return Err(NtfsError::AttributeOverrun {
                offset: record_offset,
                declared: length,
                remaining: slice.len(),
            });
        }
        let run_len = run_list_len(&slice[run_start..area]);
        let run_list = slice[run_start..run_start + run_len].to_vec();
        // include the terminating zero
        let content_end = (run_start + run_len + 1).min(area);
        (
            Attribute::NonResident {
                header: common,
                non_resident: NonResidentHeader {
                    lowest_vcn,
                    highest_vcn,
                    mapping_pairs_offset,
                    compression_unit,
                    allocated_size,
                    real_size,
                    initialized_size,
                    compressed_size,
                },
                run_list,
            },
            content_end,
        )
    };

    if declared_ok {
        return Ok((attr, declared));
    }

    // The declared size does not fit what is left of the record: derive the
    // stride from where the content ends instead.
    let recomputed = (content_end + 7) & !7;
    if recomputed < RESIDENT_HEADER_LEN || recomputed > slice.len() {
        return Err(NtfsError::AttributeOverrun {
            offset: record_offset,
            declared: length,
            remaining: slice.len(),
        });
    }
    warn!(
        "Attribute {:?} at offset {} declares {} bytes with {} remaining; using {} instead.",
        attr.attr_type(),
        record_offset,
        length,
        slice.len(),
        recomputed
    );
    Ok((attr, recomputed))
}

/// Number of mapping-pair bytes before the terminating zero (or the end).
fn run_list_len(area: &[u8]) -> usize {
    let mut pos = 0usize;
    while pos < area.len() && area[pos] != 0 {
        let hdr = area[pos];
        pos += 1 + (hdr & 0x0F) as usize + (hdr >> 4) as usize;
    }
    pos.min(area.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum AttributeType {
    StandardInformation,
    AttributeList,
    FileName,
    ObjectId,
    SecurityDescriptor,
    VolumeName,
    VolumeInformation,
    Data,
    IndexRoot,
    IndexAllocation,
    Bitmap,
    ReparsePoint,
    EaInformation,
    Ea,
    PropertySet,
    LoggedUtilityStream,
    /// Any type code this crate treats as an opaque blob.
    Other(u32),
}

impl AttributeType {
    pub fn code(self) -> u32 {
        use AttributeType::*;
        match self {
            StandardInformation => 0x10,
            AttributeList => 0x20,
            FileName => 0x30,
            ObjectId => 0x40,
            SecurityDescriptor => 0x50,
            VolumeName => 0x60,
            VolumeInformation => 0x70,
            Data => 0x80,
            IndexRoot => 0x90,
            IndexAllocation => 0xA0,
            Bitmap => 0xB0,
            ReparsePoint => 0xC0,
            EaInformation => 0xD0,
            Ea => 0xE0,
            PropertySet => 0xF0,
            LoggedUtilityStream => 0x100,
            Other(code) => code,
        }
    }
}

impl From<u32> for AttributeType {
    fn from(value: u32) -> Self {
        use AttributeType::*;
        match value {
            0x10 => StandardInformation,
            0x20 => AttributeList,
            0x30 => FileName,
            0x40 => ObjectId,
            0x50 => SecurityDescriptor,
            0x60 => VolumeName,
            0x70 => VolumeInformation,
            0x80 => Data,
            0x90 => IndexRoot,
            0xA0 => IndexAllocation,
            0xB0 => Bitmap,
            0xC0 => ReparsePoint,
            0xD0 => EaInformation,
            0xE0 => Ea,
            0xF0 => PropertySet,
            0x100 => LoggedUtilityStream,
            other => Other(other),
        }
    }
}

pub(crate) fn filetime_to_local_datetime(ft: u64) -> String {
    let micros_since_1601 = ft / 10;
    const DELTA_MICROS: i64 = 116_444_736_000_000_00;
    let unix_micros = micros_since_1601 as i64 - DELTA_MICROS;
    let secs = unix_micros.div_euclid(1_000_000);
    let nanos = unix_micros.rem_euclid(1_000_000) * 1_000;
    Utc.timestamp_opt(secs, nanos as u32)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Parsed $STANDARD_INFORMATION (covers v0 & v1, optionally v2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardInformation {
    pub created: String,
    pub modified: String,
    pub mft_modified: String,
    pub accessed: String,
    pub file_attrs: u32,
    pub max_versions: u32,
    pub version_number: u32,
    pub class_id: u32,
    pub owner_id: Option<u32>,
    pub security_id: Option<u32>,
    pub quota_charged: Option<u64>,
    pub usn: Option<u64>,
}

impl StandardInformation {
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 0x30 {
            return None;
        }
        let mut cur = ByteCursor::new(raw);
        let created = filetime_to_local_datetime(cur.read_u64().ok()?);
        let modified = filetime_to_local_datetime(cur.read_u64().ok()?);
        let mft_modified = filetime_to_local_datetime(cur.read_u64().ok()?);
        let accessed = filetime_to_local_datetime(cur.read_u64().ok()?);
        let file_attrs = cur.read_u32().ok()?;
        let max_versions = cur.read_u32().ok()?;
        let version_number = cur.read_u32().ok()?;
        let class_id = cur.read_u32().ok()?;
        let owner_id = if raw.len() >= 0x34 {
            Some(cur.read_u32().ok()?)
        } else {
            None
        };
        let security_id = if raw.len() >= 0x38 {
            Some(cur.read_u32().ok()?)
        } else {
            None
        };
        let quota_charged = if raw.len() >= 0x40 {
            Some(cur.read_u64().ok()?)
        } else {
            None
        };
        let usn = if raw.len() >= 0x48 {
            Some(cur.read_u64().ok()?)
        } else {
            None
        };
        Some(Self {
            created,
            modified,
            mft_modified,
            accessed,
            file_attrs,
            max_versions,
            version_number,
            class_id,
            owner_id,
            security_id,
            quota_charged,
            usn,
        })
    }
}

/// Parsed $FILE_NAME attribute; also the key of every $I30 index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNameAttr {
    pub parent: FileReference,
    pub allocated_size: u64,
    pub real_size: u64,
    pub name: String,
    /// Raw UTF-16 code units, used for collation.
    #[serde(skip)]
    pub name_units: Vec<u16>,
    pub namespace: u8,
    pub flags: u32,
    pub created: String,
    pub modified: String,
    pub mft_modified: String,
    pub accessed: String,
}

impl FileNameAttr {
    pub const NAMESPACE_POSIX: u8 = 0;
    pub const NAMESPACE_WIN32: u8 = 1;
    pub const NAMESPACE_DOS: u8 = 2;
    pub const NAMESPACE_WIN32_AND_DOS: u8 = 3;

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut cur = ByteCursor::new(raw);
        let parent = FileReference::from_u64(cur.read_u64()?);
        let created = filetime_to_local_datetime(cur.read_u64()?);
        let modified = filetime_to_local_datetime(cur.read_u64()?);
        let mft_modified = filetime_to_local_datetime(cur.read_u64()?);
        let accessed = filetime_to_local_datetime(cur.read_u64()?);
        let allocated_size = cur.read_u64()?;
        let real_size = cur.read_u64()?;
        let flags = cur.read_u32()?;
        cur.read_u32()?; // reparse value
        let name_len = cur.read_u8()? as usize;
        let namespace = cur.read_u8()?;
        let name_units: Vec<u16> = cur
            .read_bytes(name_len * 2)?
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(Self {
            parent,
            allocated_size,
            real_size,
            name: String::from_utf16_lossy(&name_units),
            name_units,
            namespace,
            flags,
            created,
            modified,
            mft_modified,
            accessed,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.flags & (FILE_ATTR_DIRECTORY | FILE_ATTR_DUP_INDEX_PRESENT) != 0
    }

    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "namespace": self.namespace,
            "parent": self.parent.record,
            "parent_seq": self.parent.sequence,
            "allocated": self.allocated_size,
            "size": self.real_size,
            "created": self.created,
            "modified": self.modified,
            "mft_modified": self.mft_modified,
            "accessed": self.accessed,
            "flags": self.flags,
        })
    }
}

/// One entry of an $ATTRIBUTE_LIST: where an attribute of the file lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeListEntry {
    pub attr_type: AttributeType,
    pub length: u16,
    pub name: Option<String>,
    pub lowest_vcn: u64,
    pub reference: FileReference,
    pub id: u16,
}

pub fn parse_attribute_list(raw: &[u8]) -> Result<Vec<AttributeListEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset + 0x1A <= raw.len() {
        let mut cur = ByteCursor::at(raw, offset);
        let attr_type = AttributeType::from(cur.read_u32()?);
        let length = cur.read_u16()?;
        let name_length = cur.read_u8()? as usize;
        let name_offset = cur.read_u8()? as usize;
        let lowest_vcn = cur.read_u64()?;
        let reference = FileReference::from_u64(cur.read_u64()?);
        let id = cur.read_u16()?;
        if length == 0 {
            return Err(NtfsError::OutOfBounds {
                offset,
                len: 0,
                size: raw.len(),
            });
        }
        let name = if name_length > 0 {
            Some(utf16le_to_string(
                cur.slice(offset + name_offset, name_length * 2)?,
            ))
        } else {
            None
        };
        entries.push(AttributeListEntry {
            attr_type,
            length,
            name,
            lowest_vcn,
            reference,
            id,
        });
        offset += length as usize;
    }
    Ok(entries)
}

/// Decode MFT record flags.
fn record_flags_to_string(flags: u16) -> String {
    let mut v = Vec::new();
    if flags & RECORD_IN_USE != 0 {
        v.push("Allocated")
    }
    if flags & RECORD_IS_DIRECTORY != 0 {
        v.push("Directory")
    }
    if flags & RECORD_IS_EXTENSION != 0 {
        v.push("Extension")
    }
    if flags & RECORD_IS_VIEW_INDEX != 0 {
        v.push("View Index")
    }
    if v.is_empty() {
        "None".into()
    } else {
        v.join(" | ")
    }
}

fn attribute_flags_to_string(flags: u16) -> String {
    let mut v = Vec::new();
    if flags & ATTR_FLAG_COMPRESSION_MASK != 0 {
        v.push("Compressed");
    }
    if flags & ATTR_FLAG_ENCRYPTED != 0 {
        v.push("Encrypted");
    }
    if flags & ATTR_FLAG_SPARSE != 0 {
        v.push("Sparse");
    }
    if v.is_empty() {
        "‑".into()
    } else {
        v.join(" | ")
    }
}

fn namespace_to_string(namespace: u8) -> &'static str {
    match namespace {
        FileNameAttr::NAMESPACE_POSIX => "POSIX",
        FileNameAttr::NAMESPACE_WIN32 => "Win32",
        FileNameAttr::NAMESPACE_DOS => "DOS",
        FileNameAttr::NAMESPACE_WIN32_AND_DOS => "Win32 & DOS",
        _ => "Unknown",
    }
}

/// Decode FILE attribute flags inside $STANDARD_INFORMATION.
fn si_flags_to_string(flags: u32) -> String {
    let mut v = Vec::new();
    if flags & 0x0001 != 0 {
        v.push("READONLY");
    }
    if flags & 0x0002 != 0 {
        v.push("HIDDEN");
    }
    if flags & 0x0004 != 0 {
        v.push("SYSTEM");
    }
    if flags & 0x0020 != 0 {
        v.push("ARCHIVE");
    }
    if flags & 0x0100 != 0 {
        v.push("TEMPORARY");
    }
    if flags & 0x0200 != 0 {
        v.push("SPARSE_FILE");
    }
    if flags & 0x0400 != 0 {
        v.push("REPARSE_POINT");
    }
    if flags & 0x0800 != 0 {
        v.push("COMPRESSED");
    }
    if flags & 0x1000 != 0 {
        v.push("OFFLINE");
    }
    if flags & 0x2000 != 0 {
        v.push("NOT_CONTENT_INDEXED");
    }
    if flags & 0x4000 != 0 {
        v.push("ENCRYPTED");
    }
    if flags & 0x10000000 != 0 {
        v.push("DIRECTORY");
    }
    if flags & 0x20000000 != 0 {
        v.push("INDEX_VIEW");
    }
    if v.is_empty() {
        "None".to_string()
    } else {
        v.join(" | ")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const SECTOR: usize = 512;
    pub const RECORD: usize = 1024;

    /// Build a $FILE_NAME value.
    pub fn file_name_value(name: &str, parent: u64, flags: u32, namespace: u8) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let mut v = vec![0u8; 0x42];
        v[0..8].copy_from_slice(&parent.to_le_bytes());
        v[0x38..0x3C].copy_from_slice(&flags.to_le_bytes());
        v[0x40] = units.len() as u8;
        v[0x41] = namespace;
        for u in units {
            v.extend_from_slice(&u.to_le_bytes());
        }
        v
    }

    pub fn resident_attr(attr_type: u32, id: u16, name: Option<&str>, value: &[u8]) -> Vec<u8> {
        let name_units: Vec<u16> = name.map(|n| n.encode_utf16().collect()).unwrap_or_default();
        let name_off = 0x18usize;
        let value_off = (name_off + name_units.len() * 2 + 7) & !7;
        let total = (value_off + value.len() + 7) & !7;
        let mut a = vec![0u8; total];
        a[0..4].copy_from_slice(&attr_type.to_le_bytes());
        a[4..8].copy_from_slice(&(total as u32).to_le_bytes());
        a[8] = 0;
        a[9] = name_units.len() as u8;
        a[0x0A..0x0C].copy_from_slice(&(name_off as u16).to_le_bytes());
        a[0x0E..0x10].copy_from_slice(&id.to_le_bytes());
        a[0x10..0x14].copy_from_slice(&(value.len() as u32).to_le_bytes());
        a[0x14..0x16].copy_from_slice(&(value_off as u16).to_le_bytes());
        for (i, u) in name_units.iter().enumerate() {
            a[name_off + i * 2..name_off + i * 2 + 2].copy_from_slice(&u.to_le_bytes());
        }
        a[value_off..value_off + value.len()].copy_from_slice(value);
        a
    }

    /// Lay out a FILE record with fix-up applied (as found on disk).
    pub fn build_record(seq: u16, flags: u16, attrs: &[Vec<u8>]) -> Vec<u8> {
        let mut r = vec![0u8; RECORD];
        r[0..4].copy_from_slice(b"FILE");
        r[4..6].copy_from_slice(&0x30u16.to_le_bytes());
        r[6..8].copy_from_slice(&3u16.to_le_bytes());
        r[0x10..0x12].copy_from_slice(&seq.to_le_bytes());
        r[0x12..0x14].copy_from_slice(&1u16.to_le_bytes());
        r[0x14..0x16].copy_from_slice(&0x38u16.to_le_bytes());
        r[0x16..0x18].copy_from_slice(&flags.to_le_bytes());
        let mut off = 0x38;
        for a in attrs {
            r[off..off + a.len()].copy_from_slice(a);
            off += a.len();
        }
        r[off..off + 4].copy_from_slice(&END_OF_ATTRIBUTES.to_le_bytes());
        off += 8;
        r[0x18..0x1C].copy_from_slice(&(off as u32).to_le_bytes());
        r[0x1C..0x20].copy_from_slice(&(RECORD as u32).to_le_bytes());
        protect(&mut r, 0x30, 0x0A0B);
        r
    }

    /// Move each sector's tail into the USA at `usa` and stamp `usn` in its place.
    pub fn protect(buf: &mut [u8], usa: usize, usn: u16) {
        buf[usa..usa + 2].copy_from_slice(&usn.to_le_bytes());
        for i in 0..buf.len() / SECTOR {
            let tail = (i + 1) * SECTOR - 2;
            let slot = usa + 2 + i * 2;
            let (a, b) = (buf[tail], buf[tail + 1]);
            buf[slot] = a;
            buf[slot + 1] = b;
            buf[tail..tail + 2].copy_from_slice(&usn.to_le_bytes());
        }
    }

    #[test]
    fn zero_signature_is_the_empty_sentinel() {
        // garbage after the signature must not be looked at
        let mut raw = vec![0xEEu8; RECORD];
        raw[0..4].copy_from_slice(&[0, 0, 0, 0]);
        let rec = MftRecord::parse(&mut raw, SECTOR, 7).unwrap();
        assert!(rec.is_empty());
        assert_eq!(rec.id, 7);
        assert!(rec.attributes.is_empty());
    }

    #[test]
    fn unknown_signature_is_an_integrity_error() {
        let mut raw = vec![0u8; RECORD];
        raw[0..4].copy_from_slice(b"JUNK");
        let err = MftRecord::parse(&mut raw, SECTOR, 0).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn parses_resident_attributes_and_restores_buffer() {
        let fname = file_name_value("hello.txt", 5 | (5 << 48), 0x20, 1);
        let mut raw = build_record(
            3,
            RECORD_IN_USE,
            &[
                resident_attr(0x30, 1, None, &fname),
                resident_attr(0x80, 2, None, b"contents"),
                resident_attr(0x80, 3, Some("ads"), b"x"),
            ],
        );
        // parsing hands the buffer back still protected
        let original = raw.clone();
        let rec = MftRecord::parse(&mut raw, SECTOR, 40).unwrap();
        assert_eq!(raw, original);

        assert!(rec.in_use());
        assert!(!rec.is_dir());
        assert_eq!(rec.header.sequence_number, 3);
        assert_eq!(rec.header.record_number, Some(0));
        assert_eq!(rec.attributes.len(), 3);
        assert_eq!(rec.primary_name().as_deref(), Some("hello.txt"));
        assert_eq!(rec.parent(), Some(FileReference { record: 5, sequence: 5 }));
        let data = rec.attribute_named(AttributeType::Data, None).unwrap();
        match data {
            Attribute::Resident { value, .. } => assert_eq!(value, b"contents"),
            _ => panic!("expected resident data"),
        }
        let ads = rec.alternate_data_streams();
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].name, "ads");
        assert_eq!(rec.reference(), FileReference { record: 40, sequence: 3 });
    }

    #[test]
    fn fixup_mismatch_is_fatal() {
        let mut raw = build_record(1, RECORD_IN_USE, &[resident_attr(0x80, 0, None, b"a")]);
        raw[RECORD - 1] ^= 0xFF;
        let err = MftRecord::parse(&mut raw, SECTOR, 0).unwrap_err();
        assert!(matches!(err, NtfsError::FixUpMismatch { sector: 1, .. }));
    }

    #[test]
    fn overlong_declared_size_is_recomputed_from_content() {
        let mut last = resident_attr(0x80, 1, None, b"payload!");
        // claim far more than the record holds
        last[4..8].copy_from_slice(&0x4000u32.to_le_bytes());
        let mut raw = build_record(1, RECORD_IN_USE, &[last]);
        let rec = MftRecord::parse(&mut raw, SECTOR, 0).unwrap();
        assert_eq!(rec.attributes.len(), 1);
        assert_eq!(rec.attributes[0].data_size(), 8);
    }

    #[test]
    fn baad_records_are_still_decoded() {
        let mut raw = build_record(2, RECORD_IN_USE, &[resident_attr(0x80, 1, None, b"x")]);
        raw[0..4].copy_from_slice(b"BAAD");
        let rec = MftRecord::parse(&mut raw, SECTOR, 9).unwrap();
        assert_eq!(rec.header.signature, RecordSignature::Baad);
        assert_eq!(rec.attributes.len(), 1);

        raw[0..4].copy_from_slice(b"XXXX");
        assert!(matches!(
            MftRecord::parse(&mut raw, SECTOR, 9),
            Err(NtfsError::InvalidSignature(_))
        ));
    }

    #[test]
    fn missing_terminator_is_an_overrun() {
        let mut raw = build_record(1, RECORD_IN_USE, &[resident_attr(0x80, 1, None, b"payload!")]);
        // end the used area right where the terminator starts
        let used = 0x38 + 0x20;
        raw[0x18..0x1C].copy_from_slice(&(used as u32).to_le_bytes());
        let err = MftRecord::parse(&mut raw, SECTOR, 0).unwrap_err();
        assert!(matches!(
            err,
            NtfsError::AttributeOverrun { offset: 0x58, remaining: 0, .. }
        ));
    }

    #[test]
    fn non_resident_header_and_run_list() {
        let mut a = vec![0u8; 0x48];
        a[0..4].copy_from_slice(&0x80u32.to_le_bytes());
        a[4..8].copy_from_slice(&0x48u32.to_le_bytes());
        a[8] = 1;
        a[0x0C..0x0E].copy_from_slice(&ATTR_FLAG_SPARSE.to_le_bytes());
        a[0x18..0x20].copy_from_slice(&3u64.to_le_bytes());
        a[0x20..0x22].copy_from_slice(&0x40u16.to_le_bytes());
        a[0x28..0x30].copy_from_slice(&16384u64.to_le_bytes());
        a[0x30..0x38].copy_from_slice(&10000u64.to_le_bytes());
        a[0x38..0x40].copy_from_slice(&10000u64.to_le_bytes());
        a[0x40..0x44].copy_from_slice(&[0x11, 0x02, 0x10, 0x01]);
        a[0x44] = 0x02;
        let mut raw = build_record(1, RECORD_IN_USE, &[a]);
        let rec = MftRecord::parse(&mut raw, SECTOR, 0).unwrap();
        let attr = &rec.attributes[0];
        assert!(attr.is_sparse());
        assert!(!attr.is_compressed());
        match attr {
            Attribute::NonResident {
                non_resident,
                run_list,
                ..
            } => {
                assert_eq!(non_resident.highest_vcn, 3);
                assert_eq!(non_resident.real_size, 10000);
                assert_eq!(non_resident.compressed_size, None);
                assert_eq!(run_list, &vec![0x11, 0x02, 0x10, 0x01, 0x02]);
            }
            _ => panic!("expected non-resident"),
        }
    }

    #[test]
    fn attribute_list_entries() {
        let mut raw = vec![0u8; 0x20 + 0x28];
        raw[0..4].copy_from_slice(&0x90u32.to_le_bytes());
        raw[4..6].copy_from_slice(&0x20u16.to_le_bytes());
        raw[0x10..0x18].copy_from_slice(&(12u64 | (2 << 48)).to_le_bytes());
        let second = 0x20;
        raw[second..second + 4].copy_from_slice(&0xA0u32.to_le_bytes());
        raw[second + 4..second + 6].copy_from_slice(&0x28u16.to_le_bytes());
        raw[second + 6] = 4;
        raw[second + 7] = 0x1A;
        raw[second + 0x10..second + 0x18].copy_from_slice(&13u64.to_le_bytes());
        for (i, u) in "$I30".encode_utf16().enumerate() {
            raw[second + 0x1A + i * 2..second + 0x1C + i * 2].copy_from_slice(&u.to_le_bytes());
        }
        let list = parse_attribute_list(&raw).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].attr_type, AttributeType::IndexRoot);
        assert_eq!(list[0].reference, FileReference { record: 12, sequence: 2 });
        assert_eq!(list[1].name.as_deref(), Some("$I30"));
        assert_eq!(list[1].reference.record, 13);
    }

    #[test]
    fn unknown_attribute_types_are_opaque() {
        assert_eq!(AttributeType::from(0x1234), AttributeType::Other(0x1234));
        assert_eq!(AttributeType::Other(0x1234).code(), 0x1234);
        assert_eq!(AttributeType::from(0xA0).code(), 0xA0);
    }
}
