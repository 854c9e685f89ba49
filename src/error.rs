use thiserror::Error;

pub type Result<T> = std::result::Result<T, NtfsError>;

#[derive(Error, Debug)]
pub enum NtfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error("Invalid multi-sector signature: {0:02X?}")]
    InvalidSignature([u8; 4]),

    #[error(
        "Fix-up mismatch in sector {sector}: expected 0x{expected:04X}, found 0x{found:04X}. Possibly a corrupted sector"
    )]
    FixUpMismatch {
        sector: usize,
        expected: u16,
        found: u16,
    },

    #[error("Invalid INDX signature: {0:02X?}")]
    InvalidIndexMagic([u8; 4]),

    #[error("Read of {len} bytes at offset {offset} is outside a {size} byte buffer")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("MFT index {index} is out of range ({count} records)")]
    IndexOutOfRange { index: u64, count: u64 },

    #[error("Malformed run list: {0}")]
    MalformedRunList(String),

    #[error("Malformed compression unit: {0}")]
    MalformedCompressionUnit(String),

    #[error("Backreference offset {offset} points before the start of the chunk (position {position})")]
    BackreferenceOutOfRange { offset: usize, position: usize },

    #[error("Malformed compressed data: {0}")]
    MalformedCompressedData(String),

    #[error("Attribute at offset {offset} declares {declared} bytes but only {remaining} remain")]
    AttributeOverrun {
        offset: usize,
        declared: u32,
        remaining: usize,
    },

    #[error("Data runs need {needed} bytes but the attribute allocates {allocated}")]
    ReadPastAllocated { needed: u64, allocated: u64 },

    #[error("Index record size {size} is smaller than a {sector_size} byte sector")]
    InvalidIndexRecordSize { size: usize, sector_size: usize },

    #[error("Index record with VCN {0} not found in the allocation")]
    IndexRecordNotFound(u64),

    #[error("Index descent revisits the node at VCN {0}")]
    IndexLoop(u64),

    #[error("Malformed index entry at offset {offset}: {reason}")]
    MalformedIndexEntry { offset: usize, reason: String },

    #[error("Attribute {0} not found")]
    MissingAttribute(&'static str),

    #[error("Byte position 0x{0:X} is not a record boundary inside the MFT")]
    InvalidPosition(u64),

    #[error("Stale reference to record {record}: expected sequence {expected}, found {found}")]
    StaleReference {
        record: u64,
        expected: u16,
        found: u16,
    },

    #[error("Tried to read past the end of the MFT")]
    EndOfMft,

    #[error("Volume root (\".\") not found within the first {0} MFT records")]
    RootNotFound(u64),
}

impl NtfsError {
    /// Integrity errors mean the bytes on disk are damaged (or were read
    /// mid-write); callers may skip the offending record.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            NtfsError::InvalidSignature(_)
                | NtfsError::FixUpMismatch { .. }
                | NtfsError::InvalidIndexMagic(_)
        )
    }
}
