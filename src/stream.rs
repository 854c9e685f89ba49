//! MFT addressing and the buffered record stream.
//!
//! The $MFT is itself a non-resident file, so record N lives wherever the
//! $MFT's own data runs put it. `MftLayout` maps record indexes to volume
//! offsets; `MftStream` reads records sequentially through a small
//! multi-record buffer, with a separate scratch buffer for random access.

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::content::VolumeRead;
use crate::error::{NtfsError, Result};
use crate::mft::MftRecord;
use crate::runlist::{DataRun, resolve_extents};

pub const DEFAULT_BUFFER_RECORDS: usize = 8;

/// A stretch of consecutive records stored contiguously on the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct MftSpan {
    pub first_record: u64,
    pub records: u64,
    pub byte_offset: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MftLayout {
    pub record_size: u64,
    pub cluster_size: u64,
    pub spans: Vec<MftSpan>,
}

impl MftLayout {
    /// Build the record map from the $MFT's data runs. Sparse runs hold no
    /// records.
    pub fn new(runs: &[DataRun], cluster_size: u64, record_size: u64) -> Result<Self> {
        if record_size == 0 || cluster_size == 0 {
            return Err(NtfsError::InvalidBootSector(format!(
                "cluster size {} / record size {}",
                cluster_size, record_size
            )));
        }
        let mut spans = Vec::new();
        let mut first_record = 0u64;
        for extent in resolve_extents(runs)? {
            let Some(lcn) = extent.lcn else {
                continue;
            };
            let records = extent.length * cluster_size / record_size;
            spans.push(MftSpan {
                first_record,
                records,
                byte_offset: lcn * cluster_size,
            });
            first_record += records;
        }
        debug!(
            "MFT layout: {} records in {} extents.",
            first_record,
            spans.len()
        );
        Ok(Self {
            record_size,
            cluster_size,
            spans,
        })
    }

    pub fn record_count(&self) -> u64 {
        self.spans.last().map_or(0, |s| s.first_record + s.records)
    }

    fn span_of(&self, index: u64) -> Result<&MftSpan> {
        self.spans
            .iter()
            .find(|s| index >= s.first_record && index < s.first_record + s.records)
            .ok_or(NtfsError::IndexOutOfRange {
                index,
                count: self.record_count(),
            })
    }

    /// Volume byte offset of record `index`.
    pub fn record_offset(&self, index: u64) -> Result<u64> {
        let span = self.span_of(index)?;
        Ok(span.byte_offset + (index - span.first_record) * self.record_size)
    }

    /// Inverse of `record_offset`: the record starting at a volume offset.
    pub fn record_at_offset(&self, offset: u64) -> Result<u64> {
        for span in &self.spans {
            let end = span.byte_offset + span.records * self.record_size;
            if offset >= span.byte_offset && offset < end {
                let rel = offset - span.byte_offset;
                if rel % self.record_size != 0 {
                    break;
                }
                return Ok(span.first_record + rel / self.record_size);
            }
        }
        Err(NtfsError::InvalidPosition(offset))
    }

    /// Records that can be read in one go starting at `index`.
    fn contiguous_from(&self, index: u64) -> Result<u64> {
        let span = self.span_of(index)?;
        Ok(span.first_record + span.records - index)
    }
}

/// Filters applied while enumerating the MFT.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct MftIteratorOptions {
    /// Skip never-written (zeroed) slots.
    pub ignore_empty: bool,
    /// Skip records without the InUse flag.
    pub ignore_unused: bool,
    pub start_from: u64,
}

impl MftIteratorOptions {
    pub fn in_use() -> Self {
        Self {
            ignore_empty: true,
            ignore_unused: true,
            start_from: 0,
        }
    }
}

/// Sequential reader over the MFT. Holds cursor and buffer state only; the
/// volume is passed to every call.
#[derive(Debug, Clone)]
pub struct MftStream {
    layout: MftLayout,
    sector_size: usize,
    capacity: usize,
    buffer: Vec<u8>,
    buffer_start: u64,
    buffer_records: usize,
    next: u64,
    scratch: Vec<u8>,
}

impl MftStream {
    pub fn new(layout: MftLayout, sector_size: usize) -> Self {
        let record_size = layout.record_size as usize;
        Self {
            layout,
            sector_size,
            capacity: DEFAULT_BUFFER_RECORDS,
            buffer: Vec::new(),
            buffer_start: 0,
            buffer_records: 0,
            next: 0,
            scratch: vec![0u8; record_size],
        }
    }

    pub fn layout(&self) -> &MftLayout {
        &self.layout
    }

    pub fn record_count(&self) -> u64 {
        self.layout.record_count()
    }

    pub fn buffer_size(&self) -> usize {
        self.capacity
    }

    /// Number of records fetched per refill; at least one.
    pub fn set_buffer_size(&mut self, records: usize) {
        self.capacity = records.max(1);
        self.invalidate();
    }

    /// Index of the record the next `read_next` returns.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Move the cursor. Positions inside the buffered range reuse it.
    pub fn seek(&mut self, index: u64) -> Result<()> {
        let count = self.record_count();
        if index > count {
            return Err(NtfsError::IndexOutOfRange { index, count });
        }
        if !self.is_buffered(index) {
            self.invalidate();
        }
        self.next = index;
        Ok(())
    }

    /// Read the record under the cursor and advance. Fails with `EndOfMft`
    /// once every record was returned.
    pub fn read_next<R: VolumeRead + ?Sized>(&mut self, reader: &mut R) -> Result<MftRecord> {
        let index = self.next;
        if index >= self.record_count() {
            return Err(NtfsError::EndOfMft);
        }
        if !self.is_buffered(index) {
            self.refill(reader, index)?;
        }
        self.next += 1;

        let rs = self.layout.record_size as usize;
        let at = (index - self.buffer_start) as usize * rs;
        MftRecord::parse(&mut self.buffer[at..at + rs], self.sector_size, index)
    }

    /// Raw bytes of record `index`, read through the scratch buffer.
    pub fn read_raw_at<R: VolumeRead + ?Sized>(
        &mut self,
        reader: &mut R,
        index: u64,
    ) -> Result<&[u8]> {
        let offset = self.layout.record_offset(index)?;
        reader.read_at(offset, &mut self.scratch)?;
        Ok(&self.scratch)
    }

    /// Random access that leaves the sequential cursor alone.
    pub fn read_record_at<R: VolumeRead + ?Sized>(
        &mut self,
        reader: &mut R,
        index: u64,
    ) -> Result<MftRecord> {
        let offset = self.layout.record_offset(index)?;
        reader.read_at(offset, &mut self.scratch)?;
        MftRecord::parse(&mut self.scratch, self.sector_size, index)
    }

    /// Lazily enumerate records from `options.start_from`.
    pub fn records<'a, R: VolumeRead + ?Sized>(
        &'a mut self,
        reader: &'a mut R,
        options: MftIteratorOptions,
    ) -> Result<MftRecords<'a, R>> {
        self.seek(options.start_from)?;
        Ok(MftRecords {
            stream: self,
            reader,
            options,
        })
    }

    fn is_buffered(&self, index: u64) -> bool {
        index >= self.buffer_start && index < self.buffer_start + self.buffer_records as u64
    }

    fn invalidate(&mut self) {
        self.buffer_records = 0;
    }

    fn refill<R: VolumeRead + ?Sized>(&mut self, reader: &mut R, index: u64) -> Result<()> {
        let n = self
            .layout
            .contiguous_from(index)?
            .min(self.capacity as u64) as usize;
        let rs = self.layout.record_size as usize;
        let offset = self.layout.record_offset(index)?;
        self.buffer.resize(n * rs, 0);
        self.invalidate();
        reader.read_at(offset, &mut self.buffer[..n * rs])?;
        self.buffer_start = index;
        self.buffer_records = n;
        trace!("Buffered MFT records {}..{} from 0x{:X}.", index, index + n as u64, offset);
        Ok(())
    }
}

/// Iterator returned by [`MftStream::records`]. Errors are yielded and the
/// iteration continues with the next record.
pub struct MftRecords<'a, R: VolumeRead + ?Sized> {
    stream: &'a mut MftStream,
    reader: &'a mut R,
    options: MftIteratorOptions,
}

impl<R: VolumeRead + ?Sized> Iterator for MftRecords<'_, R> {
    type Item = Result<MftRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.stream.read_next(&mut *self.reader) {
                Err(NtfsError::EndOfMft) => return None,
                Err(e) => return Some(Err(e)),
                Ok(rec) => {
                    if self.options.ignore_empty && rec.is_empty() {
                        continue;
                    }
                    if self.options.ignore_unused && !rec.in_use() {
                        continue;
                    }
                    return Some(Ok(rec));
                }
            }
        }
    }
}
