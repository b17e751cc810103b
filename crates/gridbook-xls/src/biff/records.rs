use std::borrow::Cow;

/// BIFF `CONTINUE` record id.
pub const RECORD_CONTINUE: u16 = 0x003C;
/// BIFF `EOF` record id.
pub const RECORD_EOF: u16 = 0x000A;
/// BIFF8 `BOF` record id.
pub const RECORD_BOF_BIFF8: u16 = 0x0809;
/// BIFF5 `BOF` record id.
pub const RECORD_BOF_BIFF5: u16 = 0x0009;

/// Caps applied when coalescing `CONTINUE` fragments into one logical record.
///
/// A malformed or malicious stream can contain extremely long runs of
/// `CONTINUE` records, which would otherwise result in unbounded allocations
/// when fragments are concatenated. The caps are enforced only when
/// coalescing is actually performed (the record id allows continuation and a
/// `CONTINUE` record is present).
///
/// The limits travel with the iterator instead of living in process-wide
/// statics, so callers can tighten them per stream and tests can exercise the
/// caps without giant inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLimits {
    /// Maximum combined payload size of one logical record.
    pub max_logical_record_bytes: usize,
    /// Maximum number of physical fragments (initial record plus `CONTINUE`
    /// records) in one logical record.
    pub max_logical_record_fragments: usize,
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self {
            max_logical_record_bytes: 16 * 1024 * 1024,
            max_logical_record_fragments: 4096,
        }
    }
}

pub fn is_bof_record(record_id: u16) -> bool {
    record_id == RECORD_BOF_BIFF8 || record_id == RECORD_BOF_BIFF5
}

/// Read a single physical BIFF record at `offset`.
pub fn read_biff_record(workbook_stream: &[u8], offset: usize) -> Option<(u16, &[u8])> {
    let mut iter = BiffRecordIter::from_offset(workbook_stream, offset).ok()?;
    match iter.next()? {
        Ok(record) => Some((record.record_id, record.data)),
        Err(_) => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiffRecord<'a> {
    /// Offset of the record header in the parent stream.
    pub offset: usize,
    pub record_id: u16,
    pub data: &'a [u8],
}

/// Iterator over physical BIFF records.
///
/// This performs bounds checking on the record header and length. A truncated
/// header or payload yields an `Err` and terminates iteration.
pub struct BiffRecordIter<'a> {
    stream: &'a [u8],
    offset: usize,
}

impl<'a> BiffRecordIter<'a> {
    pub fn from_offset(stream: &'a [u8], offset: usize) -> Result<Self, String> {
        if offset > stream.len() {
            return Err(format!(
                "BIFF record offset {offset} out of bounds (len={})",
                stream.len()
            ));
        }
        Ok(Self { stream, offset })
    }
}

impl<'a> Iterator for BiffRecordIter<'a> {
    type Item = Result<BiffRecord<'a>, String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.stream.len() {
            return None;
        }

        let header_end = match self.offset.checked_add(4) {
            Some(v) => v,
            None => {
                self.offset = self.stream.len();
                return Some(Err("BIFF record offset overflow".to_string()));
            }
        };
        let header = match self.stream.get(self.offset..header_end) {
            Some(header) => header,
            None => {
                self.offset = self.stream.len();
                return Some(Err("truncated BIFF record header".to_string()));
            }
        };
        let record_id = u16::from_le_bytes([header[0], header[1]]);
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;

        let data_end = match header_end.checked_add(len) {
            Some(v) => v,
            None => {
                self.offset = self.stream.len();
                return Some(Err("BIFF record length overflow".to_string()));
            }
        };
        let data = match self.stream.get(header_end..data_end) {
            Some(data) => data,
            None => {
                let offset = self.offset;
                self.offset = self.stream.len();
                return Some(Err(format!(
                    "BIFF record 0x{record_id:04X} at offset {offset} extends past end of stream (len={}, end={data_end})",
                    self.stream.len()
                )));
            }
        };

        let offset = self.offset;
        self.offset = data_end;
        Some(Ok(BiffRecord {
            offset,
            record_id,
            data,
        }))
    }
}

/// A logical BIFF record. Some BIFF record types may be split across one or
/// more physical `CONTINUE` records; those fragments are concatenated into
/// `data`.
///
/// `fragment_sizes` stores the size of each physical fragment in `data`
/// order, allowing parsers to reason about `CONTINUE` boundaries when needed.
#[derive(Debug, Clone)]
pub struct LogicalBiffRecord<'a> {
    /// Byte offset of the physical record header in the parent stream.
    pub offset: usize,
    pub record_id: u16,
    pub data: Cow<'a, [u8]>,
    pub fragment_sizes: Vec<usize>,
}

impl<'a> LogicalBiffRecord<'a> {
    pub fn is_continued(&self) -> bool {
        self.fragment_sizes.len() > 1
    }
}

/// Iterates over BIFF records, combining `CONTINUE` fragments for record ids
/// for which `allows_continuation(record_id) == true`.
pub struct LogicalBiffRecordIter<'a> {
    iter: std::iter::Peekable<BiffRecordIter<'a>>,
    allows_continuation: fn(u16) -> bool,
    limits: RecordLimits,
    finished: bool,
}

impl<'a> LogicalBiffRecordIter<'a> {
    pub fn from_offset(
        workbook_stream: &'a [u8],
        offset: usize,
        allows_continuation: fn(u16) -> bool,
        limits: RecordLimits,
    ) -> Result<Self, String> {
        Ok(Self {
            iter: BiffRecordIter::from_offset(workbook_stream, offset)?.peekable(),
            allows_continuation,
            limits,
            finished: false,
        })
    }
}

impl<'a> Iterator for LogicalBiffRecordIter<'a> {
    type Item = Result<LogicalBiffRecord<'a>, String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let first = match self.iter.next()? {
            Ok(record) => record,
            Err(err) => {
                self.finished = true;
                return Some(Err(err));
            }
        };

        let start_offset = first.offset;
        let record_id = first.record_id;
        let data = first.data;

        // Only allocate/copy when continuation applies and a CONTINUE record
        // actually follows.
        let continued = (self.allows_continuation)(record_id)
            && matches!(self.iter.peek(), Some(Ok(next)) if next.record_id == RECORD_CONTINUE);
        if !continued {
            return Some(Ok(LogicalBiffRecord {
                offset: start_offset,
                record_id,
                data: Cow::Borrowed(data),
                fragment_sizes: vec![data.len()],
            }));
        }

        let mut fragment_sizes = vec![data.len()];
        let mut combined: Vec<u8> = data.to_vec();

        // Collect subsequent CONTINUE records into one logical payload.
        while let Some(peek) = self.iter.peek() {
            let next = match peek {
                Ok(next) => next,
                // Leave the malformed record to be surfaced on the next iteration.
                Err(_) => break,
            };
            if next.record_id != RECORD_CONTINUE {
                break;
            }

            let next = match self.iter.next() {
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(err));
                }
                None => break,
            };

            let cap_bytes = self.limits.max_logical_record_bytes;
            let new_len = combined
                .len()
                .checked_add(next.data.len())
                .unwrap_or(usize::MAX);
            if new_len > cap_bytes {
                self.finished = true;
                return Some(Err(format!(
                    "logical BIFF record 0x{record_id:04X} at offset {start_offset} exceeds max continued size ({cap_bytes} bytes)"
                )));
            }

            let cap_fragments = self.limits.max_logical_record_fragments;
            if fragment_sizes.len() >= cap_fragments {
                self.finished = true;
                return Some(Err(format!(
                    "logical BIFF record 0x{record_id:04X} at offset {start_offset} exceeds max continued fragments ({cap_fragments} fragments)"
                )));
            }

            fragment_sizes.push(next.data.len());
            combined.extend_from_slice(next.data);
        }

        Some(Ok(LogicalBiffRecord {
            offset: start_offset,
            record_id,
            data: Cow::Owned(combined),
            fragment_sizes,
        }))
    }
}
