//! BIFF record parsing for the legacy workbook binary container.
//!
//! The implementation is split into submodules so the parsing layers share
//! common primitives:
//! - [`records`]: physical record framing and `CONTINUE` reassembly
//! - [`worksheet_formulas`]: `FORMULA`/`SHRFMLA`/`ARRAY`/`TABLE` payloads
//! - [`shared_values`]: shared-formula/array/table grouping and mutation
//! - [`sheet`]: the worksheet-substream scan tying the above together

use std::io::{Read, Seek};
use std::path::Path;

use thiserror::Error;

pub mod records;
pub mod shared_values;
pub mod sheet;
pub mod worksheet_formulas;

/// Errors opening the workbook stream inside a compound file.
#[derive(Debug, Error)]
pub enum WorkbookStreamError {
    #[error("failed to read compound file: {0}")]
    Container(#[from] std::io::Error),
    #[error("missing workbook stream (expected `Workbook` or `Book`)")]
    MissingWorkbookStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiffVersion {
    Biff5,
    Biff8,
}

// BIFF version numbers stored in the BOF record payload.
const BOF_VERSION_BIFF5: u16 = 0x0500;
const BOF_VERSION_BIFF8: u16 = 0x0600;
// BOF "substream type" value consulted when the stored version is 0.
// 0x1000 corresponds to a worksheet substream.
const BOF_DT_WORKSHEET: u16 = 0x1000;

/// Read the workbook stream bytes from a compound file on disk.
pub fn read_workbook_stream_from_xls(path: &Path) -> Result<Vec<u8>, WorkbookStreamError> {
    let mut comp = cfb::open(path)?;
    let mut stream = open_workbook_stream(&mut comp)?;

    let mut workbook_stream = Vec::new();
    stream.read_to_end(&mut workbook_stream)?;
    Ok(workbook_stream)
}

/// Open the workbook stream inside an already-opened compound file.
///
/// Old producers name the stream `Book`, newer ones `Workbook`; both are
/// accepted, with and without a leading path separator.
pub fn open_workbook_stream<R: Read + Seek>(
    comp: &mut cfb::CompoundFile<R>,
) -> Result<cfb::Stream<R>, WorkbookStreamError> {
    for candidate in ["/Workbook", "/Book", "Workbook", "Book"] {
        if let Ok(stream) = comp.open_stream(candidate) {
            return Ok(stream);
        }
    }
    Err(WorkbookStreamError::MissingWorkbookStream)
}

/// Detect the BIFF version from the stream's leading `BOF` record.
///
/// Defaults to BIFF8 for missing or unrecognizable `BOF` records, matching
/// how permissive readers treat damaged streams.
pub fn detect_biff_version(workbook_stream: &[u8]) -> BiffVersion {
    let Some((record_id, data)) = records::read_biff_record(workbook_stream, 0) else {
        return BiffVersion::Biff8;
    };

    if !records::is_bof_record(record_id) {
        return BiffVersion::Biff8;
    }

    let Some(biff_version) = data.get(0..2).map(|v| u16::from_le_bytes([v[0], v[1]])) else {
        return BiffVersion::Biff8;
    };

    let dt = data
        .get(2..4)
        .map(|v| u16::from_le_bytes([v[0], v[1]]))
        .unwrap_or(0);

    match biff_version {
        BOF_VERSION_BIFF5 => BiffVersion::Biff5,
        BOF_VERSION_BIFF8 => BiffVersion::Biff8,
        0 => {
            if dt == BOF_DT_WORKSHEET {
                BiffVersion::Biff5
            } else {
                BiffVersion::Biff8
            }
        }
        _ => BiffVersion::Biff8,
    }
}
