//! BIFF8 worksheet formula record parsing.
//!
//! Worksheet formulas are stored as `FORMULA` records, one per cell. Cells
//! covered by a shared formula, an array formula, or a data table carry only
//! a stub token stream; the real definition lives in an auxiliary `SHRFMLA`,
//! `ARRAY`, or `TABLE` record emitted immediately after the first formula
//! cell of the covered range. This module decodes those four record payloads
//! and the `PtgExp` "reference to first cell" token that ties follower cells
//! to their definition.
//!
//! The formula token stream (`rgce`) itself is treated as opaque bytes here;
//! only the leading `PtgExp` token is inspected.

use gridbook_model::{CellRef, Range, LEGACY_MAX_COLS, LEGACY_MAX_ROWS};

use super::records;

// Worksheet record ids (BIFF8).
// See [MS-XLS]:
// - FORMULA: 2.4.127 (0x0006)
// - ARRAY: 2.4.19 (0x0221)
// - SHRFMLA: 2.4.276 (0x04BC)
// - TABLE: 2.4.328 (0x0236)
pub const RECORD_FORMULA: u16 = 0x0006;
pub const RECORD_ARRAY: u16 = 0x0221;
pub const RECORD_SHRFMLA: u16 = 0x04BC;
pub const RECORD_TABLE: u16 = 0x0236;

/// BIFF8 `FORMULA.grbit` bitfield.
///
/// Only the bits that mark membership in a shared-value group are decoded:
/// - `0x0008` (`fShrFmla`): part of a shared formula group (expects `SHRFMLA` + `PtgExp`)
/// - `0x0010` (`fArray`): part of an array formula (expects `ARRAY` + `PtgExp`)
/// - `0x0020` (`fTbl`): part of a data table (expects `TABLE` + `PtgTbl`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormulaFlags(pub u16);

impl FormulaFlags {
    pub const F_SHR_FMLA: u16 = 0x0008;
    pub const F_ARRAY: u16 = 0x0010;
    pub const F_TBL: u16 = 0x0020;

    pub fn is_shared(self) -> bool {
        (self.0 & Self::F_SHR_FMLA) != 0
    }

    pub fn is_array(self) -> bool {
        (self.0 & Self::F_ARRAY) != 0
    }

    pub fn is_table(self) -> bool {
        (self.0 & Self::F_TBL) != 0
    }
}

/// One parsed `FORMULA` cell record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaCellRecord {
    pub cell: CellRef,
    /// Cell format index.
    pub xf: u16,
    pub flags: FormulaFlags,
    /// Raw formula token stream.
    pub rgce: Vec<u8>,
}

/// One parsed `SHRFMLA` record: the defining record of a shared formula group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFormulaRecord {
    /// Declared range the shared formula applies to.
    pub range: Range,
    /// Shared formula token stream, relative references unresolved.
    pub rgce: Vec<u8>,
}

/// One parsed `ARRAY` record: the defining record of an array formula region.
///
/// Array regions are dense: every cell in `range` participates, and the
/// top-left cell is always the region's first cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayRecord {
    pub range: Range,
    pub flags: u16,
    /// Array formula token stream.
    pub rgce: Vec<u8>,
}

/// One parsed `TABLE` record: the defining record of a what-if data table.
///
/// Same density and first-cell convention as [`ArrayRecord`]. The input-cell
/// coordinates are kept raw because producers store `0xFFFF` markers in the
/// unused pair of a one-input table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRecord {
    pub range: Range,
    pub flags: u16,
    /// Row-input cell as raw (row, col).
    pub row_input: (u16, u16),
    /// Column-input cell as raw (row, col).
    pub col_input: (u16, u16),
}

/// Decode the `PtgExp` token from the head of a formula token stream.
///
/// BIFF8 `PtgExp`: `[0x01][rw: u16][col: u16]`, pointing at the cell whose
/// formula record defined the group this cell belongs to. Returns `None` when
/// the stream does not start with `PtgExp` or the coordinates exceed the
/// legacy sheet bounds.
pub fn parse_ptg_exp(rgce: &[u8]) -> Option<CellRef> {
    if rgce.first().copied()? != 0x01 {
        return None;
    }
    let chunk = rgce.get(1..5)?;
    let row = u16::from_le_bytes([chunk[0], chunk[1]]);
    let col = u16::from_le_bytes([chunk[2], chunk[3]]);
    cell_ref_from_u16(row, col)
}

pub(crate) fn cell_ref_from_u16(row: u16, col: u16) -> Option<CellRef> {
    let row = row as u32;
    let col = col as u32;
    if row >= LEGACY_MAX_ROWS || col >= LEGACY_MAX_COLS {
        return None;
    }
    Some(CellRef::new(row, col))
}

// `Ref8` columns can carry flags in their high bits; mask down to the 14-bit payload.
const REF8_COL_MASK: u16 = 0x3FFF;

struct PayloadCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u16_le(&mut self) -> Result<u16, String> {
        let chunk = self
            .data
            .get(self.pos..self.pos + 2)
            .ok_or_else(|| format!("record payload truncated at offset {}", self.pos))?;
        self.pos += 2;
        Ok(u16::from_le_bytes([chunk[0], chunk[1]]))
    }

    fn skip(&mut self, n: usize) -> Result<(), String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| format!("record payload truncated at offset {}", self.pos))?;
        self.pos = end;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| format!("record payload truncated at offset {}", self.pos))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }
}

/// Range header shapes seen in the wild for `SHRFMLA`/`ARRAY`/`TABLE`.
///
/// `RefU` (6 bytes) stores u8 columns; `Ref8` (8 bytes) stores u16 columns
/// with flag bits in the high positions. Producers disagree on which one a
/// given record uses, so parsers try `RefU` first and fall back to `Ref8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeHeader {
    RefU,
    Ref8,
}

fn read_range_header(cursor: &mut PayloadCursor<'_>, shape: RangeHeader) -> Result<Range, String> {
    let row_first = cursor.read_u16_le()?;
    let row_last = cursor.read_u16_le()?;
    let (col_first, col_last) = match shape {
        RangeHeader::RefU => {
            let chunk = cursor.take(2)?;
            (chunk[0] as u16, chunk[1] as u16)
        }
        RangeHeader::Ref8 => (
            cursor.read_u16_le()? & REF8_COL_MASK,
            cursor.read_u16_le()? & REF8_COL_MASK,
        ),
    };
    if row_first > row_last || col_first > col_last {
        return Err(format!(
            "inverted range header ({row_first}..{row_last}, {col_first}..{col_last})"
        ));
    }
    let start = cell_ref_from_u16(row_first, col_first)
        .ok_or_else(|| format!("range start ({row_first},{col_first}) out of sheet bounds"))?;
    let end = cell_ref_from_u16(row_last, col_last)
        .ok_or_else(|| format!("range end ({row_last},{col_last}) out of sheet bounds"))?;
    Ok(Range::new(start, end))
}

/// Parse a `FORMULA` record payload.
///
/// Layout: `[rw:u16][col:u16][ixfe:u16][cached result:8][grbit:u16][chn:u32][cce:u16][rgce]`.
pub fn parse_formula_record(record: &records::LogicalBiffRecord<'_>) -> Result<FormulaCellRecord, String> {
    let mut cursor = PayloadCursor::new(record.data.as_ref());

    let row = cursor.read_u16_le()?;
    let col = cursor.read_u16_le()?;
    let xf = cursor.read_u16_le()?;

    // Skip the cached result (8), read grbit (2), skip the calc chain field (4).
    cursor.skip(8)?;
    let flags = FormulaFlags(cursor.read_u16_le()?);
    cursor.skip(4)?;

    let cce = cursor.read_u16_le()? as usize;
    let rgce = cursor.take(cce)?.to_vec();

    let cell = cell_ref_from_u16(row, col)
        .ok_or_else(|| format!("formula cell ({row},{col}) out of sheet bounds"))?;

    Ok(FormulaCellRecord {
        cell,
        xf,
        flags,
        rgce,
    })
}

/// Parse a `SHRFMLA` record payload.
///
/// Layout: range header + `[cUse:u16][cce:u16][rgce]`. Trailing bytes are
/// ignored. Both `RefU` and `Ref8` range headers are accepted; the header
/// whose embedded `cce` is coherent with the payload length wins.
pub fn parse_shrfmla_record(record: &records::LogicalBiffRecord<'_>) -> Result<SharedFormulaRecord, String> {
    let data = record.data.as_ref();
    for shape in [RangeHeader::RefU, RangeHeader::Ref8] {
        let mut cursor = PayloadCursor::new(data);
        let Ok(range) = read_range_header(&mut cursor, shape) else {
            continue;
        };
        // cUse (reserved byte + use count).
        if cursor.skip(2).is_err() {
            continue;
        }
        let Ok(cce) = cursor.read_u16_le() else {
            continue;
        };
        let Ok(rgce) = cursor.take(cce as usize) else {
            continue;
        };
        if rgce.is_empty() {
            continue;
        }
        return Ok(SharedFormulaRecord {
            range,
            rgce: rgce.to_vec(),
        });
    }
    Err("unrecognized SHRFMLA record layout".to_string())
}

/// Parse an `ARRAY` record payload.
///
/// Layout: range header + `[flags:u16][chn:u32][cce:u16][rgce]`.
pub fn parse_array_record(record: &records::LogicalBiffRecord<'_>) -> Result<ArrayRecord, String> {
    let data = record.data.as_ref();
    for shape in [RangeHeader::RefU, RangeHeader::Ref8] {
        let mut cursor = PayloadCursor::new(data);
        let Ok(range) = read_range_header(&mut cursor, shape) else {
            continue;
        };
        let Ok(flags) = cursor.read_u16_le() else {
            continue;
        };
        if cursor.skip(4).is_err() {
            continue;
        }
        let Ok(cce) = cursor.read_u16_le() else {
            continue;
        };
        let Ok(rgce) = cursor.take(cce as usize) else {
            continue;
        };
        if rgce.is_empty() {
            continue;
        }
        return Ok(ArrayRecord {
            range,
            flags,
            rgce: rgce.to_vec(),
        });
    }
    Err("unrecognized ARRAY record layout".to_string())
}

/// Parse a `TABLE` record payload.
///
/// Layout: range header + `[grbit:u16][rwInpRw:u16][colInpRw:u16][rwInpCol:u16][colInpCol:u16]`.
pub fn parse_table_record(record: &records::LogicalBiffRecord<'_>) -> Result<TableRecord, String> {
    let data = record.data.as_ref();
    for shape in [RangeHeader::RefU, RangeHeader::Ref8] {
        let mut cursor = PayloadCursor::new(data);
        let Ok(range) = read_range_header(&mut cursor, shape) else {
            continue;
        };
        let Ok(flags) = cursor.read_u16_le() else {
            continue;
        };
        let Ok(rw_inp_rw) = cursor.read_u16_le() else {
            continue;
        };
        let Ok(col_inp_rw) = cursor.read_u16_le() else {
            continue;
        };
        let Ok(rw_inp_col) = cursor.read_u16_le() else {
            continue;
        };
        let Ok(col_inp_col) = cursor.read_u16_le() else {
            continue;
        };
        return Ok(TableRecord {
            range,
            flags,
            row_input: (rw_inp_rw, col_inp_rw),
            col_input: (rw_inp_col, col_inp_col),
        });
    }
    Err("unrecognized TABLE record layout".to_string())
}
