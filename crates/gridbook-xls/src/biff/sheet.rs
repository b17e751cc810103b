//! Worksheet-substream scan that rebuilds shared-value bookkeeping.
//!
//! The substream is a flat run of loosely-typed records with no explicit
//! grouping. One pass collects the `FORMULA` cells and the
//! `SHRFMLA`/`ARRAY`/`TABLE` definitions in stream order; the anchor of each
//! shared definition is then recovered from the first formula cell whose
//! `PtgExp` token points at its own coordinates, and every shared formula
//! cell is linked into its group through the [`SharedValueManager`].
//!
//! Unparseable individual records are skipped with a bounded warning (badly
//! written producers are common); inconsistencies in the recovered grouping
//! itself are fatal and abort the scan.

use gridbook_model::CellRef;
use thiserror::Error;

use super::records::{self, RecordLimits};
use super::shared_values::{SharedValueError, SharedValueManager};
use super::worksheet_formulas::{
    self, ArrayRecord, FormulaCellRecord, SharedFormulaRecord, TableRecord, RECORD_ARRAY,
    RECORD_FORMULA, RECORD_SHRFMLA, RECORD_TABLE,
};

/// Cap warnings collected per sheet so a crafted stream cannot allocate an
/// unbounded number of warning strings.
const MAX_WARNINGS_PER_SHEET: usize = 50;
const WARNINGS_SUPPRESSED_MESSAGE: &str = "additional warnings suppressed";

fn push_warning_bounded(warnings: &mut Vec<String>, warning: impl Into<String>) {
    if warnings.len() < MAX_WARNINGS_PER_SHEET {
        let warning = warning.into();
        log::warn!("worksheet scan: {warning}");
        warnings.push(warning);
        return;
    }
    // Add a single terminal warning so callers have a hint that the scan was noisy.
    if warnings.len() == MAX_WARNINGS_PER_SHEET {
        warnings.push(WARNINGS_SUPPRESSED_MESSAGE.to_string());
    }
}

#[derive(Debug, Error)]
pub enum SheetScanError {
    #[error("malformed worksheet stream: {0}")]
    Stream(String),
    #[error(transparent)]
    SharedValues(#[from] SharedValueError),
}

/// Result of scanning one worksheet substream.
#[derive(Debug, Default)]
pub struct SheetSharedValues {
    pub manager: SharedValueManager,
    /// `FORMULA` cells in stream order.
    pub formula_cells: Vec<FormulaCellRecord>,
    /// Non-fatal issues encountered while scanning.
    pub warnings: Vec<String>,
}

/// Scan the worksheet substream starting at `start` and reconstruct its
/// shared-value state.
///
/// The scan stops at the substream's `EOF` record, or at the next `BOF` when
/// a truncated stream omits the `EOF`.
pub fn parse_sheet_shared_values(
    workbook_stream: &[u8],
    start: usize,
    limits: RecordLimits,
) -> Result<SheetSharedValues, SheetScanError> {
    let mut formula_cells: Vec<FormulaCellRecord> = Vec::new();
    let mut shared_defs: Vec<SharedFormulaRecord> = Vec::new();
    let mut array_records: Vec<ArrayRecord> = Vec::new();
    let mut table_records: Vec<TableRecord> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    // SHRFMLA/ARRAY/FORMULA payloads can be large and split across CONTINUE
    // records; reassemble before parsing.
    let allows_continuation = |id: u16| {
        id == RECORD_FORMULA || id == RECORD_SHRFMLA || id == RECORD_ARRAY || id == RECORD_TABLE
    };
    let iter =
        records::LogicalBiffRecordIter::from_offset(workbook_stream, start, allows_continuation, limits)
            .map_err(SheetScanError::Stream)?;

    for record in iter {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                push_warning_bounded(&mut warnings, format!("malformed BIFF record: {err}"));
                break;
            }
        };

        if record.offset != start && records::is_bof_record(record.record_id) {
            break;
        }
        if record.record_id == records::RECORD_EOF {
            break;
        }

        match record.record_id {
            RECORD_FORMULA => match worksheet_formulas::parse_formula_record(&record) {
                Ok(parsed) => formula_cells.push(parsed),
                Err(err) => push_warning_bounded(
                    &mut warnings,
                    format!("failed to parse FORMULA record at offset {}: {err}", record.offset),
                ),
            },
            RECORD_SHRFMLA => match worksheet_formulas::parse_shrfmla_record(&record) {
                Ok(parsed) => shared_defs.push(parsed),
                Err(err) => push_warning_bounded(
                    &mut warnings,
                    format!("failed to parse SHRFMLA record at offset {}: {err}", record.offset),
                ),
            },
            RECORD_ARRAY => match worksheet_formulas::parse_array_record(&record) {
                Ok(parsed) => array_records.push(parsed),
                Err(err) => push_warning_bounded(
                    &mut warnings,
                    format!("failed to parse ARRAY record at offset {}: {err}", record.offset),
                ),
            },
            RECORD_TABLE => match worksheet_formulas::parse_table_record(&record) {
                Ok(parsed) => table_records.push(parsed),
                Err(err) => push_warning_bounded(
                    &mut warnings,
                    format!("failed to parse TABLE record at offset {}: {err}", record.offset),
                ),
            },
            _ => {}
        }
    }

    // Recover each shared definition's anchor: the first formula cell in
    // stream order whose PtgExp token points at its own coordinates claims
    // the first unanchored definition covering it. The anchor is whichever
    // cell was encoded first, not necessarily the range's top-left corner.
    let mut anchors: Vec<Option<CellRef>> = vec![None; shared_defs.len()];
    for cell in &formula_cells {
        if !cell.flags.is_shared() {
            continue;
        }
        let Some(token) = worksheet_formulas::parse_ptg_exp(&cell.rgce) else {
            continue;
        };
        if token != cell.cell {
            continue;
        }
        let claimed = shared_defs
            .iter()
            .zip(anchors.iter())
            .position(|(def, anchor)| anchor.is_none() && def.range.contains(token));
        if let Some(idx) = claimed {
            anchors[idx] = Some(token);
        }
    }

    // Definitions that no formula cell references cannot be anchored; drop
    // them with a warning rather than inventing an anchor.
    let mut anchored_defs = Vec::with_capacity(shared_defs.len());
    let mut anchored_anchors = Vec::with_capacity(shared_defs.len());
    for (def, anchor) in shared_defs.into_iter().zip(anchors) {
        match anchor {
            Some(anchor) => {
                anchored_defs.push(def);
                anchored_anchors.push(anchor);
            }
            None => push_warning_bounded(
                &mut warnings,
                format!("shared formula definition {} has no referencing formula cell", def.range),
            ),
        }
    }

    let mut manager =
        SharedValueManager::create(anchored_defs, anchored_anchors, array_records, table_records)?;

    // Link every shared formula cell into its group, in stream order. A
    // dangling reference here means the stream declared sharing it never
    // defined; that is fatal.
    for cell in &formula_cells {
        if !cell.flags.is_shared() {
            continue;
        }
        let Some(token) = worksheet_formulas::parse_ptg_exp(&cell.rgce) else {
            continue;
        };
        manager.link_shared_formula_record(token, cell.cell)?;
    }

    Ok(SheetSharedValues {
        manager,
        formula_cells,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridbook_model::Range;
    use pretty_assertions::assert_eq;

    fn record(id: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn ptg_exp(row: u16, col: u16) -> Vec<u8> {
        let mut out = vec![0x01];
        out.extend_from_slice(&row.to_le_bytes());
        out.extend_from_slice(&col.to_le_bytes());
        out
    }

    fn formula(row: u16, col: u16, grbit: u16, rgce: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&row.to_le_bytes());
        payload.extend_from_slice(&col.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&[0u8; 8]);
        payload.extend_from_slice(&grbit.to_le_bytes());
        payload.extend_from_slice(&[0u8; 4]);
        payload.extend_from_slice(&(rgce.len() as u16).to_le_bytes());
        payload.extend_from_slice(rgce);
        record(RECORD_FORMULA, &payload)
    }

    fn shrfmla(rows: (u16, u16), cols: (u8, u8), rgce: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&rows.0.to_le_bytes());
        payload.extend_from_slice(&rows.1.to_le_bytes());
        payload.push(cols.0);
        payload.push(cols.1);
        payload.extend_from_slice(&[0x00, 0x02]);
        payload.extend_from_slice(&(rgce.len() as u16).to_le_bytes());
        payload.extend_from_slice(rgce);
        record(RECORD_SHRFMLA, &payload)
    }

    fn eof() -> Vec<u8> {
        record(records::RECORD_EOF, &[])
    }

    const F_SHR: u16 = worksheet_formulas::FormulaFlags::F_SHR_FMLA;
    const SHARED_RGCE: [u8; 3] = [0x1E, 0x07, 0x00];

    #[test]
    fn reconstructs_a_shared_group_with_a_non_top_left_anchor() {
        // The first formula of the group lives at B2, one row below the
        // declared range's top-left corner B1.
        let stream = [
            formula(1, 1, F_SHR, &ptg_exp(1, 1)),
            shrfmla((0, 2), (1, 1), &SHARED_RGCE),
            formula(0, 1, F_SHR, &ptg_exp(1, 1)),
            formula(2, 1, F_SHR, &ptg_exp(1, 1)),
            eof(),
        ]
        .concat();

        let mut out = parse_sheet_shared_values(&stream, 0, RecordLimits::default()).unwrap();
        assert_eq!(out.warnings, Vec::<String>::new());
        assert_eq!(out.formula_cells.len(), 3);

        let anchor = CellRef::new(1, 1);
        let handle = out.manager.find_group_for_cell(anchor).unwrap();
        let group = out.manager.group(handle).unwrap();
        assert_eq!(group.anchor(), anchor);
        assert_eq!(group.record().range, Range::from_a1("B1:B3").unwrap());
        assert_eq!(
            group.members(),
            &[CellRef::new(1, 1), CellRef::new(0, 1), CellRef::new(2, 1)]
        );

        // Only the anchor gets the auxiliary record; the top-left cell does not.
        assert!(out
            .manager
            .get_record_for_first_cell(anchor, Some(anchor))
            .is_some());
        let top_left = CellRef::new(0, 1);
        assert_eq!(
            out.manager.get_record_for_first_cell(top_left, Some(anchor)),
            None
        );
    }

    #[test]
    fn drops_definitions_nothing_references() {
        let stream = [shrfmla((0, 2), (1, 1), &SHARED_RGCE), eof()].concat();

        let mut out = parse_sheet_shared_values(&stream, 0, RecordLimits::default()).unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("no referencing formula cell"));
        assert_eq!(out.manager.find_group_for_cell(CellRef::new(0, 1)), None);
    }

    #[test]
    fn dangling_shared_reference_is_fatal() {
        // A formula claims shared membership at D4 but no SHRFMLA covers D4.
        let stream = [formula(3, 3, F_SHR, &ptg_exp(3, 3)), eof()].concat();

        let err = parse_sheet_shared_values(&stream, 0, RecordLimits::default()).unwrap_err();
        match err {
            SheetScanError::SharedValues(SharedValueError::NoMatchingSharedFormula(cell)) => {
                assert_eq!(cell, CellRef::new(3, 3));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn skips_malformed_records_with_bounded_warnings() {
        // SHRFMLA with an empty rgce is unparseable and skipped; the rest of
        // the stream still parses.
        let stream = [
            shrfmla((0, 2), (1, 1), &[]),
            formula(5, 0, 0, &[0x1E, 0x2A, 0x00]),
            eof(),
        ]
        .concat();

        let out = parse_sheet_shared_values(&stream, 0, RecordLimits::default()).unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("SHRFMLA"), "warnings={:?}", out.warnings);
        assert_eq!(out.formula_cells.len(), 1);
    }

    #[test]
    fn stops_at_next_bof_when_eof_is_missing() {
        let stream = [
            formula(0, 0, 0, &[0x1E, 0x2A, 0x00]),
            record(records::RECORD_BOF_BIFF8, &[0u8; 16]),
            formula(9, 9, 0, &[0x1E, 0x2A, 0x00]),
        ]
        .concat();

        let out = parse_sheet_shared_values(&stream, 0, RecordLimits::default()).unwrap();
        assert_eq!(out.formula_cells.len(), 1);
        assert_eq!(out.formula_cells[0].cell, CellRef::new(0, 0));
    }
}
