//! Legacy Excel 97-2003 `.xls` (BIFF) record-stream reading.
//!
//! This crate covers the record layer of the workbook binary container: the
//! `[id][len][payload]` framing (including `CONTINUE` reassembly), the
//! worksheet formula records, and the reconstruction of shared-value groups
//! (shared formulas, array formulas, and data tables) whose membership is
//! implicit in record order.
//!
//! It is intentionally not a full importer: cell values, strings, styles, and
//! the user-facing workbook model live in the layers above. What this crate
//! guarantees is that the grouping state it hands back can be mutated
//! (unshared, array regions added/removed) without losing the information
//! needed to re-serialize a coherent stream.

pub mod biff;

pub use biff::records::RecordLimits;
pub use biff::shared_values::{
    FirstCellRecord, SharedFormulaGroup, SharedGroupHandle, SharedValueError, SharedValueManager,
    UnlinkFormulaCells,
};
pub use biff::sheet::{parse_sheet_shared_values, SheetScanError, SheetSharedValues};
pub use biff::worksheet_formulas::{
    parse_ptg_exp, ArrayRecord, FormulaCellRecord, FormulaFlags, SharedFormulaRecord, TableRecord,
};
pub use biff::{
    detect_biff_version, open_workbook_stream, read_workbook_stream_from_xls, BiffVersion,
    WorkbookStreamError,
};
