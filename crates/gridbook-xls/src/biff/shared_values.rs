//! Shared-value bookkeeping for worksheet record-stream reconstruction.
//!
//! A worksheet substream stores shared formulas, array formulas, and data
//! tables as auxiliary records that follow the first `FORMULA` record of the
//! range they cover. The grouping is implicit in record order: follower cells
//! carry a `PtgExp` token pointing at the coordinates of the group's first
//! cell, and that first cell is whichever formula happened to be encoded
//! first, not necessarily the top-left corner of the declared range.
//!
//! [`SharedValueManager`] rebuilds those groupings while the row layer walks
//! formula cells in stream order, and keeps them consistent under mutation
//! (unsharing a group, adding/removing array regions) so the stream can be
//! re-serialized.
//!
//! All invariant violations here are fatal: they mean the input stream is
//! corrupt or the caller has desynchronized, and the current load/edit
//! operation should be aborted rather than patched up.

use std::collections::HashMap;

use gridbook_model::{CellRef, Range, LEGACY_MAX_COLS, LEGACY_MAX_ROWS};
use thiserror::Error;

use super::worksheet_formulas::{ArrayRecord, SharedFormulaRecord, TableRecord};

/// Fatal structural errors raised by the shared-value subsystem.
///
/// None of these are retryable; callers should surface them as a corrupt or
/// unsupported file.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SharedValueError {
    #[error("mismatched shared formula inputs: {definitions} definition records, {anchors} anchor cells")]
    DefinitionAnchorMismatch { definitions: usize, anchors: usize },
    #[error("shared formula anchor {anchor} lies outside its declared range {range}")]
    AnchorOutsideRange { anchor: CellRef, range: Range },
    #[error("no matching shared formula record for first cell {0}")]
    NoMatchingSharedFormula(CellRef),
    #[error("first formula cell {cell} does not match shared formula anchor {anchor}")]
    FirstCellMismatch { cell: CellRef, anchor: CellRef },
    #[error("too many formula records for shared formula group: range {range} holds {capacity} cells")]
    GroupCapacityExceeded { range: Range, capacity: usize },
    #[error("failed to find formulas for shared formula")]
    UnknownSharedFormula,
    #[error("cell {0} is not part of an array formula")]
    NotAnArrayFormula(CellRef),
}

/// Capability interface implemented by whatever owns the formula cells.
///
/// When a shared formula group is dissolved, every member cell must be told
/// to stand alone as an ordinary formula. The manager only needs this one
/// notification; it never sees the concrete cell representation.
pub trait UnlinkFormulaCells {
    fn unlink_shared_formula(&mut self, cell: CellRef);
}

/// Opaque handle to a shared-formula group inside a [`SharedValueManager`].
///
/// Handles stay stable across unrelated mutations. A handle whose group has
/// been unlinked is dangling; passing it to [`SharedValueManager::unlink`]
/// again fails rather than touching another group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedGroupHandle(usize);

/// One shared-formula range: the defining record, the anchor cell, and the
/// formula cells linked to it so far in stream order.
///
/// The anchor is the coordinate of the group's first formula cell. Sharing is
/// frequently sparse, so the member list is usually far from the
/// `width * height` upper bound of the declared range.
#[derive(Debug, Clone)]
pub struct SharedFormulaGroup {
    record: SharedFormulaRecord,
    anchor: CellRef,
    members: Vec<CellRef>,
}

impl SharedFormulaGroup {
    fn new(record: SharedFormulaRecord, anchor: CellRef) -> Result<Self, SharedValueError> {
        if !record.range.contains(anchor) {
            return Err(SharedValueError::AnchorOutsideRange {
                anchor,
                range: record.range,
            });
        }
        Ok(Self {
            record,
            anchor,
            members: Vec::new(),
        })
    }

    pub fn record(&self) -> &SharedFormulaRecord {
        &self.record
    }

    pub fn anchor(&self) -> CellRef {
        self.anchor
    }

    /// Linked member cells in insertion (stream) order.
    pub fn members(&self) -> &[CellRef] {
        &self.members
    }

    fn capacity(&self) -> usize {
        self.record.range.cell_count()
    }

    fn add(&mut self, member: CellRef) -> Result<(), SharedValueError> {
        if self.members.is_empty() && member != self.anchor {
            return Err(SharedValueError::FirstCellMismatch {
                cell: member,
                anchor: self.anchor,
            });
        }
        if self.members.len() >= self.capacity() {
            return Err(SharedValueError::GroupCapacityExceeded {
                range: self.record.range,
                capacity: self.capacity(),
            });
        }
        self.members.push(member);
        Ok(())
    }

    fn notify_unlinked(&self, cells: &mut dyn UnlinkFormulaCells) {
        for &member in &self.members {
            cells.unlink_shared_formula(member);
        }
    }
}

/// Auxiliary record that must be emitted immediately after the first formula
/// cell of its group or region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstCellRecord<'a> {
    Shared(&'a SharedFormulaRecord),
    Table(&'a TableRecord),
    Array(&'a ArrayRecord),
}

/// Packed coordinate key for the anchor-lookup cache.
///
/// Rows occupy the low 16 bits and the column plus one the next 8, so
/// distinct in-bounds coordinates never collide and the key for column 0 is
/// never zero.
fn packed_anchor_key(cell: CellRef) -> u32 {
    debug_assert!(cell.row < LEGACY_MAX_ROWS && cell.col < LEGACY_MAX_COLS);
    (cell.col + 1) << 16 | cell.row
}

fn ranges_overlap(a: Range, b: Range) -> bool {
    a.start.row <= b.end.row
        && b.start.row <= a.end.row
        && a.start.col <= b.end.col
        && b.start.col <= a.end.col
}

/// Tracks the shared formulas, array formulas, and data tables of one
/// worksheet while its record stream is reconstructed or mutated.
///
/// Groups are stored in an arena indexed by [`SharedGroupHandle`]; the
/// anchor-coordinate index over them is built lazily on first lookup and
/// discarded whenever a group is removed, since lookup runs once per formula
/// cell but removal is rare.
///
/// Not synchronized: one manager belongs to one worksheet being processed on
/// one thread.
#[derive(Debug, Clone, Default)]
pub struct SharedValueManager {
    groups: Vec<Option<SharedFormulaGroup>>,
    /// Lazy index over `groups`, keyed by packed anchor coordinates. `None`
    /// means "rebuild on next lookup"; every mutation that changes anchors
    /// must reset it.
    anchor_cache: Option<HashMap<u32, SharedGroupHandle>>,
    array_records: Vec<ArrayRecord>,
    table_records: Vec<TableRecord>,
}

impl SharedValueManager {
    /// A manager with no shared values.
    ///
    /// Each call returns an independent value; mutating one empty manager
    /// never affects another.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a manager from the definitions discovered during the worksheet
    /// scan.
    ///
    /// `definitions` and `anchors` are parallel: `anchors[i]` is the
    /// coordinate of the first formula cell observed referencing
    /// `definitions[i]`. Each anchor must lie inside its definition's
    /// declared range.
    pub fn create(
        definitions: Vec<SharedFormulaRecord>,
        anchors: Vec<CellRef>,
        array_records: Vec<ArrayRecord>,
        table_records: Vec<TableRecord>,
    ) -> Result<Self, SharedValueError> {
        if definitions.len() != anchors.len() {
            return Err(SharedValueError::DefinitionAnchorMismatch {
                definitions: definitions.len(),
                anchors: anchors.len(),
            });
        }
        let mut groups = Vec::with_capacity(definitions.len());
        for (record, anchor) in definitions.into_iter().zip(anchors) {
            groups.push(Some(SharedFormulaGroup::new(record, anchor)?));
        }
        Ok(Self {
            groups,
            anchor_cache: None,
            array_records,
            table_records,
        })
    }

    fn anchor_cache(&mut self) -> &HashMap<u32, SharedGroupHandle> {
        let groups = &self.groups;
        self.anchor_cache.get_or_insert_with(|| {
            let mut cache = HashMap::new();
            for (idx, group) in groups.iter().enumerate() {
                if let Some(group) = group {
                    cache.insert(packed_anchor_key(group.anchor), SharedGroupHandle(idx));
                }
            }
            cache
        })
    }

    /// Look up the group whose anchor is exactly `cell`.
    pub fn find_group_for_cell(&mut self, cell: CellRef) -> Option<SharedGroupHandle> {
        self.anchor_cache().get(&packed_anchor_key(cell)).copied()
    }

    /// Borrow a group by handle. Returns `None` for dangling handles.
    pub fn group(&self, handle: SharedGroupHandle) -> Option<&SharedFormulaGroup> {
        self.groups.get(handle.0).and_then(|slot| slot.as_ref())
    }

    /// Live groups in registration order, with their handles.
    pub fn groups(&self) -> impl Iterator<Item = (SharedGroupHandle, &SharedFormulaGroup)> {
        self.groups
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|group| (SharedGroupHandle(idx), group)))
    }

    /// Link `formula_cell` into the group anchored at `first_cell` and return
    /// the group's defining record so the caller can resolve the formula
    /// body.
    ///
    /// The stream is corrupt if no group is anchored at `first_cell`, if the
    /// first linked member is not the anchor itself, or if the declared range
    /// cannot hold another member. Linking the same cell twice double-counts
    /// and will eventually trip the capacity check; that is a caller error.
    pub fn link_shared_formula_record(
        &mut self,
        first_cell: CellRef,
        formula_cell: CellRef,
    ) -> Result<&SharedFormulaRecord, SharedValueError> {
        let handle = self
            .find_group_for_cell(first_cell)
            .ok_or(SharedValueError::NoMatchingSharedFormula(first_cell))?;
        let group = self
            .groups
            .get_mut(handle.0)
            .and_then(|slot| slot.as_mut())
            .ok_or(SharedValueError::NoMatchingSharedFormula(first_cell))?;
        group.add(formula_cell)?;
        Ok(group.record())
    }

    /// Decide whether an auxiliary record must be emitted immediately after
    /// the formula record at `formula_cell`.
    ///
    /// `first_cell_token` is the cell's decoded reference-to-first-cell token
    /// (see [`parse_ptg_exp`](super::worksheet_formulas::parse_ptg_exp)).
    /// Cells without one participate in no group. A cell whose token points
    /// elsewhere is a follower; its auxiliary record belongs next to the
    /// actual first cell.
    ///
    /// Tables are consulted before arrays when both start at the same
    /// coordinate, matching the emission order of the original streams.
    pub fn get_record_for_first_cell(
        &mut self,
        formula_cell: CellRef,
        first_cell_token: Option<CellRef>,
    ) -> Option<FirstCellRecord<'_>> {
        let first_cell = first_cell_token?;
        if first_cell != formula_cell {
            return None;
        }
        if let Some(handle) = self.find_group_for_cell(first_cell) {
            if let Some(group) = self.group(handle) {
                return Some(FirstCellRecord::Shared(group.record()));
            }
        }
        if let Some(table) = self
            .table_records
            .iter()
            .find(|table| table.range.start == first_cell)
        {
            return Some(FirstCellRecord::Table(table));
        }
        if let Some(array) = self
            .array_records
            .iter()
            .find(|array| array.range.start == first_cell)
        {
            return Some(FirstCellRecord::Array(array));
        }
        None
    }

    /// Dissolve the group behind `handle`: every linked member is told to
    /// become an independent formula and all bookkeeping for the definition
    /// is dropped. The member cells themselves remain.
    pub fn unlink(
        &mut self,
        handle: SharedGroupHandle,
        cells: &mut dyn UnlinkFormulaCells,
    ) -> Result<(), SharedValueError> {
        let group = self
            .groups
            .get_mut(handle.0)
            .and_then(|slot| slot.take())
            .ok_or(SharedValueError::UnknownSharedFormula)?;
        self.anchor_cache = None;
        group.notify_unlinked(cells);
        Ok(())
    }

    /// Register a new array-formula region.
    ///
    /// Overlap with existing regions is not validated; callers keep regions
    /// disjoint. Debug builds assert disjointness so unexpected overlap
    /// surfaces during testing.
    pub fn add_array_record(&mut self, record: ArrayRecord) {
        debug_assert!(
            self.array_records
                .iter()
                .all(|existing| !ranges_overlap(existing.range, record.range)),
            "overlapping array formula regions: {} and {}",
            self.array_records
                .iter()
                .find(|existing| ranges_overlap(existing.range, record.range))
                .map(|existing| existing.range.to_string())
                .unwrap_or_default(),
            record.range,
        );
        self.array_records.push(record);
    }

    /// Remove the array region containing `cell` and return its range.
    ///
    /// The cells inside the removed range are intentionally untouched; the
    /// caller owns the cell grid and is responsible for blanking them.
    pub fn remove_array_formula(&mut self, cell: CellRef) -> Result<Range, SharedValueError> {
        let idx = self
            .array_records
            .iter()
            .position(|record| record.range.contains(cell))
            .ok_or(SharedValueError::NotAnArrayFormula(cell))?;
        Ok(self.array_records.remove(idx).range)
    }

    /// Look up the array region whose top-left corner is exactly
    /// `first_cell`. This is a lookup, not an assertion; absence is a normal
    /// answer.
    pub fn get_array_record(&self, first_cell: CellRef) -> Option<&ArrayRecord> {
        self.array_records
            .iter()
            .find(|record| record.range.start == first_cell)
    }

    pub fn array_records(&self) -> &[ArrayRecord] {
        &self.array_records
    }

    pub fn table_records(&self) -> &[TableRecord] {
        &self.table_records
    }
}
