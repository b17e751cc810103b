#![allow(dead_code)]

//! Byte-level builders for synthetic workbook streams.
//!
//! The goal is not to be a complete `.xls` writer; it's just enough BIFF8 +
//! CFB to exercise the record layer with targeted worksheet payloads.

use std::io::{Cursor, Write};

use gridbook_xls::biff::records::{RECORD_BOF_BIFF8, RECORD_EOF};
use gridbook_xls::biff::worksheet_formulas::{
    RECORD_ARRAY, RECORD_FORMULA, RECORD_SHRFMLA, RECORD_TABLE,
};

const BOF_VERSION_BIFF8: u16 = 0x0600;
const BOF_DT_GLOBALS: u16 = 0x0005;
const BOF_DT_WORKSHEET: u16 = 0x0010;

pub fn record(id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn bof(dt: u16) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&BOF_VERSION_BIFF8.to_le_bytes());
    payload.extend_from_slice(&dt.to_le_bytes());
    payload.extend_from_slice(&[0u8; 12]);
    record(RECORD_BOF_BIFF8, &payload)
}

pub fn bof_globals() -> Vec<u8> {
    bof(BOF_DT_GLOBALS)
}

pub fn bof_worksheet() -> Vec<u8> {
    bof(BOF_DT_WORKSHEET)
}

pub fn eof() -> Vec<u8> {
    record(RECORD_EOF, &[])
}

/// A `PtgExp` token stream pointing at the group's first cell.
pub fn ptg_exp(row: u16, col: u16) -> Vec<u8> {
    let mut out = vec![0x01];
    out.extend_from_slice(&row.to_le_bytes());
    out.extend_from_slice(&col.to_le_bytes());
    out
}

/// A `PtgInt` token stream; stands in for an ordinary formula body.
pub fn ptg_int(value: u16) -> Vec<u8> {
    let mut out = vec![0x1E];
    out.extend_from_slice(&value.to_le_bytes());
    out
}

pub fn formula_record(row: u16, col: u16, grbit: u16, rgce: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&row.to_le_bytes());
    payload.extend_from_slice(&col.to_le_bytes());
    payload.extend_from_slice(&0u16.to_le_bytes()); // ixfe
    payload.extend_from_slice(&[0u8; 8]); // cached result
    payload.extend_from_slice(&grbit.to_le_bytes());
    payload.extend_from_slice(&[0u8; 4]); // chn
    payload.extend_from_slice(&(rgce.len() as u16).to_le_bytes());
    payload.extend_from_slice(rgce);
    record(RECORD_FORMULA, &payload)
}

fn refu_header(rows: (u16, u16), cols: (u8, u8)) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&rows.0.to_le_bytes());
    out.extend_from_slice(&rows.1.to_le_bytes());
    out.push(cols.0);
    out.push(cols.1);
    out
}

pub fn shrfmla_record(rows: (u16, u16), cols: (u8, u8), rgce: &[u8]) -> Vec<u8> {
    let mut payload = refu_header(rows, cols);
    payload.extend_from_slice(&[0x00, 0x02]); // reserved + cUse
    payload.extend_from_slice(&(rgce.len() as u16).to_le_bytes());
    payload.extend_from_slice(rgce);
    record(RECORD_SHRFMLA, &payload)
}

pub fn array_record(rows: (u16, u16), cols: (u8, u8), rgce: &[u8]) -> Vec<u8> {
    let mut payload = refu_header(rows, cols);
    payload.extend_from_slice(&0u16.to_le_bytes()); // flags
    payload.extend_from_slice(&[0u8; 4]); // chn
    payload.extend_from_slice(&(rgce.len() as u16).to_le_bytes());
    payload.extend_from_slice(rgce);
    record(RECORD_ARRAY, &payload)
}

pub fn table_record(rows: (u16, u16), cols: (u8, u8), row_input: (u16, u16)) -> Vec<u8> {
    let mut payload = refu_header(rows, cols);
    payload.extend_from_slice(&0x0001u16.to_le_bytes()); // grbit: fAlwaysCalc
    payload.extend_from_slice(&row_input.0.to_le_bytes());
    payload.extend_from_slice(&row_input.1.to_le_bytes());
    payload.extend_from_slice(&0xFFFFu16.to_le_bytes()); // rwInpCol (unused)
    payload.extend_from_slice(&0xFFFFu16.to_le_bytes()); // colInpCol (unused)
    record(RECORD_TABLE, &payload)
}

/// Concatenate workbook globals and one worksheet substream into a workbook
/// stream, returning the stream bytes and the worksheet substream's offset.
pub fn build_workbook_stream(sheet_records: &[Vec<u8>]) -> (Vec<u8>, usize) {
    let mut stream = Vec::new();
    stream.extend_from_slice(&bof_globals());
    stream.extend_from_slice(&eof());

    let sheet_offset = stream.len();
    stream.extend_from_slice(&bof_worksheet());
    for record in sheet_records {
        stream.extend_from_slice(record);
    }
    stream.extend_from_slice(&eof());
    (stream, sheet_offset)
}

/// Wrap a workbook stream in a compound file.
pub fn build_fixture_xls(workbook_stream: &[u8]) -> Vec<u8> {
    let cursor = Cursor::new(Vec::new());
    let mut ole = cfb::CompoundFile::create(cursor).expect("create cfb");
    {
        let mut stream = ole.create_stream("Workbook").expect("Workbook stream");
        stream
            .write_all(workbook_stream)
            .expect("write Workbook stream");
    }
    ole.into_inner().into_inner()
}
