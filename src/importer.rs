use std::io::{Cursor, Read};
use std::path::Path;

use calamine::{Data, Range, Reader};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{RecapError, Result};
use crate::models::{header_names, Scalar, SourceTable, TargetTable, MASTER_SHEET};

/// Physical row (0-based) holding the source header. Row 0 is a title line.
const SOURCE_HEADER_ROW: usize = 1;

pub fn compute_checksum(file_path: &Path) -> Result<String> {
    let data = std::fs::read(file_path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

/// Read a raw extract. CSV files go through `csv`; workbooks (xlsx, xlsm,
/// xls, ods) through calamine, first sheet only.
pub fn read_source(path: &Path) -> Result<SourceTable> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let rows = match ext.as_str() {
        "csv" => csv_rows(std::fs::File::open(path)?)?,
        "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => {
            let mut workbook = calamine::open_workbook_auto(path)?;
            let range = workbook
                .worksheet_range_at(0)
                .ok_or_else(|| RecapError::Parse(format!("{}: workbook has no sheets", path.display())))??;
            grid_rows(&range)
        }
        _ => {
            return Err(RecapError::Parse(format!(
                "{}: unsupported source file type",
                path.display()
            )))
        }
    };
    let table = source_from_rows(rows)?;
    info!(path = %path.display(), rows = table.rows.len(), "read source extract");
    Ok(table)
}

fn csv_rows<R: Read>(reader: R) -> Result<Vec<Vec<Scalar>>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        rows.push(
            record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        Scalar::Empty
                    } else {
                        Scalar::text(field)
                    }
                })
                .collect(),
        );
    }
    Ok(rows)
}

fn source_from_rows(rows: Vec<Vec<Scalar>>) -> Result<SourceTable> {
    let mut rows = rows.into_iter().skip(SOURCE_HEADER_ROW);
    let header_row = rows
        .next()
        .ok_or_else(|| RecapError::Parse("source has no header row (expected on row 2)".to_string()))?;
    let mut table = SourceTable::new(header_names(&trim_trailing_blanks(header_row)));
    let mut skipped = 0usize;
    for row in rows {
        if row.iter().all(Scalar::is_blank) {
            skipped += 1;
            continue;
        }
        table.push_row(row);
    }
    debug!(columns = table.header.len(), skipped, "parsed source rows");
    Ok(table)
}

/// Parse the `Master Sheet` of a workbook. Row 1 is the header; interior
/// blank rows are kept so row positions survive a write-back.
pub fn read_target(bytes: &[u8]) -> Result<TargetTable> {
    let mut workbook = calamine::Xlsx::new(Cursor::new(bytes))?;
    if !workbook.sheet_names().iter().any(|name| name == MASTER_SHEET) {
        return Err(RecapError::Parse(format!(
            "worksheet '{MASTER_SHEET}' not found"
        )));
    }
    let range = workbook.worksheet_range(MASTER_SHEET)?;
    let mut rows = grid_rows(&range).into_iter();
    let header = header_names(&trim_trailing_blanks(rows.next().unwrap_or_default()));
    if header.is_empty() || range.get_value((0, 0)).map_or(true, |d| data_to_scalar(d).is_blank()) {
        return Err(RecapError::schema("entity key column"));
    }
    let mut table = TargetTable::new(header);
    for row in rows {
        table.push_row(row);
    }
    debug!(rows = table.rows.len(), columns = table.header.len(), "read target table");
    Ok(table)
}

pub fn read_target_file(path: &Path) -> Result<TargetTable> {
    let bytes = std::fs::read(path)?;
    read_target_from(&bytes, path)
}

/// [`read_target`] over bytes already read from `path`; parse errors name it.
pub fn read_target_from(bytes: &[u8], path: &Path) -> Result<TargetTable> {
    read_target(bytes).map_err(|e| match e {
        RecapError::Schema { .. } => e,
        other => RecapError::Parse(format!("{}: {other}", path.display())),
    })
}

/// Physical rows from sheet row 1, regardless of where the used range
/// starts.
fn grid_rows(range: &Range<Data>) -> Vec<Vec<Scalar>> {
    let Some((end_row, end_col)) = range.end() else {
        return Vec::new();
    };
    (0..=end_row)
        .map(|r| {
            (0..=end_col)
                .map(|c| range.get_value((r, c)).map(data_to_scalar).unwrap_or_default())
                .collect()
        })
        .collect()
}

fn data_to_scalar(data: &Data) -> Scalar {
    match data {
        Data::Empty => Scalar::Empty,
        Data::Int(i) => Scalar::Number(*i as f64),
        Data::Float(f) => Scalar::Number(*f),
        Data::String(s) if s.is_empty() => Scalar::Empty,
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => Scalar::text(s.as_str()),
        Data::Bool(b) => Scalar::text(if *b { "TRUE" } else { "FALSE" }),
        Data::DateTime(dt) => Scalar::Number(dt.as_f64()),
        // Same text the worksheet stores, e.g. `#DIV/0!`.
        Data::Error(e) => Scalar::text(e.to_string()),
    }
}

fn trim_trailing_blanks(mut row: Vec<Scalar>) -> Vec<Scalar> {
    while row.last().is_some_and(Scalar::is_blank) {
        row.pop();
    }
    row
}
