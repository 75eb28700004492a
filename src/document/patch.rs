use std::collections::BTreeMap;
use std::io::BufRead;

use quick_xml::escape::escape;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::{RecapError, Result};
use crate::models::{format_number, Scalar};

use super::local_name;
use super::sheet::{cell_attrs, parse_a1, row_number, to_a1};

#[derive(Debug)]
pub(super) struct Patched {
    pub xml: Vec<u8>,
    /// An overwritten cell carried a formula, so any cached calc chain is stale.
    pub formula_removed: bool,
}

type RowEdits<'a> = BTreeMap<u32, Vec<(u32, &'a Scalar)>>;

/// Rewrite worksheet XML with `edits` applied. Everything outside the edited
/// cells is streamed through unchanged; existing cell styles are kept.
pub(super) fn apply(original: &[u8], edits: &BTreeMap<(u32, u32), Scalar>) -> Result<Patched> {
    let mut by_row: RowEdits<'_> = BTreeMap::new();
    for ((row, col), value) in edits {
        by_row.entry(*row).or_default().push((*col, value));
    }
    let pending: Vec<u32> = by_row.keys().copied().collect();
    let mut next = 0usize;
    let mut formula_removed = false;

    let mut reader = Reader::from_reader(original);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Vec::with_capacity(original.len() + edits.len() * 48));
    let mut buf = Vec::new();
    let mut saw_sheet_data = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Empty(e) if local_name(e.name().as_ref()) == b"dimension" => {
                writer.write_event(Event::Empty(grow_dimension(&e, edits)?))?;
            }
            Event::Start(e) if local_name(e.name().as_ref()) == b"sheetData" => {
                saw_sheet_data = true;
                writer.write_event(Event::Start(e.into_owned()))?;
                formula_removed |=
                    patch_sheet_data(&mut reader, &mut writer, &by_row, &pending, &mut next)?;
            }
            Event::Empty(e) if local_name(e.name().as_ref()) == b"sheetData" => {
                saw_sheet_data = true;
                if by_row.is_empty() {
                    writer.write_event(Event::Empty(e.into_owned()))?;
                } else {
                    writer.write_event(Event::Start(e.into_owned()))?;
                    write_rows(&mut writer, &by_row, &pending, &mut next, None)?;
                    writer.write_event(Event::End(BytesEnd::new("sheetData")))?;
                }
            }
            Event::End(e) if local_name(e.name().as_ref()) == b"worksheet" => {
                if !saw_sheet_data && !by_row.is_empty() {
                    writer.write_event(Event::Start(BytesStart::new("sheetData")))?;
                    write_rows(&mut writer, &by_row, &pending, &mut next, None)?;
                    writer.write_event(Event::End(BytesEnd::new("sheetData")))?;
                }
                writer.write_event(Event::End(e.into_owned()))?;
            }
            Event::Eof => break,
            ev => writer.write_event(ev.into_owned())?,
        }
        buf.clear();
    }

    Ok(Patched {
        xml: writer.into_inner(),
        formula_removed,
    })
}

/// Emit new rows for pending edit rows, stopping before `until` when given.
fn write_rows(
    writer: &mut Writer<Vec<u8>>,
    by_row: &RowEdits<'_>,
    pending: &[u32],
    next: &mut usize,
    until: Option<u32>,
) -> Result<()> {
    while *next < pending.len() && until.map_or(true, |stop| pending[*next] < stop) {
        let row = pending[*next];
        let mut start = BytesStart::new("row");
        start.push_attribute(("r", row.to_string().as_str()));
        writer.write_event(Event::Start(start))?;
        for (col, value) in by_row.get(&row).map(Vec::as_slice).unwrap_or_default() {
            write_cell(writer, row, *col, value, None)?;
        }
        writer.write_event(Event::End(BytesEnd::new("row")))?;
        *next += 1;
    }
    Ok(())
}

fn patch_sheet_data<R: BufRead>(
    reader: &mut Reader<R>,
    writer: &mut Writer<Vec<u8>>,
    by_row: &RowEdits<'_>,
    pending: &[u32],
    next: &mut usize,
) -> Result<bool> {
    let mut buf = Vec::new();
    let mut formula_removed = false;
    let mut current_row = 0u32;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if local_name(e.name().as_ref()) == b"row" => {
                let start = e.into_owned();
                current_row = row_number(&start)?.unwrap_or(current_row + 1);
                write_rows(writer, by_row, pending, next, Some(current_row))?;
                writer.write_event(Event::Start(start))?;
                if let Some(cells) = by_row.get(&current_row) {
                    *next += 1;
                    formula_removed |= patch_row(reader, writer, current_row, cells)?;
                }
            }
            Event::Empty(e) if local_name(e.name().as_ref()) == b"row" => {
                let empty = e.into_owned();
                current_row = row_number(&empty)?.unwrap_or(current_row + 1);
                write_rows(writer, by_row, pending, next, Some(current_row))?;
                match by_row.get(&current_row) {
                    Some(cells) => {
                        *next += 1;
                        writer.write_event(Event::Start(empty))?;
                        for (col, value) in cells {
                            write_cell(writer, current_row, *col, value, None)?;
                        }
                        writer.write_event(Event::End(BytesEnd::new("row")))?;
                    }
                    None => writer.write_event(Event::Empty(empty))?,
                }
            }
            Event::End(e) if local_name(e.name().as_ref()) == b"sheetData" => {
                write_rows(writer, by_row, pending, next, None)?;
                writer.write_event(Event::End(e.into_owned()))?;
                break;
            }
            Event::Eof => {
                return Err(RecapError::Parse(
                    "unexpected end of worksheet inside sheetData".to_string(),
                ))
            }
            ev => writer.write_event(ev.into_owned())?,
        }
        buf.clear();
    }

    Ok(formula_removed)
}

/// Stream one `<row>` body, replacing edited cells and inserting new ones in
/// column order. Writes the closing `</row>`.
fn patch_row<R: BufRead>(
    reader: &mut Reader<R>,
    writer: &mut Writer<Vec<u8>>,
    row: u32,
    cells: &[(u32, &Scalar)],
) -> Result<bool> {
    let mut buf = Vec::new();
    let mut idx = 0usize;
    let mut current_col = 0u32;
    let mut formula_removed = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if local_name(e.name().as_ref()) == b"c" => {
                let start = e.into_owned();
                let attrs = cell_attrs(&start)?;
                current_col = column_of(attrs.reference.as_deref()).unwrap_or(current_col + 1);
                while idx < cells.len() && cells[idx].0 < current_col {
                    write_cell(writer, row, cells[idx].0, cells[idx].1, None)?;
                    idx += 1;
                }
                if idx < cells.len() && cells[idx].0 == current_col {
                    let replaced = skip_cell(reader)?;
                    if let Some(range) = replaced.shared_range {
                        return Err(RecapError::Parse(format!(
                            "{} anchors the shared formula of {range}; overwriting it would orphan the other cells",
                            to_a1(row, current_col)
                        )));
                    }
                    formula_removed |= replaced.formula;
                    write_cell(writer, row, current_col, cells[idx].1, attrs.s.as_deref())?;
                    idx += 1;
                } else {
                    writer.write_event(Event::Start(start))?;
                }
            }
            Event::Empty(e) if local_name(e.name().as_ref()) == b"c" => {
                let empty = e.into_owned();
                let attrs = cell_attrs(&empty)?;
                current_col = column_of(attrs.reference.as_deref()).unwrap_or(current_col + 1);
                while idx < cells.len() && cells[idx].0 < current_col {
                    write_cell(writer, row, cells[idx].0, cells[idx].1, None)?;
                    idx += 1;
                }
                if idx < cells.len() && cells[idx].0 == current_col {
                    write_cell(writer, row, current_col, cells[idx].1, attrs.s.as_deref())?;
                    idx += 1;
                } else {
                    writer.write_event(Event::Empty(empty))?;
                }
            }
            Event::End(e) if local_name(e.name().as_ref()) == b"row" => {
                for (col, value) in &cells[idx..] {
                    write_cell(writer, row, *col, value, None)?;
                }
                writer.write_event(Event::End(e.into_owned()))?;
                break;
            }
            Event::Eof => {
                return Err(RecapError::Parse(
                    "unexpected end of worksheet inside row".to_string(),
                ))
            }
            ev => writer.write_event(ev.into_owned())?,
        }
        buf.clear();
    }

    Ok(formula_removed)
}

/// What an overwritten cell carried.
#[derive(Debug, Default)]
struct Replaced {
    formula: bool,
    /// Range of a shared formula anchored on this cell.
    shared_range: Option<String>,
}

/// Consume a cell body up to its `</c>`.
fn skip_cell<R: BufRead>(reader: &mut Reader<R>) -> Result<Replaced> {
    let mut buf = Vec::new();
    let mut depth = 1usize;
    let mut replaced = Replaced::default();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(inner) => {
                if depth == 1 && local_name(inner.name().as_ref()) == b"f" {
                    replaced.formula = true;
                    replaced.shared_range = shared_range(&inner)?;
                }
                depth += 1;
            }
            Event::Empty(inner) => {
                if depth == 1 && local_name(inner.name().as_ref()) == b"f" {
                    replaced.formula = true;
                    replaced.shared_range = shared_range(&inner)?;
                }
            }
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => {
                return Err(RecapError::Parse(
                    "unexpected end of worksheet inside cell".to_string(),
                ))
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(replaced)
}

/// `ref` of `<f t="shared" ref=".." si="..">` when it covers more than one cell.
fn shared_range(f: &BytesStart<'_>) -> Result<Option<String>> {
    let mut shared = false;
    let mut range = None;
    for attr in f.attributes() {
        let attr = attr?;
        match local_name(attr.key.as_ref()) {
            b"t" => shared = attr.value.as_ref() == b"shared",
            b"ref" => range = Some(attr.unescape_value()?.into_owned()),
            _ => {}
        }
    }
    Ok(range.filter(|r| shared && spans_cells(r)))
}

fn spans_cells(range: &str) -> bool {
    match range.split_once(':') {
        Some((first, last)) => parse_a1(first) != parse_a1(last),
        None => false,
    }
}

fn write_cell(
    writer: &mut Writer<Vec<u8>>,
    row: u32,
    col: u32,
    value: &Scalar,
    style: Option<&str>,
) -> Result<()> {
    let mut cell = format!(r#"<c r="{}""#, to_a1(row, col));
    if let Some(s) = style.filter(|s| !s.is_empty() && *s != "0") {
        cell.push_str(&format!(r#" s="{}""#, escape(s)));
    }
    match value {
        Scalar::Empty => cell.push_str("/>"),
        Scalar::Number(n) => {
            cell.push_str(&format!("><v>{}</v></c>", format_number(*n)));
        }
        Scalar::Text(s) => {
            cell.push_str(r#" t="inlineStr"><is><t"#);
            if s.trim() != s {
                cell.push_str(r#" xml:space="preserve""#);
            }
            cell.push_str(&format!(">{}</t></is></c>", escape(s.as_str())));
        }
    }
    writer.get_mut().extend_from_slice(cell.as_bytes());
    Ok(())
}

fn column_of(reference: Option<&str>) -> Option<u32> {
    reference.and_then(parse_a1).map(|(_, col)| col)
}

/// Widen `<dimension ref="A1:C3"/>` so it still covers every edited cell.
fn grow_dimension(e: &BytesStart<'_>, edits: &BTreeMap<(u32, u32), Scalar>) -> Result<BytesStart<'static>> {
    let mut reference = None;
    for attr in e.attributes() {
        let attr = attr?;
        if local_name(attr.key.as_ref()) == b"ref" {
            reference = Some(attr.unescape_value()?.into_owned());
        }
    }
    let Some(reference) = reference else {
        return Ok(e.clone().into_owned());
    };
    let mut parts = reference.split(':');
    let first = parts.next().and_then(parse_a1);
    let last = parts.next().and_then(parse_a1).or(first);
    let (Some((top, left)), Some((mut bottom, mut right))) = (first, last) else {
        return Ok(e.clone().into_owned());
    };
    for (row, col) in edits.keys() {
        bottom = bottom.max(*row);
        right = right.max(*col);
    }

    let updated = format!("{}:{}", to_a1(top, left), to_a1(bottom, right));
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);
    for attr in e.attributes() {
        let attr = attr?;
        if local_name(attr.key.as_ref()) == b"ref" {
            out.push_attribute(("ref", updated.as_str()));
        } else {
            out.push_attribute(attr);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(xml: &str, edits: &[((u32, u32), Scalar)]) -> (String, bool) {
        let edits: BTreeMap<_, _> = edits.iter().cloned().collect();
        let out = apply(xml.as_bytes(), &edits).unwrap();
        (String::from_utf8(out.xml).unwrap(), out.formula_removed)
    }

    const SHEET: &str = r#"<worksheet><dimension ref="A1:B2"/><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>Site</t></is></c><c r="B1" t="inlineStr"><is><t>Jan</t></is></c></row><row r="2"><c r="A2" t="inlineStr"><is><t>Acme</t></is></c><c r="B2" s="4"><v>10</v></c></row></sheetData></worksheet>"#;

    #[test]
    fn test_no_edits_is_identity() {
        let (out, _) = patch(SHEET, &[]);
        assert_eq!(out, SHEET);
    }

    #[test]
    fn test_overwrite_keeps_style() {
        let (out, removed) = patch(SHEET, &[((2, 2), Scalar::Number(12.0))]);
        assert!(out.contains(r#"<c r="B2" s="4"><v>12</v></c>"#));
        assert!(!removed);
    }

    #[test]
    fn test_appended_row_and_dimension() {
        let (out, _) = patch(
            SHEET,
            &[((3, 1), Scalar::text("Beta & co")), ((3, 3), Scalar::Number(2.0))],
        );
        assert!(out.contains(
            r#"<row r="3"><c r="A3" t="inlineStr"><is><t>Beta &amp; co</t></is></c><c r="C3"><v>2</v></c></row></sheetData>"#
        ));
        assert!(out.contains(r#"<dimension ref="A1:C3"/>"#));
    }

    #[test]
    fn test_cell_inserted_in_column_order() {
        let (out, _) = patch(SHEET, &[((2, 1), Scalar::Empty), ((2, 3), Scalar::Number(1.5))]);
        assert!(out.contains(r#"<row r="2"><c r="A2"/><c r="B2" s="4"><v>10</v></c><c r="C2"><v>1.5</v></c></row>"#));
    }

    #[test]
    fn test_rows_inserted_between_existing() {
        let xml = r#"<worksheet><sheetData><row r="1"><c r="A1"><v>1</v></c></row><row r="5"><c r="A5"><v>5</v></c></row></sheetData></worksheet>"#;
        let (out, _) = patch(xml, &[((3, 1), Scalar::Number(3.0))]);
        let r3 = out.find(r#"<row r="3">"#).unwrap();
        assert!(out.find(r#"<row r="1">"#).unwrap() < r3);
        assert!(r3 < out.find(r#"<row r="5">"#).unwrap());
    }

    #[test]
    fn test_formula_overwrite_reported() {
        let xml = r#"<worksheet><sheetData><row r="1"><c r="A1"><f>1+1</f><v>2</v></c></row></sheetData></worksheet>"#;
        let (out, removed) = patch(xml, &[((1, 1), Scalar::Number(7.0))]);
        assert!(removed);
        assert!(!out.contains("<f>"));
    }

    #[test]
    fn test_empty_sheet_data_expanded() {
        let xml = r#"<worksheet><sheetData/></worksheet>"#;
        let (out, _) = patch(xml, &[((1, 1), Scalar::text("Site"))]);
        assert!(out.contains(r#"<sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>Site</t></is></c></row></sheetData>"#));
    }

    #[test]
    fn test_truncated_xml_is_parse_error() {
        let xml = r#"<worksheet><sheetData><row r="1"><c r="A1"><v>1</v></c>"#;
        let edits: BTreeMap<_, _> = [((1, 1), Scalar::Number(2.0))].into_iter().collect();
        assert!(apply(xml.as_bytes(), &edits).unwrap_err().is_parse());
    }

    const FILLED_DOWN: &str = r#"<worksheet><sheetData><row r="1"><c r="B1"><f t="shared" ref="B1:B3" si="0">A1*2</f><v>2</v></c></row><row r="2"><c r="B2"><f t="shared" si="0"/><v>4</v></c></row><row r="3"><c r="B3"><f t="shared" si="0"/><v>6</v></c></row></sheetData></worksheet>"#;

    #[test]
    fn test_shared_formula_anchor_is_not_overwritten() {
        let edits: BTreeMap<_, _> = [((1, 2), Scalar::Number(9.0))].into_iter().collect();
        let err = apply(FILLED_DOWN.as_bytes(), &edits).unwrap_err();
        assert!(err.is_parse());
        assert!(err.to_string().contains("B1:B3"), "{err}");
    }

    #[test]
    fn test_shared_formula_dependent_can_be_overwritten() {
        let (out, removed) = patch(FILLED_DOWN, &[((2, 2), Scalar::Number(9.0))]);
        assert!(removed);
        assert!(out.contains(r#"<c r="B2"><v>9</v></c>"#));
        assert!(out.contains(r#"ref="B1:B3""#));
    }

    #[test]
    fn test_single_cell_shared_formula_can_be_overwritten() {
        let xml = r#"<worksheet><sheetData><row r="1"><c r="A1"><f t="shared" ref="A1" si="0">1+1</f><v>2</v></c></row></sheetData></worksheet>"#;
        let (out, removed) = patch(xml, &[((1, 1), Scalar::Number(7.0))]);
        assert!(removed);
        assert!(!out.contains("<f"));
    }
}
