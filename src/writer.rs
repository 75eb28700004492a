use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::document::{Document, SheetGrid};
use crate::error::{RecapError, Result};
use crate::models::{Scalar, TargetTable};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub updated: usize,
    pub appended: usize,
}

/// Project `result` onto the named sheet of `doc`.
///
/// Edits go to a worksheet snapshot first and reach `doc` in a single commit,
/// so on error the document is left untouched.
pub fn write_back<'d>(
    doc: &'d mut Document,
    result: &TargetTable,
    sheet_name: &str,
) -> Result<&'d mut Document> {
    let mut sheet = doc.worksheet(sheet_name)?;
    let summary = write_rows(&mut sheet, result)?;
    doc.commit(&sheet)?;
    info!(
        sheet = sheet_name,
        updated = summary.updated,
        appended = summary.appended,
        "wrote result rows back"
    );
    Ok(doc)
}

/// Row-identity resolution over any grid whose row 1 is the header.
///
/// Existing data rows (row 2 onward) are found by their key cell. When a key
/// repeats, the n-th result row with that key lands on the n-th sheet row
/// with it, so the first occurrence stays the one `reconcile` updated.
/// Unmatched rows go after the current last row, never in between.
pub fn write_rows<G: SheetGrid>(grid: &mut G, result: &TargetTable) -> Result<WriteSummary> {
    if grid.cell(1, 1).is_blank() {
        return Err(RecapError::schema(result.key_column().unwrap_or("key column")));
    }
    let header = grid.header();
    let key_name = &header[0];
    let key_col = result
        .column_index(key_name)
        .ok_or_else(|| RecapError::schema(key_name.as_str()))?;
    let sources: Vec<Option<usize>> = header.iter().map(|h| result.column_index(h)).collect();

    let mut rows_by_key: HashMap<String, Vec<u32>> = HashMap::new();
    for row in 2..=grid.last_row() {
        match grid.cell(row, 1).key_text() {
            Some(key) if !key.is_empty() => rows_by_key.entry(key).or_default().push(row),
            _ => {}
        }
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut summary = WriteSummary::default();
    for (idx, cells) in result.rows.iter().enumerate() {
        let Some(key) = cells.get(key_col).and_then(Scalar::key_text).filter(|k| !k.is_empty())
        else {
            warn!(row = idx, "result row has no key, not written");
            continue;
        };
        let occurrence = seen.entry(key.clone()).or_default();
        let rows = rows_by_key.entry(key.clone()).or_default();
        let row = match rows.get(*occurrence) {
            Some(&row) => {
                summary.updated += 1;
                row
            }
            None => {
                let row = grid.last_row().max(1) + 1;
                rows.push(row);
                summary.appended += 1;
                debug!(key = %key, row, "appending row");
                row
            }
        };
        *occurrence += 1;

        for (col, source) in sources.iter().enumerate() {
            let value = source
                .and_then(|s| cells.get(s))
                .cloned()
                .unwrap_or(Scalar::Empty);
            grid.set_cell(row, col as u32 + 1, value);
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::document::tests::{master_workbook, replace_cell, rewrite_part, with_vba_project};
    use crate::importer::read_target;
    use crate::models::{CountMap, UpdateMode, MASTER_SHEET};
    use crate::reconciler::reconcile;
    use pretty_assertions::assert_eq;

    const MASTER_PART: &str = "xl/worksheets/sheet1.xml";
    const NOTES_PART: &str = "xl/worksheets/sheet2.xml";

    /// In-memory grid for identity tests.
    #[derive(Default)]
    struct Grid {
        cells: BTreeMap<(u32, u32), Scalar>,
        last_row: u32,
    }

    impl Grid {
        fn from_rows(rows: &[&[Scalar]]) -> Self {
            let mut grid = Grid::default();
            for (r, row) in rows.iter().enumerate() {
                for (c, value) in row.iter().enumerate() {
                    grid.set_cell(r as u32 + 1, c as u32 + 1, value.clone());
                }
            }
            grid
        }
    }

    impl SheetGrid for Grid {
        fn cell(&self, row: u32, col: u32) -> Scalar {
            self.cells.get(&(row, col)).cloned().unwrap_or_default()
        }
        fn last_row(&self) -> u32 {
            self.last_row
        }
        fn set_cell(&mut self, row: u32, col: u32, value: Scalar) {
            self.last_row = self.last_row.max(row);
            self.cells.insert((row, col), value);
        }
        fn last_col_in_row(&self, row: u32) -> u32 {
            self.cells.keys().filter(|(r, _)| *r == row).map(|(_, c)| *c).max().unwrap_or(0)
        }
    }

    fn s(v: &str) -> Scalar {
        Scalar::text(v)
    }

    fn n(v: f64) -> Scalar {
        Scalar::Number(v)
    }

    fn processed(mode: UpdateMode) -> (Document, TargetTable) {
        let bytes = master_workbook();
        let target = read_target(&bytes).unwrap();
        let counts: CountMap = [("Acme", 2), ("Zed", 5)].into_iter().collect();
        let result = reconcile(&target, &counts, "Jan", mode).unwrap().table;
        (Document::from_bytes(&bytes).unwrap(), result)
    }

    #[test]
    fn test_round_trip_through_reader() {
        let (mut doc, result) = processed(UpdateMode::Add);
        write_back(&mut doc, &result, MASTER_SHEET).unwrap();
        let reread = read_target(&doc.to_bytes().unwrap()).unwrap();
        assert_eq!(reread, result);
        assert_eq!(reread.value(0, "Jan"), Some(&n(12.0)));
        assert_eq!(reread.value(0, "Feb"), Some(&s("Y")));
        assert_eq!(reread.rows[2], vec![s("Zed"), n(5.0), Scalar::Empty]);
    }

    #[test]
    fn test_other_parts_untouched() {
        let payload = b"\xd0\xcf\x11\xe0vba-bytes";
        let bytes = with_vba_project(&master_workbook(), payload);
        let before = Document::from_bytes(&bytes).unwrap();
        let mut doc = before.clone();
        let (_, result) = processed(UpdateMode::Replace);
        write_back(&mut doc, &result, MASTER_SHEET).unwrap();
        let after = Document::from_bytes(&doc.to_bytes().unwrap()).unwrap();

        assert_ne!(after.part(MASTER_PART), before.part(MASTER_PART));
        for name in before.part_names().filter(|n| *n != MASTER_PART) {
            assert_eq!(after.part(name), before.part(name), "part {name} changed");
        }
        assert_eq!(after.part("xl/vbaProject.bin"), Some(&payload[..]));
        assert_eq!(after.part(NOTES_PART), before.part(NOTES_PART));
    }

    #[test]
    fn test_unchanged_result_leaves_sheet_bytes() {
        let bytes = master_workbook();
        let target = read_target(&bytes).unwrap();
        let mut doc = Document::from_bytes(&bytes).unwrap();
        let before = doc.part(MASTER_PART).map(<[u8]>::to_vec);
        write_back(&mut doc, &target, MASTER_SHEET).unwrap();
        assert_eq!(doc.part(MASTER_PART).map(<[u8]>::to_vec), before);
    }

    #[test]
    fn test_failure_leaves_document_unchanged() {
        let (mut doc, _) = processed(UpdateMode::Add);
        let before = doc.to_bytes().unwrap();
        let mut wrong = TargetTable::new(vec!["Company".into(), "Jan".into()]);
        wrong.push_row(vec![s("Acme"), n(1.0)]);
        let err = write_back(&mut doc, &wrong, MASTER_SHEET).unwrap_err();
        assert!(matches!(err, RecapError::Schema { ref field } if field == "Site"));
        assert_eq!(doc.to_bytes().unwrap(), before);

        let err = write_back(&mut doc, &wrong, "Missing").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn test_appends_after_last_row_and_registers_key() {
        let mut grid = Grid::from_rows(&[
            &[s("Site"), s("Jan")],
            &[s("Acme"), n(1.0)],
            &[Scalar::Empty, Scalar::Empty],
            &[s("Beta"), n(2.0)],
        ]);
        let mut result = TargetTable::new(vec!["Site".into(), "Jan".into()]);
        result.push_row(vec![s("Acme"), n(3.0)]);
        result.push_row(vec![s("Beta"), n(2.0)]);
        result.push_row(vec![s("Gamma"), n(7.0)]);

        let summary = write_rows(&mut grid, &result).unwrap();
        assert_eq!(summary, WriteSummary { updated: 2, appended: 1 });
        assert_eq!(grid.cell(2, 2), n(3.0));
        assert_eq!(grid.cell(3, 1), Scalar::Empty);
        assert_eq!(grid.cell(5, 1), s("Gamma"));
        assert_eq!(grid.cell(5, 2), n(7.0));
    }

    #[test]
    fn test_duplicate_keys_follow_occurrence_order() {
        let mut grid = Grid::from_rows(&[
            &[s("Site"), s("Jan")],
            &[s("Acme"), n(1.0)],
            &[s("Acme"), n(9.0)],
        ]);
        let mut result = TargetTable::new(vec!["Site".into(), "Jan".into()]);
        result.push_row(vec![s("Acme"), n(4.0)]);
        result.push_row(vec![s("Acme"), n(9.0)]);
        write_rows(&mut grid, &result).unwrap();
        assert_eq!(grid.cell(2, 2), n(4.0));
        assert_eq!(grid.cell(3, 2), n(9.0));
        assert_eq!(grid.last_row(), 3);
    }

    #[test]
    fn test_missing_result_column_clears_cell() {
        let mut grid = Grid::from_rows(&[
            &[s("Site"), s("Jan"), s("Notes")],
            &[s("Acme"), n(1.0), s("old")],
        ]);
        let mut result = TargetTable::new(vec!["Site".into(), "Jan".into()]);
        result.push_row(vec![s("Acme"), n(2.0)]);
        write_rows(&mut grid, &result).unwrap();
        assert_eq!(grid.cell(2, 3), Scalar::Empty);
    }

    #[test]
    fn test_blank_header_key_is_schema_error() {
        let mut grid = Grid::from_rows(&[&[Scalar::Empty, s("Jan")]]);
        let result = TargetTable::new(vec!["Site".into(), "Jan".into()]);
        let err = write_rows(&mut grid, &result).unwrap_err();
        assert!(matches!(err, RecapError::Schema { .. }));
    }

    #[test]
    fn test_numeric_keys_match() {
        let mut grid = Grid::from_rows(&[&[s("Code"), s("Jan")], &[n(101.0), n(1.0)]]);
        let mut result = TargetTable::new(vec!["Code".into(), "Jan".into()]);
        result.push_row(vec![s("101"), n(5.0)]);
        let summary = write_rows(&mut grid, &result).unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(grid.cell(2, 2), n(5.0));
    }

    #[test]
    fn test_error_cell_in_other_column_survives() {
        let cell = r#"<c r="C2" t="e"><f>1/0</f><v>#DIV/0!</v></c>"#;
        let bytes = rewrite_part(&master_workbook(), MASTER_PART, |xml| replace_cell(&xml, "C2", cell));
        let target = read_target(&bytes).unwrap();
        assert_eq!(target.value(0, "Feb"), Some(&s("#DIV/0!")));

        let counts: CountMap = [("Acme", 2)].into_iter().collect();
        let result = reconcile(&target, &counts, "Jan", UpdateMode::Add).unwrap().table;
        let mut doc = Document::from_bytes(&bytes).unwrap();
        write_back(&mut doc, &result, MASTER_SHEET).unwrap();

        let xml = String::from_utf8(doc.part(MASTER_PART).unwrap().to_vec()).unwrap();
        assert!(xml.contains(cell), "{xml}");
        assert_eq!(read_target(&doc.to_bytes().unwrap()).unwrap().value(0, "Jan"), Some(&n(12.0)));
    }

    #[test]
    fn test_filled_down_formula_column_is_refused() {
        let bytes = rewrite_part(&master_workbook(), MASTER_PART, |xml| {
            let xml = replace_cell(
                &xml,
                "B2",
                r#"<c r="B2"><f t="shared" ref="B2:B3" si="0">ROW()*5</f><v>10</v></c>"#,
            );
            replace_cell(&xml, "B3", r#"<c r="B3"><f t="shared" si="0"/><v>15</v></c>"#)
        });
        let target = read_target(&bytes).unwrap();
        let counts: CountMap = [("Acme", 2)].into_iter().collect();
        let result = reconcile(&target, &counts, "Jan", UpdateMode::Add).unwrap().table;

        let mut doc = Document::from_bytes(&bytes).unwrap();
        let before = doc.to_bytes().unwrap();
        let err = write_back(&mut doc, &result, MASTER_SHEET).unwrap_err();
        assert!(err.is_parse());
        assert!(err.to_string().contains("B2:B3"), "{err}");
        assert_eq!(doc.to_bytes().unwrap(), before);
    }
}
