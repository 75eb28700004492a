use tracing::{debug, info};

use crate::error::{RecapError, Result};
use crate::models::{CountMap, Outcome, ReconcileEntry, ReconcileLog, Scalar, TargetTable, UpdateMode};

#[derive(Debug)]
pub struct ReconcileResult {
    pub table: TargetTable,
    pub log: ReconcileLog,
}

/// Merge `counts` into a copy of `target`.
///
/// Matched rows (first occurrence of the key) get their `column` cell added
/// to or replaced; unseen keys are appended with only the key and `column`
/// set. The header is never changed.
pub fn reconcile(
    target: &TargetTable,
    counts: &CountMap,
    column: &str,
    mode: UpdateMode,
) -> Result<ReconcileResult> {
    // The key column is never a target.
    let col = target
        .column_index(column)
        .filter(|&idx| idx > 0)
        .ok_or_else(|| RecapError::InvalidColumn(column.to_string()))?;

    // Rows may stop short of the header; missing cells are blank.
    let mut table = target.clone();
    let width = table.header.len();
    for row in table.rows.iter_mut().filter(|row| row.len() < width) {
        row.resize(width, Scalar::Empty);
    }
    let mut log = ReconcileLog::default();

    for (key, count) in counts.iter() {
        let entry = match table.find_row(key) {
            Some(row) => {
                let previous = table.rows[row][col].clone();
                let value = match mode {
                    UpdateMode::Add => {
                        if !previous.is_blank() && previous.as_number().is_none() {
                            debug!(key, ?previous, "non-numeric value treated as 0");
                        }
                        Scalar::Number(previous.coerce_number() + count as f64)
                    }
                    UpdateMode::Replace => Scalar::Number(count as f64),
                };
                table.rows[row][col] = value.clone();
                ReconcileEntry {
                    key: key.to_string(),
                    count,
                    value,
                    outcome: Outcome::Updated { row, previous },
                }
            }
            None => {
                let mut new_row = vec![Scalar::Empty; table.header.len()];
                new_row[0] = Scalar::text(key);
                new_row[col] = Scalar::Number(count as f64);
                table.rows.push(new_row);
                ReconcileEntry {
                    key: key.to_string(),
                    count,
                    value: Scalar::Number(count as f64),
                    outcome: Outcome::Inserted {
                        row: table.rows.len() - 1,
                    },
                }
            }
        };
        debug!(key = %entry.key, count, outcome = ?entry.outcome, "reconciled");
        log.entries.push(entry);
    }

    info!(
        column,
        mode = %mode,
        updated = log.updated(),
        inserted = log.inserted(),
        "reconciliation complete"
    );
    Ok(ReconcileResult { table, log })
}

/// Matched-versus-inserted keys, derived purely from the two tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub updated: Vec<String>,
    pub inserted: Vec<String>,
}

pub fn classify(before: &TargetTable, after: &TargetTable) -> Classification {
    Classification {
        updated: updated_keys(before, after),
        inserted: inserted_keys(before, after),
    }
}

/// Keys of `after` that do not exist in `before`, in row order.
pub fn inserted_keys(before: &TargetTable, after: &TargetTable) -> Vec<String> {
    (0..after.rows.len())
        .filter_map(|row| after.key_of(row))
        .filter(|key| before.find_row(key).is_none())
        .collect()
}

/// Keys present in both tables whose row differs.
pub fn updated_keys(before: &TargetTable, after: &TargetTable) -> Vec<String> {
    let mut keys = Vec::new();
    for (row, cells) in before.rows.iter().enumerate() {
        let Some(key) = before.key_of(row) else { continue };
        if before.find_row(&key) != Some(row) {
            continue;
        }
        if let Some(after_row) = after.find_row(&key) {
            if !same_cells(&after.rows[after_row], cells) {
                keys.push(key);
            }
        }
    }
    keys
}

/// Row equality where missing trailing cells count as blank.
fn same_cells(a: &[Scalar], b: &[Scalar]) -> bool {
    (0..a.len().max(b.len())).all(|i| {
        a.get(i).unwrap_or(&Scalar::Empty) == b.get(i).unwrap_or(&Scalar::Empty)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn target(rows: &[(&str, Scalar)]) -> TargetTable {
        let mut t = TargetTable::new(vec!["Site".into(), "Jan".into(), "Feb".into()]);
        for (key, jan) in rows {
            t.push_row(vec![Scalar::text(*key), jan.clone(), Scalar::text("keep")]);
        }
        t
    }

    fn counts(pairs: &[(&str, u64)]) -> CountMap {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_add_to_existing() {
        let t = target(&[("Acme", Scalar::Number(10.0))]);
        let r = reconcile(&t, &counts(&[("Acme", 2)]), "Jan", UpdateMode::Add).unwrap();
        assert_eq!(r.table.value(0, "Jan"), Some(&Scalar::Number(12.0)));
        assert_eq!(r.table.value(0, "Feb"), Some(&Scalar::text("keep")));
        assert_eq!(r.log.updated(), 1);
    }

    #[test]
    fn test_replace_existing() {
        let t = target(&[("Acme", Scalar::Number(10.0))]);
        let r = reconcile(&t, &counts(&[("Acme", 2)]), "Jan", UpdateMode::Replace).unwrap();
        assert_eq!(r.table.value(0, "Jan"), Some(&Scalar::Number(2.0)));
    }

    #[test]
    fn test_replace_overwrites_text() {
        let t = target(&[("Acme", Scalar::text("n/a"))]);
        let r = reconcile(&t, &counts(&[("Acme", 4)]), "Jan", UpdateMode::Replace).unwrap();
        assert_eq!(r.table.value(0, "Jan"), Some(&Scalar::Number(4.0)));
    }

    #[test]
    fn test_add_tolerates_non_numeric() {
        for existing in [Scalar::text("Y"), Scalar::Empty, Scalar::text("")] {
            let t = target(&[("Acme", existing)]);
            let r = reconcile(&t, &counts(&[("Acme", 3)]), "Jan", UpdateMode::Add).unwrap();
            assert_eq!(r.table.value(0, "Jan"), Some(&Scalar::Number(3.0)));
        }
    }

    #[test]
    fn test_add_parses_numeric_text() {
        for existing in [Scalar::text("12"), Scalar::Number(12.0), Scalar::text("12.0")] {
            let t = target(&[("Acme", existing)]);
            let r = reconcile(&t, &counts(&[("Acme", 1)]), "Jan", UpdateMode::Add).unwrap();
            assert_eq!(r.table.value(0, "Jan"), Some(&Scalar::Number(13.0)));
        }
    }

    #[test]
    fn test_replace_is_idempotent() {
        let t = target(&[("Acme", Scalar::Number(10.0)), ("Beta", Scalar::Empty)]);
        let c = counts(&[("Acme", 2), ("Gamma", 5)]);
        let once = reconcile(&t, &c, "Jan", UpdateMode::Replace).unwrap().table;
        let twice = reconcile(&once, &c, "Jan", UpdateMode::Replace).unwrap().table;
        assert_eq!(once, twice);
    }

    #[test]
    fn test_add_is_additive() {
        let t = target(&[("Acme", Scalar::Number(10.0))]);
        let step1 = reconcile(&t, &counts(&[("Acme", 2)]), "Jan", UpdateMode::Add).unwrap().table;
        let step2 = reconcile(&step1, &counts(&[("Acme", 5)]), "Jan", UpdateMode::Add).unwrap().table;
        let combined = reconcile(&t, &counts(&[("Acme", 7)]), "Jan", UpdateMode::Add).unwrap().table;
        assert_eq!(step2, combined);
        assert_eq!(step2.value(0, "Jan"), Some(&Scalar::Number(17.0)));
    }

    #[test]
    fn test_new_entity_inserted() {
        let t = target(&[("Beta", Scalar::Number(1.0))]);
        let r = reconcile(&t, &counts(&[("Acme", 2)]), "Jan", UpdateMode::Add).unwrap();
        assert_eq!(r.table.rows.len(), 2);
        assert_eq!(
            r.table.rows[1],
            vec![Scalar::text("Acme"), Scalar::Number(2.0), Scalar::Empty]
        );
        assert_eq!(r.log.inserted(), 1);
        assert_eq!(inserted_keys(&t, &r.table), vec!["Acme".to_string()]);
    }

    #[test]
    fn test_header_preserved() {
        let t = target(&[("Acme", Scalar::Number(1.0))]);
        for mode in [UpdateMode::Add, UpdateMode::Replace] {
            let r = reconcile(&t, &counts(&[("Acme", 1), ("New", 3)]), "Feb", mode).unwrap();
            assert_eq!(r.table.header, t.header);
            assert!(r.table.rows.iter().all(|row| row.len() == t.header.len()));
        }
    }

    #[test]
    fn test_input_not_mutated() {
        let t = target(&[("Acme", Scalar::Number(10.0))]);
        let before = t.clone();
        reconcile(&t, &counts(&[("Acme", 2), ("New", 1)]), "Jan", UpdateMode::Add).unwrap();
        assert_eq!(t, before);
    }

    #[test]
    fn test_duplicate_keys_first_wins() {
        let t = target(&[("Acme", Scalar::Number(1.0)), ("Acme", Scalar::Number(5.0))]);
        let r = reconcile(&t, &counts(&[("Acme", 2)]), "Jan", UpdateMode::Add).unwrap();
        assert_eq!(r.table.value(0, "Jan"), Some(&Scalar::Number(3.0)));
        assert_eq!(r.table.value(1, "Jan"), Some(&Scalar::Number(5.0)));
    }

    #[test]
    fn test_key_match_is_not_trimmed() {
        let t = target(&[(" Acme", Scalar::Number(1.0))]);
        let r = reconcile(&t, &counts(&[("Acme", 2)]), "Jan", UpdateMode::Add).unwrap();
        assert_eq!(r.table.rows.len(), 2);
        assert_eq!(r.table.value(0, "Jan"), Some(&Scalar::Number(1.0)));
    }

    #[test]
    fn test_invalid_column() {
        let t = target(&[]);
        let err = reconcile(&t, &counts(&[("Acme", 1)]), "Mar", UpdateMode::Add).unwrap_err();
        assert!(matches!(err, RecapError::InvalidColumn(ref c) if c == "Mar"));
    }

    #[test]
    fn test_key_column_rejected() {
        let t = target(&[("Acme", Scalar::Number(1.0))]);
        let err = reconcile(&t, &counts(&[("Acme", 1)]), "Site", UpdateMode::Replace).unwrap_err();
        assert!(matches!(err, RecapError::InvalidColumn(_)));
    }

    #[test]
    fn test_classification_from_diff() {
        let t = target(&[("Acme", Scalar::Number(10.0)), ("Beta", Scalar::Number(1.0))]);
        let r = reconcile(&t, &counts(&[("Acme", 2), ("Zed", 1)]), "Jan", UpdateMode::Add).unwrap();
        let c = classify(&t, &r.table);
        assert_eq!(c.updated, vec!["Acme".to_string()]);
        assert_eq!(c.inserted, vec!["Zed".to_string()]);
        assert_eq!(c.updated.len(), r.log.updated());
        assert_eq!(c.inserted.len(), r.log.inserted());
    }

    #[test]
    fn test_short_rows_treated_as_blank() {
        let mut t = TargetTable::new(vec!["Site".into(), "Jan".into(), "Feb".into()]);
        t.rows.push(vec![Scalar::text("Acme"), Scalar::Number(1.0)]);
        t.rows.push(vec![Scalar::text("Beta")]);
        let r = reconcile(&t, &counts(&[("Acme", 4)]), "Feb", UpdateMode::Add).unwrap();
        assert_eq!(
            r.table.rows[0],
            vec![Scalar::text("Acme"), Scalar::Number(1.0), Scalar::Number(4.0)]
        );
        assert_eq!(r.table.rows[1].len(), 3);
        let c = classify(&t, &r.table);
        assert_eq!(c.updated, vec!["Acme".to_string()]);
        assert!(c.inserted.is_empty());
    }
}
