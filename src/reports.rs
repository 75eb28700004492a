use std::cmp::Ordering;

use crate::error::{RecapError, Result};
use crate::models::{Scalar, TargetTable};

/// Rows that carry an entity key, as (row index, key).
fn entities(table: &TargetTable) -> Vec<(usize, String)> {
    (0..table.rows.len())
        .filter_map(|row| table.key_of(row).filter(|k| !k.is_empty()).map(|k| (row, k)))
        .collect()
}

fn category_index(table: &TargetTable, column: &str) -> Result<usize> {
    table
        .column_index(column)
        .filter(|&idx| idx > 0)
        .ok_or_else(|| RecapError::InvalidColumn(column.to_string()))
}

fn coerced(table: &TargetTable, row: usize, col: usize) -> f64 {
    table.rows[row].get(col).map_or(0.0, Scalar::coerce_number)
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

pub struct ColumnSummary {
    pub column: String,
    pub non_blank: usize,
    pub total: f64,
    pub mean: f64,
    pub max: Option<(String, f64)>,
}

pub struct Summary {
    pub entities: usize,
    pub columns: Vec<ColumnSummary>,
}

pub fn summary(table: &TargetTable) -> Summary {
    let keyed = entities(table);
    let columns = table
        .category_columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let col = i + 1;
            let mut non_blank = 0;
            let mut total = 0.0;
            let mut max: Option<(String, f64)> = None;
            for (row, key) in &keyed {
                if table.rows[*row].get(col).is_some_and(|v| !v.is_blank()) {
                    non_blank += 1;
                }
                let value = coerced(table, *row, col);
                total += value;
                if max.as_ref().map_or(true, |(_, m)| value > *m) {
                    max = Some((key.clone(), value));
                }
            }
            let mean = if keyed.is_empty() { 0.0 } else { total / keyed.len() as f64 };
            ColumnSummary {
                column: column.clone(),
                non_blank,
                total,
                mean,
                max,
            }
        })
        .collect();
    Summary {
        entities: keyed.len(),
        columns,
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RankedEntity {
    pub rank: usize,
    pub entity: String,
    pub value: f64,
}

/// Keyed rows ordered by value, descending. Ties keep table order.
fn ranked_rows(table: &TargetTable, col: usize) -> Vec<(usize, String, f64)> {
    let mut rows: Vec<(usize, String, f64)> = entities(table)
        .into_iter()
        .map(|(row, key)| {
            let value = coerced(table, row, col);
            (row, key, value)
        })
        .collect();
    rows.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));
    rows
}

pub fn ranking(table: &TargetTable, column: &str, n: usize) -> Result<Vec<RankedEntity>> {
    let col = category_index(table, column)?;
    Ok(ranked_rows(table, col)
        .into_iter()
        .take(n)
        .enumerate()
        .map(|(i, (_, entity, value))| RankedEntity {
            rank: i + 1,
            entity,
            value,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

pub struct Comparison {
    pub columns: Vec<String>,
    pub rows: Vec<(String, Vec<f64>)>,
}

/// Values for `entities` across `columns`. Empty selections mean "all".
pub fn compare(table: &TargetTable, columns: &[String], entities_filter: &[String]) -> Result<Comparison> {
    let columns: Vec<String> = if columns.is_empty() {
        table.category_columns().to_vec()
    } else {
        columns.to_vec()
    };
    let indexes = columns
        .iter()
        .map(|c| category_index(table, c))
        .collect::<Result<Vec<_>>>()?;

    let selected: Vec<(usize, String)> = if entities_filter.is_empty() {
        entities(table)
    } else {
        entities_filter
            .iter()
            .map(|e| {
                table
                    .find_row(e)
                    .map(|row| (row, e.clone()))
                    .ok_or_else(|| RecapError::Other(format!("Unknown entity: {e}")))
            })
            .collect::<Result<Vec<_>>>()?
    };

    let rows = selected
        .into_iter()
        .map(|(row, key)| {
            let values = indexes.iter().map(|&col| coerced(table, row, col)).collect();
            (key, values)
        })
        .collect();
    Ok(Comparison { columns, rows })
}

// ---------------------------------------------------------------------------
// Entity profile
// ---------------------------------------------------------------------------

pub struct ProfileItem {
    pub column: String,
    pub value: Scalar,
    pub rank: usize,
    pub of: usize,
}

pub struct Profile {
    pub entity: String,
    pub items: Vec<ProfileItem>,
}

pub fn profile(table: &TargetTable, entity: &str) -> Result<Profile> {
    let row = table
        .find_row(entity)
        .ok_or_else(|| RecapError::Other(format!("Unknown entity: {entity}")))?;
    let items = table
        .category_columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let col = i + 1;
            let ranked = ranked_rows(table, col);
            let rank = ranked.iter().position(|(r, _, _)| *r == row).map_or(0, |p| p + 1);
            ProfileItem {
                column: column.clone(),
                value: table.value(row, column).cloned().unwrap_or_default(),
                rank,
                of: ranked.len(),
            }
        })
        .collect();
    Ok(Profile {
        entity: entity.to_string(),
        items,
    })
}
