use std::path::Path;

use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::db::get_latest;
use crate::error::{RecapError, Result};
use crate::fmt::{cell, number};
use crate::importer::read_target_file;
use crate::models::TargetTable;
use crate::reports;
use crate::settings::load_settings;

/// The table to report on: `file` if given, else the latest cached run.
fn load_table(file: Option<&Path>) -> Result<(TargetTable, String)> {
    if let Some(path) = file {
        return Ok((read_target_file(path)?, path.display().to_string()));
    }
    let conn = super::open_cache(&load_settings())?;
    match get_latest(&conn)? {
        Some((table, record)) => {
            let label = format!(
                "run #{} ({}, {} {})",
                record.id, record.created_at, record.meta.target_column, record.meta.mode
            );
            Ok((table, label))
        }
        None => Err(RecapError::Other(
            "No processed table yet. Run `recap process` first or pass --file.".to_string(),
        )),
    }
}

pub fn summary(file: Option<&Path>) -> Result<()> {
    let (table, label) = load_table(file)?;
    let s = reports::summary(&table);

    let mut out = Table::new();
    out.set_header(vec!["Column", "Filled", "Total", "Mean", "Max"]);
    for col in &s.columns {
        let max = col
            .max
            .as_ref()
            .map(|(entity, value)| format!("{} ({entity})", number(*value)))
            .unwrap_or_default();
        out.add_row(vec![
            Cell::new(&col.column),
            Cell::new(col.non_blank),
            Cell::new(number(col.total)),
            Cell::new(number(col.mean)),
            Cell::new(max),
        ]);
    }
    println!("{} {label}", "Summary".bold());
    println!("Entities: {}\n{out}", s.entities);
    Ok(())
}

pub fn rank(file: Option<&Path>, column: &str, top: Option<usize>) -> Result<()> {
    let (table, label) = load_table(file)?;
    let n = top.unwrap_or_else(|| load_settings().top_n);
    let ranked = reports::ranking(&table, column, n)?;

    let mut out = Table::new();
    out.set_header(vec!["#", "Entity", column]);
    for entry in &ranked {
        out.add_row(vec![
            Cell::new(entry.rank),
            Cell::new(&entry.entity),
            Cell::new(number(entry.value)),
        ]);
    }
    println!("{} {label}\n{out}", format!("Top {n} by {column}").bold());
    Ok(())
}

pub fn compare(file: Option<&Path>, columns: &[String], entities: &[String]) -> Result<()> {
    let (table, label) = load_table(file)?;
    let comparison = reports::compare(&table, columns, entities)?;

    let mut out = Table::new();
    let mut header = vec![table.key_column().unwrap_or_default().to_string()];
    header.extend(comparison.columns.iter().cloned());
    out.set_header(header);
    for (entity, values) in &comparison.rows {
        let mut row = vec![Cell::new(entity)];
        row.extend(values.iter().map(|v| Cell::new(number(*v))));
        out.add_row(row);
    }
    println!("{} {label}\n{out}", "Comparison".bold());
    Ok(())
}

pub fn profile(file: Option<&Path>, entity: &str) -> Result<()> {
    let (table, label) = load_table(file)?;
    let p = reports::profile(&table, entity)?;

    let mut out = Table::new();
    out.set_header(vec!["Column", "Value", "Rank"]);
    for item in &p.items {
        out.add_row(vec![
            Cell::new(&item.column),
            Cell::new(cell(&item.value)),
            Cell::new(format!("{} of {}", item.rank, item.of)),
        ]);
    }
    println!("{} {label}\n{out}", p.entity.bold());
    Ok(())
}
