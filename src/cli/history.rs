use comfy_table::{Cell, Table};

use crate::db::list_runs;
use crate::error::Result;
use crate::settings::load_settings;

pub fn run(limit: usize) -> Result<()> {
    let conn = super::open_cache(&load_settings())?;
    let runs = list_runs(&conn, limit)?;
    if runs.is_empty() {
        println!("No cached runs.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "ID", "When", "Source", "Target", "Column", "Mode", "Updated", "Inserted", "Entities",
    ]);
    for run in runs {
        table.add_row(vec![
            Cell::new(run.id),
            Cell::new(run.created_at),
            Cell::new(run.meta.source_name),
            Cell::new(run.meta.target_name),
            Cell::new(run.meta.target_column),
            Cell::new(run.meta.mode),
            Cell::new(run.meta.updated),
            Cell::new(run.meta.inserted),
            Cell::new(run.entities),
        ]);
    }
    println!("Runs\n{table}");
    Ok(())
}
