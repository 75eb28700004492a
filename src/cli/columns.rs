use std::path::Path;

use comfy_table::{Cell, Table};

use crate::document::Document;
use crate::error::Result;
use crate::importer::read_target_from;

pub fn run(target: &Path) -> Result<()> {
    let bytes = std::fs::read(target)?;
    let table = read_target_from(&bytes, target)?;
    let sheets = Document::load(&bytes, target)?.sheet_names()?;

    let mut out = Table::new();
    out.set_header(vec!["#", "Column", "Filled"]);
    for (i, column) in table.category_columns().iter().enumerate() {
        let col = i + 1;
        let filled = table
            .rows
            .iter()
            .filter(|row| row.get(col).is_some_and(|v| !v.is_blank()))
            .count();
        out.add_row(vec![Cell::new(col), Cell::new(column), Cell::new(filled)]);
    }

    println!("Sheets:     {}", sheets.join(", "));
    println!("Key column: {}", table.key_column().unwrap_or_default());
    println!("Selectable columns\n{out}");
    Ok(())
}
