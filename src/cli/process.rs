use std::path::PathBuf;

use colored::Colorize;
use comfy_table::{Cell, Table};
use tracing::{debug, warn};

use crate::aggregator::aggregate;
use crate::db::{put_latest, RunMeta};
use crate::document::{Document, DocumentKind};
use crate::error::Result;
use crate::fmt::{cell, file_size, number};
use crate::importer::{compute_checksum, read_source, read_target_from};
use crate::models::{
    CountMap, Outcome, ReconcileLog, TargetTable, UpdateMode, COURSE_CODE, MASTER_SHEET, SITE_NAME,
    STUDENT_CODE,
};
use crate::reconciler::{classify, reconcile};
use crate::settings::load_settings;
use crate::writer::write_back;

pub struct ProcessArgs {
    pub source: PathBuf,
    pub target: PathBuf,
    pub column: String,
    pub mode: Option<UpdateMode>,
    pub output: Option<PathBuf>,
    pub dry_run: bool,
    pub no_cache: bool,
}

pub fn run(args: ProcessArgs) -> Result<()> {
    let settings = load_settings();
    let mode = args.mode.unwrap_or(settings.default_mode);

    let source = read_source(&args.source)?;
    let counts = aggregate(&source, STUDENT_CODE, COURSE_CODE, SITE_NAME)?;
    print_counts(&counts);

    let target_bytes = std::fs::read(&args.target)?;
    let target = read_target_from(&target_bytes, &args.target)?;
    let result = reconcile(&target, &counts, &args.column, mode)?;
    print_log(&result.log, &args.column, mode);
    print_preview(&result.table);
    let changes = classify(&target, &result.table);
    if !changes.inserted.is_empty() {
        println!("New entities: {}", changes.inserted.join(", "));
    }

    if args.dry_run {
        println!("{}", "Dry run: no workbook written, nothing cached.".yellow());
        return Ok(());
    }

    let mut doc = Document::load(&target_bytes, &args.target)?;
    debug!(parts = ?doc.part_names().collect::<Vec<_>>(), "target package");
    write_back(&mut doc, &result.table, MASTER_SHEET)?;
    let kind = doc.kind();
    let output = args
        .output
        .unwrap_or_else(|| settings.outputs_dir().join(format!("processed.{}", kind.extension())));
    if DocumentKind::from_path(&output) != Some(kind) {
        warn!(
            path = %output.display(),
            expected = kind.extension(),
            "output extension does not match the workbook type"
        );
    }
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    doc.save(&output)?;
    let size = std::fs::metadata(&output)?.len();
    println!(
        "{} {} ({}, {})",
        "Saved".green().bold(),
        output.display(),
        kind.mime_type(),
        file_size(size)
    );

    if !args.no_cache {
        let conn = super::open_cache(&settings)?;
        let meta = RunMeta {
            source_name: file_name(&args.source),
            source_checksum: Some(compute_checksum(&args.source)?),
            target_name: file_name(&args.target),
            target_column: args.column.clone(),
            mode,
            inserted: result.log.inserted(),
            updated: result.log.updated(),
        };
        let id = put_latest(&conn, &result.table, &meta)?;
        println!("Cached as run #{id}");
    }
    Ok(())
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_counts(counts: &CountMap) {
    let mut table = Table::new();
    table.set_header(vec![SITE_NAME, "Count"]);
    for (site, count) in counts.iter() {
        table.add_row(vec![Cell::new(site), Cell::new(count)]);
    }
    table.add_row(vec![Cell::new("Total".bold()), Cell::new(counts.total())]);
    println!("Qualifying records\n{table}");
}

fn print_log(log: &ReconcileLog, column: &str, mode: UpdateMode) {
    let mut table = Table::new();
    table.set_header(vec!["Row", "Key", "Count", "Before", "After", "Outcome"]);
    for entry in &log.entries {
        // Table rows sit below the header, so table row 0 is sheet row 2.
        let (row, before, outcome) = match &entry.outcome {
            Outcome::Updated { row, previous } => (row + 2, cell(previous), "updated".yellow()),
            Outcome::Inserted { row } => (row + 2, String::new(), "inserted".green()),
        };
        table.add_row(vec![
            Cell::new(row),
            Cell::new(&entry.key),
            Cell::new(number(entry.count as f64)),
            Cell::new(before),
            Cell::new(cell(&entry.value)),
            Cell::new(outcome),
        ]);
    }
    println!("{column} ({mode}): {} updated, {} inserted\n{table}", log.updated(), log.inserted());
}

fn print_preview(result: &TargetTable) {
    let mut table = Table::new();
    table.set_header(result.header.clone());
    for row in &result.rows {
        table.add_row(row.iter().map(|v| Cell::new(cell(v))).collect::<Vec<_>>());
    }
    println!("Preview\n{table}");
}
