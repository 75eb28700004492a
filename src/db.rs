use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::error::Result;
use crate::models::{Scalar, TargetTable, UpdateMode};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY,
    created_at TEXT DEFAULT (datetime('now')),
    source_name TEXT NOT NULL,
    source_checksum TEXT,
    target_name TEXT NOT NULL,
    target_column TEXT NOT NULL,
    mode TEXT NOT NULL,
    inserted INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    header_json TEXT NOT NULL,
    rows_json TEXT NOT NULL
);
";

pub type RunId = i64;

/// Provenance of a processed table.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMeta {
    pub source_name: String,
    pub source_checksum: Option<String>,
    pub target_name: String,
    pub target_column: String,
    pub mode: UpdateMode,
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: RunId,
    pub created_at: String,
    pub meta: RunMeta,
    pub entities: usize,
}

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Store `table` as the newest run. One INSERT, so readers see either the
/// previous latest run or this one.
pub fn put_latest(conn: &Connection, table: &TargetTable, meta: &RunMeta) -> Result<RunId> {
    let header_json = serde_json::to_string(&table.header)?;
    let rows_json = serde_json::to_string(&table.rows)?;
    conn.execute(
        "INSERT INTO runs (source_name, source_checksum, target_name, target_column, mode, inserted, updated, header_json, rows_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            meta.source_name,
            meta.source_checksum,
            meta.target_name,
            meta.target_column,
            meta.mode.as_str(),
            meta.inserted as i64,
            meta.updated as i64,
            header_json,
            rows_json,
        ],
    )?;
    let id = conn.last_insert_rowid();
    info!(id, entities = table.rows.len(), "cached run");
    Ok(id)
}

pub fn get_latest(conn: &Connection) -> Result<Option<(TargetTable, RunRecord)>> {
    let found = conn
        .query_row(
            "SELECT id, created_at, source_name, source_checksum, target_name, target_column, mode, inserted, updated, header_json, rows_json
             FROM runs ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                let header_json: String = row.get(9)?;
                let rows_json: String = row.get(10)?;
                Ok((run_from_row(row)?, header_json, rows_json))
            },
        )
        .optional()?;
    let Some((mut record, header_json, rows_json)) = found else {
        return Ok(None);
    };
    let header: Vec<String> = serde_json::from_str(&header_json)?;
    let rows: Vec<Vec<Scalar>> = serde_json::from_str(&rows_json)?;
    let mut table = TargetTable::new(header);
    for row in rows {
        table.push_row(row);
    }
    record.entities = table.rows.len();
    Ok(Some((table, record)))
}

/// Newest first.
pub fn list_runs(conn: &Connection, limit: usize) -> Result<Vec<RunRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, created_at, source_name, source_checksum, target_name, target_column, mode, inserted, updated,
                json_array_length(rows_json)
         FROM runs ORDER BY id DESC LIMIT ?1",
    )?;
    let runs = stmt
        .query_map([limit as i64], |row| {
            let mut record = run_from_row(row)?;
            record.entities = row.get::<_, i64>(9)? as usize;
            Ok(record)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(runs)
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let mode: String = row.get(6)?;
    Ok(RunRecord {
        id: row.get(0)?,
        created_at: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        meta: RunMeta {
            source_name: row.get(2)?,
            source_checksum: row.get(3)?,
            target_name: row.get(4)?,
            target_column: row.get(5)?,
            mode: UpdateMode::parse(&mode).unwrap_or(UpdateMode::Add),
            inserted: row.get::<_, i64>(7)? as usize,
            updated: row.get::<_, i64>(8)? as usize,
        },
        entities: 0,
    })
}
