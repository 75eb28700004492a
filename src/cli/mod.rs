pub mod columns;
pub mod dashboard;
pub mod history;
pub mod init;
pub mod process;
pub mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rusqlite::Connection;

use crate::db::{get_connection, init_db};
use crate::error::Result;
use crate::models::UpdateMode;
use crate::settings::Settings;

#[derive(Parser)]
#[command(
    name = "recap",
    version,
    about = "Count enrolment extracts by site and merge them into a master workbook."
)]
pub struct Cli {
    /// Log more detail to stderr (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and initialize the run cache.
    Init {
        /// Path for recap data (default: ~/Documents/recap)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// List the columns of a master workbook that can receive counts.
    Columns {
        /// Master workbook (.xlsx or .xlsm)
        target: PathBuf,
    },
    /// Count an extract by site and merge the counts into a master workbook.
    Process {
        /// Raw extract (.csv, .xlsx, .xlsm); header on row 2
        source: PathBuf,
        /// Master workbook (.xlsx or .xlsm) with a "Master Sheet"
        target: PathBuf,
        /// Target column to update
        #[arg(long)]
        column: String,
        /// add: add counts to existing values; replace: overwrite them
        #[arg(long, value_enum)]
        mode: Option<UpdateMode>,
        /// Output path (default: <data_dir>/outputs/processed.<xlsx|xlsm>)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Show the merged table without writing a workbook or caching the run
        #[arg(long)]
        dry_run: bool,
        /// Do not store the result in the run cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Statistics over the latest processed table.
    Dashboard {
        /// Read this master workbook instead of the latest cached run
        #[arg(long, global = true)]
        file: Option<PathBuf>,
        #[command(subcommand)]
        command: DashboardCommands,
    },
    /// List cached runs, newest first.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show configuration and run cache statistics.
    Status,
}

#[derive(Subcommand)]
pub enum DashboardCommands {
    /// Entity count and per-column totals, means and maxima.
    Summary,
    /// Top entities for one column.
    Rank {
        column: String,
        /// Number of entities to show (default from settings)
        #[arg(long)]
        top: Option<usize>,
    },
    /// Side-by-side values for chosen entities and columns.
    Compare {
        /// Entities to compare (default: all)
        #[arg(long = "entity")]
        entities: Vec<String>,
        /// Columns to compare, comma separated (default: all)
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
    },
    /// Every value of one entity with its rank in each column.
    Profile { entity: String },
}

/// Open the run cache, creating the data directory and schema on first use.
pub(crate) fn open_cache(settings: &Settings) -> Result<Connection> {
    std::fs::create_dir_all(settings.data_path())?;
    let conn = get_connection(&settings.db_path())?;
    init_db(&conn)?;
    Ok(conn)
}
