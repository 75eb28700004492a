use crate::db::{get_connection, get_latest};
use crate::error::Result;
use crate::fmt::file_size;
use crate::settings::{load_settings, settings_file_exists, settings_path};

pub fn run() -> Result<()> {
    let settings = load_settings();
    let db_path = settings.db_path();

    let config = if settings_file_exists() {
        settings_path().display().to_string()
    } else {
        "(defaults)".to_string()
    };
    println!("Settings:   {config}");
    println!("Data dir:   {}", settings.data_path().display());
    println!("Outputs:    {}", settings.outputs_dir().display());
    println!("Mode:       {}", settings.default_mode);
    println!("Top N:      {}", settings.top_n);
    println!("Run cache:  {}", db_path.display());

    if db_path.exists() {
        let size = std::fs::metadata(&db_path)?.len();
        println!("Cache size: {}", file_size(size));

        let conn = get_connection(&db_path)?;
        let runs: i64 = conn.query_row("SELECT count(*) FROM runs", [], |r| r.get(0))?;
        println!();
        println!("Runs:       {runs}");
        if let Some((table, record)) = get_latest(&conn)? {
            println!(
                "Latest:     #{} {} -> {} [{}] ({} entities)",
                record.id,
                record.meta.source_name,
                record.meta.target_name,
                record.meta.target_column,
                table.rows.len()
            );
        }
    } else {
        println!();
        println!("Run cache not found. Run `recap init` to set up.");
    }

    Ok(())
}
