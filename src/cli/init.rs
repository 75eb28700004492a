use colored::Colorize;

use crate::error::Result;
use crate::settings::{load_settings, save_settings, shellexpand_path};

pub fn run(data_dir: Option<String>) -> Result<()> {
    let mut settings = load_settings();
    if let Some(dir) = data_dir {
        settings.data_dir = shellexpand_path(&dir);
    }

    std::fs::create_dir_all(settings.outputs_dir())?;
    super::open_cache(&settings)?;
    save_settings(&settings)?;

    println!("{} {}", "Initialized".green().bold(), settings.data_path().display());
    println!("Run cache:  {}", settings.db_path().display());
    println!("Outputs:    {}", settings.outputs_dir().display());
    Ok(())
}
