use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RecapError, Result};
use crate::models::UpdateMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    #[serde(default = "default_mode")]
    pub default_mode: UpdateMode,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_mode() -> UpdateMode {
    UpdateMode::Add
}

fn default_top_n() -> usize {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            default_mode: default_mode(),
            top_n: default_top_n(),
        }
    }
}

impl Settings {
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_path().join("recap.db")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.data_path().join("outputs")
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("recap")
}

pub fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("recap")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if !path.exists() {
        return Settings::default();
    }
    let content = std::fs::read_to_string(&path).unwrap_or_default();
    match serde_json::from_str(&content) {
        Ok(settings) => settings,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable settings, using defaults");
            Settings::default()
        }
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| RecapError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn settings_file_exists() -> bool {
    settings_path().exists()
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_roundtrip() {
        let settings = Settings {
            data_dir: "/tmp/test".to_string(),
            default_mode: UpdateMode::Replace,
            top_n: 5,
        };
        let json = serde_json::to_string_pretty(&settings).unwrap();
        assert!(json.contains(r#""default_mode": "replace""#));
        let loaded: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.data_dir, "/tmp/test");
        assert_eq!(loaded.default_mode, UpdateMode::Replace);
        assert_eq!(loaded.top_n, 5);
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.default_mode, UpdateMode::Add);
        assert_eq!(s.top_n, 10);
        assert!(s.data_dir.ends_with("recap"));
        assert!(s.db_path().ends_with("recap.db"));
        assert!(s.outputs_dir().ends_with("outputs"));
    }

    #[test]
    fn test_load_merges_with_defaults() {
        let json = r#"{"data_dir": "/tmp/test"}"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.default_mode, UpdateMode::Add);
        assert_eq!(s.top_n, 10);
    }

    #[test]
    fn test_shellexpand_plain_path() {
        let dir = tempfile::tempdir().unwrap();
        let expanded = shellexpand_path(&dir.path().to_string_lossy());
        assert_eq!(
            PathBuf::from(expanded),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }
}
