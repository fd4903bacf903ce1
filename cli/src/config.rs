// Settings file handling for the blebridge CLI
//
// Settings are JSON (see `BridgeSettings`). Lookup order:
// - `--config <FILE>` when given (must exist)
// - <config_dir>/blebridge/config.json when present
//   (macOS: ~/Library/Application Support, Linux: ~/.config, Windows: %APPDATA%)
// - built-in defaults
// Command-line flags are applied on top.

use anyhow::{Context, Result};
use blebridge_core::BridgeSettings;
use std::path::{Path, PathBuf};

/// Default settings file location, if the platform has a config directory
pub fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("blebridge").join("config.json"))
}

/// Read settings from `path`
pub fn load_file(path: &Path) -> Result<BridgeSettings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    BridgeSettings::from_json(&contents)
        .with_context(|| format!("Invalid settings file {}", path.display()))
}

/// Resolve settings from an explicit file, the default file, or defaults
pub fn load_settings(explicit: Option<&Path>) -> Result<(BridgeSettings, Option<PathBuf>)> {
    if let Some(path) = explicit {
        return Ok((load_file(path)?, Some(path.to_path_buf())));
    }

    match default_config_file() {
        Some(path) if path.exists() => Ok((load_file(&path)?, Some(path))),
        _ => Ok((BridgeSettings::default(), None)),
    }
}

/// Values from the command line that take precedence over the file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub queue_capacity: Option<usize>,
    pub threshold: Option<f64>,
    pub min_write_interval_ms: Option<u64>,
}

impl Overrides {
    pub fn apply(&self, mut settings: BridgeSettings) -> Result<BridgeSettings> {
        if let Some(capacity) = self.queue_capacity {
            settings.queue_capacity = capacity;
        }
        if let Some(threshold) = self.threshold {
            settings.threshold = threshold;
        }
        if let Some(interval) = self.min_write_interval_ms {
            settings.write_rate_limit.min_interval_ms = interval;
        }
        settings
            .validate()
            .context("Invalid command-line setting")?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_settings(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_explicit_file() {
        let file = write_settings(r#"{ "queue_capacity": 16, "threshold": 0.8 }"#);
        let (settings, source) = load_settings(Some(file.path())).unwrap();

        assert_eq!(settings.queue_capacity, 16);
        assert_eq!(settings.threshold, 0.8);
        assert_eq!(settings.drain_grace_ms, 3_000);
        assert_eq!(source.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(load_settings(Some(&missing)).is_err());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let file = write_settings(r#"{ "write_rate_limit": { "burst": 0 } }"#);
        let err = load_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid settings file"));
    }

    #[test]
    fn test_overrides_win() {
        let overrides = Overrides {
            queue_capacity: Some(8),
            threshold: None,
            min_write_interval_ms: Some(100),
        };
        let settings = overrides.apply(BridgeSettings::default()).unwrap();

        assert_eq!(settings.queue_capacity, 8);
        assert_eq!(settings.threshold, 0.50);
        assert_eq!(settings.write_rate_limit.min_interval_ms, 100);
    }

    #[test]
    fn test_overrides_are_validated() {
        let overrides = Overrides {
            queue_capacity: Some(0),
            ..Overrides::default()
        };
        assert!(overrides.apply(BridgeSettings::default()).is_err());

        let overrides = Overrides {
            threshold: Some(f64::NAN),
            ..Overrides::default()
        };
        assert!(overrides.apply(BridgeSettings::default()).is_err());
    }

    #[test]
    fn test_settings_file_roundtrip() {
        let mut settings = BridgeSettings::default();
        settings.command_keyword = "LED".to_string();
        let file = write_settings(&settings.to_json_pretty().unwrap());

        assert_eq!(load_file(file.path()).unwrap(), settings);
    }
}
