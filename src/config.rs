use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Store location: a path, `sqlite://<path>` or `:memory:`.
    pub database_url: Option<String>,
    pub chrome_path: Option<PathBuf>,
    /// DevTools endpoint of an already running browser, e.g. `http://127.0.0.1:9222`.
    pub browser_url: Option<String>,
    pub headless: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            chrome_path: None,
            browser_url: None,
            headless: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

impl AppConfig {
    /// Reads `config.json` from the data directory (if any) and layers the
    /// environment on top of it.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = read_config(&utils::config_path())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty("EVENTS_DATABASE_URL").or_else(|| non_empty("DATABASE_URL")) {
            self.database_url = Some(url.trim().to_string());
        }
        if let Some(path) = non_empty("EVENTS_CHROME_PATH") {
            self.chrome_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(url) = non_empty("EVENTS_BROWSER_URL") {
            self.browser_url = Some(url.trim().to_string());
        }
        if let Some(raw) = non_empty("EVENTS_HEADLESS") {
            self.headless = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "EVENTS_HEADLESS",
                        value: raw,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn database_location(&self) -> DatabaseLocation {
        match self.database_url.as_deref() {
            None => DatabaseLocation::File(utils::database_path()),
            Some(":memory:") | Some("sqlite::memory:") => DatabaseLocation::Memory,
            Some(url) => {
                let path = url
                    .strip_prefix("sqlite://")
                    .or_else(|| url.strip_prefix("sqlite:"))
                    .unwrap_or(url);
                DatabaseLocation::File(PathBuf::from(path))
            }
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = AppConfig {
            database_url: Some("/tmp/from-file.sqlite".into()),
            ..AppConfig::default()
        };
        config
            .apply_env(env(&[
                ("EVENTS_DATABASE_URL", "sqlite:///var/lib/events.sqlite"),
                ("EVENTS_HEADLESS", "false"),
            ]))
            .expect("apply env");

        assert_eq!(
            config.database_location(),
            DatabaseLocation::File(PathBuf::from("/var/lib/events.sqlite"))
        );
        assert!(!config.headless);
    }

    #[test]
    fn falls_back_to_generic_database_url() {
        let mut config = AppConfig::default();
        config
            .apply_env(env(&[("DATABASE_URL", ":memory:")]))
            .expect("apply env");
        assert_eq!(config.database_location(), DatabaseLocation::Memory);
    }

    #[test]
    fn rejects_garbage_headless_flag() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(env(&[("EVENTS_HEADLESS", "sometimes")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn defaults_to_data_directory_store() {
        let config = AppConfig::default();
        assert_eq!(
            config.database_location(),
            DatabaseLocation::File(utils::database_path())
        );
        assert!(config.headless);
    }
}
