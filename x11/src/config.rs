use std::{env, fs, io, path::PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{CliError, IoErr};

#[must_use]
pub fn file() -> PathBuf {
    if let Some(s) = env::var_os("CLIPBOARD_MANAGER_CONFIG") {
        return PathBuf::from(s);
    }

    let mut file = dirs::config_local_dir().unwrap_or_else(|| PathBuf::from("/tmp/config"));
    file.reserve("/clipboard-manager/x11.toml".len());
    file.push("clipboard-manager");
    file.push("x11.toml");
    file
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct V1 {
    /// Display to connect to instead of `$DISPLAY`.
    #[serde(default)]
    pub display: Option<String>,
    /// Largest property write before switching to `INCR`.
    #[serde(default)]
    pub selection_max_size: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "version")]
pub enum Config {
    #[serde(rename = "1")]
    V1(V1),
}

impl Config {
    #[must_use]
    pub fn to_latest(self) -> Latest {
        match self {
            Self::V1(c) => c,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::V1(V1::default())
    }
}

pub type Latest = V1;

pub fn parse(contents: &str) -> Result<Latest, toml::de::Error> {
    toml::from_str::<Config>(contents).map(Config::to_latest)
}

pub fn load() -> Result<Latest, CliError> {
    let file = file();
    match fs::read_to_string(&file) {
        Ok(contents) => {
            debug!("Loading config from {file:?}.");
            parse(&contents).map_err(|error| CliError::Config { error, file })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No config file at {file:?}, using defaults.");
            Ok(Config::default().to_latest())
        }
        Err(e) => Err(e).map_io_err(|| format!("Failed to read config file: {file:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config() {
        let config = parse(
            r#"
            version = "1"
            display = ":1"
            selection_max_size = 4096
            "#,
        )
        .unwrap();

        assert_eq!(config.display.as_deref(), Some(":1"));
        assert_eq!(config.selection_max_size, Some(4096));
    }

    #[test]
    fn fields_are_optional() {
        assert_eq!(parse(r#"version = "1""#).unwrap(), V1::default());
    }

    #[test]
    fn version_is_required() {
        assert!(parse(r#"display = ":0""#).is_err());
        assert!(parse(r#"version = "2""#).is_err());
    }

    #[test]
    fn default_uses_display_env() {
        let config = Config::default().to_latest();
        assert!(config.display.is_none());
        assert!(config.selection_max_size.is_none());
    }

    #[test]
    fn file_lives_in_config_dir() {
        if env::var_os("CLIPBOARD_MANAGER_CONFIG").is_none() {
            assert!(file().ends_with("clipboard-manager/x11.toml"));
        }
    }
}
