//! Configuration file support for ptyshot.
//!
//! Defaults for every capture option can be kept in `~/.ptyshot/config.toml`;
//! command-line flags override them.
//!
//! ```toml
//! cols = 120
//! rows = 40
//! delay = "1s"
//! stable_time = "300ms"
//! timeout = "1m"
//! format = "json"
//! env = ["NO_COLOR=1"]
//! log_level = "debug"
//! log_file = "/tmp/ptyshot.log"
//! ```
//!
//! Durations are written as `<number><unit>` with unit `ms`, `s` or `m`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::capture::OutputFormat;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration {0:?} (expected e.g. 250ms, 1.5s, 2m)")]
    InvalidDuration(String),
}

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cols: usize,
    pub rows: usize,
    /// Initial delay before anything else happens
    #[serde(with = "duration_str")]
    pub delay: Duration,
    #[serde(with = "duration_str")]
    pub stable_timeout: Duration,
    /// How long the screen must stay unchanged
    #[serde(with = "duration_str")]
    pub stable_time: Duration,
    /// Overall deadline for a capture
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    #[serde(with = "duration_str")]
    pub input_delay: Duration,
    pub format: OutputFormat,
    pub trim: bool,
    /// `KEY=VALUE` entries for the child's environment
    pub env: Vec<String>,
    /// Value of `TERM` for the child
    pub term: String,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            delay: Duration::from_millis(500),
            stable_timeout: Duration::from_secs(5),
            stable_time: Duration::from_millis(200),
            timeout: Duration::from_secs(30),
            input_delay: Duration::from_millis(50),
            format: OutputFormat::Text,
            trim: false,
            env: Vec::new(),
            term: "xterm-256color".to_string(),
            log_level: None,
            log_file: None,
        }
    }
}

impl Config {
    /// Load `explicit` if given (errors are fatal), else the default file.
    ///
    /// A missing or unreadable default file yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Some(path) = Self::default_path() {
            if path.exists() {
                if let Ok(config) = Self::load_from(&path) {
                    return Ok(config);
                }
            }
        }
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `~/.ptyshot/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".ptyshot").join("config.toml"))
    }
}

/// Parse `250ms`, `1.5s`, `2m` or a bare `0`
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(invalid)?;
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let scale = match unit {
        "ms" => 0.001,
        "s" => 1.0,
        "m" => 60.0,
        _ => return Err(invalid()),
    };
    Duration::try_from_secs_f64(value * scale).map_err(|_| invalid())
}

mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(de::Error::custom)
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration(" 0 ").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for bad in ["", "ms", "10", "10h", "1.2.3s", "-5s", "fast"] {
            assert!(
                matches!(parse_duration(bad), Err(ConfigError::InvalidDuration(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!((config.cols, config.rows), (80, 24));
        assert_eq!(config.delay, Duration::from_millis(500));
        assert_eq!(config.stable_timeout, Duration::from_secs(5));
        assert_eq!(config.stable_time, Duration::from_millis(200));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.input_delay, Duration::from_millis(50));
        assert_eq!(config.format, OutputFormat::Text);
        assert_eq!(config.term, "xterm-256color");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "cols = 120\ndelay = \"1s\"\nformat = \"json\"\nenv = [\"NO_COLOR=1\"]"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.cols, 120);
        assert_eq!(config.rows, 24);
        assert_eq!(config.delay, Duration::from_secs(1));
        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(config.env, vec!["NO_COLOR=1".to_string()]);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_bad_duration_in_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "stable_time = \"soon\"").unwrap();
        assert!(matches!(
            Config::load_from(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }
}
