//! Configuration management for Speedrack.
//!
//! This module defines the structure of the `speedrack.toml` settings file
//! and provides functionality to locate, load and parse it. Every key is
//! optional; `main` merges the file with command-line flags.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::process::OutputFormat;

const CONFIG_FILE: &str = "speedrack.toml";

/// Top-level configuration structure corresponding to `speedrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Copy the report to the clipboard when a test completes (default: true).
    pub copy_to_clipboard: Option<bool>,
    /// Ring the terminal bell when a test completes (default: true).
    pub show_notifications: Option<bool>,
    /// Append completed tests to the history file (default: true).
    pub save_history: Option<bool>,
    /// Server to test against instead of the tool's pick.
    pub preferred_server_id: Option<u64>,
    /// Path to the speed-test executable.
    pub cli_path: Option<String>,
    /// Extra arguments for the tool, split like a shell would.
    pub extra_args: Option<String>,
    /// Output mode requested from the tool ("json" or "human").
    pub output: Option<String>,
    /// Seconds before a run is stopped; 0 disables the limit.
    pub timeout_secs: Option<u64>,
    /// Milliseconds the tool gets to exit after a cancel before it is killed.
    pub grace_ms: Option<u64>,
    /// Maximum number of output lines kept in memory.
    pub max_lines: Option<usize>,
    /// Format numbers with a decimal comma.
    pub decimal_comma: Option<bool>,
    /// Where to keep the history file.
    pub history_file: Option<PathBuf>,
}

impl Config {
    pub fn output_format(&self) -> Result<Option<OutputFormat>> {
        self.output
            .as_deref()
            .map(|value| {
                OutputFormat::parse(value).ok_or_else(|| anyhow!("invalid output mode: {}", value))
            })
            .transpose()
    }

    pub fn extra_args(&self) -> Result<Vec<String>> {
        match self.extra_args.as_deref() {
            Some(raw) => shell_words::split(raw).context("failed to parse extra_args"),
            None => Ok(Vec::new()),
        }
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// `./speedrack.toml` if present, else the per-user config file if present.
pub fn default_config_path() -> Option<PathBuf> {
    let local = Path::new(CONFIG_FILE);
    if local.exists() {
        return Some(local.to_path_buf());
    }
    config_dir()
        .map(|dir| dir.join("speedrack").join(CONFIG_FILE))
        .filter(|path| path.exists())
}

fn config_dir() -> Option<PathBuf> {
    if let Ok(path) = env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(path));
    }
    if cfg!(windows) {
        return env::var("APPDATA").ok().map(PathBuf::from);
    }
    env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
copy_to_clipboard = false
show_notifications = true
save_history = false
preferred_server_id = 2445
cli_path = "/opt/ookla/speedtest"
extra_args = "--interface eth0 --ip '10.0.0.2'"
output = "human"
timeout_secs = 90
grace_ms = 1500
max_lines = 200
decimal_comma = true
history_file = "speed/history.json"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.copy_to_clipboard, Some(false));
        assert_eq!(config.show_notifications, Some(true));
        assert_eq!(config.save_history, Some(false));
        assert_eq!(config.preferred_server_id, Some(2445));
        assert_eq!(config.cli_path.as_deref(), Some("/opt/ookla/speedtest"));
        assert_eq!(
            config.extra_args().unwrap(),
            vec!["--interface", "eth0", "--ip", "10.0.0.2"]
        );
        assert_eq!(config.output_format().unwrap(), Some(OutputFormat::Human));
        assert_eq!(config.timeout_secs, Some(90));
        assert_eq!(config.grace_ms, Some(1500));
        assert_eq!(config.max_lines, Some(200));
        assert_eq!(config.decimal_comma, Some(true));
        assert_eq!(
            config.history_file.as_deref(),
            Some(Path::new("speed/history.json"))
        );
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.copy_to_clipboard.is_none());
        assert_eq!(config.output_format().unwrap(), None);
        assert!(config.extra_args().unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_values() {
        let config: Config = toml::from_str(r#"output = "xml""#).unwrap();
        assert!(config.output_format().is_err());
        let config: Config = toml::from_str(r#"extra_args = "'unterminated""#).unwrap();
        assert!(config.extra_args().is_err());
        assert!(toml::from_str::<Config>("unknown_key = 1").is_err());
    }
}
