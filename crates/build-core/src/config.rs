//! Configuration parsing for the build daemon.
//!
//! Uses a key=value format: one setting per line, `#` comments, optional
//! quotes around values. Precedence: CLI flags > `--config` file > defaults.

use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use crate::types::ErrorCategory;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid category priority: {0}")]
    InvalidPriority(String),
}

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Retry policy
    pub per_category_retry_cap: u32,
    pub global_retry_cap: u32,
    /// Evaluation order when several categories fail at once, highest first.
    pub category_priority: Vec<ErrorCategory>,

    // Bounded waits
    pub stage_timeout_sec: u64,
    pub session_timeout_sec: u64,

    // Sessions
    pub session_ttl_sec: u64,
    pub session_template: String,
    pub preview_port: u16,
    pub post_restore_cmds: Vec<String>,

    // Stages
    pub validate_cmds: Vec<String>,
    pub essential_files: Vec<String>,

    // Snapshots and file listing
    pub snapshot_paths: Vec<String>,
    pub excluded_dirs: Vec<String>,
    pub excluded_files: Vec<String>,
    pub speculative_snapshot: bool,

    // Event delivery
    pub event_buffer_depth: usize,
    pub subscriber_send_timeout_ms: u64,

    // Reasoning backend
    pub agent_cmd: String,
    pub agent_model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            per_category_retry_cap: 3,
            global_retry_cap: 10,
            category_priority: vec![
                ErrorCategory::Runtime,
                ErrorCategory::Validation,
                ErrorCategory::Import,
            ],
            stage_timeout_sec: 600,
            session_timeout_sec: 120,
            session_ttl_sec: 1800,
            session_template: "react-vite".to_string(),
            preview_port: 5173,
            post_restore_cmds: vec!["rm -rf node_modules/.vite-temp".to_string()],
            validate_cmds: vec!["npm run build".to_string()],
            essential_files: split_list("src/App.jsx src/main.jsx package.json"),
            snapshot_paths: split_list("src public package.json index.html"),
            excluded_dirs: split_list("node_modules .git __pycache__ .next dist build .venv venv"),
            excluded_files: split_list(".DS_Store package-lock.json yarn.lock"),
            speculative_snapshot: true,
            event_buffer_depth: 256,
            subscriber_send_timeout_ms: 5000,
            agent_cmd: "claude".to_string(),
            agent_model: "sonnet".to_string(),
        }
    }
}

impl Config {
    /// Load config from a file, layered over defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge config from a file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, &path.display().to_string())
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str, source: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, source)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str, source: &str) -> Result<(), ConfigError> {
        match key {
            "per_category_retry_cap" => self.per_category_retry_cap = Self::parse_int(key, value)?,
            "global_retry_cap" => self.global_retry_cap = Self::parse_int(key, value)?,
            "category_priority" => self.category_priority = Self::parse_priority(value)?,
            "stage_timeout_sec" => self.stage_timeout_sec = Self::parse_int(key, value)?,
            "session_timeout_sec" => self.session_timeout_sec = Self::parse_int(key, value)?,
            "session_ttl_sec" => self.session_ttl_sec = Self::parse_int(key, value)?,
            "session_template" => self.session_template = value.to_string(),
            "preview_port" => self.preview_port = Self::parse_int(key, value)?,
            // Pipe-separated lists of shell commands
            "post_restore_cmds" => self.post_restore_cmds = split_commands(value),
            "validate_cmds" => self.validate_cmds = split_commands(value),
            "essential_files" => self.essential_files = split_list(value),
            "snapshot_paths" => self.snapshot_paths = split_list(value),
            "excluded_dirs" => self.excluded_dirs = split_list(value),
            "excluded_files" => self.excluded_files = split_list(value),
            "speculative_snapshot" => self.speculative_snapshot = Self::parse_bool(key, value)?,
            "event_buffer_depth" => self.event_buffer_depth = Self::parse_int(key, value)?,
            "subscriber_send_timeout_ms" => {
                self.subscriber_send_timeout_ms = Self::parse_int(key, value)?;
            }
            "agent_cmd" => self.agent_cmd = value.to_string(),
            "agent_model" => self.agent_model = value.to_string(),
            _ => {
                // Unknown keys warn but don't fail, so older daemons accept newer files.
                eprintln!("Warning: unknown config key in {source}: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Parse a priority list. Every category must appear exactly once.
    fn parse_priority(value: &str) -> Result<Vec<ErrorCategory>, ConfigError> {
        let mut order = Vec::with_capacity(ErrorCategory::ALL.len());
        for token in split_list(value) {
            let category = ErrorCategory::parse(&token)
                .ok_or_else(|| ConfigError::InvalidPriority(format!("unknown category '{token}'")))?;
            if order.contains(&category) {
                return Err(ConfigError::InvalidPriority(format!(
                    "category '{token}' listed twice"
                )));
            }
            order.push(category);
        }
        if order.len() != ErrorCategory::ALL.len() {
            return Err(ConfigError::InvalidPriority(format!(
                "expected all of import, validation, runtime, got '{value}'"
            )));
        }
        Ok(order)
    }
}

/// Split on whitespace, commas, or pipes.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c.is_whitespace() || c == ',' || c == '|')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_commands(value: &str) -> Vec<String> {
    value
        .split('|')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_limits() {
        let config = Config::default();
        assert_eq!(config.per_category_retry_cap, 3);
        assert_eq!(config.global_retry_cap, 10);
        assert_eq!(
            config.category_priority,
            vec![
                ErrorCategory::Runtime,
                ErrorCategory::Validation,
                ErrorCategory::Import
            ]
        );
        assert_eq!(config.stage_timeout_sec, 600);
        assert_eq!(config.session_ttl_sec, 1800);
        assert_eq!(config.preview_port, 5173);
        assert!(config.excluded_dirs.contains(&"node_modules".to_string()));
        assert!(config.speculative_snapshot);
    }

    #[test]
    fn parses_key_value_lines() {
        let mut config = Config::default();
        let content = r#"
# retry tuning
per_category_retry_cap=2
global_retry_cap = 5
session_template="node-basic"
validate_cmds=npm run lint | npm run build
essential_files='index.html, src/main.ts'
speculative_snapshot=off
"#;
        config.parse_content(content, "test").unwrap();
        assert_eq!(config.per_category_retry_cap, 2);
        assert_eq!(config.global_retry_cap, 5);
        assert_eq!(config.session_template, "node-basic");
        assert_eq!(config.validate_cmds, vec!["npm run lint", "npm run build"]);
        assert_eq!(config.essential_files, vec!["index.html", "src/main.ts"]);
        assert!(!config.speculative_snapshot);
    }

    #[test]
    fn parses_category_priority() {
        let mut config = Config::default();
        config
            .parse_content("category_priority=import validation runtime", "test")
            .unwrap();
        assert_eq!(
            config.category_priority,
            vec![
                ErrorCategory::Import,
                ErrorCategory::Validation,
                ErrorCategory::Runtime
            ]
        );
    }

    #[test]
    fn rejects_incomplete_or_duplicate_priority() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("category_priority=runtime import", "test"),
            Err(ConfigError::InvalidPriority(_))
        ));
        assert!(matches!(
            config.parse_content("category_priority=runtime runtime import", "test"),
            Err(ConfigError::InvalidPriority(_))
        ));
        assert!(matches!(
            config.parse_content("category_priority=runtime network import", "test"),
            Err(ConfigError::InvalidPriority(_))
        ));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("global_retry_cap=lots", "test"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.parse_content("speculative_snapshot=maybe", "test"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(matches!(
            config.parse_content("no equals sign here", "test"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("future_knob=1", "test").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buildd.conf");
        std::fs::write(&path, "preview_port=3000\nevent_buffer_depth=16\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.preview_port, 3000);
        assert_eq!(config.event_buffer_depth, 16);
    }
}
