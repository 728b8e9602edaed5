//! Configuration parsing for the simulation supervisor.
//!
//! Plain key=value file, `#` comments, optional quotes around values.
//! Precedence: CLI flags > `--config` file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::types::DEFAULT_RECENT_ACTIONS_CAPACITY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Supervisor configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Layout
    /// Parent of every per-run directory (`runs_dir/<run_id>/`).
    pub runs_dir: PathBuf,
    pub launch_config_name: String,
    pub worker_log_name: String,
    pub actions_log_name: String,
    pub state_file_name: String,

    // Worker
    /// Executable launched for each run. Unset means runs cannot start.
    pub worker_bin: Option<PathBuf>,
    /// Arguments placed before `--config` (e.g. an interpreter's script path).
    pub worker_args: Vec<String>,
    /// Channel names a worker may drive.
    pub channels: Vec<String>,

    // Timing
    pub monitor_interval_ms: u64,
    pub stop_grace_sec: u64,
    pub kill_wait_sec: u64,
    pub shutdown_grace_sec: u64,

    // State
    pub recent_actions_capacity: usize,
    /// Characters of worker output kept in the error of a failed run.
    pub error_excerpt_chars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runs_dir: dirs::data_local_dir()
                .map_or_else(|| PathBuf::from("runs"), |d| d.join("simd/runs")),
            launch_config_name: "simulation_config.json".to_string(),
            worker_log_name: "simulation.log".to_string(),
            actions_log_name: "actions.jsonl".to_string(),
            state_file_name: "run_state.json".to_string(),
            worker_bin: None,
            worker_args: Vec::new(),
            channels: vec!["twitter".to_string(), "reddit".to_string()],
            monitor_interval_ms: 2000,
            stop_grace_sec: 10,
            kill_wait_sec: 5,
            shutdown_grace_sec: 5,
            recent_actions_capacity: DEFAULT_RECENT_ACTIONS_CAPACITY,
            error_excerpt_chars: 2000,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
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

            self.apply_value(key, &value)?;
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

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "runs_dir" => self.runs_dir = PathBuf::from(value),
            "launch_config_name" => self.launch_config_name = value.to_string(),
            "worker_log_name" => self.worker_log_name = value.to_string(),
            "actions_log_name" => self.actions_log_name = value.to_string(),
            "state_file_name" => self.state_file_name = value.to_string(),
            "worker_bin" => {
                self.worker_bin = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "worker_args" => {
                self.worker_args = value.split_whitespace().map(str::to_string).collect();
            }
            "channels" => {
                let channels: Vec<String> = value
                    .split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_ascii_lowercase)
                    .collect();
                if channels.is_empty() {
                    return Err(ConfigError::InvalidLine(
                        "channels must name at least one channel".to_string(),
                    ));
                }
                self.channels = channels;
            }
            "monitor_interval_ms" => self.monitor_interval_ms = Self::parse_int(key, value)?,
            "stop_grace_sec" => self.stop_grace_sec = Self::parse_int(key, value)?,
            "kill_wait_sec" => self.kill_wait_sec = Self::parse_int(key, value)?,
            "shutdown_grace_sec" => self.shutdown_grace_sec = Self::parse_int(key, value)?,
            "recent_actions_capacity" => {
                self.recent_actions_capacity = Self::parse_int(key, value)?;
            }
            "error_excerpt_chars" => self.error_excerpt_chars = Self::parse_int(key, value)?,
            _ => warn!(key, "unknown config key"),
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Resolve a relative `runs_dir` against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.runs_dir.is_relative() {
            self.runs_dir = base.join(&self.runs_dir);
        }
    }

    // --- Derived paths and durations ---

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn launch_config_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(&self.launch_config_name)
    }

    pub fn worker_log_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(&self.worker_log_name)
    }

    /// Channel log: `<run_dir>/<channel>/<actions_log_name>`.
    pub fn channel_log_path(&self, run_id: &str, channel: &str) -> PathBuf {
        self.run_dir(run_id)
            .join(channel)
            .join(&self.actions_log_name)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_sec)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_secs(self.kill_wait_sec)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_sec)
    }
}
