//! Staged launch configuration for a run.
//!
//! The launch configuration is a JSON document written into the run
//! directory before `start` is called. The supervisor only reads the
//! `time_config` block; everything else is passed through to the worker.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

/// Simulated hours when `time_config.total_simulation_hours` is absent.
pub const DEFAULT_TOTAL_SIMULATION_HOURS: f64 = 72.0;
/// Minutes per round when `time_config.minutes_per_round` is absent.
pub const DEFAULT_MINUTES_PER_ROUND: f64 = 30.0;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("launch configuration not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read launch configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid launch configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The parts of a launch configuration the supervisor cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Absolute path handed to the worker via `--config`.
    pub config_path: PathBuf,
    pub total_simulation_hours: f64,
    pub minutes_per_round: f64,
}

impl LaunchSpec {
    /// Load the launch configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, LaunchError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LaunchError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        let value: Value = serde_json::from_str(&content)?;
        let config_path = std::path::absolute(path)?;
        Ok(Self::from_value(config_path, &value))
    }

    /// Build from an already-parsed document.
    pub fn from_value(config_path: PathBuf, value: &Value) -> Self {
        let time_config = value.get("time_config");
        let number = |key: &str, default: f64| {
            time_config
                .and_then(|tc| tc.get(key))
                .and_then(Value::as_f64)
                .unwrap_or(default)
        };
        Self {
            config_path,
            total_simulation_hours: number("total_simulation_hours", DEFAULT_TOTAL_SIMULATION_HOURS),
            minutes_per_round: number("minutes_per_round", DEFAULT_MINUTES_PER_ROUND),
        }
    }

    /// `floor(total_hours * 60 / minutes_per_round)`; zero for degenerate input.
    pub fn total_rounds(&self) -> u32 {
        if self.minutes_per_round <= 0.0 || self.total_simulation_hours <= 0.0 {
            return 0;
        }
        let rounds = (self.total_simulation_hours * 60.0 / self.minutes_per_round).floor();
        if rounds >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            rounds as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_when_time_config_missing() {
        let spec = LaunchSpec::from_value(PathBuf::from("/x.json"), &serde_json::json!({}));
        assert!((spec.total_simulation_hours - 72.0).abs() < f64::EPSILON);
        assert!((spec.minutes_per_round - 30.0).abs() < f64::EPSILON);
        assert_eq!(spec.total_rounds(), 144);
    }

    #[test]
    fn total_rounds_floors() {
        let spec = LaunchSpec::from_value(
            PathBuf::from("/x.json"),
            &serde_json::json!({"time_config": {"total_simulation_hours": 1, "minutes_per_round": 45}}),
        );
        assert_eq!(spec.total_rounds(), 1);
    }

    #[test]
    fn degenerate_time_config_yields_zero_rounds() {
        let spec = LaunchSpec::from_value(
            PathBuf::from("/x.json"),
            &serde_json::json!({"time_config": {"total_simulation_hours": 1, "minutes_per_round": 0}}),
        );
        assert_eq!(spec.total_rounds(), 0);

        let spec = LaunchSpec::from_value(
            PathBuf::from("/x.json"),
            &serde_json::json!({"time_config": {"total_simulation_hours": 0.2, "minutes_per_round": 30}}),
        );
        assert_eq!(spec.total_rounds(), 0);
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let result = LaunchSpec::load(&dir.path().join("simulation_config.json"));
        assert!(matches!(result, Err(LaunchError::NotFound(_))));
    }

    #[test]
    fn load_invalid_json_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("simulation_config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(LaunchSpec::load(&path), Err(LaunchError::Parse(_))));
    }

    #[test]
    fn load_resolves_absolute_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("simulation_config.json");
        std::fs::write(
            &path,
            r#"{"simulation_id": "sim-1", "time_config": {"total_simulation_hours": 2, "minutes_per_round": 60}}"#,
        )
        .unwrap();
        let spec = LaunchSpec::load(&path).unwrap();
        assert!(spec.config_path.is_absolute());
        assert_eq!(spec.total_rounds(), 2);
    }
}
