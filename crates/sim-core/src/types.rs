//! Core types for the simulation supervisor.
//!
//! Run lifecycle, action records parsed from channel logs, and the per-run
//! state snapshot that is persisted to disk and served to clients.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default capacity of the recent-actions buffer.
pub const DEFAULT_RECENT_ACTIONS_CAPACITY: usize = 50;

/// Identifier of a run. Chosen by the caller that staged the launch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Accept an id that names exactly one directory under the runs dir.
    ///
    /// Rejects empty ids, `.`, `..`, and anything with a path separator or NUL.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = !s.is_empty()
            && s != "."
            && s != ".."
            && !s.contains(['/', '\\', '\0']);
        valid.then(|| Self(s.to_string()))
    }

    pub fn is_valid(&self) -> bool {
        Self::parse(&self.0).is_some()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Run lifecycle status.
///
/// Variants are declared in lifecycle order, so the derived ordering follows
/// `idle → starting → running → {paused, stopping} → {stopped, completed, failed}`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the wire representation (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    /// A worker has been (or is being) launched for this run.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// `stop` is only accepted from these states.
    pub fn is_stoppable(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: Self) -> bool {
        use RunStatus::{Completed, Failed, Idle, Paused, Running, Starting, Stopped, Stopping};
        match (self, next) {
            (Idle, Starting) => true,
            (Starting, Running | Failed) => true,
            (Running, Paused | Stopping | Completed | Failed) => true,
            (Paused, Stopping) => true,
            (Stopping, Stopped | Failed) => true,
            // A finished run may be launched again under the same id.
            (Stopped | Completed | Failed, Starting) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which channel(s) a worker should drive.
///
/// Serialized as `"parallel"` or the bare channel name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PlatformSelector {
    /// Every configured channel.
    #[default]
    Parallel,
    /// A single named channel.
    Only(String),
}

impl PlatformSelector {
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("parallel") {
            Self::Parallel
        } else {
            Self::Only(trimmed.to_ascii_lowercase())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Parallel => "parallel",
            Self::Only(channel) => channel,
        }
    }

    /// Resolve the selected channels against the configured set.
    ///
    /// Returns `None` when a single channel is requested that is not configured.
    pub fn resolve(&self, configured: &[String]) -> Option<Vec<String>> {
        match self {
            Self::Parallel => Some(configured.to_vec()),
            Self::Only(channel) => configured
                .iter()
                .any(|c| c == channel)
                .then(|| vec![channel.clone()]),
        }
    }
}

impl From<String> for PlatformSelector {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<PlatformSelector> for String {
    fn from(selector: PlatformSelector) -> Self {
        selector.as_str().to_string()
    }
}

// --- Records and state ---

/// One unit of worker activity, parsed from a channel log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub round: u32,
    /// Wall-clock time as written by the worker (ISO-8601).
    pub timestamp: String,
    /// Channel the record was read from.
    pub channel: String,
    pub actor_id: u64,
    pub actor_name: String,
    pub action_type: String,
    #[serde(default)]
    pub action_args: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub result: Option<String>,
    pub success: bool,
}

/// Per-channel progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Whether the worker is still expected to write to this channel.
    pub active: bool,
    pub actions_count: u64,
}

/// Mutable aggregate for one run. Persisted as `run_state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Id,
    pub status: RunStatus,
    #[serde(default)]
    pub platform: PlatformSelector,
    pub current_round: u32,
    pub total_rounds: u32,
    #[serde(default)]
    pub minutes_per_round: f64,
    #[serde(default)]
    pub total_simulation_hours: f64,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelState>,
    /// Newest first, never longer than `recent_actions_capacity`.
    #[serde(default)]
    pub recent_actions: VecDeque<ActionRecord>,
    #[serde(default = "default_recent_actions_capacity")]
    pub recent_actions_capacity: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub process_pid: Option<u32>,
}

fn default_recent_actions_capacity() -> usize {
    DEFAULT_RECENT_ACTIONS_CAPACITY
}

impl RunState {
    /// A fresh, idle state.
    pub fn new(run_id: Id, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: RunStatus::Idle,
            platform: PlatformSelector::Parallel,
            current_round: 0,
            total_rounds: 0,
            minutes_per_round: 0.0,
            total_simulation_hours: 0.0,
            channels: BTreeMap::new(),
            recent_actions: VecDeque::new(),
            recent_actions_capacity: DEFAULT_RECENT_ACTIONS_CAPACITY,
            started_at: None,
            updated_at: now,
            completed_at: None,
            error: None,
            process_pid: None,
        }
    }

    /// Refresh `updated_at`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Progress in percent (0-100), one decimal. Zero total rounds counts as one.
    pub fn progress_percent(&self) -> f64 {
        let ratio = f64::from(self.current_round) / f64::from(self.total_rounds.max(1));
        (ratio * 1000.0).round() / 10.0
    }

    /// Simulated hours elapsed, derived from the current round.
    pub fn simulated_hours(&self) -> f64 {
        f64::from(self.current_round) * self.minutes_per_round / 60.0
    }

    pub fn total_actions_count(&self) -> u64 {
        self.channels.values().map(|c| c.actions_count).sum()
    }

    /// Mark every channel inactive.
    pub fn clear_channel_flags(&mut self) {
        for channel in self.channels.values_mut() {
            channel.active = false;
        }
    }

    pub fn any_channel_active(&self) -> bool {
        self.channels.values().any(|c| c.active)
    }
}

/// API representation of a run: the state plus derived fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    #[serde(flatten)]
    pub state: RunState,
    pub progress_percent: f64,
    pub simulated_hours: f64,
    pub total_actions_count: u64,
}

impl From<RunState> for RunSnapshot {
    fn from(state: RunState) -> Self {
        Self {
            progress_percent: state.progress_percent(),
            simulated_hours: state.simulated_hours(),
            total_actions_count: state.total_actions_count(),
            state,
        }
    }
}
