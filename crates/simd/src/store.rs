//! Durable per-run state snapshots.
//!
//! One JSON document per run at `<runs_dir>/<run_id>/run_state.json`, plus
//! the authoritative in-memory table. Snapshots are written to a temp file
//! in the same directory and renamed over the target, so a reader never sees
//! a half-written file. Reads and writes for one run id are serialized by a
//! per-run lock; different runs never contend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use sim_core::{Config, Id, RunState};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run state not found: {0}")]
    NotFound(String),
    #[error("run state corrupt at {path}: {reason}")]
    StateCorrupt { path: PathBuf, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable run-state store with an in-memory table in front of it.
#[derive(Debug)]
pub struct RunStateStore {
    runs_dir: PathBuf,
    state_file_name: String,
    table: RwLock<HashMap<Id, RunState>>,
    locks: Mutex<HashMap<Id, Arc<tokio::sync::Mutex<()>>>>,
}

impl RunStateStore {
    pub fn new(runs_dir: impl Into<PathBuf>, state_file_name: impl Into<String>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            state_file_name: state_file_name.into(),
            table: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.runs_dir, &config.state_file_name)
    }

    /// Location of the snapshot for `run_id`.
    pub fn state_path(&self, run_id: &Id) -> PathBuf {
        self.runs_dir
            .join(run_id.as_ref())
            .join(&self.state_file_name)
    }

    fn run_lock(&self, run_id: &Id) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(run_id.clone()).or_default())
    }

    /// In-memory entry only.
    pub fn cached(&self, run_id: &Id) -> Option<RunState> {
        self.table
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    fn insert_cached(&self, state: RunState) {
        self.table
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(state.run_id.clone(), state);
    }

    /// Read the snapshot from disk.
    ///
    /// A missing file is `NotFound`; an unreadable one is `StateCorrupt`.
    pub async fn load(&self, run_id: &Id) -> Result<RunState> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;
        self.read_snapshot(run_id).await
    }

    async fn read_snapshot(&self, run_id: &Id) -> Result<RunState> {
        let path = self.state_path(run_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(run_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::StateCorrupt {
            path,
            reason: e.to_string(),
        })
    }

    /// Persist the full snapshot, then update the in-memory table.
    ///
    /// The table is updated even when the write fails; the error is returned
    /// so the caller can log it.
    pub async fn save(&self, state: RunState) -> Result<()> {
        let lock = self.run_lock(&state.run_id);
        let _guard = lock.lock().await;
        let written = self.write_snapshot(&state).await;
        self.insert_cached(state);
        written
    }

    async fn write_snapshot(&self, state: &RunState) -> Result<()> {
        let path = self.state_path(&state.run_id);
        let dir = path
            .parent()
            .map_or_else(|| self.runs_dir.clone(), Path::to_path_buf);
        tokio::fs::create_dir_all(&dir).await?;

        let json = serde_json::to_vec_pretty(state)?;
        let tmp_path = dir.join(format!(
            ".{}.{}.tmp",
            self.state_file_name,
            uuid::Uuid::now_v7()
        ));

        let result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(run_id = %state.run_id, status = %state.status, "saved run state");
        Ok(())
    }

    /// Current state: memory first, then disk.
    ///
    /// A disk hit is cached. A corrupt snapshot is logged and treated as absent.
    pub async fn get(&self, run_id: &Id) -> Option<RunState> {
        if let Some(state) = self.cached(run_id) {
            return Some(state);
        }
        match self.load(run_id).await {
            Ok(state) => {
                let mut table = self
                    .table
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                // A concurrent writer may have populated the table meanwhile.
                Some(
                    table
                        .entry(run_id.clone())
                        .or_insert(state)
                        .clone(),
                )
            }
            Err(StoreError::NotFound(_)) => None,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "ignoring unreadable run state");
                None
            }
        }
    }

    /// Read-modify-write of one run's state under its lock.
    ///
    /// `f` receives the current state (memory, else disk, else `None`) and
    /// returns the new state or a caller error, in which case nothing is
    /// written. Durable write failures are logged and do not fail the update.
    pub async fn update<F, E>(&self, run_id: &Id, f: F) -> std::result::Result<RunState, E>
    where
        F: FnOnce(Option<RunState>) -> std::result::Result<RunState, E>,
    {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let current = match self.cached(run_id) {
            Some(state) => Some(state),
            None => match self.read_snapshot(run_id).await {
                Ok(state) => Some(state),
                Err(StoreError::NotFound(_)) => None,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "ignoring unreadable run state");
                    None
                }
            },
        };

        let next = f(current)?;
        if let Err(e) = self.write_snapshot(&next).await {
            warn!(run_id = %run_id, error = %e, "failed to persist run state");
        }
        self.insert_cached(next.clone());
        Ok(next)
    }

    /// Every snapshot under the runs directory. Unreadable ones are skipped.
    pub async fn load_all(&self) -> Vec<RunState> {
        let mut states = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.runs_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %self.runs_dir.display(), error = %e, "failed to scan runs dir");
                }
                return states;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(dir = %self.runs_dir.display(), error = %e, "failed to scan runs dir");
                    break;
                }
            };
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let run_id = Id::from_string(entry.file_name().to_string_lossy());
            match self.load(&run_id).await {
                Ok(state) => states.push(state),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "skipping unreadable run state"),
            }
        }
        states
    }
}
