//! Run lifecycle: start, monitor, stop, and queries.
//!
//! Each started run gets one monitor task. The monitor is the only writer of
//! terminal statuses for runs it supervises: `stop` moves a run to
//! `stopping`, signals the worker group, and waits for the monitor to observe
//! the exit and record `stopped`. Runs with no monitor (restored from disk)
//! are finalized by `stop` directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use sim_core::aggregate::{self, ActionFilter, ActorStats, RoundRange, RoundSummary};
use sim_core::launch::LaunchError;
use sim_core::{
    ActionRecord, ChannelState, Config, Id, LaunchSpec, PlatformSelector, RunState, RunStatus,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::{RunStateStore, StoreError};
use crate::supervisor::{self, LaunchCommand, ProcessHandle, ProcessStatus, ProcessSupervisor};
use crate::tailer::{self, ChannelTail};

/// Error recorded on runs found active when the daemon starts.
pub const RESTART_INTERRUPTED_ERROR: &str = "supervisor restarted while run was active";
/// Error recorded on runs stopped by process-wide shutdown.
pub const SHUTDOWN_ERROR: &str = "supervisor shutting down";

/// Default page size for `get_actions`.
pub const DEFAULT_ACTIONS_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run already running: {0}")]
    AlreadyRunning(String),
    #[error("run {run_id} is not running (status: {status})")]
    NotRunning { run_id: String, status: RunStatus },
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("invalid run id: {0:?}")]
    InvalidRunId(String),
    #[error("missing launch configuration: {0}")]
    MissingLaunchSpec(String),
    #[error("unknown platform: {0}")]
    InvalidPlatform(String),
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone)]
struct Monitor {
    /// Cancelled once the monitor has written the terminal state.
    finished: CancellationToken,
}

/// Owns every run's lifecycle.
#[derive(Debug)]
pub struct RunOrchestrator {
    config: Config,
    store: Arc<RunStateStore>,
    supervisor: Arc<ProcessSupervisor>,
    /// Runs with a live monitor task. Inserted by `start`, removed by the monitor.
    monitors: Mutex<HashMap<Id, Monitor>>,
    shutting_down: AtomicBool,
}

impl RunOrchestrator {
    pub fn new(config: Config, store: Arc<RunStateStore>, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            config,
            store,
            supervisor,
            monitors: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<RunStateStore> {
        &self.store
    }

    fn monitors(&self) -> std::sync::MutexGuard<'_, HashMap<Id, Monitor>> {
        self.monitors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn monitor(&self, run_id: &Id) -> Option<Monitor> {
        self.monitors().get(run_id).cloned()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Run ids become directory names; anything that is not a single path
    /// component is refused before touching the filesystem.
    fn check_run_id(run_id: &Id) -> Result<()> {
        if run_id.is_valid() {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidRunId(run_id.to_string()))
        }
    }

    // --- Start ---

    /// Launch a worker for `run_id` and begin monitoring it.
    pub async fn start(self: &Arc<Self>, run_id: &Id, platform: PlatformSelector) -> Result<RunState> {
        Self::check_run_id(run_id)?;
        if self.is_shutting_down() {
            return Err(OrchestratorError::ShuttingDown);
        }
        if self.monitor(run_id).is_some() {
            return Err(OrchestratorError::AlreadyRunning(run_id.to_string()));
        }
        if let Some(existing) = self.store.get(run_id).await {
            if is_busy(existing.status) {
                return Err(OrchestratorError::AlreadyRunning(run_id.to_string()));
            }
        }

        let channels = platform
            .resolve(&self.config.channels)
            .ok_or_else(|| OrchestratorError::InvalidPlatform(platform.as_str().to_string()))?;

        let launch_path = self.config.launch_config_path(run_id.as_ref());
        let launch = tokio::task::spawn_blocking(move || LaunchSpec::load(&launch_path))
            .await
            .map_err(|e| OrchestratorError::LaunchFailed(format!("launch config reader panicked: {e}")))?
            .map_err(|e| match e {
                LaunchError::NotFound(path) => {
                    OrchestratorError::MissingLaunchSpec(format!("nothing staged at {}", path.display()))
                }
                other => OrchestratorError::MissingLaunchSpec(other.to_string()),
            })?;

        let now = Utc::now();
        let capacity = self.config.recent_actions_capacity;
        let claimed = self
            .store
            .update(run_id, |current| {
                if current.as_ref().is_some_and(|state| is_busy(state.status)) {
                    return Err(OrchestratorError::AlreadyRunning(run_id.to_string()));
                }
                let mut state = RunState::new(run_id.clone(), now);
                state.status = RunStatus::Starting;
                state.platform = platform.clone();
                state.total_rounds = launch.total_rounds();
                state.minutes_per_round = launch.minutes_per_round;
                state.total_simulation_hours = launch.total_simulation_hours;
                state.recent_actions_capacity = capacity;
                state.started_at = Some(now);
                state.channels = channels
                    .iter()
                    .map(|channel| {
                        (
                            channel.clone(),
                            ChannelState {
                                active: true,
                                actions_count: 0,
                            },
                        )
                    })
                    .collect();
                Ok(state)
            })
            .await?;

        info!(
            run_id = %run_id,
            platform = %platform.as_str(),
            total_rounds = claimed.total_rounds,
            "starting run"
        );

        let Some(program) = self.config.worker_bin.clone() else {
            return Err(self
                .fail_launch(run_id, "no worker executable configured".to_string())
                .await);
        };

        // Every configured channel, not only the selected ones: queries read them all.
        self.clear_channel_logs(run_id, &self.config.channels).await;

        let mut args = self.config.worker_args.clone();
        args.push("--config".to_string());
        args.push(launch.config_path.to_string_lossy().into_owned());
        if let PlatformSelector::Only(channel) = &platform {
            args.push(format!("--{channel}-only"));
        }
        let command = LaunchCommand {
            program,
            args,
            working_dir: self.config.run_dir(run_id.as_ref()),
            log_path: self.config.worker_log_path(run_id.as_ref()),
        };

        let handle = match self.supervisor.spawn(run_id, &command).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail_launch(run_id, e.to_string()).await),
        };

        let finished = CancellationToken::new();
        self.monitors().insert(
            run_id.clone(),
            Monitor {
                finished: finished.clone(),
            },
        );

        let pid = handle.pid;
        let running = self
            .store
            .update(run_id, |current| {
                let mut state = current.unwrap_or(claimed);
                // Shutdown may already have moved it to `stopping`.
                if state.status == RunStatus::Starting {
                    state.status = RunStatus::Running;
                }
                state.process_pid = Some(pid);
                state.touch(Utc::now());
                Ok::<_, OrchestratorError>(state)
            })
            .await?;

        let orchestrator = Arc::clone(self);
        let monitor_id = run_id.clone();
        tokio::spawn(async move {
            orchestrator
                .monitor_run(monitor_id, handle, channels, finished)
                .await;
        });

        // `shutdown_all` lists monitors after raising the flag. A start that
        // inserted its monitor too late to be listed sees the flag here.
        if self.is_shutting_down() {
            warn!(run_id = %run_id, pid, "shutdown began during start; stopping worker");
            if let Err(e) = self
                .stop_with(run_id, self.config.shutdown_grace(), Some(SHUTDOWN_ERROR))
                .await
            {
                debug!(run_id = %run_id, error = %e, "run already stopping for shutdown");
            }
            return Err(OrchestratorError::ShuttingDown);
        }

        info!(run_id = %run_id, pid, "run started");
        Ok(running)
    }

    /// Record a launch failure and build the error returned to the caller.
    async fn fail_launch(&self, run_id: &Id, message: String) -> OrchestratorError {
        error!(run_id = %run_id, error = %message, "failed to launch worker");
        let now = Utc::now();
        let result = self
            .store
            .update(run_id, |current| {
                let mut state = current.unwrap_or_else(|| RunState::new(run_id.clone(), now));
                state.status = RunStatus::Failed;
                state.error = Some(message.clone());
                state.clear_channel_flags();
                state.completed_at = Some(now);
                state.touch(now);
                Ok::<_, OrchestratorError>(state)
            })
            .await;
        if let Err(e) = result {
            warn!(run_id = %run_id, error = %e, "failed to record launch failure");
        }
        OrchestratorError::LaunchFailed(message)
    }

    /// Remove channel logs left by an earlier run so the monitor starts clean.
    async fn clear_channel_logs(&self, run_id: &Id, channels: &[String]) {
        for channel in channels {
            let path = self.config.channel_log_path(run_id.as_ref(), channel);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(run_id = %run_id, channel = %channel, "removed stale channel log"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(run_id = %run_id, path = %path.display(), error = %e, "failed to remove stale channel log");
                }
            }
        }
    }

    // --- Monitor ---

    async fn monitor_run(
        self: Arc<Self>,
        run_id: Id,
        handle: ProcessHandle,
        channels: Vec<String>,
        finished: CancellationToken,
    ) {
        let mut tails: Vec<ChannelTail> = channels
            .iter()
            .map(|channel| {
                ChannelTail::new(
                    channel.as_str(),
                    self.config.channel_log_path(run_id.as_ref(), channel),
                )
            })
            .collect();
        let interval = self.config.monitor_interval();

        debug!(run_id = %run_id, pid = handle.pid, channels = ?channels, "monitor started");

        let code = loop {
            if let ProcessStatus::Exited(code) = self.supervisor.poll(&handle).await {
                break code;
            }
            self.ingest(&run_id, &mut tails).await;
            tokio::time::sleep(interval).await;
        };

        // Records written just before exit.
        self.ingest(&run_id, &mut tails).await;
        self.finalize(&run_id, code).await;

        self.supervisor.release(&handle);
        self.monitors().remove(&run_id);
        finished.cancel();
        debug!(run_id = %run_id, "monitor finished");
    }

    async fn ingest(&self, run_id: &Id, tails: &mut [ChannelTail]) {
        let mut records: Vec<ActionRecord> = Vec::new();
        for tail in tails.iter_mut() {
            records.extend(tail.poll().await);
        }
        if records.is_empty() {
            return;
        }

        let now = Utc::now();
        let result = self
            .store
            .update(run_id, |current| {
                current
                    .map(|state| aggregate::apply_all(state, &records, now))
                    .ok_or_else(|| OrchestratorError::NotFound(run_id.to_string()))
            })
            .await;
        match result {
            Ok(state) => debug!(
                run_id = %run_id,
                records = records.len(),
                current_round = state.current_round,
                "applied new actions"
            ),
            Err(e) => warn!(run_id = %run_id, error = %e, "failed to apply actions"),
        }
    }

    /// Write the terminal state for an exited worker.
    async fn finalize(&self, run_id: &Id, code: i32) {
        let excerpt = if code == 0 {
            None
        } else {
            supervisor::output_tail(
                &self.config.worker_log_path(run_id.as_ref()),
                self.config.error_excerpt_chars,
            )
            .await
        };

        let now = Utc::now();
        let result = self
            .store
            .update(run_id, |current| {
                let Some(mut state) = current else {
                    return Err(OrchestratorError::NotFound(run_id.to_string()));
                };
                state.status = match state.status {
                    RunStatus::Stopping => RunStatus::Stopped,
                    _ if code == 0 => RunStatus::Completed,
                    _ => RunStatus::Failed,
                };
                if state.status == RunStatus::Failed {
                    state.error = Some(match &excerpt {
                        Some(tail) => format!("worker exited with code {code}: {tail}"),
                        None => format!("worker exited with code {code}"),
                    });
                }
                state.clear_channel_flags();
                state.completed_at = Some(now);
                state.touch(now);
                Ok(state)
            })
            .await;

        match result {
            Ok(state) if state.status == RunStatus::Failed => error!(
                run_id = %run_id,
                exit_code = code,
                current_round = state.current_round,
                "worker failed"
            ),
            Ok(state) => info!(
                run_id = %run_id,
                exit_code = code,
                status = %state.status,
                current_round = state.current_round,
                total_actions = state.total_actions_count(),
                "run finished"
            ),
            Err(e) => warn!(run_id = %run_id, error = %e, "failed to record run exit"),
        }
    }

    // --- Stop ---

    /// Stop a running or paused run.
    pub async fn stop(&self, run_id: &Id) -> Result<RunState> {
        self.stop_with(run_id, self.config.stop_grace(), None).await
    }

    async fn stop_with(&self, run_id: &Id, grace: Duration, reason: Option<&str>) -> Result<RunState> {
        Self::check_run_id(run_id)?;
        let stopping = self
            .store
            .update(run_id, |current| {
                let Some(mut state) = current else {
                    return Err(OrchestratorError::NotFound(run_id.to_string()));
                };
                // Shutdown also catches runs between spawn and `running`.
                let stoppable = state.status.is_stoppable()
                    || (reason.is_some() && state.status == RunStatus::Starting);
                if !stoppable {
                    return Err(OrchestratorError::NotRunning {
                        run_id: run_id.to_string(),
                        status: state.status,
                    });
                }
                state.status = RunStatus::Stopping;
                if let Some(reason) = reason {
                    state.error = Some(reason.to_string());
                }
                state.touch(Utc::now());
                Ok(state)
            })
            .await?;
        info!(run_id = %run_id, pid = ?stopping.process_pid, "stopping run");

        let kill_wait = self.config.kill_wait();
        if let Some(handle) = self.supervisor.handle(run_id) {
            if let Err(e) = self.supervisor.stop(&handle, grace, kill_wait).await {
                error!(run_id = %run_id, error = %e, "failed to stop worker");
            }
        }

        if let Some(monitor) = self.monitor(run_id) {
            let bound = grace + kill_wait + self.config.monitor_interval() * 2;
            if tokio::time::timeout(bound, monitor.finished.cancelled())
                .await
                .is_err()
            {
                warn!(run_id = %run_id, "monitor did not finish after stop");
            }
            return self.get_state(run_id).await;
        }

        // No monitor: nothing else will finalize this run.
        let now = Utc::now();
        let stopped = self
            .store
            .update(run_id, |current| {
                let mut state = current.unwrap_or(stopping);
                if state.status == RunStatus::Stopping {
                    state.status = RunStatus::Stopped;
                    state.clear_channel_flags();
                    state.completed_at = Some(now);
                    state.touch(now);
                }
                Ok::<_, OrchestratorError>(state)
            })
            .await?;
        info!(run_id = %run_id, status = %stopped.status, "run stopped without monitor");
        Ok(stopped)
    }

    // --- Queries ---

    pub async fn get_state(&self, run_id: &Id) -> Result<RunState> {
        Self::check_run_id(run_id)?;
        self.store
            .get(run_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(run_id.to_string()))
    }

    /// Full action history across configured channels, oldest first.
    async fn history(&self, run_id: &Id) -> Result<Vec<ActionRecord>> {
        self.get_state(run_id).await?;

        let mut per_channel = Vec::with_capacity(self.config.channels.len());
        for channel in &self.config.channels {
            let path = self.config.channel_log_path(run_id.as_ref(), channel);
            match tailer::read_all(&path, channel).await {
                Ok(records) => per_channel.push(records),
                Err(e) => {
                    warn!(run_id = %run_id, channel = %channel, error = %e, "failed to read channel log");
                }
            }
        }
        Ok(aggregate::merge_chronological(per_channel))
    }

    /// Newest-first page of the full history.
    pub async fn get_actions(
        &self,
        run_id: &Id,
        filter: &ActionFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ActionRecord>> {
        let history = self.history(run_id).await?;
        Ok(aggregate::page_recent(history, filter, offset, limit))
    }

    pub async fn get_timeline(&self, run_id: &Id, range: RoundRange) -> Result<Vec<RoundSummary>> {
        let history = self.history(run_id).await?;
        Ok(aggregate::by_round(&history, range))
    }

    pub async fn get_actor_stats(&self, run_id: &Id) -> Result<Vec<ActorStats>> {
        let history = self.history(run_id).await?;
        Ok(aggregate::by_actor(&history))
    }

    /// Runs whose worker is tracked and still alive.
    pub async fn list_active_runs(&self) -> Vec<Id> {
        let mut active = Vec::new();
        for run_id in self.supervisor.tracked_ids() {
            let Some(handle) = self.supervisor.handle(&run_id) else {
                continue;
            };
            if self.supervisor.poll(&handle).await == ProcessStatus::Running {
                active.push(run_id);
            }
        }
        active
    }

    // --- Recovery and shutdown ---

    /// Fail runs a previous daemon instance left active.
    ///
    /// Their recorded pid is never signalled; it may belong to another process by now.
    pub async fn recover_interrupted_runs(&self) -> Vec<Id> {
        let mut recovered = Vec::new();
        for state in self.store.load_all().await {
            if !is_busy(state.status) || self.monitor(&state.run_id).is_some() {
                continue;
            }
            let run_id = state.run_id.clone();
            let now = Utc::now();
            let result = self
                .store
                .update(&run_id, |current| {
                    let mut state = current.unwrap_or(state);
                    state.status = RunStatus::Failed;
                    state.error = Some(RESTART_INTERRUPTED_ERROR.to_string());
                    state.clear_channel_flags();
                    state.completed_at = Some(now);
                    state.touch(now);
                    Ok::<_, OrchestratorError>(state)
                })
                .await;
            match result {
                Ok(_) => {
                    warn!(run_id = %run_id, "marked interrupted run as failed");
                    recovered.push(run_id);
                }
                Err(e) => warn!(run_id = %run_id, error = %e, "failed to recover run"),
            }
        }
        recovered
    }

    /// Stop every monitored run. Later calls are no-ops.
    pub async fn shutdown_all(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let run_ids: Vec<Id> = self.monitors().keys().cloned().collect();
        info!(runs = run_ids.len(), "stopping all runs for shutdown");

        let grace = self.config.shutdown_grace();
        let results = join_all(
            run_ids
                .iter()
                .map(|run_id| self.stop_with(run_id, grace, Some(SHUTDOWN_ERROR))),
        )
        .await;
        for (run_id, result) in run_ids.iter().zip(results) {
            match result {
                Ok(state) => info!(run_id = %run_id, status = %state.status, "run stopped for shutdown"),
                // Finished on its own between listing and stopping.
                Err(OrchestratorError::NotRunning { .. }) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "failed to stop run for shutdown"),
            }
        }

        // Anything still tracked without a monitor.
        self.supervisor
            .stop_all(grace, self.config.kill_wait())
            .await;
    }
}

/// Statuses that hold a worker or are about to.
fn is_busy(status: RunStatus) -> bool {
    matches!(
        status,
        RunStatus::Starting | RunStatus::Running | RunStatus::Stopping
    )
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const LAUNCH_CONFIG: &str =
        r#"{"time_config": {"total_simulation_hours": 1, "minutes_per_round": 30}}"#;

    fn worker(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn orchestrator(dir: &Path, worker_bin: Option<PathBuf>) -> Arc<RunOrchestrator> {
        let config = Config {
            runs_dir: dir.join("runs"),
            worker_bin,
            channels: vec!["twitter".to_string(), "reddit".to_string()],
            monitor_interval_ms: 50,
            stop_grace_sec: 1,
            kill_wait_sec: 2,
            shutdown_grace_sec: 1,
            ..Config::default()
        };
        let store = Arc::new(RunStateStore::from_config(&config));
        Arc::new(RunOrchestrator::new(
            config,
            store,
            Arc::new(ProcessSupervisor::new()),
        ))
    }

    fn stage(orchestrator: &RunOrchestrator, run_id: &str) {
        let path = orchestrator.config().launch_config_path(run_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, LAUNCH_CONFIG).unwrap();
    }

    async fn wait_terminal(orchestrator: &RunOrchestrator, run_id: &Id) -> RunState {
        for _ in 0..200 {
            let state = orchestrator.get_state(run_id).await.unwrap();
            if state.status.is_terminal() && orchestrator.monitor(run_id).is_none() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run did not finish");
    }

    const TWO_ROUNDS: &str = r#"mkdir -p twitter
echo '{"event_type": "simulation_start"}' >> twitter/actions.jsonl
echo '{"round": 1, "timestamp": "2025-01-01T00:00:01", "agent_id": 1, "agent_name": "alice", "action_type": "CREATE_POST", "action_args": {}}' >> twitter/actions.jsonl
sleep 0.2
echo '{"round": 2, "timestamp": "2025-01-01T00:00:02", "agent_id": 2, "agent_name": "bob", "action_type": "LIKE_POST", "action_args": {}}' >> twitter/actions.jsonl
exit 0"#;

    #[tokio::test]
    async fn two_round_run_completes() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), Some(worker(dir.path(), TWO_ROUNDS)));
        stage(&orch, "sim-1");
        let run_id = Id::from_string("sim-1");

        let started = orch
            .start(&run_id, PlatformSelector::Only("twitter".to_string()))
            .await
            .unwrap();
        assert_eq!(started.status, RunStatus::Running);
        assert_eq!(started.total_rounds, 2);
        assert!(started.channels["twitter"].active);
        assert!(!started.channels.contains_key("reddit"));

        let state = wait_terminal(&orch, &run_id).await;
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.current_round, 2);
        assert!(!state.channels["twitter"].active);
        assert_eq!(state.channels["twitter"].actions_count, 2);
        assert_eq!(state.recent_actions[0].round, 2);
        assert!(state.completed_at.is_some());
        assert!(orch.list_active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn single_channel_flag_is_passed_to_worker() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), Some(worker(dir.path(), r#"echo "$@" > args.txt"#)));
        stage(&orch, "sim-1");
        let run_id = Id::from_string("sim-1");

        orch.start(&run_id, PlatformSelector::Only("reddit".to_string()))
            .await
            .unwrap();
        wait_terminal(&orch, &run_id).await;

        let args = std::fs::read_to_string(orch.config().run_dir("sim-1").join("args.txt")).unwrap();
        assert!(args.contains("--config /"));
        assert!(args.contains("simulation_config.json"));
        assert!(args.trim_end().ends_with("--reddit-only"));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_output_excerpt() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            dir.path(),
            Some(worker(dir.path(), "echo 'Traceback: out of memory' >&2\nexit 137")),
        );
        stage(&orch, "sim-1");
        let run_id = Id::from_string("sim-1");

        orch.start(&run_id, PlatformSelector::Parallel).await.unwrap();
        let state = wait_terminal(&orch, &run_id).await;

        assert_eq!(state.status, RunStatus::Failed);
        let error = state.error.as_deref().unwrap();
        assert!(error.starts_with("worker exited with code 137"));
        assert!(error.contains("out of memory"));
        assert!(!state.any_channel_active());
    }

    #[tokio::test]
    async fn idle_worker_still_completes() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), Some(worker(dir.path(), "exit 0")));
        stage(&orch, "sim-1");
        let run_id = Id::from_string("sim-1");

        orch.start(&run_id, PlatformSelector::Parallel).await.unwrap();
        let state = wait_terminal(&orch, &run_id).await;
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.current_round, 0);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn start_while_running_is_rejected_without_second_spawn() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            dir.path(),
            Some(worker(dir.path(), "echo started >> spawns.txt\nsleep 30")),
        );
        stage(&orch, "sim-1");
        let run_id = Id::from_string("sim-1");

        orch.start(&run_id, PlatformSelector::Parallel).await.unwrap();
        let second = orch.start(&run_id, PlatformSelector::Parallel).await;
        assert!(matches!(second, Err(OrchestratorError::AlreadyRunning(_))));
        assert_eq!(orch.list_active_runs().await, vec![run_id.clone()]);

        let state = orch.stop(&run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Stopped);
        let spawns =
            std::fs::read_to_string(orch.config().run_dir("sim-1").join("spawns.txt")).unwrap();
        assert_eq!(spawns.lines().count(), 1);
    }

    #[tokio::test]
    async fn stop_escalates_and_records_stopped() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(
            dir.path(),
            Some(worker(dir.path(), "trap '' TERM\nwhile true; do sleep 1; done")),
        );
        stage(&orch, "sim-1");
        let run_id = Id::from_string("sim-1");

        orch.start(&run_id, PlatformSelector::Parallel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = orch.stop(&run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Stopped);
        assert!(!state.any_channel_active());
        assert!(state.completed_at.is_some());
        assert!(orch.supervisor.tracked_ids().is_empty());
        assert!(orch.monitor(&run_id).is_none());
    }

    #[tokio::test]
    async fn stop_requires_running_status() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), Some(worker(dir.path(), "exit 0")));
        stage(&orch, "sim-1");
        let run_id = Id::from_string("sim-1");

        assert!(matches!(
            orch.stop(&run_id).await,
            Err(OrchestratorError::NotFound(_))
        ));

        orch.start(&run_id, PlatformSelector::Parallel).await.unwrap();
        wait_terminal(&orch, &run_id).await;
        assert!(matches!(
            orch.stop(&run_id).await,
            Err(OrchestratorError::NotRunning {
                status: RunStatus::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn stop_paused_run_without_monitor_writes_stopped() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), None);
        let run_id = Id::from_string("sim-1");
        let mut paused = RunState::new(run_id.clone(), Utc::now());
        paused.status = RunStatus::Paused;
        paused.channels.insert(
            "twitter".to_string(),
            ChannelState {
                active: true,
                actions_count: 3,
            },
        );
        orch.store().save(paused).await.unwrap();

        let state = orch.stop(&run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Stopped);
        assert!(!state.any_channel_active());
    }

    #[tokio::test]
    async fn start_without_launch_config_is_missing_launch_spec() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), Some(worker(dir.path(), "exit 0")));
        let result = orch
            .start(&Id::from_string("sim-1"), PlatformSelector::Parallel)
            .await;
        assert!(matches!(result, Err(OrchestratorError::MissingLaunchSpec(_))));
    }

    #[tokio::test]
    async fn unknown_platform_is_rejected() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), Some(worker(dir.path(), "exit 0")));
        stage(&orch, "sim-1");
        let result = orch
            .start(
                &Id::from_string("sim-1"),
                PlatformSelector::Only("myspace".to_string()),
            )
            .await;
        assert!(matches!(result, Err(OrchestratorError::InvalidPlatform(_))));
    }

    #[tokio::test]
    async fn spawn_failure_is_recorded_as_failed() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), Some(dir.path().join("no-such-worker")));
        stage(&orch, "sim-1");
        let run_id = Id::from_string("sim-1");

        let result = orch.start(&run_id, PlatformSelector::Parallel).await;
        assert!(matches!(result, Err(OrchestratorError::LaunchFailed(_))));

        let state = orch.get_state(&run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert!(state.error.as_deref().unwrap().contains("not found"));
        assert!(!state.any_channel_active());
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), None);
        let run_id = Id::from_string("ghost");
        assert!(matches!(
            orch.get_state(&run_id).await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            orch.get_actions(&run_id, &ActionFilter::default(), 0, 10).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn queries_read_full_history_newest_first() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), Some(worker(dir.path(), TWO_ROUNDS)));
        stage(&orch, "sim-1");
        let run_id = Id::from_string("sim-1");
        orch.start(&run_id, PlatformSelector::Parallel).await.unwrap();
        wait_terminal(&orch, &run_id).await;

        let page = orch
            .get_actions(&run_id, &ActionFilter::default(), 0, 1)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].round, 2);

        let filter = ActionFilter {
            actor_id: Some(1),
            ..ActionFilter::default()
        };
        let alice = orch.get_actions(&run_id, &filter, 0, 10).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].actor_name, "alice");

        let timeline = orch
            .get_timeline(&run_id, RoundRange::default())
            .await
            .unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].round_num, 1);

        let actors = orch.get_actor_stats(&run_id).await.unwrap();
        assert_eq!(actors.len(), 2);
        assert_eq!(actors[0].agent_id, 1);
    }

    #[tokio::test]
    async fn restart_recovery_fails_active_snapshots() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), None);
        let now = Utc::now();

        let mut running = RunState::new(Id::from_string("sim-running"), now);
        running.status = RunStatus::Running;
        running.process_pid = Some(999_999);
        running
            .channels
            .insert("reddit".to_string(), ChannelState { active: true, actions_count: 1 });
        let mut done = RunState::new(Id::from_string("sim-done"), now);
        done.status = RunStatus::Completed;
        orch.store().save(running).await.unwrap();
        orch.store().save(done).await.unwrap();

        // Fresh instance over the same directory.
        let restarted = orchestrator(dir.path(), None);
        let recovered = restarted.recover_interrupted_runs().await;
        assert_eq!(recovered, vec![Id::from_string("sim-running")]);

        let state = restarted
            .get_state(&Id::from_string("sim-running"))
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.error.as_deref(), Some(RESTART_INTERRUPTED_ERROR));
        assert!(!state.any_channel_active());

        let done = restarted.get_state(&Id::from_string("sim-done")).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn run_id_outside_runs_dir_is_refused() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), Some(worker(dir.path(), "exit 0")));
        let escaped = dir.path().join("escaped");
        std::fs::create_dir_all(&escaped).unwrap();
        std::fs::write(escaped.join("simulation_config.json"), LAUNCH_CONFIG).unwrap();
        let run_id = Id::from_string("../escaped");

        assert!(matches!(
            orch.start(&run_id, PlatformSelector::Parallel).await,
            Err(OrchestratorError::InvalidRunId(_))
        ));
        assert!(!escaped.join("run_state.json").exists());
        assert!(!escaped.join("simulation.log").exists());
        assert!(orch.list_active_runs().await.is_empty());

        assert!(matches!(
            orch.stop(&run_id).await,
            Err(OrchestratorError::InvalidRunId(_))
        ));
        assert!(matches!(
            orch.get_actor_stats(&run_id).await,
            Err(OrchestratorError::InvalidRunId(_))
        ));
    }

    #[tokio::test]
    async fn single_channel_rerun_drops_other_channel_history() {
        let dir = TempDir::new().unwrap();
        let body = r#"case "$*" in *--twitter-only*) exit 0 ;; esac
mkdir -p reddit
echo '{"round": 1, "timestamp": "2025-01-01T00:00:01", "agent_id": 9, "agent_name": "old", "action_type": "CREATE_POST", "action_args": {}}' >> reddit/actions.jsonl
exit 0"#;
        let orch = orchestrator(dir.path(), Some(worker(dir.path(), body)));
        stage(&orch, "sim-1");
        let run_id = Id::from_string("sim-1");

        orch.start(&run_id, PlatformSelector::Parallel).await.unwrap();
        let first = wait_terminal(&orch, &run_id).await;
        assert_eq!(first.total_actions_count(), 1);

        orch.start(&run_id, PlatformSelector::Only("twitter".to_string()))
            .await
            .unwrap();
        let second = wait_terminal(&orch, &run_id).await;
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.total_actions_count(), 0);

        let actions = orch
            .get_actions(&run_id, &ActionFilter::default(), 0, 10)
            .await
            .unwrap();
        assert!(actions.is_empty(), "{actions:?}");
        assert!(orch
            .get_timeline(&run_id, RoundRange::default())
            .await
            .unwrap()
            .is_empty());
        assert!(orch.get_actor_stats(&run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_racing_shutdown_leaves_no_live_worker() {
        // Each offset lets shutdown begin at a different await point of `start`.
        for yields in 0..12 {
            let dir = TempDir::new().unwrap();
            let orch = orchestrator(dir.path(), Some(worker(dir.path(), "sleep 30")));
            stage(&orch, "sim-1");
            let run_id = Id::from_string("sim-1");

            let (started, ()) = tokio::join!(
                orch.start(&run_id, PlatformSelector::Parallel),
                async {
                    for _ in 0..yields {
                        tokio::task::yield_now().await;
                    }
                    orch.shutdown_all().await;
                }
            );

            assert!(orch.list_active_runs().await.is_empty(), "yields={yields}");
            assert!(orch.supervisor.tracked_ids().is_empty(), "yields={yields}");
            match orch.get_state(&run_id).await {
                Ok(state) => {
                    assert_eq!(state.status, RunStatus::Stopped, "yields={yields}");
                    assert_eq!(state.error.as_deref(), Some(SHUTDOWN_ERROR));
                }
                Err(OrchestratorError::NotFound(_)) => {
                    assert!(matches!(started, Err(OrchestratorError::ShuttingDown)));
                }
                Err(e) => panic!("yields={yields}: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn shutdown_stops_runs_once_and_refuses_new_starts() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), Some(worker(dir.path(), "sleep 30")));
        stage(&orch, "sim-1");
        let run_id = Id::from_string("sim-1");
        orch.start(&run_id, PlatformSelector::Parallel).await.unwrap();

        orch.shutdown_all().await;
        orch.shutdown_all().await;

        let state = orch.get_state(&run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Stopped);
        assert_eq!(state.error.as_deref(), Some(SHUTDOWN_ERROR));
        assert!(orch.list_active_runs().await.is_empty());
        assert!(matches!(
            orch.start(&run_id, PlatformSelector::Parallel).await,
            Err(OrchestratorError::ShuttingDown)
        ));
    }
}
