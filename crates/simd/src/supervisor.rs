//! Worker process supervision.
//!
//! Each worker runs in its own process group so that anything it forks is
//! signalled together with it. Output goes straight to a log file in the run
//! directory, never through a pipe we would have to drain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use sim_core::Id;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How often `stop` re-checks a process while waiting for it to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker executable not found: {0}")]
    WorkerNotFound(PathBuf),
    #[error("run {0} already has a live worker")]
    AlreadyTracked(String),
    #[error("spawned worker has no pid")]
    NoPid,
    #[error("worker group {pid} still alive after SIGKILL")]
    StillAlive { pid: u32 },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Receives both stdout and stderr; truncated at spawn.
    pub log_path: PathBuf,
}

/// Reference to a tracked worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub run_id: Id,
    /// Worker pid, which is also its process group id.
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exit code; death by signal N is reported as `128 + N`.
    Exited(i32),
}

#[derive(Debug)]
struct Tracked {
    pid: u32,
    child: Arc<tokio::sync::Mutex<Child>>,
}

/// Table of live workers keyed by run id.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    procs: Mutex<HashMap<Id, Tracked>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn procs(&self) -> std::sync::MutexGuard<'_, HashMap<Id, Tracked>> {
        self.procs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn child(&self, handle: &ProcessHandle) -> Option<Arc<tokio::sync::Mutex<Child>>> {
        self.procs()
            .get(&handle.run_id)
            .filter(|tracked| tracked.pid == handle.pid)
            .map(|tracked| Arc::clone(&tracked.child))
    }

    /// Launch a worker in a new process group.
    pub async fn spawn(&self, run_id: &Id, launch: &LaunchCommand) -> Result<ProcessHandle> {
        let existing = self.handle(run_id);
        if let Some(handle) = existing {
            if self.poll(&handle).await == ProcessStatus::Running {
                return Err(SupervisorError::AlreadyTracked(run_id.to_string()));
            }
        }

        if let Some(parent) = launch.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Truncate, then reopen in append mode: writes from the worker and
        // anything it forks always land at the end.
        tokio::fs::File::create(&launch.log_path).await?;
        let stdout = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&launch.log_path)
            .await?
            .into_std()
            .await;
        let stderr = stdout.try_clone()?;

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .current_dir(&launch.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            run_id = %run_id,
            program = %launch.program.display(),
            args = ?launch.args,
            working_dir = %launch.working_dir.display(),
            "spawning worker"
        );

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SupervisorError::WorkerNotFound(launch.program.clone())
            } else {
                SupervisorError::Io(e)
            }
        })?;
        let pid = child.id().ok_or(SupervisorError::NoPid)?;

        self.procs().insert(
            run_id.clone(),
            Tracked {
                pid,
                child: Arc::new(tokio::sync::Mutex::new(child)),
            },
        );
        info!(run_id = %run_id, pid, "worker started");

        Ok(ProcessHandle {
            run_id: run_id.clone(),
            pid,
        })
    }

    /// Current status. An untracked handle, or one that cannot be waited on,
    /// reads as exited with -1.
    pub async fn poll(&self, handle: &ProcessHandle) -> ProcessStatus {
        let Some(child) = self.child(handle) else {
            return ProcessStatus::Exited(-1);
        };
        let mut child = child.lock().await;
        wait_status(handle, child.try_wait())
    }

    /// Terminate the worker's process group.
    ///
    /// SIGTERM, up to `grace` for the leader to exit, then SIGKILL and up to
    /// `kill_wait` more. A group that no longer exists counts as stopped.
    pub async fn stop(
        &self,
        handle: &ProcessHandle,
        grace: Duration,
        kill_wait: Duration,
    ) -> Result<ProcessStatus> {
        if let ProcessStatus::Exited(code) = self.poll(handle).await {
            return Ok(ProcessStatus::Exited(code));
        }

        info!(run_id = %handle.run_id, pid = handle.pid, "sending SIGTERM to worker group");
        signal_group(handle.pid, Signal::Term)?;
        if let Some(code) = self.wait_exit(handle, grace).await {
            return Ok(ProcessStatus::Exited(code));
        }

        warn!(
            run_id = %handle.run_id,
            pid = handle.pid,
            grace_sec = grace.as_secs(),
            "worker ignored SIGTERM; sending SIGKILL"
        );
        signal_group(handle.pid, Signal::Kill)?;
        if let Some(code) = self.wait_exit(handle, kill_wait).await {
            return Ok(ProcessStatus::Exited(code));
        }

        Err(SupervisorError::StillAlive { pid: handle.pid })
    }

    async fn wait_exit(&self, handle: &ProcessHandle, limit: Duration) -> Option<i32> {
        let deadline = Instant::now() + limit;
        loop {
            if let ProcessStatus::Exited(code) = self.poll(handle).await {
                return Some(code);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Stop every tracked worker concurrently. Safe to repeat.
    pub async fn stop_all(&self, grace: Duration, kill_wait: Duration) {
        let handles: Vec<ProcessHandle> = self
            .procs()
            .iter()
            .map(|(run_id, tracked)| ProcessHandle {
                run_id: run_id.clone(),
                pid: tracked.pid,
            })
            .collect();

        let results = join_all(
            handles
                .iter()
                .map(|handle| self.stop(handle, grace, kill_wait)),
        )
        .await;

        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                warn!(run_id = %handle.run_id, pid = handle.pid, error = %e, "failed to stop worker");
            }
        }
    }

    /// Forget a worker whose exit has been observed.
    pub fn release(&self, handle: &ProcessHandle) {
        let mut procs = self.procs();
        if procs
            .get(&handle.run_id)
            .is_some_and(|tracked| tracked.pid == handle.pid)
        {
            procs.remove(&handle.run_id);
            debug!(run_id = %handle.run_id, pid = handle.pid, "released worker");
        }
    }

    /// Handle for the worker tracked under `run_id`, if any.
    pub fn handle(&self, run_id: &Id) -> Option<ProcessHandle> {
        self.procs().get(run_id).map(|tracked| ProcessHandle {
            run_id: run_id.clone(),
            pid: tracked.pid,
        })
    }

    pub fn tracked_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.procs().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal) -> Result<()> {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return Err(SupervisorError::Io(std::io::Error::from(
            std::io::ErrorKind::InvalidInput,
        )));
    };
    // SAFETY: killpg only reads its two integer arguments.
    if unsafe { libc::killpg(pgid, signo) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!(pgid, "worker group already gone");
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: Signal) -> Result<()> {
    Err(SupervisorError::Io(std::io::Error::from(
        std::io::ErrorKind::Unsupported,
    )))
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Last `max_chars` characters of a worker log, trimmed.
///
/// Returns `None` when the log is missing or empty.
pub async fn output_tail(path: &Path, max_chars: usize) -> Option<String> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let text = String::from_utf8_lossy(&bytes);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let skip = text.chars().count().saturating_sub(max_chars);
    Some(text.chars().skip(skip).collect())
}

fn wait_status(handle: &ProcessHandle, result: std::io::Result<Option<ExitStatus>>) -> ProcessStatus {
    match result {
        Ok(Some(status)) => ProcessStatus::Exited(exit_code(status)),
        Ok(None) => ProcessStatus::Running,
        Err(e) => {
            warn!(run_id = %handle.run_id, pid = handle.pid, error = %e, "failed to poll worker; treating as exited");
            ProcessStatus::Exited(-1)
        }
    }
}
