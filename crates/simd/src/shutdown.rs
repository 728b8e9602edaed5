//! Process-wide shutdown.
//!
//! Components register named callbacks; the first call to `run` invokes them
//! in registration order and every later call just waits for that one pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Callback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Ordered set of shutdown callbacks, executed at most once.
pub struct ShutdownCoordinator {
    callbacks: Mutex<Vec<(String, Callback)>>,
    started: AtomicBool,
    done: CancellationToken,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("callbacks", &self.registered())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            done: CancellationToken::new(),
        }
    }

    fn callbacks(&self) -> std::sync::MutexGuard<'_, Vec<(String, Callback)>> {
        self.callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add a callback under `name`.
    ///
    /// Returns false, dropping the callback, if `name` is already registered
    /// or shutdown has begun.
    pub fn register<F>(&self, name: impl Into<String>, callback: F) -> bool
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let name = name.into();
        if self.is_shutting_down() {
            debug!(callback = %name, "shutdown already started; not registering");
            return false;
        }
        let mut callbacks = self.callbacks();
        if callbacks.iter().any(|(existing, _)| *existing == name) {
            debug!(callback = %name, "shutdown callback already registered");
            return false;
        }
        callbacks.push((name, Box::new(callback)));
        true
    }

    /// Names of registered callbacks, in execution order.
    pub fn registered(&self) -> Vec<String> {
        self.callbacks()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run every callback once, in order.
    ///
    /// Returns true for the call that performed the shutdown. Concurrent and
    /// later calls wait for it to finish and return false.
    pub async fn run(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            self.done.cancelled().await;
            return false;
        }

        let callbacks = std::mem::take(&mut *self.callbacks());
        info!(callbacks = callbacks.len(), "running shutdown callbacks");
        for (name, callback) in callbacks {
            debug!(callback = %name, "shutdown callback starting");
            callback().await;
            debug!(callback = %name, "shutdown callback finished");
        }

        self.done.cancel();
        info!("shutdown complete");
        true
    }

    /// Resolves once a shutdown pass has completed.
    pub async fn finished(&self) {
        self.done.cancelled().await;
    }
}

/// Resolves on the first SIGINT or SIGTERM (Ctrl-C elsewhere).
pub async fn termination_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigint.recv() => Ok("SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}
