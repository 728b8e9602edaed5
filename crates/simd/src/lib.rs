//! simd - simulation worker supervisor daemon
//!
//! Library components for the daemon process.

pub mod orchestrator;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod tailer;

use std::sync::Arc;

use futures_util::FutureExt;
use orchestrator::RunOrchestrator;
use shutdown::ShutdownCoordinator;
use sim_core::Config;
use store::RunStateStore;
use supervisor::ProcessSupervisor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Run layout, worker and timing settings.
    pub sim: Config,
    /// HTTP server port (default: 7700).
    pub port: u16,
    /// Auth token for HTTP API (optional).
    pub auth_token: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sim: Config::default(),
            port: 7700,
            auth_token: std::env::var("SIMD_AUTH_TOKEN").ok(),
        }
    }
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    store: Arc<RunStateStore>,
    orchestrator: Arc<RunOrchestrator>,
    shutdown: Arc<ShutdownCoordinator>,
    http_stop: CancellationToken,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: DaemonConfig) -> Result<Self, Box<dyn std::error::Error>> {
        tokio::fs::create_dir_all(&config.sim.runs_dir).await?;

        let store = Arc::new(RunStateStore::from_config(&config.sim));
        let supervisor = Arc::new(ProcessSupervisor::new());
        let orchestrator = Arc::new(RunOrchestrator::new(
            config.sim.clone(),
            Arc::clone(&store),
            supervisor,
        ));

        let shutdown = Arc::new(ShutdownCoordinator::new());
        let http_stop = CancellationToken::new();

        // Workers first, so no run is left behind once the API is gone.
        let runs = Arc::clone(&orchestrator);
        shutdown.register("runs", move || {
            async move { runs.shutdown_all().await }.boxed()
        });
        let http = http_stop.clone();
        shutdown.register("http", move || async move { http.cancel() }.boxed());

        Ok(Self {
            config,
            store,
            orchestrator,
            shutdown,
            http_stop,
        })
    }

    /// Get a reference to the state store.
    pub fn store(&self) -> &Arc<RunStateStore> {
        &self.store
    }

    /// Get a reference to the orchestrator.
    pub fn orchestrator(&self) -> &Arc<RunOrchestrator> {
        &self.orchestrator
    }

    /// Recover interrupted runs, then serve the API until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("simd starting on port {}", self.config.port);
        info!("runs dir: {}", self.config.sim.runs_dir.display());
        match &self.config.sim.worker_bin {
            Some(bin) => info!("worker: {}", bin.display()),
            None => warn!("no worker_bin configured; starts will fail"),
        }
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let recovered = self.orchestrator.recover_interrupted_runs().await;
        if !recovered.is_empty() {
            warn!("marked {} interrupted run(s) as failed", recovered.len());
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let port = self.config.port;
        let token = self.config.auth_token.clone();
        let stop = self.http_stop.clone();
        let http_handle = tokio::spawn(async move {
            if let Err(e) =
                server::start_server(orchestrator, port, token, stop.cancelled_owned()).await
            {
                error!("HTTP server error: {}", e);
            }
        });

        http_handle.await?;
        info!("HTTP server stopped");
        Ok(())
    }

    /// Stop every run and the HTTP server. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown.run().await {
            info!("shutdown finished");
        } else {
            self.shutdown.finished().await;
        }
    }
}
