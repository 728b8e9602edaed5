//! HTTP client for the simd daemon.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use sim_core::aggregate::{ActorStats, RoundSummary};
use sim_core::{ActionRecord, RunSnapshot};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: simd\n  → or set SIMD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    RunNotFound(String),

    #[error("rejected: {0}")]
    InvalidOperation(String),

    #[error("unauthorized: check SIMD_TOKEN env var or --token flag")]
    Unauthorized,

    #[error("daemon is shutting down")]
    ShuttingDown,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure simd is running\n  → check SIMD_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for POST /runs/{id}/start.
#[derive(Debug, Serialize)]
pub struct StartRunRequest {
    pub platform: String,
}

#[derive(Debug, Deserialize)]
pub struct RunResponse {
    pub run: RunSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct ListRunsResponse {
    pub run_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActionsResponse {
    pub actions: Vec<ActionRecord>,
}

#[derive(Debug, Deserialize)]
pub struct TimelineResponse {
    pub timeline: Vec<RoundSummary>,
}

#[derive(Debug, Deserialize)]
pub struct AgentsResponse {
    pub stats: Vec<ActorStats>,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Filters and paging for the actions query.
#[derive(Debug, Clone, Default)]
pub struct ActionsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub channel: Option<String>,
    pub actor_id: Option<u64>,
    pub round: Option<u32>,
}

impl ActionsQuery {
    /// Query string, including the leading `?` when non-empty.
    pub fn to_query_string(&self) -> String {
        let mut params = Vec::new();
        if let Some(limit) = self.limit {
            params.push(format!("limit={limit}"));
        }
        if let Some(offset) = self.offset {
            params.push(format!("offset={offset}"));
        }
        if let Some(channel) = &self.channel {
            params.push(format!("channel={}", urlencoding::encode(channel)));
        }
        if let Some(actor_id) = self.actor_id {
            params.push(format!("actor_id={actor_id}"));
        }
        if let Some(round) = self.round {
            params.push(format!("round={round}"));
        }
        if params.is_empty() {
            String::new()
        } else {
            format!("?{}", params.join("&"))
        }
    }
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for simd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the daemon address (for error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    fn run_url(&self, run_id: &str, suffix: &str) -> String {
        format!(
            "{}/runs/{}{}",
            self.base_url,
            urlencoding::encode(run_id),
            suffix
        )
    }

    /// Probe /health. Err only when the request itself failed.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to answer /health, with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms.min(remaining)))
                        .await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    /// Build headers with optional auth token.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Handle error response from API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map_or_else(|_| "unknown error".to_string(), |e| e.error);

        match status {
            404 => ClientError::RunNotFound(message),
            409 | 422 => ClientError::InvalidOperation(message),
            503 => ClientError::ShuttingDown,
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// POST /runs/{id}/start
    pub async fn start_run(&self, run_id: &str, platform: &str) -> Result<RunSnapshot, ClientError> {
        let response = self
            .http
            .post(self.run_url(run_id, "/start"))
            .headers(self.headers())
            .json(&StartRunRequest {
                platform: platform.to_string(),
            })
            .send()
            .await?;
        Ok(self.decode::<RunResponse>(response).await?.run)
    }

    /// POST /runs/{id}/stop
    pub async fn stop_run(&self, run_id: &str) -> Result<RunSnapshot, ClientError> {
        let response = self
            .http
            .post(self.run_url(run_id, "/stop"))
            .headers(self.headers())
            .send()
            .await?;
        Ok(self.decode::<RunResponse>(response).await?.run)
    }

    /// GET /runs/{id}
    pub async fn get_run(&self, run_id: &str) -> Result<RunSnapshot, ClientError> {
        let response = self
            .http
            .get(self.run_url(run_id, ""))
            .headers(self.headers())
            .send()
            .await?;
        Ok(self.decode::<RunResponse>(response).await?.run)
    }

    /// GET /runs/{id}/actions
    pub async fn get_actions(
        &self,
        run_id: &str,
        query: &ActionsQuery,
    ) -> Result<Vec<ActionRecord>, ClientError> {
        let url = self.run_url(run_id, &format!("/actions{}", query.to_query_string()));
        let response = self.http.get(url).headers(self.headers()).send().await?;
        Ok(self.decode::<ActionsResponse>(response).await?.actions)
    }

    /// GET /runs/{id}/timeline
    pub async fn get_timeline(
        &self,
        run_id: &str,
        start_round: Option<u32>,
        end_round: Option<u32>,
    ) -> Result<Vec<RoundSummary>, ClientError> {
        let mut params = Vec::new();
        if let Some(start) = start_round {
            params.push(format!("start_round={start}"));
        }
        if let Some(end) = end_round {
            params.push(format!("end_round={end}"));
        }
        let suffix = if params.is_empty() {
            "/timeline".to_string()
        } else {
            format!("/timeline?{}", params.join("&"))
        };
        let response = self
            .http
            .get(self.run_url(run_id, &suffix))
            .headers(self.headers())
            .send()
            .await?;
        Ok(self.decode::<TimelineResponse>(response).await?.timeline)
    }

    /// GET /runs/{id}/agents
    pub async fn get_agents(&self, run_id: &str) -> Result<Vec<ActorStats>, ClientError> {
        let response = self
            .http
            .get(self.run_url(run_id, "/agents"))
            .headers(self.headers())
            .send()
            .await?;
        Ok(self.decode::<AgentsResponse>(response).await?.stats)
    }

    /// GET /runs
    pub async fn list_active_runs(&self) -> Result<Vec<String>, ClientError> {
        let url = format!("{}/runs", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(self.decode::<ListRunsResponse>(response).await?.run_ids)
    }
}
