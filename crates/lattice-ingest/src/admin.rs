//! Admin API of the running daemon.
//!
//! Reindex requests and dead-letter requeues go through the daemon's own
//! [`FrameProcessor`], against the stores it already holds open, while
//! ingestion keeps running. The processor serializes work per entity, so
//! these calls never race a lane on the same record.
//!
//! # Routes
//!
//! - `POST /reindex` - body `{"uri": "at://..."}`
//! - `POST /deadletters/{id}/requeue` - reprocess one entry
//! - `POST /deadletters/sweep?limit=N` - reprocess the oldest entries
//!
//! The API has no authentication; bind it to a loopback address.
//! [`AdminClient`] is the operator-side counterpart.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use url::Url;

use crate::pipeline::{FrameOutcome, FrameProcessor, SweepReport};
use crate::reindex::{RecordFetcher, Reindexer};
use crate::{Error, Result};

const DEFAULT_SWEEP_LIMIT: usize = 100;

/// Shared handles behind the admin routes.
pub struct AdminState<F> {
    pub processor: Arc<FrameProcessor>,
    pub reindexer: Arc<Reindexer<F>>,
}

impl<F> Clone for AdminState<F> {
    fn clone(&self) -> Self {
        Self {
            processor: Arc::clone(&self.processor),
            reindexer: Arc::clone(&self.reindexer),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexRequest {
    pub uri: String,
}

#[derive(Debug, Deserialize)]
struct SweepQuery {
    limit: Option<usize>,
}

/// Wire form of a [`FrameOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeResponse {
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_id: Option<i64>,
    pub detail: String,
}

impl From<FrameOutcome> for OutcomeResponse {
    fn from(outcome: FrameOutcome) -> Self {
        match outcome {
            FrameOutcome::Applied(applied) => Self {
                applied: true,
                dead_letter_id: None,
                detail: format!("{applied:?}"),
            },
            FrameOutcome::DeadLettered { id, error, .. } => Self {
                applied: false,
                dead_letter_id: Some(id),
                detail: error.to_string(),
            },
        }
    }
}

/// Admin API error, rendered as a JSON body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The origin repository could not be reached.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::EntryNotFound(id) => Self::NotFound(format!("dead-letter entry {id}")),
            Error::Frame(e) => Self::BadRequest(e.to_string()),
            Error::Http(e) => Self::Upstream(e.to_string()),
            Error::Transport(msg) => Self::Upstream(msg),
            other => Self::Internal(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg.clone())),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg.clone())),
            Self::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", Some(msg.clone())),
            Self::Internal(err) => {
                error!(error = %err, "admin request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    Some(err.to_string()),
                )
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Build the admin router.
pub fn router<F: RecordFetcher + 'static>(state: AdminState<F>) -> Router {
    Router::new()
        .route("/reindex", post(reindex::<F>))
        .route("/deadletters/{id}/requeue", post(requeue::<F>))
        .route("/deadletters/sweep", post(sweep::<F>))
        .with_state(state)
}

/// Bind `addr` and serve the admin API in the background.
///
/// Returns the bound address, which differs from `addr` when it asks for
/// port 0.
pub async fn start_admin_server<F: RecordFetcher + 'static>(
    addr: SocketAddr,
    state: AdminState<F>,
) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("Admin API listening on http://{}", local);

    let app = router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Admin server stopped: {}", e);
        }
    });

    Ok(local)
}

fn record_request(route: &'static str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("admin_requests_total", "route" => route, "result" => result).increment(1);
}

async fn reindex<F: RecordFetcher + 'static>(
    State(state): State<AdminState<F>>,
    Json(request): Json<ReindexRequest>,
) -> std::result::Result<Json<OutcomeResponse>, ApiError> {
    let outcome = state.reindexer.reindex(&request.uri).await;
    record_request("reindex", outcome.is_ok());
    Ok(Json(outcome?.into()))
}

async fn requeue<F: RecordFetcher + 'static>(
    State(state): State<AdminState<F>>,
    Path(id): Path<i64>,
) -> std::result::Result<Json<OutcomeResponse>, ApiError> {
    let processor = Arc::clone(&state.processor);
    let outcome = tokio::task::spawn_blocking(move || processor.requeue(id))
        .await
        .map_err(|e| Error::Task(format!("requeue of entry {id} failed: {e}")))
        .and_then(|result| result);
    record_request("requeue", outcome.is_ok());
    Ok(Json(outcome?.into()))
}

async fn sweep<F: RecordFetcher + 'static>(
    State(state): State<AdminState<F>>,
    Query(query): Query<SweepQuery>,
) -> std::result::Result<Json<SweepReport>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_SWEEP_LIMIT);
    let processor = Arc::clone(&state.processor);
    let report = tokio::task::spawn_blocking(move || processor.sweep(limit))
        .await
        .map_err(|e| Error::Task(format!("sweep failed: {e}")))
        .and_then(|result| result);
    record_request("sweep", report.is_ok());
    Ok(Json(report?))
}

/// HTTP client for a running daemon's admin API.
pub struct AdminClient {
    client: reqwest::Client,
    base: String,
}

impl AdminClient {
    pub fn new(base: &str) -> Result<Self> {
        Url::parse(base).map_err(|e| Error::Config(format!("invalid admin URL '{base}': {e}")))?;
        // Sweeps can run for minutes.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn reindex(&self, uri: &str) -> Result<OutcomeResponse> {
        let response = self
            .client
            .post(format!("{}/reindex", self.base))
            .json(&ReindexRequest {
                uri: uri.to_string(),
            })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn requeue(&self, id: i64) -> Result<OutcomeResponse> {
        let response = self
            .client
            .post(format!("{}/deadletters/{}/requeue", self.base, id))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn sweep(&self, limit: usize) -> Result<SweepReport> {
        let response = self
            .client
            .post(format!("{}/deadletters/sweep?limit={}", self.base, limit))
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await?;
    let message = match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => err.message.unwrap_or(err.error),
        Err(_) => body,
    };
    Err(Error::Transport(format!("daemon returned {status}: {message}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Applied;
    use crate::error::{FrameError, StoreError, StoreErrorKind};
    use crate::saga::IndexingStage;

    #[test]
    fn test_outcome_response() {
        let applied: OutcomeResponse =
            FrameOutcome::Applied(Applied::Indexed(vec![IndexingStage::Relational])).into();
        assert!(applied.applied);
        assert_eq!(applied.dead_letter_id, None);

        let dead: OutcomeResponse = FrameOutcome::DeadLettered {
            id: 7,
            classification: crate::Classification::Retryable,
            error: FrameError::TransientStoreFailure(StoreError::new(
                "rocksdb",
                StoreErrorKind::Timeout,
                "slow",
            )),
        }
        .into();
        assert!(!dead.applied);
        assert_eq!(dead.dead_letter_id, Some(7));
        assert!(dead.detail.contains("slow"));
    }

    #[test]
    fn test_error_status() {
        let status = |e: Error| ApiError::from(e).into_response().status();
        assert_eq!(status(Error::EntryNotFound(3)), StatusCode::NOT_FOUND);
        assert_eq!(
            status(Error::Transport("origin down".to_string())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(Error::Database("locked".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_client_rejects_bad_url() {
        assert!(matches!(AdminClient::new("not a url"), Err(Error::Config(_))));
    }
}
