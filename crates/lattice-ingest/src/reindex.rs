//! Manual reindex trigger.
//!
//! Fetches the current version of a record from its origin repository and
//! runs it through the same [`FrameProcessor`] as the firehose, so retries,
//! compensation and dead-lettering behave identically. A record the origin
//! no longer has is removed from the stores.
//!
//! Synthesized frames use the wall-clock time in microseconds as sequence,
//! the same clock domain as the relay's `time_us`, so a reindex wins over
//! older firehose frames and loses to newer ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lattice_core::{CommitFrame, OperationKind, parse_at_uri};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::pipeline::{FrameOutcome, FrameProcessor};
use crate::{Error, Result};

/// Origin repository settings.
#[derive(Debug, Clone)]
pub struct ReindexConfig {
    /// Base URL of the PDS (or PDS proxy) serving `com.atproto.repo.getRecord`.
    pub origin: String,
    pub request_timeout: Duration,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            origin: "https://bsky.social".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Current state of a record at its origin.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchedRecord {
    Found { cid: String, value: serde_json::Value },
    NotFound,
}

/// Looks up records in their origin repository.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch(&self, did: &str, collection: &str, rkey: &str) -> Result<FetchedRecord>;
}

#[derive(Debug, Deserialize)]
struct GetRecordResponse {
    cid: Option<String>,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct XrpcError {
    error: String,
    #[serde(default)]
    message: Option<String>,
}

/// [`RecordFetcher`] over XRPC.
pub struct HttpRecordFetcher {
    client: reqwest::Client,
    config: ReindexConfig,
}

impl HttpRecordFetcher {
    pub fn new(config: ReindexConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// `getRecord` URL for one record.
    pub fn record_url(&self, did: &str, collection: &str, rkey: &str) -> Result<Url> {
        let base = format!(
            "{}/xrpc/com.atproto.repo.getRecord",
            self.config.origin.trim_end_matches('/')
        );
        Url::parse_with_params(
            &base,
            &[("repo", did), ("collection", collection), ("rkey", rkey)],
        )
        .map_err(|e| Error::Config(format!("invalid origin '{}': {}", self.config.origin, e)))
    }
}

#[async_trait]
impl RecordFetcher for HttpRecordFetcher {
    async fn fetch(&self, did: &str, collection: &str, rkey: &str) -> Result<FetchedRecord> {
        let url = self.record_url(did, collection, rkey)?;
        debug!("Fetching {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status.is_success() {
            let body: GetRecordResponse = response.json().await?;
            let cid = body.cid.ok_or_else(|| {
                Error::Transport(format!("origin returned {did}/{collection}/{rkey} without a cid"))
            })?;
            return Ok(FetchedRecord::Found {
                cid,
                value: body.value,
            });
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(FetchedRecord::NotFound);
        }

        let body = response.text().await?;
        match serde_json::from_str::<XrpcError>(&body) {
            Ok(xrpc) if xrpc.error == "RecordNotFound" => Ok(FetchedRecord::NotFound),
            Ok(xrpc) => Err(Error::Transport(format!(
                "origin returned {} {}: {}",
                status,
                xrpc.error,
                xrpc.message.unwrap_or_default()
            ))),
            Err(_) => Err(Error::Transport(format!("origin returned {status}: {body}"))),
        }
    }
}

/// Re-applies single records on demand.
pub struct Reindexer<F> {
    fetcher: F,
    processor: Arc<FrameProcessor>,
}

impl<F: RecordFetcher> Reindexer<F> {
    pub fn new(fetcher: F, processor: Arc<FrameProcessor>) -> Self {
        Self { fetcher, processor }
    }

    /// Reindex the record at `at_uri` and report the outcome.
    pub async fn reindex(&self, at_uri: &str) -> Result<FrameOutcome> {
        let (did, collection, rkey) = parse_at_uri(at_uri)?;
        let fetched = self.fetcher.fetch(did, collection, rkey).await?;

        let (operation, cid, record) = match fetched {
            FetchedRecord::Found { cid, value } => (OperationKind::Update, Some(cid), Some(value)),
            FetchedRecord::NotFound => (OperationKind::Delete, None, None),
        };

        let frame = CommitFrame {
            seq: wall_clock_seq(),
            did: did.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
            operation,
            cid,
            record,
            rev: None,
        };
        frame.validate()?;

        info!("Reindexing {} as {} at seq {}", at_uri, operation, frame.seq);

        let processor = Arc::clone(&self.processor);
        tokio::task::spawn_blocking(move || processor.process(&frame))
            .await
            .map_err(|e| Error::Task(format!("reindex of {at_uri} failed: {e}")))?
    }
}

fn wall_clock_seq() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}
