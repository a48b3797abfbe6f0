//! Fallback Poller
//!
//! Fetches full snapshots on an interval while the push channel is down.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, trace};

use crate::model::state::MatchId;
use crate::model::update::MatchSnapshot;
use crate::sync::error::SyncError;
use crate::transport::TransportError;

/// Source of full match snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    /// Fetch the current snapshot of a match.
    async fn fetch(&self, match_id: MatchId) -> Result<MatchSnapshot, SyncError>;
}

/// Snapshot source backed by `GET {api_base}/api/matches/{id}`.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    http: reqwest::Client,
    api_base: String,
}

impl HttpSnapshotSource {
    /// Source for the REST API at `api_base`.
    pub fn new(http: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self { http, api_base: api_base.into().trim_end_matches('/').to_string() }
    }

    fn url(&self, match_id: MatchId) -> String {
        format!("{}/api/matches/{}", self.api_base, match_id)
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    #[instrument(skip(self))]
    async fn fetch(&self, match_id: MatchId) -> Result<MatchSnapshot, SyncError> {
        let response = self
            .http
            .get(self.url(match_id))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(TransportError::from)?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::Auth(format!("snapshot request refused ({})", status)));
        }
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()).into());
        }
        let body = response.text().await.map_err(TransportError::from)?;
        MatchSnapshot::from_json(&body)
            .map_err(|e| SyncError::Protocol(format!("invalid snapshot: {}", e)))
    }
}

/// Poll `source` every `interval`, first fetch immediately, until `sink`
/// breaks. Ticks while `paused` holds are skipped.
pub(crate) async fn run<P, F>(
    source: Arc<dyn SnapshotSource>,
    match_id: MatchId,
    interval: Duration,
    paused: P,
    mut sink: F,
) where
    P: Fn() -> bool,
    F: FnMut(Result<MatchSnapshot, SyncError>) -> ControlFlow<()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(match_id, ?interval, "poller started");
    loop {
        ticker.tick().await;
        if paused() {
            trace!(match_id, "poll skipped while paused");
            continue;
        }
        let result = source.fetch(match_id).await;
        if sink(result).is_break() {
            debug!(match_id, "poller stopped");
            return;
        }
    }
}
