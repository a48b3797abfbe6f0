//! Privileged write path.
//!
//! Updates entered by an operator are posted to the admin endpoint. The
//! client state is not touched; the change returns through the push feed.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::model::state::MatchId;
use crate::model::update::Topic;
use crate::sync::error::SyncError;
use crate::transport::TransportError;

/// Destination of privileged updates.
#[async_trait]
pub trait UpdateWriter: Send + Sync + 'static {
    /// Submit one update.
    async fn send(&self, match_id: MatchId, topic: Topic, data: Value) -> Result<(), SyncError>;
}

/// Writer posting `{type, data}` to `{api_base}/api/admin/matches/{id}/live-update`.
#[derive(Debug, Clone)]
pub struct HttpUpdateWriter {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl HttpUpdateWriter {
    /// Writer for the REST API at `api_base`, authenticating with `token`.
    pub fn new(http: reqwest::Client, api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, match_id: MatchId) -> String {
        format!("{}/api/admin/matches/{}/live-update", self.api_base, match_id)
    }
}

#[async_trait]
impl UpdateWriter for HttpUpdateWriter {
    #[instrument(skip(self, data))]
    async fn send(&self, match_id: MatchId, topic: Topic, data: Value) -> Result<(), SyncError> {
        let mut request = self
            .http
            .post(self.url(match_id))
            .json(&json!({ "type": topic, "data": data }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(TransportError::from)?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            let reason = if body.is_empty() { status.to_string() } else { body };
            return Err(SyncError::Auth(reason));
        }
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()).into());
        }
        info!(match_id, %topic, "live update accepted");
        Ok(())
    }
}
