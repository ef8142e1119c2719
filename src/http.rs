//! HTTP fallback for broadcasts sent while the channel cannot push over
//! the socket.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use crate::error::RealtimeError;

/// One broadcast destined for the REST endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastRequest {
    pub endpoint: Url,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
    pub private: bool,
    pub timeout: Duration,
}

impl BroadcastRequest {
    pub fn body(&self) -> Value {
        json!({
            "messages": [{
                "topic": self.topic,
                "event": self.event,
                "payload": self.payload,
                "private": self.private,
            }]
        })
    }
}

/// Seam for the broadcast POST so tests can observe requests without a
/// live server.
#[async_trait]
pub trait BroadcastBackend: Send + Sync {
    async fn broadcast(&self, request: BroadcastRequest) -> Result<(), RealtimeError>;
}

pub(crate) struct ReqwestBroadcastBackend {
    client: reqwest::Client,
}

impl ReqwestBroadcastBackend {
    pub(crate) fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BroadcastBackend for ReqwestBroadcastBackend {
    async fn broadcast(&self, request: BroadcastRequest) -> Result<(), RealtimeError> {
        let mut builder = self
            .client
            .post(request.endpoint.clone())
            .timeout(request.timeout)
            .json(&request.body());
        if let Some(token) = &request.access_token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(api_key) = &request.api_key {
            builder = builder.header("apikey", api_key.clone());
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(RealtimeError::Http(format!(
                "broadcast endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Rewrites the socket endpoint into the REST base: scheme ws→http, any
/// `/socket`/`/websocket` suffix trimmed.
pub(crate) fn http_endpoint_url(endpoint: &str) -> Result<Url, RealtimeError> {
    let mut url = Url::parse(endpoint)
        .map_err(|err| RealtimeError::InvalidConfig(format!("invalid endpoint: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(RealtimeError::InvalidConfig(format!(
                "unsupported endpoint scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RealtimeError::InvalidConfig("cannot rewrite endpoint scheme".into()))?;

    let trimmed = url
        .path()
        .trim_end_matches('/')
        .trim_end_matches("/websocket")
        .trim_end_matches("/socket")
        .to_string();
    url.set_path(&trimmed);
    Ok(url)
}

/// The broadcast endpoint for a given socket endpoint.
pub(crate) fn broadcast_url(endpoint: &str) -> Result<Url, RealtimeError> {
    let base = http_endpoint_url(endpoint)?;
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| RealtimeError::InvalidConfig("endpoint cannot be a base".into()))?;
        segments.pop_if_empty().push("api").push("broadcast");
    }
    Ok(url)
}
