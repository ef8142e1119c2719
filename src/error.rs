use thiserror::Error;

use crate::protocol::wire::WireError;
use crate::transport::TransportError;

/// Errors surfaced by the realtime client.
///
/// Recoverable faults (socket drops, push timeouts, token-provider
/// failures) are handled internally by the backoff machinery and never
/// appear here; subscription callbacks are the signal for those.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("push timed out after {0:?}")]
    PushTimeout(std::time::Duration),

    #[error("channel is not subscribed; call subscribe() first")]
    NotSubscribed,

    #[error("subscription rejected: {0}")]
    Subscription(String),

    #[error("on_message hook returned no payload for a non-empty payload")]
    BadHook,

    #[error("access token provider failed: {0}")]
    TokenProvider(String),

    #[error("broadcast endpoint error: {0}")]
    Http(String),

    #[error("client has been dropped")]
    ClientGone,
}

impl From<reqwest::Error> for RealtimeError {
    fn from(err: reqwest::Error) -> Self {
        RealtimeError::Http(err.to_string())
    }
}
