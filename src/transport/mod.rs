//! Transport abstraction the client drives. A connector hands back a send
//! handle plus a stream of events; the concrete WebSocket implementation
//! lives in [`websocket`], and [`pair`] provides an in-memory two-ended
//! transport for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::protocol::WireMessage;

pub mod pair;
pub mod websocket;

pub use pair::{pair, PairedConnector, ServerEnd, ServerSession};
pub use websocket::WebSocketConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    ConnectFailed(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("failed to send: {0}")]
    SendFailed(String),
}

/// What the transport reports back to the client.
#[derive(Debug)]
pub enum TransportEvent {
    Open,
    Message(WireMessage),
    Error(String),
    Closed { code: u16, reason: String },
}

/// Send half of an established connection. Exclusively owned by the
/// client; channels never touch it.
pub trait Transport: Send + Sync {
    fn send(&self, message: WireMessage) -> Result<(), TransportError>;
    fn close(&self, code: u16, reason: &str);
}

/// An established connection: the send handle plus the event stream.
pub struct TransportHandle {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Builds connections. The default is [`WebSocketConnector`]; tests swap
/// in [`PairedConnector`].
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        url: Url,
        headers: &HashMap<String, String>,
    ) -> Result<TransportHandle, TransportError>;
}
