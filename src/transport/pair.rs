//! In-memory two-ended transport. The client side looks like any other
//! connector; the server side is a test driver that records what the
//! client sent and injects inbound traffic, one session per connect so
//! reconnects are observable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use super::{Transport, TransportConnector, TransportError, TransportEvent, TransportHandle};
use crate::protocol::{wire, Frame, WireMessage};

/// Creates a connector for the client and the matching server end for
/// the test driver.
pub fn pair() -> (PairedConnector, ServerEnd) {
    let (session_tx, session_rx) = mpsc::unbounded_channel();
    (
        PairedConnector {
            session_tx,
            refuse: Arc::new(AtomicUsize::new(0)),
        },
        ServerEnd {
            session_rx,
            connects: Arc::new(AtomicUsize::new(0)),
        },
    )
}

pub struct PairedConnector {
    session_tx: mpsc::UnboundedSender<ServerSession>,
    refuse: Arc<AtomicUsize>,
}

impl PairedConnector {
    /// Makes the next `count` connection attempts fail.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportConnector for PairedConnector {
    async fn connect(
        &self,
        url: Url,
        _headers: &HashMap<String, String>,
    ) -> Result<TransportHandle, TransportError> {
        if self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::ConnectFailed("refused by test".into()));
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(Mutex::new(None));
        let _ = event_tx.send(TransportEvent::Open);

        let session = ServerSession {
            url,
            sent_rx,
            event_tx: event_tx.clone(),
            closed: Arc::clone(&closed),
        };
        self.session_tx
            .send(session)
            .map_err(|_| TransportError::ConnectFailed("server end dropped".into()))?;

        Ok(TransportHandle {
            transport: Box::new(PairedTransport { sent_tx, event_tx, closed }),
            events: event_rx,
        })
    }
}

struct PairedTransport {
    sent_tx: mpsc::UnboundedSender<WireMessage>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

impl Transport for PairedTransport {
    fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        if self.closed.lock().expect("pair lock").is_some() {
            return Err(TransportError::NotConnected);
        }
        self.sent_tx
            .send(message)
            .map_err(|_| TransportError::NotConnected)
    }

    fn close(&self, code: u16, reason: &str) {
        let mut closed = self.closed.lock().expect("pair lock");
        if closed.is_some() {
            return;
        }
        *closed = Some((code, reason.to_string()));
        let _ = self.event_tx.send(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Test-driver side of the pair: yields one [`ServerSession`] per client
/// connect.
pub struct ServerEnd {
    session_rx: mpsc::UnboundedReceiver<ServerSession>,
    connects: Arc<AtomicUsize>,
}

impl ServerEnd {
    /// Waits for the next connection attempt to succeed.
    pub async fn accept(&mut self) -> ServerSession {
        let session = self
            .session_rx
            .recv()
            .await
            .expect("client connector dropped");
        self.connects.fetch_add(1, Ordering::SeqCst);
        session
    }

    pub fn try_accept(&mut self) -> Option<ServerSession> {
        match self.session_rx.try_recv() {
            Ok(session) => {
                self.connects.fetch_add(1, Ordering::SeqCst);
                Some(session)
            }
            Err(_) => None,
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// One established connection, as the server sees it.
pub struct ServerSession {
    url: Url,
    sent_rx: mpsc::UnboundedReceiver<WireMessage>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<Mutex<Option<(u16, String)>>>,
}

impl ServerSession {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Next raw message the client sent, or `None` after `wait`.
    pub async fn recv_raw(&mut self, wait: Duration) -> Option<WireMessage> {
        tokio::time::timeout(wait, self.sent_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next decoded frame the client sent; panics on decode failure so
    /// tests fail loudly.
    pub async fn recv_frame(&mut self, wait: Duration) -> Option<Frame> {
        let raw = self.recv_raw(wait).await?;
        Some(wire::decode(&raw).expect("client sent an undecodable frame"))
    }

    /// Injects a frame as if the server had sent it.
    pub fn send_frame(&self, frame: &Frame) {
        let message = wire::encode(frame).expect("test frame must encode");
        let _ = self.event_tx.send(TransportEvent::Message(message));
    }

    /// Injects a raw transport message.
    pub fn send_raw(&self, message: WireMessage) {
        let _ = self.event_tx.send(TransportEvent::Message(message));
    }

    /// Simulates the connection dropping out from under the client.
    pub fn drop_connection(&self, code: u16, reason: &str) {
        let _ = self.event_tx.send(TransportEvent::Error("connection lost".into()));
        let _ = self.event_tx.send(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    /// Close initiated by the client, if any.
    pub fn client_close(&self) -> Option<(u16, String)> {
        self.closed.lock().expect("pair lock").clone()
    }
}
