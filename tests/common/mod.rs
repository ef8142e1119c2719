#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use riptide::protocol::event;
use riptide::transport::{pair, PairedConnector, ServerEnd, ServerSession};
use riptide::{
    ChannelConfig, Client, ClientConfig, Frame, Payload, RealtimeError, SubscribeStatus,
};

pub const WAIT: Duration = Duration::from_secs(1);
pub const SHORT: Duration = Duration::from_millis(200);

/// Client wired to an in-memory transport, plus the server driver.
pub fn paired_client(configure: impl FnOnce(ClientConfig) -> ClientConfig) -> (Client, ServerEnd) {
    let (connector, server) = pair();
    let config = configure(ClientConfig::new("wss://r/socket").transport(Arc::new(connector)));
    (Client::new(config).expect("client"), server)
}

/// Like [`paired_client`] but keeps a handle to the connector so tests
/// can make connection attempts fail.
pub fn paired_client_refusable(
    configure: impl FnOnce(ClientConfig) -> ClientConfig,
) -> (Client, ServerEnd, Arc<PairedConnector>) {
    let (connector, server) = pair();
    let connector = Arc::new(connector);
    let config =
        configure(ClientConfig::new("wss://r/socket").transport(connector.clone()));
    (Client::new(config).expect("client"), server, connector)
}

pub async fn connected(
    configure: impl FnOnce(ClientConfig) -> ClientConfig,
) -> (Client, ServerEnd, ServerSession) {
    let (client, mut server) = paired_client(configure);
    client.connect().await.expect("connect");
    let session = server.accept().await;
    (client, server, session)
}

/// Subscribe-status recorder backed by a channel so tests can await the
/// next status.
pub fn status_recorder() -> (
    impl Fn(SubscribeStatus, Option<&RealtimeError>) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<(SubscribeStatus, Option<String>)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |status: SubscribeStatus, error: Option<&RealtimeError>| {
        let _ = tx.send((status, error.map(|e| e.to_string())));
    };
    (callback, rx)
}

pub async fn next_status(
    rx: &mut mpsc::UnboundedReceiver<(SubscribeStatus, Option<String>)>,
) -> SubscribeStatus {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("status within deadline")
        .expect("status stream open")
        .0
}

pub fn ok_reply(request: &Frame, response: Value) -> Frame {
    reply(request, "ok", response)
}

pub fn error_reply(request: &Frame, response: Value) -> Frame {
    reply(request, "error", response)
}

pub fn reply(request: &Frame, status: &str, response: Value) -> Frame {
    Frame::new(
        request.join_ref.clone(),
        request.reference.clone(),
        request.topic.clone(),
        event::REPLY,
        Payload::Json(json!({"status": status, "response": response})),
    )
}

/// Joins `topic` and answers the join with an empty ok reply. Returns
/// the channel and its join frame.
pub async fn join_channel(
    client: &Client,
    session: &mut ServerSession,
    topic: &str,
) -> (riptide::Channel, Frame) {
    let channel = client.channel(topic, ChannelConfig::default());
    let (callback, mut statuses) = status_recorder();
    channel.subscribe(callback);
    let join = session.recv_frame(WAIT).await.expect("join frame");
    assert_eq!(join.event, event::JOIN);
    session.send_frame(&ok_reply(&join, json!({"postgres_changes": []})));
    assert_eq!(next_status(&mut statuses).await, SubscribeStatus::Subscribed);
    (channel, join)
}

/// Collects values pushed from callbacks for later assertions.
#[derive(Clone, Default)]
pub struct Recorder<T: Clone + Send> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send> Recorder<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}
