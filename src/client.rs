//! The client owns the socket: connection lifecycle, heartbeats,
//! reconnect backoff, send buffering, ref generation, and routing of
//! inbound frames to channels.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use url::Url;

use crate::backoff::BackoffTimer;
use crate::channel::{Channel, ChannelInner};
use crate::config::{ChannelConfig, ClientConfig, LogLevel};
use crate::error::RealtimeError;
use crate::http::{broadcast_url, BroadcastBackend, BroadcastRequest, ReqwestBroadcastBackend};
use crate::protocol::{event, wire, Frame, Payload, WireMessage, PHOENIX_TOPIC, VSN};
use crate::push::SendStatus;
use crate::transport::{Transport, TransportEvent};

/// Ref counter wrap point: the largest integer a JSON number consumer
/// handles exactly. No in-flight push survives long enough to collide.
const REF_WRAP: u64 = 1 << 53;

/// What heartbeat listeners observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Sent,
    Ok,
    Timeout,
    Error,
}

#[derive(Default)]
struct ClientHooks {
    open: Vec<Arc<dyn Fn() + Send + Sync>>,
    close: Vec<Arc<dyn Fn(u16, &str) + Send + Sync>>,
    error: Vec<Arc<dyn Fn(&str) + Send + Sync>>,
    message: Vec<Arc<dyn Fn(&Frame) + Send + Sync>>,
    heartbeat: Vec<Arc<dyn Fn(HeartbeatStatus) + Send + Sync>>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    channels: Mutex<Vec<Arc<ChannelInner>>>,
    send_buffer: Mutex<Vec<Frame>>,
    ref_counter: AtomicU64,
    pending_heartbeat_ref: Mutex<Option<String>>,
    access_token: Mutex<Option<String>>,
    connected: AtomicBool,
    manual_disconnect: AtomicBool,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    ingress_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_timer: BackoffTimer,
    hooks: Mutex<ClientHooks>,
    broadcast_backend: Arc<dyn BroadcastBackend>,
}

impl ClientInner {
    fn new(config: ClientConfig) -> Arc<Self> {
        let broadcast_backend = config
            .broadcast_backend
            .clone()
            .unwrap_or_else(|| Arc::new(ReqwestBroadcastBackend::new()));
        let initial_token = config.access_token.clone();
        let reconnect_after = Arc::clone(&config.reconnect_after);

        Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let reconnect_target = weak.clone();
            let reconnect_timer = BackoffTimer::new(
                Arc::new(move || {
                    if let Some(inner) = reconnect_target.upgrade() {
                        tokio::spawn(async move {
                            inner.reconnect().await;
                        });
                    }
                }),
                reconnect_after,
            );

            ClientInner {
                config,
                transport: Mutex::new(None),
                channels: Mutex::new(Vec::new()),
                send_buffer: Mutex::new(Vec::new()),
                ref_counter: AtomicU64::new(0),
                pending_heartbeat_ref: Mutex::new(None),
                access_token: Mutex::new(initial_token),
                connected: AtomicBool::new(false),
                manual_disconnect: AtomicBool::new(false),
                heartbeat_task: Mutex::new(None),
                ingress_task: Mutex::new(None),
                reconnect_timer,
                hooks: Mutex::new(ClientHooks::default()),
                broadcast_backend,
            }
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn access_token(&self) -> Option<String> {
        self.access_token.lock().unwrap().clone()
    }

    /// Monotone counter, stringified, wrapping back to zero well before
    /// any duplicate could still be in flight.
    pub(crate) fn make_ref(&self) -> String {
        let previous = self
            .ref_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |reference| {
                Some((reference + 1) % REF_WRAP)
            })
            .unwrap_or(0);
        ((previous + 1) % REF_WRAP).to_string()
    }

    fn log(&self, level: LogLevel, kind: &str, message: &str, data: Value) {
        if let Some(logger) = &self.config.logger {
            if level >= self.config.log_level {
                logger(level, &format!("{kind}: {message}"), &data);
            }
        }
    }

    // ── connection lifecycle ────────────────────────────────────────────

    fn build_url(&self) -> Result<Url, RealtimeError> {
        let mut url = Url::parse(&self.config.endpoint)
            .map_err(|err| RealtimeError::InvalidConfig(format!("invalid endpoint: {err}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RealtimeError::InvalidConfig("endpoint cannot be a base".into()))?;
            segments.pop_if_empty().push("websocket");
        }
        let params = self.config.params.resolve();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("vsn", VSN);
            for (key, value) in &params {
                pairs.append_pair(key, value);
            }
            if let Some(api_key) = &self.config.api_key {
                if !params.contains_key("apikey") {
                    pairs.append_pair("apikey", api_key);
                }
            }
        }
        Ok(url)
    }

    async fn connect_socket(self: &Arc<Self>) -> Result<(), RealtimeError> {
        if self.transport.lock().unwrap().is_some() {
            return Ok(());
        }
        let url = self.build_url()?;
        debug!(url = %url, "connecting");
        let handle = self
            .config
            .connector
            .connect(url, &self.config.headers)
            .await?;
        let transport: Arc<dyn Transport> = Arc::from(handle.transport);
        {
            let mut slot = self.transport.lock().unwrap();
            if slot.is_some() {
                // Another connect won the race; discard this socket.
                transport.close(1000, "duplicate connection");
                return Ok(());
            }
            *slot = Some(transport);
        }
        let ingress = tokio::spawn(run_ingress(Arc::downgrade(self), handle.events));
        if let Some(previous) = self.ingress_task.lock().unwrap().replace(ingress) {
            previous.abort();
        }
        Ok(())
    }

    async fn reconnect(self: Arc<Self>) {
        if self.manual_disconnect.load(Ordering::SeqCst) {
            return;
        }
        self.drop_socket();
        if let Err(err) = self.connect_socket().await {
            warn!(error = %err, "reconnect attempt failed");
            self.log(LogLevel::Warn, "transport", "reconnect failed", json!({}));
            self.reconnect_timer.schedule();
        }
    }

    fn drop_socket(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(transport) = self.transport.lock().unwrap().take() {
            transport.close(1000, "");
        }
    }

    fn on_conn_open(self: &Arc<Self>) {
        debug!(endpoint = %self.config.endpoint, "connected");
        self.log(LogLevel::Info, "transport", "connected", json!({}));
        self.connected.store(true, Ordering::SeqCst);
        *self.pending_heartbeat_ref.lock().unwrap() = None;
        self.flush_send_buffer();
        self.reconnect_timer.reset();
        self.start_heartbeat();
        let hooks = self.hooks.lock().unwrap().open.clone();
        for hook in hooks {
            hook();
        }
    }

    fn on_conn_close(self: &Arc<Self>, code: u16, reason: &str) {
        debug!(code, %reason, "connection closed");
        self.log(
            LogLevel::Info,
            "transport",
            "closed",
            json!({"code": code, "reason": reason}),
        );
        self.connected.store(false, Ordering::SeqCst);
        self.transport.lock().unwrap().take();
        self.trigger_chan_error();
        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
        if !self.manual_disconnect.load(Ordering::SeqCst) {
            self.reconnect_timer.schedule();
        }
        let hooks = self.hooks.lock().unwrap().close.clone();
        for hook in hooks {
            hook(code, reason);
        }
    }

    fn on_conn_error(self: &Arc<Self>, message: &str) {
        warn!(error = %message, "connection error");
        self.log(
            LogLevel::Error,
            "transport",
            "error",
            json!({"error": message}),
        );
        self.trigger_chan_error();
        let hooks = self.hooks.lock().unwrap().error.clone();
        for hook in hooks {
            hook(message);
        }
    }

    /// Every channel sees `phx_error` so it enters errored and begins
    /// rejoining; channels that are leaving or closed ignore it.
    fn trigger_chan_error(self: &Arc<Self>) {
        let channels: Vec<Arc<ChannelInner>> =
            self.channels.lock().unwrap().iter().cloned().collect();
        for channel in channels {
            let _ = channel.trigger(event::ERROR, Payload::Json(json!({})), None, None);
        }
    }

    fn on_conn_message(self: &Arc<Self>, message: WireMessage) {
        let frame = match &self.config.decode {
            Some(decode) => decode(&message),
            None => wire::decode(&message),
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                // A bad frame is dropped; the socket stays open.
                warn!(error = %err, "dropping undecodable frame");
                self.log(LogLevel::Warn, "receive", "bad frame dropped", json!({}));
                return;
            }
        };

        if let Some(reference) = &frame.reference {
            let mut pending = self.pending_heartbeat_ref.lock().unwrap();
            if pending.as_deref() == Some(reference.as_str()) {
                *pending = None;
                drop(pending);
                trace!("heartbeat acknowledged");
                self.fire_heartbeat(HeartbeatStatus::Ok);
            }
        }

        trace!(
            topic = %frame.topic,
            event = %frame.event,
            reference = frame.reference.as_deref().unwrap_or(""),
            "received frame"
        );
        self.log(
            LogLevel::Debug,
            "receive",
            &format!("{} {}", frame.topic, frame.event),
            json!({"ref": frame.reference}),
        );

        let channels: Vec<Arc<ChannelInner>> = self
            .channels
            .lock()
            .unwrap()
            .iter()
            .filter(|channel| channel.topic() == frame.topic)
            .cloned()
            .collect();
        for channel in channels {
            if let Err(err) = channel.trigger(
                &frame.event,
                frame.payload.clone(),
                frame.reference.as_deref(),
                frame.join_ref.as_deref(),
            ) {
                error!(topic = %frame.topic, error = %err, "message dispatch failed");
            }
        }

        let hooks = self.hooks.lock().unwrap().message.clone();
        for hook in hooks {
            hook(&frame);
        }
    }

    // ── outbound ────────────────────────────────────────────────────────

    /// Sends now when connected, otherwise buffers; the buffer flushes
    /// FIFO on the next open.
    pub(crate) fn push(&self, frame: Frame) {
        self.log(
            LogLevel::Debug,
            "push",
            &format!("{} {}", frame.topic, frame.event),
            json!({"ref": frame.reference, "join_ref": frame.join_ref}),
        );
        if self.is_connected() {
            self.send_now(frame);
        } else {
            self.send_buffer.lock().unwrap().push(frame);
        }
    }

    fn send_now(&self, frame: Frame) {
        let encoded = match &self.config.encode {
            Some(encode) => encode(&frame),
            None => wire::encode(&frame),
        };
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, "dropping unencodable frame");
                return;
            }
        };
        let transport = self.transport.lock().unwrap().clone();
        let Some(transport) = transport else {
            return;
        };
        if let Err(err) = transport.send(encoded) {
            warn!(error = %err, "send failed");
        }
    }

    fn flush_send_buffer(&self) {
        let buffered: Vec<Frame> = self.send_buffer.lock().unwrap().drain(..).collect();
        for frame in buffered {
            self.send_now(frame);
        }
    }

    // ── heartbeat ───────────────────────────────────────────────────────

    fn start_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the immediate tick
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.send_heartbeat().await {
                    return;
                }
            }
        });
        if let Some(previous) = self.heartbeat_task.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    /// One heartbeat tick. An unanswered previous heartbeat closes the
    /// socket; the close event takes recovery from there.
    async fn send_heartbeat(self: &Arc<Self>) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.pending_heartbeat_ref.lock().unwrap().take().is_some() {
            warn!("heartbeat timeout, closing socket");
            self.log(LogLevel::Warn, "transport", "heartbeat timeout", json!({}));
            self.fire_heartbeat(HeartbeatStatus::Timeout);
            let transport = self.transport.lock().unwrap().clone();
            if let Some(transport) = transport {
                transport.close(1000, "heartbeat timeout");
            }
            return false;
        }

        // Heartbeats double as the token refresh tick.
        let _ = self.set_auth_inner(None).await;

        let reference = self.make_ref();
        *self.pending_heartbeat_ref.lock().unwrap() = Some(reference.clone());
        let frame = Frame::new(
            None,
            Some(reference),
            PHOENIX_TOPIC,
            event::HEARTBEAT,
            Payload::Json(json!({})),
        );

        let encoded = match wire::encode(&frame) {
            Ok(encoded) => encoded,
            Err(_) => return true,
        };
        let transport = self.transport.lock().unwrap().clone();
        let Some(transport) = transport else {
            self.fire_heartbeat(HeartbeatStatus::Error);
            return false;
        };
        match transport.send(encoded) {
            Ok(()) => {
                trace!("heartbeat sent");
                self.fire_heartbeat(HeartbeatStatus::Sent);
                true
            }
            Err(err) => {
                warn!(error = %err, "heartbeat send failed");
                self.fire_heartbeat(HeartbeatStatus::Error);
                true
            }
        }
    }

    fn fire_heartbeat(&self, status: HeartbeatStatus) {
        let hooks = self.hooks.lock().unwrap().heartbeat.clone();
        for hook in hooks {
            hook(status);
        }
    }

    // ── access token ────────────────────────────────────────────────────

    /// Resolves the current token (explicit beats provider beats stored),
    /// then re-announces it on every joined channel. Provider failures
    /// fall back to the stored token.
    pub(crate) async fn set_auth_inner(
        self: &Arc<Self>,
        explicit: Option<String>,
    ) -> Result<(), RealtimeError> {
        let mut provider_error = None;
        let token = match explicit {
            Some(token) => Some(token),
            None => match &self.config.access_token_provider {
                Some(provider) => match provider().await {
                    Ok(token) => Some(token),
                    Err(err) => {
                        debug!(error = %err, "token provider failed, keeping current token");
                        provider_error = Some(RealtimeError::TokenProvider(err));
                        self.access_token()
                    }
                },
                None => self.access_token(),
            },
        };

        let changed = {
            let mut current = self.access_token.lock().unwrap();
            let changed = *current != token;
            *current = token.clone();
            changed
        };

        // Joined channels learn the new token right away; the join
        // payload provider picks it up on the next rejoin regardless.
        if changed {
            if let Some(token) = token {
                let channels: Vec<Arc<ChannelInner>> =
                    self.channels.lock().unwrap().iter().cloned().collect();
                for channel in channels {
                    if channel.is_joined() {
                        let _ = channel.push(
                            event::ACCESS_TOKEN,
                            json!({"access_token": token}),
                            None,
                        );
                    }
                }
            }
        }

        match provider_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub(crate) fn spawn_token_refresh(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.set_auth_inner(None).await;
        });
    }

    // ── channels ────────────────────────────────────────────────────────

    pub(crate) fn add_channel(self: &Arc<Self>, channel: &Arc<ChannelInner>) {
        let mut channels = self.channels.lock().unwrap();
        if !channels.iter().any(|existing| Arc::ptr_eq(existing, channel)) {
            channels.push(Arc::clone(channel));
        }
    }

    /// Erases a channel by join-ref identity (pointer identity when it
    /// never joined).
    pub(crate) fn remove_channel(&self, channel: &Arc<ChannelInner>) {
        let target = channel.join_ref();
        self.channels.lock().unwrap().retain(|existing| {
            if Arc::ptr_eq(existing, channel) {
                return false;
            }
            match (&target, existing.join_ref()) {
                (Some(target), Some(join_ref)) => join_ref != *target,
                _ => true,
            }
        });
    }

    /// The server allows one live subscription per topic; an existing
    /// joined or joining channel on the topic is unsubscribed first.
    pub(crate) fn leave_open_topic(&self, topic: &str, except: &Arc<ChannelInner>) {
        let duplicate = self
            .channels
            .lock()
            .unwrap()
            .iter()
            .find(|channel| {
                channel.topic() == topic
                    && !Arc::ptr_eq(channel, except)
                    && (channel.is_joined() || channel.is_joining())
            })
            .cloned();
        if let Some(duplicate) = duplicate {
            warn!(topic = %topic, "leaving duplicate topic");
            tokio::spawn(async move {
                duplicate.unsubscribe(None).await;
            });
        }
    }

    pub(crate) async fn broadcast_http(
        &self,
        topic: &str,
        broadcast_event: &str,
        payload: Value,
        private: bool,
        timeout: Duration,
    ) -> Result<(), RealtimeError> {
        let endpoint = broadcast_url(&self.config.endpoint)?;
        let request = BroadcastRequest {
            endpoint,
            api_key: self.config.api_key.clone(),
            access_token: self.access_token(),
            topic: topic.to_string(),
            event: broadcast_event.to_string(),
            payload,
            private,
            timeout,
        };
        self.broadcast_backend.broadcast(request).await
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Ok(mut task) = self.heartbeat_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        if let Ok(mut task) = self.ingress_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn run_ingress(
    weak: Weak<ClientInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(transport_event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match transport_event {
            TransportEvent::Open => inner.on_conn_open(),
            TransportEvent::Message(message) => inner.on_conn_message(message),
            TransportEvent::Error(message) => inner.on_conn_error(&message),
            TransportEvent::Closed { code, reason } => {
                inner.on_conn_close(code, &reason);
                return;
            }
        }
    }
}

/// Multiplexes channels over one socket connection. Cheaply cloneable.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, RealtimeError> {
        Url::parse(&config.endpoint)
            .map_err(|err| RealtimeError::InvalidConfig(format!("invalid endpoint: {err}")))?;
        Ok(Self {
            inner: ClientInner::new(config),
        })
    }

    /// Establishes the socket. A no-op when a socket already exists.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        self.inner
            .manual_disconnect
            .store(false, Ordering::SeqCst);
        self.inner.connect_socket().await
    }

    /// Closes the socket with a normal close. No reconnect follows; the
    /// channels err out and rejoin once `connect` is called again.
    pub async fn disconnect(&self) {
        self.disconnect_with(1000, "").await;
    }

    pub async fn disconnect_with(&self, code: u16, reason: &str) {
        let inner = &self.inner;
        inner.manual_disconnect.store(true, Ordering::SeqCst);
        inner.reconnect_timer.reset();
        *inner.pending_heartbeat_ref.lock().unwrap() = None;
        if let Some(task) = inner.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = inner.ingress_task.lock().unwrap().take() {
            task.abort();
        }
        inner.connected.store(false, Ordering::SeqCst);
        if let Some(transport) = inner.transport.lock().unwrap().take() {
            transport.close(code, reason);
        }
        inner.trigger_chan_error();
        let hooks = inner.hooks.lock().unwrap().close.clone();
        for hook in hooks {
            hook(code, reason);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// The socket URL this client connects to, with current params.
    pub fn endpoint_url(&self) -> Result<Url, RealtimeError> {
        self.inner.build_url()
    }

    /// Creates and registers a channel on `topic`.
    pub fn channel(&self, topic: impl Into<String>, config: ChannelConfig) -> Channel {
        let inner = ChannelInner::new(
            topic.into(),
            config,
            Arc::downgrade(&self.inner),
            self.inner.config.timeout,
            Arc::clone(&self.inner.config.rejoin_after),
        );
        self.inner.add_channel(&inner);
        Channel { inner }
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.inner
            .channels
            .lock()
            .unwrap()
            .iter()
            .map(|inner| Channel {
                inner: Arc::clone(inner),
            })
            .collect()
    }

    /// Unsubscribes and tears down one channel.
    pub async fn remove_channel(&self, channel: Channel) -> SendStatus {
        let status = channel.inner.unsubscribe(None).await;
        channel.inner.teardown();
        status
    }

    pub async fn remove_all_channels(&self) {
        let channels: Vec<Arc<ChannelInner>> =
            self.inner.channels.lock().unwrap().iter().cloned().collect();
        for channel in channels {
            channel.unsubscribe(None).await;
            channel.teardown();
        }
    }

    /// Replaces the access token (or re-resolves it through the provider
    /// when `None`) and re-announces it on every joined channel.
    pub async fn set_auth(&self, token: Option<String>) -> Result<(), RealtimeError> {
        self.inner.set_auth_inner(token).await
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.access_token()
    }

    pub fn on_open(&self, hook: impl Fn() + Send + Sync + 'static) -> &Self {
        self.inner.hooks.lock().unwrap().open.push(Arc::new(hook));
        self
    }

    pub fn on_close(&self, hook: impl Fn(u16, &str) + Send + Sync + 'static) -> &Self {
        self.inner.hooks.lock().unwrap().close.push(Arc::new(hook));
        self
    }

    pub fn on_error(&self, hook: impl Fn(&str) + Send + Sync + 'static) -> &Self {
        self.inner.hooks.lock().unwrap().error.push(Arc::new(hook));
        self
    }

    pub fn on_message(&self, hook: impl Fn(&Frame) + Send + Sync + 'static) -> &Self {
        self.inner
            .hooks
            .lock()
            .unwrap()
            .message
            .push(Arc::new(hook));
        self
    }

    pub fn on_heartbeat(
        &self,
        hook: impl Fn(HeartbeatStatus) + Send + Sync + 'static,
    ) -> &Self {
        self.inner
            .hooks
            .lock()
            .unwrap()
            .heartbeat
            .push(Arc::new(hook));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn client(endpoint: &str) -> Client {
        Client::new(ClientConfig::new(endpoint)).expect("client")
    }

    #[tokio::test]
    async fn socket_url_appends_websocket_and_vsn() {
        let client = client("wss://r/socket");
        let url = client.endpoint_url().unwrap();
        assert_eq!(url.as_str(), "wss://r/socket/websocket?vsn=1.0.0");
    }

    #[tokio::test]
    async fn socket_url_carries_params_and_api_key() {
        let mut params = std::collections::HashMap::new();
        params.insert("token".to_string(), "abc".to_string());
        let client = Client::new(
            ClientConfig::new("wss://r/socket")
                .params(params)
                .api_key("anon"),
        )
        .unwrap();
        let url = client.endpoint_url().unwrap();
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query.get("vsn").map(String::as_str), Some("1.0.0"));
        assert_eq!(query.get("token").map(String::as_str), Some("abc"));
        assert_eq!(query.get("apikey").map(String::as_str), Some("anon"));
    }

    #[tokio::test]
    async fn params_provider_refreshes_per_connect() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let client = Client::new(ClientConfig::new("wss://r/socket").params_provider(
            move || {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                let mut map = std::collections::HashMap::new();
                map.insert("attempt".to_string(), call.to_string());
                map
            },
        ))
        .unwrap();
        let first = client.endpoint_url().unwrap();
        let second = client.endpoint_url().unwrap();
        assert_ne!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refs_are_monotone_and_wrap() {
        let client = client("wss://r/socket");
        assert_eq!(client.inner.make_ref(), "1");
        assert_eq!(client.inner.make_ref(), "2");
        client.inner.ref_counter.store(REF_WRAP - 1, Ordering::SeqCst);
        assert_eq!(client.inner.make_ref(), "0");
        assert_eq!(client.inner.make_ref(), "1");
    }

    #[test]
    fn rejects_invalid_endpoint() {
        assert!(Client::new(ClientConfig::new("not a url")).is_err());
    }
}
