//! Per-topic channel: join/leave state machine, binding table, push
//! buffering, rejoin backoff, and the presence sub-object.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{trace, warn};

use crate::backoff::{BackoffTimer, DelayFn};
use crate::client::ClientInner;
use crate::config::ChannelConfig;
use crate::error::RealtimeError;
use crate::presence::{Presence, PresenceCallback, PresenceMeta, PresenceState};
use crate::protocol::{event, Payload, MAX_PUSH_BUFFER_SIZE};
use crate::push::{Push, PushPayload, PushShared, ReplyHook, SendStatus};

pub mod postgres;

pub use postgres::{PostgresChange, PostgresFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Errored,
    Joined,
    Joining,
    Leaving,
}

/// User-visible subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    TimedOut,
    Closed,
    ChannelError,
}

impl SubscribeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscribeStatus::Subscribed => "SUBSCRIBED",
            SubscribeStatus::TimedOut => "TIMED_OUT",
            SubscribeStatus::Closed => "CLOSED",
            SubscribeStatus::ChannelError => "CHANNEL_ERROR",
        }
    }
}

pub type SubscribeCallback =
    Arc<dyn Fn(SubscribeStatus, Option<&RealtimeError>) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(&Payload) + Send + Sync>;
pub type PostgresCallback = Arc<dyn Fn(&PostgresChange) + Send + Sync>;
/// Per-channel rewrite hook applied to every inbound message.
pub type MessageHook =
    Arc<dyn Fn(&str, Payload, Option<&str>) -> Option<Payload> + Send + Sync>;

enum BindingTarget {
    Event(EventCallback),
    Postgres {
        filter: PostgresFilter,
        id: Option<Value>,
        callback: PostgresCallback,
    },
}

struct Binding {
    /// Event filter for broadcast/presence/system bindings; `None`
    /// matches by type alone.
    filter_event: Option<String>,
    target: BindingTarget,
}

struct ChannelCore {
    state: ChannelState,
    joined_once: bool,
    config: ChannelConfig,
    timeout: Duration,
    bindings: HashMap<String, Vec<Binding>>,
    push_buffer: VecDeque<Arc<PushShared>>,
    subscribe_callback: Option<SubscribeCallback>,
    on_message: Option<MessageHook>,
    presence: Presence,
}

pub(crate) struct ChannelInner {
    topic: String,
    client: Weak<ClientInner>,
    core: Mutex<ChannelCore>,
    rejoin_timer: BackoffTimer,
    join_push: Arc<PushShared>,
}

impl ChannelInner {
    pub(crate) fn new(
        topic: String,
        config: ChannelConfig,
        client: Weak<ClientInner>,
        timeout: Duration,
        rejoin_after: DelayFn,
    ) -> Arc<Self> {
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let payload_source = weak.clone();
            let join_push = PushShared::new(
                weak.clone(),
                event::JOIN,
                PushPayload::Provider(Arc::new(move || {
                    payload_source
                        .upgrade()
                        .map(|channel| channel.build_join_payload())
                        .unwrap_or_else(|| json!({}))
                })),
                timeout,
            );

            let rejoin_target = weak.clone();
            let rejoin_timer = BackoffTimer::new(
                Arc::new(move || {
                    if let Some(channel) = rejoin_target.upgrade() {
                        channel.rejoin_until_connected();
                    }
                }),
                rejoin_after,
            );

            ChannelInner {
                topic,
                client,
                core: Mutex::new(ChannelCore {
                    state: ChannelState::Closed,
                    joined_once: false,
                    config,
                    timeout,
                    bindings: HashMap::new(),
                    push_buffer: VecDeque::new(),
                    subscribe_callback: None,
                    on_message: None,
                    presence: Presence::default(),
                }),
                rejoin_timer,
                join_push,
            }
        });
        inner.wire_join_hooks();
        inner
    }

    fn wire_join_hooks(self: &Arc<Self>) {
        let ok_target = Arc::downgrade(self);
        self.join_push.receive(
            "ok",
            Arc::new(move |response| {
                if let Some(channel) = ok_target.upgrade() {
                    channel.handle_join_ok(response);
                }
            }),
        );
        let error_target = Arc::downgrade(self);
        self.join_push.receive(
            "error",
            Arc::new(move |response| {
                if let Some(channel) = error_target.upgrade() {
                    channel.handle_join_error(response);
                }
            }),
        );
        let timeout_target = Arc::downgrade(self);
        self.join_push.receive(
            "timeout",
            Arc::new(move |_| {
                if let Some(channel) = timeout_target.upgrade() {
                    channel.handle_join_timeout();
                }
            }),
        );
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    /// Topic with the optional `realtime:` namespace stripped, as the
    /// REST broadcast endpoint expects.
    fn sub_topic(&self) -> &str {
        self.topic
            .strip_prefix("realtime:")
            .unwrap_or(&self.topic)
    }

    pub(crate) fn client(&self) -> Option<Arc<ClientInner>> {
        self.client.upgrade()
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.core.lock().unwrap().state
    }

    pub(crate) fn join_ref(&self) -> Option<String> {
        self.join_push.reference()
    }

    pub(crate) fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    pub(crate) fn is_joining(&self) -> bool {
        self.state() == ChannelState::Joining
    }

    fn is_leaving_or_closed(&self) -> bool {
        matches!(
            self.state(),
            ChannelState::Leaving | ChannelState::Closed
        )
    }

    fn can_push(&self) -> bool {
        let connected = self
            .client()
            .map(|client| client.is_connected())
            .unwrap_or(false);
        connected && self.is_joined()
    }

    fn default_timeout(&self) -> Duration {
        self.core.lock().unwrap().timeout
    }

    fn subscribe_callback(&self) -> Option<SubscribeCallback> {
        self.core.lock().unwrap().subscribe_callback.clone()
    }

    fn notify(&self, status: SubscribeStatus, error: Option<&RealtimeError>) {
        if let Some(callback) = self.subscribe_callback() {
            callback(status, error);
        }
    }

    pub(crate) fn presence_state(&self) -> PresenceState {
        self.core.lock().unwrap().presence.state()
    }

    // ── subscribe / rejoin ──────────────────────────────────────────────

    /// First join. A second call is an idempotent no-op; a channel is
    /// never joined twice.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        callback: Option<SubscribeCallback>,
        timeout: Option<Duration>,
    ) {
        {
            let mut core = self.core.lock().unwrap();
            if core.joined_once {
                return;
            }
            if let Some(callback) = callback {
                core.subscribe_callback = Some(callback);
            }
            if let Some(timeout) = timeout {
                core.timeout = timeout;
            }
            core.joined_once = true;
        }
        self.rejoin();
    }

    /// Rejoin-timer target: keep the timer armed and join as soon as the
    /// socket is there.
    fn rejoin_until_connected(self: &Arc<Self>) {
        self.rejoin_timer.schedule();
        let connected = self
            .client()
            .map(|client| client.is_connected())
            .unwrap_or(false);
        if connected {
            self.rejoin();
        }
    }

    fn rejoin(self: &Arc<Self>) {
        if self.state() == ChannelState::Leaving {
            return;
        }
        if let Some(client) = self.client() {
            client.leave_open_topic(&self.topic, self);
        }
        let timeout = {
            let mut core = self.core.lock().unwrap();
            core.state = ChannelState::Joining;
            core.timeout
        };
        self.join_push.resend(timeout);
    }

    fn handle_join_ok(self: &Arc<Self>, response: &Payload) {
        if self.is_leaving_or_closed() {
            return;
        }

        let server_entries: Vec<Value> = response
            .json()
            .and_then(|value| value.get("postgres_changes"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let stamp_result = self.stamp_postgres_ids(&server_entries);

        match stamp_result {
            Ok(()) => {
                let buffered: Vec<Arc<PushShared>> = {
                    let mut core = self.core.lock().unwrap();
                    core.state = ChannelState::Joined;
                    core.push_buffer.drain(..).collect()
                };
                self.rejoin_timer.reset();
                for push in buffered {
                    push.send();
                }
                // A fresh join is the moment to re-announce credentials.
                if let Some(client) = self.client() {
                    client.spawn_token_refresh();
                }
                self.notify(SubscribeStatus::Subscribed, None);
            }
            Err(error) => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = this.unsubscribe(None).await;
                    this.core.lock().unwrap().state = ChannelState::Errored;
                    this.notify(SubscribeStatus::ChannelError, Some(&error));
                });
            }
        }
    }

    /// The join reply carries a server-assigned id per postgres filter;
    /// ids are stamped positionally after checking the filters agree.
    /// The server dispatches by id, so a mismatch is fatal for the
    /// subscription.
    fn stamp_postgres_ids(&self, server_entries: &[Value]) -> Result<(), RealtimeError> {
        let mut core = self.core.lock().unwrap();
        let Some(bindings) = core.bindings.get_mut(event::POSTGRES_CHANGES) else {
            return Ok(());
        };
        let mut index = 0usize;
        for binding in bindings.iter_mut() {
            let BindingTarget::Postgres { filter, id, .. } = &mut binding.target else {
                continue;
            };
            let entry = server_entries.get(index);
            match entry {
                Some(entry) if filter.matches_server_entry(entry) => {
                    *id = entry.get("id").cloned();
                }
                _ => {
                    return Err(RealtimeError::Subscription(format!(
                        "mismatch between server and client bindings for postgres changes: \
                         no server binding for {filter:?}"
                    )));
                }
            }
            index += 1;
        }
        Ok(())
    }

    fn handle_join_error(self: &Arc<Self>, response: &Payload) {
        if self.is_leaving_or_closed() {
            return;
        }
        warn!(topic = %self.topic, "channel join rejected");
        self.core.lock().unwrap().state = ChannelState::Errored;
        self.rejoin_timer.schedule();
        let message = response
            .json()
            .map(Value::to_string)
            .unwrap_or_else(|| "join error".to_string());
        let error = RealtimeError::Subscription(message);
        self.notify(SubscribeStatus::ChannelError, Some(&error));
    }

    fn handle_join_timeout(self: &Arc<Self>) {
        if !self.is_joining() {
            return;
        }
        trace!(topic = %self.topic, "channel join timed out");
        self.core.lock().unwrap().state = ChannelState::Errored;
        self.rejoin_timer.schedule();
        self.notify(SubscribeStatus::TimedOut, None);
    }

    fn build_join_payload(&self) -> Value {
        let (config, filters, presence_enabled) = {
            let core = self.core.lock().unwrap();
            let filters: Vec<PostgresFilter> = core
                .bindings
                .get(event::POSTGRES_CHANGES)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter_map(|binding| match &binding.target {
                            BindingTarget::Postgres { filter, .. } => Some(filter.clone()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();
            let presence_enabled = core
                .bindings
                .get(event::PRESENCE)
                .map(|bindings| !bindings.is_empty())
                .unwrap_or(false)
                || core.config.presence.enabled;
            (core.config.clone(), filters, presence_enabled)
        };

        let mut payload = Map::new();
        payload.insert(
            "config".into(),
            json!({
                "broadcast": config.broadcast,
                "presence": {
                    "key": config.presence.key.clone().unwrap_or_default(),
                    "enabled": presence_enabled,
                },
                "postgres_changes": filters,
                "private": config.private,
            }),
        );
        let token = self.client().and_then(|client| client.access_token());
        if let Some(token) = token {
            payload.insert("access_token".into(), Value::String(token));
        }
        Value::Object(payload)
    }

    // ── pushes ──────────────────────────────────────────────────────────

    /// Sends when the channel is pushable, otherwise buffers with the
    /// timeout already running. The buffer is bounded; the oldest push is
    /// evicted and destroyed on overflow.
    pub(crate) fn push(
        self: &Arc<Self>,
        push_event: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Push, RealtimeError> {
        if !self.core.lock().unwrap().joined_once {
            return Err(RealtimeError::NotSubscribed);
        }
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let push = PushShared::new(
            Arc::downgrade(self),
            push_event,
            PushPayload::Value(payload),
            timeout,
        );

        if self.can_push() {
            push.send();
        } else {
            push.start_timeout();
            let evicted = {
                let mut core = self.core.lock().unwrap();
                core.push_buffer.push_back(Arc::clone(&push));
                if core.push_buffer.len() > MAX_PUSH_BUFFER_SIZE {
                    core.push_buffer.pop_front()
                } else {
                    None
                }
            };
            if let Some(evicted) = evicted {
                warn!(
                    topic = %self.topic,
                    event = %evicted.event,
                    "push buffer full, dropping oldest push"
                );
                evicted.destroy();
            }
        }
        Ok(Push { shared: push })
    }

    /// User-facing send: broadcasts fall back to HTTP when the channel
    /// cannot push, and `ack: false` broadcasts resolve optimistically.
    pub(crate) async fn send_message(
        self: &Arc<Self>,
        message_type: &str,
        message_event: &str,
        user_payload: Value,
        timeout: Option<Duration>,
    ) -> Result<SendStatus, RealtimeError> {
        let (ack, private) = {
            let core = self.core.lock().unwrap();
            (core.config.broadcast.ack, core.config.private)
        };

        if message_type == event::BROADCAST && !self.can_push() {
            let client = self.client().ok_or(RealtimeError::ClientGone)?;
            let timeout = timeout.unwrap_or_else(|| self.default_timeout());
            client
                .broadcast_http(
                    self.sub_topic(),
                    message_event,
                    user_payload,
                    private,
                    timeout,
                )
                .await?;
            return Ok(SendStatus::Ok);
        }

        let body = json!({
            "type": message_type,
            "event": message_event,
            "payload": user_payload,
        });
        let push = self.push(message_type, body, timeout)?;
        if message_type == event::BROADCAST && !ack {
            return Ok(SendStatus::Ok);
        }
        Ok(push.await_status().await)
    }

    // ── leave / teardown ────────────────────────────────────────────────

    /// Leaves the topic. Repeat calls are no-ops; exactly one leave frame
    /// reaches the wire. The state always finalizes to closed and the
    /// channel is removed from the client.
    pub(crate) async fn unsubscribe(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> SendStatus {
        let pushable = self.can_push();
        {
            let mut core = self.core.lock().unwrap();
            if matches!(core.state, ChannelState::Leaving | ChannelState::Closed) {
                return SendStatus::Ok;
            }
            core.state = ChannelState::Leaving;
        }
        self.rejoin_timer.reset();
        self.join_push.destroy();

        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let leave_push = PushShared::new(
            Arc::downgrade(self),
            event::LEAVE,
            PushPayload::Value(json!({})),
            timeout,
        );
        let status = leave_push.status_future();
        leave_push.send();
        if !pushable {
            leave_push.trigger(json!({"status": "ok", "response": {}}));
        }

        let status = status.await.unwrap_or(SendStatus::Ok);
        self.finalize_close();
        status
    }

    fn finalize_close(self: &Arc<Self>) {
        trace!(topic = %self.topic, "channel closed");
        self.rejoin_timer.reset();
        self.core.lock().unwrap().state = ChannelState::Closed;
        if let Some(client) = self.client() {
            client.remove_channel(self);
        }
        self.notify(SubscribeStatus::Closed, None);
    }

    /// Releases every owned resource. Safe to call repeatedly.
    pub(crate) fn teardown(self: &Arc<Self>) {
        let buffered: Vec<Arc<PushShared>> = {
            let mut core = self.core.lock().unwrap();
            core.state = ChannelState::Closed;
            core.bindings.clear();
            core.push_buffer.drain(..).collect()
        };
        for push in buffered {
            push.destroy();
        }
        self.join_push.destroy();
        self.rejoin_timer.reset();
    }

    /// Tears the channel down and joins again with the current bindings.
    /// Used when presence is enabled after the channel already joined.
    async fn resubscribe(self: Arc<Self>) {
        let _ = self.unsubscribe(None).await;
        if let Some(client) = self.client() {
            client.add_channel(&self);
        }
        {
            let mut core = self.core.lock().unwrap();
            core.state = ChannelState::Closed;
            core.joined_once = false;
        }
        // Leaving destroyed the join push hooks; arm them again.
        self.wire_join_hooks();
        self.subscribe(None, None);
    }

    // ── bindings ────────────────────────────────────────────────────────

    fn add_binding(self: &Arc<Self>, event_type: &str, binding: Binding) {
        let event_type = event_type.to_ascii_lowercase();
        let resubscribe_for_presence = {
            let mut core = self.core.lock().unwrap();
            let first_presence = event_type == event::PRESENCE
                && core
                    .bindings
                    .get(event::PRESENCE)
                    .map(|bindings| bindings.is_empty())
                    .unwrap_or(true)
                && !core.config.presence.enabled;
            core.bindings.entry(event_type).or_default().push(binding);
            first_presence && core.state == ChannelState::Joined
        };
        // The join announced presence as disabled; re-announce.
        if resubscribe_for_presence {
            let this = Arc::clone(self);
            tokio::spawn(this.resubscribe());
        }
    }

    pub(crate) fn on_event(self: &Arc<Self>, event_type: &str, callback: EventCallback) {
        self.add_binding(
            event_type,
            Binding {
                filter_event: None,
                target: BindingTarget::Event(callback),
            },
        );
    }

    pub(crate) fn on_filtered(
        self: &Arc<Self>,
        event_type: &str,
        filter_event: &str,
        callback: EventCallback,
    ) {
        self.add_binding(
            event_type,
            Binding {
                filter_event: Some(filter_event.to_string()),
                target: BindingTarget::Event(callback),
            },
        );
    }

    pub(crate) fn on_postgres(
        self: &Arc<Self>,
        filter: PostgresFilter,
        callback: PostgresCallback,
    ) {
        self.add_binding(
            event::POSTGRES_CHANGES,
            Binding {
                filter_event: None,
                target: BindingTarget::Postgres {
                    filter,
                    id: None,
                    callback,
                },
            },
        );
    }

    /// Single-shot reply binding used by pushes.
    pub(crate) fn on_reply(&self, ref_event: String, hook: ReplyHook) {
        let mut core = self.core.lock().unwrap();
        core.bindings.entry(ref_event).or_default().push(Binding {
            filter_event: None,
            target: BindingTarget::Event(hook),
        });
    }

    pub(crate) fn off_event(&self, event_type: &str) {
        self.core
            .lock()
            .unwrap()
            .bindings
            .remove(&event_type.to_ascii_lowercase());
    }

    pub(crate) fn off_filtered(&self, event_type: &str, filter_event: Option<&str>) {
        let mut core = self.core.lock().unwrap();
        if let Some(bindings) = core.bindings.get_mut(&event_type.to_ascii_lowercase()) {
            match filter_event {
                None => bindings.clear(),
                Some(filter_event) => bindings
                    .retain(|binding| binding.filter_event.as_deref() != Some(filter_event)),
            }
        }
    }

    pub(crate) fn set_on_message(&self, hook: MessageHook) {
        self.core.lock().unwrap().on_message = Some(hook);
    }

    // ── event routing ───────────────────────────────────────────────────

    /// Routes one inbound message to the matching bindings.
    pub(crate) fn trigger(
        self: &Arc<Self>,
        trigger_event: &str,
        payload: Payload,
        reference: Option<&str>,
        join_ref: Option<&str>,
    ) -> Result<(), RealtimeError> {
        // Stale join generations never transition the channel.
        if event::CHANNEL_LIFECYCLE.contains(&trigger_event) {
            let incoming = join_ref.or(reference);
            if let Some(incoming) = incoming {
                if self.join_ref().as_deref() != Some(incoming) {
                    trace!(
                        topic = %self.topic,
                        event = %trigger_event,
                        "dropping frame from a previous join generation"
                    );
                    return Ok(());
                }
            }
        }

        let payload = self.apply_message_hook(trigger_event, payload, reference)?;

        match trigger_event {
            event::REPLY => {
                if let Some(reference) = reference {
                    return self.trigger(
                        &event::reply_event(reference),
                        payload,
                        Some(reference),
                        join_ref,
                    );
                }
                Ok(())
            }
            event::CLOSE => {
                self.handle_remote_close();
                Ok(())
            }
            event::ERROR => {
                self.handle_socket_error(&payload);
                Ok(())
            }
            event::JOIN | event::LEAVE => Ok(()),
            event::PRESENCE_STATE => {
                self.handle_presence_state(&payload);
                Ok(())
            }
            event::PRESENCE_DIFF => {
                self.handle_presence_diff(&payload);
                Ok(())
            }
            _ if is_legacy_change_event(trigger_event) => {
                self.dispatch_legacy_change(trigger_event, &payload);
                Ok(())
            }
            _ => {
                self.dispatch_bindings(trigger_event, &payload);
                Ok(())
            }
        }
    }

    fn apply_message_hook(
        &self,
        trigger_event: &str,
        payload: Payload,
        reference: Option<&str>,
    ) -> Result<Payload, RealtimeError> {
        let hook = self.core.lock().unwrap().on_message.clone();
        let Some(hook) = hook else {
            return Ok(payload);
        };
        let had_payload = !payload.is_empty();
        match hook(trigger_event, payload.clone(), reference) {
            Some(rewritten) => Ok(rewritten),
            None if had_payload => Err(RealtimeError::BadHook),
            None => Ok(payload),
        }
    }

    /// Server closed the channel (graceful shutdown of the topic).
    fn handle_remote_close(self: &Arc<Self>) {
        trace!(topic = %self.topic, "server closed channel");
        self.rejoin_timer.reset();
        self.join_push.destroy();
        self.core.lock().unwrap().state = ChannelState::Closed;
        if let Some(client) = self.client() {
            client.remove_channel(self);
        }
        self.notify(SubscribeStatus::Closed, None);
    }

    /// Socket-level fault. Ignored while leaving or closed: those races
    /// are deliberate teardown.
    fn handle_socket_error(self: &Arc<Self>, payload: &Payload) {
        if self.is_leaving_or_closed() {
            return;
        }
        self.core.lock().unwrap().state = ChannelState::Errored;
        self.rejoin_timer.schedule();
        let message = payload
            .json()
            .filter(|value| !value.is_null())
            .map(Value::to_string)
            .unwrap_or_else(|| "channel error".to_string());
        let error = RealtimeError::Subscription(message);
        self.notify(SubscribeStatus::ChannelError, Some(&error));
    }

    fn handle_presence_state(self: &Arc<Self>, payload: &Payload) {
        let raw = payload.json().cloned().unwrap_or(Value::Null);
        let callbacks = {
            let mut core = self.core.lock().unwrap();
            let join_ref = self.join_push.reference();
            core.presence.handle_state(&raw, join_ref)
        };
        self.fire_presence_callbacks(callbacks);
        self.fire_presence_sync();
    }

    fn handle_presence_diff(self: &Arc<Self>, payload: &Payload) {
        let raw = payload.json().cloned().unwrap_or(Value::Null);
        let callbacks = {
            let mut core = self.core.lock().unwrap();
            let join_ref = self.join_push.reference();
            core.presence.handle_diff(&raw, join_ref.as_deref())
        };
        if let Some(callbacks) = callbacks {
            self.fire_presence_callbacks(callbacks);
            self.fire_presence_sync();
        }
    }

    /// Presence activity is surfaced to bindings as synthetic `presence`
    /// events carrying `{event: join|leave|sync, ..}`.
    fn fire_presence_callbacks(self: &Arc<Self>, callbacks: Vec<PresenceCallback>) {
        for callback in callbacks {
            let synthetic = match callback {
                PresenceCallback::Join {
                    key,
                    current,
                    joined,
                } => json!({
                    "event": "join",
                    "key": key,
                    "current": current,
                    "joined": joined,
                }),
                PresenceCallback::Leave {
                    key,
                    remaining,
                    left,
                } => json!({
                    "event": "leave",
                    "key": key,
                    "current": remaining,
                    "left": left,
                }),
            };
            self.dispatch_bindings(event::PRESENCE, &Payload::Json(synthetic));
        }
    }

    fn fire_presence_sync(self: &Arc<Self>) {
        self.dispatch_bindings(event::PRESENCE, &Payload::Json(json!({"event": "sync"})));
    }

    /// Old-style servers deliver change rows as bare INSERT/UPDATE/DELETE
    /// events; they match by filter event only and skip id dispatch.
    fn dispatch_legacy_change(self: &Arc<Self>, trigger_event: &str, payload: &Payload) {
        let callbacks: Vec<PostgresCallback> = {
            let core = self.core.lock().unwrap();
            core.bindings
                .get(event::POSTGRES_CHANGES)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter_map(|binding| match &binding.target {
                            BindingTarget::Postgres {
                                filter, callback, ..
                            } if filter.matches_event(trigger_event) => {
                                Some(Arc::clone(callback))
                            }
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        if callbacks.is_empty() {
            return;
        }
        let raw = payload.json().cloned().unwrap_or(Value::Null);
        let change = postgres::transform_change(&raw);
        for callback in callbacks {
            callback(&change);
        }
    }

    fn dispatch_bindings(self: &Arc<Self>, trigger_event: &str, payload: &Payload) {
        enum Dispatch {
            Event(EventCallback),
            Postgres(PostgresCallback),
        }

        let matched: Vec<Dispatch> = {
            let core = self.core.lock().unwrap();
            let Some(bindings) = core.bindings.get(&trigger_event.to_ascii_lowercase())
            else {
                return;
            };
            bindings
                .iter()
                .filter_map(|binding| match &binding.target {
                    BindingTarget::Event(callback) => {
                        let matches = match &binding.filter_event {
                            None => true,
                            Some(filter_event) => {
                                filter_event == "*"
                                    || payload
                                        .json()
                                        .and_then(|value| value.get("event"))
                                        .and_then(Value::as_str)
                                        .map(|payload_event| payload_event == filter_event)
                                        .unwrap_or(false)
                            }
                        };
                        matches.then(|| Dispatch::Event(Arc::clone(callback)))
                    }
                    BindingTarget::Postgres {
                        filter,
                        id,
                        callback,
                    } => {
                        let matches = match id {
                            None => false,
                            Some(id) => {
                                let ids_match = payload
                                    .json()
                                    .and_then(|value| value.get("ids"))
                                    .and_then(Value::as_array)
                                    .map(|ids| ids.contains(id))
                                    .unwrap_or(false);
                                let type_match = payload
                                    .json()
                                    .and_then(|value| value.get("data"))
                                    .and_then(|data| data.get("type"))
                                    .and_then(Value::as_str)
                                    .map(|change_type| filter.matches_event(change_type))
                                    .unwrap_or(false);
                                ids_match && type_match
                            }
                        };
                        matches.then(|| Dispatch::Postgres(Arc::clone(callback)))
                    }
                })
                .collect()
        };

        if matched.is_empty() {
            return;
        }

        let change = matched
            .iter()
            .any(|dispatch| matches!(dispatch, Dispatch::Postgres(_)))
            .then(|| {
                let data = payload
                    .json()
                    .and_then(|value| value.get("data"))
                    .cloned()
                    .unwrap_or(Value::Null);
                postgres::transform_change(&data)
            });

        for dispatch in matched {
            match dispatch {
                Dispatch::Event(callback) => callback(payload),
                Dispatch::Postgres(callback) => {
                    if let Some(change) = &change {
                        callback(change);
                    }
                }
            }
        }
    }
}

fn is_legacy_change_event(trigger_event: &str) -> bool {
    trigger_event.eq_ignore_ascii_case("insert")
        || trigger_event.eq_ignore_ascii_case("update")
        || trigger_event.eq_ignore_ascii_case("delete")
}

// ── public handle ──────────────────────────────────────────────────────

/// Handle to one topic's channel. Cheaply cloneable.
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn topic(&self) -> &str {
        self.inner.topic()
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_joined(&self) -> bool {
        self.inner.is_joined()
    }

    /// Current join generation, when a join has been attempted.
    pub fn join_ref(&self) -> Option<String> {
        self.inner.join_ref()
    }

    /// Joins the topic. The callback observes the subscription states;
    /// calling subscribe again is a no-op.
    pub fn subscribe(
        &self,
        callback: impl Fn(SubscribeStatus, Option<&RealtimeError>) + Send + Sync + 'static,
    ) -> &Self {
        self.inner.subscribe(Some(Arc::new(callback)), None);
        self
    }

    pub fn subscribe_with_timeout(
        &self,
        callback: impl Fn(SubscribeStatus, Option<&RealtimeError>) + Send + Sync + 'static,
        timeout: Duration,
    ) -> &Self {
        self.inner
            .subscribe(Some(Arc::new(callback)), Some(timeout));
        self
    }

    /// Leaves the topic and removes the channel from the client.
    pub async fn unsubscribe(&self) -> SendStatus {
        self.inner.unsubscribe(None).await
    }

    /// Low-level push expecting a reply.
    pub fn push(&self, push_event: &str, payload: Value) -> Result<Push, RealtimeError> {
        self.inner.push(push_event, payload, None)
    }

    pub fn push_with_timeout(
        &self,
        push_event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Push, RealtimeError> {
        self.inner.push(push_event, payload, Some(timeout))
    }

    /// The join configuration this channel announces.
    pub fn config(&self) -> ChannelConfig {
        self.inner.core.lock().unwrap().config.clone()
    }

    /// Broadcasts a message, falling back to HTTP while the channel
    /// cannot push over the socket.
    pub async fn send_broadcast(
        &self,
        broadcast_event: &str,
        payload: Value,
    ) -> Result<SendStatus, RealtimeError> {
        self.inner
            .send_message(event::BROADCAST, broadcast_event, payload, None)
            .await
    }

    /// Announces this client's presence payload on the topic.
    pub async fn track(&self, payload: Value) -> Result<SendStatus, RealtimeError> {
        self.inner
            .send_message(event::PRESENCE, "track", payload, None)
            .await
    }

    pub async fn untrack(&self) -> Result<SendStatus, RealtimeError> {
        self.inner
            .send_message(event::PRESENCE, "untrack", json!({}), None)
            .await
    }

    /// Snapshot of who is currently present.
    pub fn presence_state(&self) -> PresenceState {
        self.inner.presence_state()
    }

    pub fn on_broadcast(
        &self,
        event_filter: &str,
        callback: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) -> &Self {
        self.inner.on_filtered(
            event::BROADCAST,
            event_filter,
            Arc::new(move |payload| {
                let Some(value) = payload.json() else {
                    return;
                };
                let broadcast_event = value
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let inner = value.get("payload").cloned().unwrap_or(Value::Null);
                callback(broadcast_event, &inner);
            }),
        );
        self
    }

    pub fn on_postgres_changes(
        &self,
        filter: PostgresFilter,
        callback: impl Fn(&PostgresChange) + Send + Sync + 'static,
    ) -> &Self {
        self.inner.on_postgres(filter, Arc::new(callback));
        self
    }

    pub fn on_presence_sync(
        &self,
        callback: impl Fn(&PresenceState) + Send + Sync + 'static,
    ) -> &Self {
        let source = Arc::downgrade(&self.inner);
        self.inner.on_filtered(
            event::PRESENCE,
            "sync",
            Arc::new(move |_| {
                if let Some(inner) = source.upgrade() {
                    callback(&inner.presence_state());
                }
            }),
        );
        self
    }

    pub fn on_presence_join(
        &self,
        callback: impl Fn(&str, &[PresenceMeta], &[PresenceMeta]) + Send + Sync + 'static,
    ) -> &Self {
        self.inner.on_filtered(
            event::PRESENCE,
            "join",
            Arc::new(move |payload| {
                if let Some((key, current, changed)) = decode_presence_event(payload, "joined") {
                    callback(&key, &current, &changed);
                }
            }),
        );
        self
    }

    pub fn on_presence_leave(
        &self,
        callback: impl Fn(&str, &[PresenceMeta], &[PresenceMeta]) + Send + Sync + 'static,
    ) -> &Self {
        self.inner.on_filtered(
            event::PRESENCE,
            "leave",
            Arc::new(move |payload| {
                if let Some((key, current, changed)) = decode_presence_event(payload, "left") {
                    callback(&key, &current, &changed);
                }
            }),
        );
        self
    }

    pub fn on_system(&self, callback: impl Fn(&Value) + Send + Sync + 'static) -> &Self {
        self.inner.on_filtered(
            event::SYSTEM,
            "*",
            Arc::new(move |payload| {
                if let Some(value) = payload.json() {
                    callback(value);
                }
            }),
        );
        self
    }

    /// Binds an arbitrary server event by name.
    pub fn on_event(
        &self,
        event_name: &str,
        callback: impl Fn(&Payload) + Send + Sync + 'static,
    ) -> &Self {
        self.inner.on_event(event_name, Arc::new(callback));
        self
    }

    /// Removes bindings for an event type, optionally narrowed to one
    /// event filter.
    pub fn off(&self, event_type: &str, event_filter: Option<&str>) -> &Self {
        self.inner.off_filtered(event_type, event_filter);
        self
    }

    /// Installs a rewrite hook applied to every inbound message before
    /// dispatch. Returning `None` for a non-empty payload is a
    /// programming error surfaced as [`RealtimeError::BadHook`].
    pub fn on_message(
        &self,
        hook: impl Fn(&str, Payload, Option<&str>) -> Option<Payload> + Send + Sync + 'static,
    ) -> &Self {
        self.inner.set_on_message(Arc::new(hook));
        self
    }
}

fn decode_presence_event(
    payload: &Payload,
    changed_field: &str,
) -> Option<(String, Vec<PresenceMeta>, Vec<PresenceMeta>)> {
    let value = payload.json()?;
    let key = value.get("key")?.as_str()?.to_string();
    let current: Vec<PresenceMeta> =
        serde_json::from_value(value.get("current").cloned().unwrap_or(Value::Null))
            .unwrap_or_default();
    let changed: Vec<PresenceMeta> =
        serde_json::from_value(value.get(changed_field).cloned().unwrap_or(Value::Null))
            .unwrap_or_default();
    Some((key, current, changed))
}
