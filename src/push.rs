//! A single in-flight request: ref allocation, reply correlation,
//! timeout, and status hooks.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::channel::ChannelInner;
use crate::protocol::{event, Frame, Payload};

/// Terminal outcome of a push, unsubscribe, or send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    Error,
    TimedOut,
}

impl SendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SendStatus::Ok => "ok",
            SendStatus::Error => "error",
            SendStatus::TimedOut => "timed out",
        }
    }

    pub(crate) fn from_reply(status: &str) -> Self {
        match status {
            "ok" => SendStatus::Ok,
            "timeout" => SendStatus::TimedOut,
            _ => SendStatus::Error,
        }
    }
}

pub(crate) type ReplyHook = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Payload source; join pushes use a provider so every (re)send reads
/// the freshest configuration and access token.
pub(crate) enum PushPayload {
    Value(Value),
    Provider(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl PushPayload {
    fn build(&self) -> Value {
        match self {
            PushPayload::Value(value) => value.clone(),
            PushPayload::Provider(provider) => provider(),
        }
    }
}

struct PushState {
    reference: Option<String>,
    ref_event: Option<String>,
    received: Option<(String, Payload)>,
    sent: bool,
    hooks: Vec<(String, ReplyHook)>,
    timeout_task: Option<JoinHandle<()>>,
}

pub(crate) struct PushShared {
    channel: Weak<ChannelInner>,
    pub(crate) event: String,
    payload: Mutex<PushPayload>,
    timeout: Mutex<Duration>,
    state: Mutex<PushState>,
}

impl PushShared {
    pub(crate) fn new(
        channel: Weak<ChannelInner>,
        event: impl Into<String>,
        payload: PushPayload,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            event: event.into(),
            payload: Mutex::new(payload),
            timeout: Mutex::new(timeout),
            state: Mutex::new(PushState {
                reference: None,
                ref_event: None,
                received: None,
                sent: false,
                hooks: Vec::new(),
                timeout_task: None,
            }),
        })
    }

    pub(crate) fn reference(&self) -> Option<String> {
        self.state.lock().unwrap().reference.clone()
    }

    pub(crate) fn is_sent(&self) -> bool {
        self.state.lock().unwrap().sent
    }

    pub(crate) fn has_received(&self, status: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .received
            .as_ref()
            .map(|(s, _)| s == status)
            .unwrap_or(false)
    }

    pub(crate) fn set_payload(&self, payload: PushPayload) {
        *self.payload.lock().unwrap() = payload;
    }

    /// Sends the frame. A push that has already timed out stays dead;
    /// `resend` is the way back.
    pub(crate) fn send(self: &Arc<Self>) {
        if self.has_received("timeout") {
            return;
        }
        self.start_timeout();
        self.state.lock().unwrap().sent = true;

        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let Some(client) = channel.client() else {
            return;
        };
        let frame = Frame::new(
            channel.join_ref(),
            self.reference(),
            channel.topic().to_string(),
            self.event.clone(),
            Payload::Json(self.payload.lock().unwrap().build()),
        );
        client.push(frame);
    }

    /// Allocates a ref, registers the single-shot reply binding, and arms
    /// the timeout. Used by `send` and by the channel when it buffers a
    /// push for later.
    pub(crate) fn start_timeout(self: &Arc<Self>) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let Some(client) = channel.client() else {
            return;
        };

        // Re-arming drops the previous generation entirely.
        self.cancel_ref_event();
        self.cancel_timeout();

        let reference = client.make_ref();
        let ref_event = event::reply_event(&reference);

        let weak = Arc::downgrade(self);
        channel.on_reply(
            ref_event.clone(),
            Arc::new(move |payload| {
                if let Some(push) = weak.upgrade() {
                    push.handle_reply(payload);
                }
            }),
        );

        let delay = *self.timeout.lock().unwrap();
        let weak = Arc::downgrade(self);
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(push) = weak.upgrade() {
                push.trigger(json!({"status": "timeout", "response": {}}));
            }
        });

        let mut state = self.state.lock().unwrap();
        state.reference = Some(reference);
        state.ref_event = Some(ref_event);
        state.timeout_task = Some(timeout_task);
    }

    /// Registers a status hook; replays an already-received matching
    /// response immediately.
    pub(crate) fn receive(self: &Arc<Self>, status: impl Into<String>, hook: ReplyHook) {
        let status = status.into();
        let replay = {
            let mut state = self.state.lock().unwrap();
            let replay = state
                .received
                .as_ref()
                .filter(|(s, _)| *s == status)
                .map(|(_, response)| response.clone());
            state.hooks.push((status, Arc::clone(&hook)));
            replay
        };
        if let Some(response) = replay {
            hook(&response);
        }
    }

    /// Clears all per-send state and sends again with a new ref.
    pub(crate) fn resend(self: &Arc<Self>, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
        self.reset();
        self.send();
    }

    fn reset(self: &Arc<Self>) {
        self.cancel_ref_event();
        self.cancel_timeout();
        let mut state = self.state.lock().unwrap();
        state.reference = None;
        state.ref_event = None;
        state.received = None;
        state.sent = false;
    }

    /// Releases the reply binding, the timeout, and the hooks. Safe to
    /// call repeatedly.
    pub(crate) fn destroy(self: &Arc<Self>) {
        self.cancel_ref_event();
        self.cancel_timeout();
        self.state.lock().unwrap().hooks.clear();
    }

    /// Routes a synthesized reply through the channel so it takes the
    /// same path as a server reply.
    pub(crate) fn trigger(self: &Arc<Self>, reply: Value) {
        let ref_event = self.state.lock().unwrap().ref_event.clone();
        let Some(ref_event) = ref_event else {
            return;
        };
        if let Some(channel) = self.channel.upgrade() {
            let _ = channel.trigger(&ref_event, Payload::Json(reply), None, None);
        }
    }

    /// Reply binding target: records the response and fires matching
    /// hooks in registration order.
    pub(crate) fn handle_reply(self: &Arc<Self>, payload: &Payload) {
        self.cancel_ref_event();
        self.cancel_timeout();

        let Some((status, response)) = split_reply(payload) else {
            return;
        };

        let hooks: Vec<ReplyHook> = {
            let mut state = self.state.lock().unwrap();
            state.received = Some((status.clone(), response.clone()));
            state
                .hooks
                .iter()
                .filter(|(s, _)| *s == status)
                .map(|(_, hook)| Arc::clone(hook))
                .collect()
        };
        for hook in hooks {
            hook(&response);
        }
    }

    /// Resolves once with the terminal status, mapping reply statuses the
    /// way user-facing send surfaces do.
    pub(crate) fn status_future(self: &Arc<Self>) -> oneshot::Receiver<SendStatus> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        for status in ["ok", "error", "timeout"] {
            let tx = Arc::clone(&tx);
            self.receive(
                status,
                Arc::new(move |_| {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(SendStatus::from_reply(status));
                    }
                }),
            );
        }
        rx
    }

    fn cancel_ref_event(&self) {
        let ref_event = self.state.lock().unwrap().ref_event.clone();
        if let Some(ref_event) = ref_event {
            if let Some(channel) = self.channel.upgrade() {
                channel.off_event(&ref_event);
            }
        }
    }

    fn cancel_timeout(&self) {
        if let Some(task) = self.state.lock().unwrap().timeout_task.take() {
            task.abort();
        }
    }
}

impl Drop for PushState {
    fn drop(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

fn split_reply(payload: &Payload) -> Option<(String, Payload)> {
    match payload {
        Payload::Json(value) => {
            let status = value.get("status")?.as_str()?.to_string();
            let response = value
                .get("response")
                .cloned()
                .unwrap_or_else(|| json!({}));
            Some((status, Payload::Json(response)))
        }
        Payload::BinaryReply { status, response } => {
            Some((status.clone(), Payload::Binary(response.clone())))
        }
        Payload::Binary(_) => None,
    }
}

/// Handle to an in-flight request. Owned by its channel; destroyed on
/// leave or teardown.
#[derive(Clone)]
pub struct Push {
    pub(crate) shared: Arc<PushShared>,
}

impl Push {
    /// Chains a status hook. The callback runs immediately when a
    /// matching reply was already recorded.
    pub fn receive(
        &self,
        status: impl Into<String>,
        callback: impl Fn(&Payload) + Send + Sync + 'static,
    ) -> &Self {
        self.shared.receive(status, Arc::new(callback));
        self
    }

    /// Waits for the terminal status of this push.
    pub async fn await_status(&self) -> SendStatus {
        self.shared
            .status_future()
            .await
            .unwrap_or(SendStatus::Error)
    }

    pub fn is_sent(&self) -> bool {
        self.shared.is_sent()
    }

    pub fn resend(&self, timeout: Duration) {
        self.shared.resend(timeout);
    }

    pub fn destroy(&self) {
        self.shared.destroy();
    }
}
