//! Client construction options.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::backoff::{default_delay, DelayFn};
use crate::http::BroadcastBackend;
use crate::protocol::{Frame, WireError, WireMessage};
use crate::transport::{TransportConnector, WebSocketConnector};

/// Query parameters appended to the socket URL; a provider is re-invoked
/// on every (re)connect so credentials stay fresh.
#[derive(Clone)]
pub enum Params {
    Static(HashMap<String, String>),
    Provider(Arc<dyn Fn() -> HashMap<String, String> + Send + Sync>),
}

impl Params {
    pub fn resolve(&self) -> HashMap<String, String> {
        match self {
            Params::Static(map) => map.clone(),
            Params::Provider(provider) => provider(),
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Params::Static(HashMap::new())
    }
}

/// Asynchronous access-token source. Failures are tolerated; the client
/// falls back to the token it already holds.
pub type TokenProvider =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

pub type LoggerFn = Arc<dyn Fn(LogLevel, &str, &Value) + Send + Sync>;

pub type EncodeFn = Arc<dyn Fn(&Frame) -> Result<WireMessage, WireError> + Send + Sync>;
pub type DecodeFn = Arc<dyn Fn(&WireMessage) -> Result<Frame, WireError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Per-channel join configuration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastOpts {
    /// Receive messages this client broadcast itself.
    #[serde(rename = "self")]
    pub self_send: bool,
    /// Ask the server to acknowledge broadcasts.
    pub ack: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PresenceOpts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub broadcast: BroadcastOpts,
    pub presence: PresenceOpts,
    pub private: bool,
}

impl ChannelConfig {
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn broadcast(mut self, self_send: bool, ack: bool) -> Self {
        self.broadcast = BroadcastOpts { self_send, ack };
        self
    }

    pub fn presence_key(mut self, key: impl Into<String>) -> Self {
        self.presence.key = Some(key.into());
        self
    }
}

/// Options recognized at client construction.
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) endpoint: String,
    pub(crate) params: Params,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) reconnect_after: DelayFn,
    pub(crate) rejoin_after: DelayFn,
    pub(crate) logger: Option<LoggerFn>,
    pub(crate) log_level: LogLevel,
    pub(crate) encode: Option<EncodeFn>,
    pub(crate) decode: Option<DecodeFn>,
    pub(crate) connector: Arc<dyn TransportConnector>,
    pub(crate) access_token: Option<String>,
    pub(crate) access_token_provider: Option<TokenProvider>,
    pub(crate) api_key: Option<String>,
    pub(crate) broadcast_backend: Option<Arc<dyn BroadcastBackend>>,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: Params::default(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_after: Arc::new(default_delay),
            rejoin_after: Arc::new(default_delay),
            logger: None,
            log_level: LogLevel::Info,
            encode: None,
            decode: None,
            connector: Arc::new(WebSocketConnector),
            access_token: None,
            access_token_provider: None,
            api_key: None,
            broadcast_backend: None,
        }
    }

    pub fn params(mut self, params: HashMap<String, String>) -> Self {
        self.params = Params::Static(params);
        self
    }

    pub fn params_provider(
        mut self,
        provider: impl Fn() -> HashMap<String, String> + Send + Sync + 'static,
    ) -> Self {
        self.params = Params::Provider(Arc::new(provider));
        self
    }

    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Default push timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn reconnect_after(
        mut self,
        delay_fn: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.reconnect_after = Arc::new(delay_fn);
        self
    }

    pub fn rejoin_after(
        mut self,
        delay_fn: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.rejoin_after = Arc::new(delay_fn);
        self
    }

    pub fn logger(
        mut self,
        logger: impl Fn(LogLevel, &str, &Value) + Send + Sync + 'static,
    ) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn encode(mut self, encode: EncodeFn) -> Self {
        self.encode = Some(encode);
        self
    }

    pub fn decode(mut self, decode: DecodeFn) -> Self {
        self.decode = Some(decode);
        self
    }

    /// Overrides the WebSocket transport; tests use the paired transport.
    pub fn transport(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn access_token_provider(mut self, provider: TokenProvider) -> Self {
        self.access_token_provider = Some(provider);
        self
    }

    /// Forwarded as the `apikey` query parameter and broadcast header.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn broadcast_backend(mut self, backend: Arc<dyn BroadcastBackend>) -> Self {
        self.broadcast_backend = Some(backend);
        self
    }
}
