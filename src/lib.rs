//! riptide — multiplexed realtime channels over a single WebSocket.
//!
//! A client for Phoenix-style realtime servers: logical channels carry
//! broadcast messages, shared presence state, and Postgres change feeds,
//! while the connection layer heartbeats, reconnects with backoff, and
//! rejoins channels transparently.
//!
//! ```no_run
//! use riptide::{Client, ClientConfig, ChannelConfig, SubscribeStatus};
//!
//! # async fn run() -> Result<(), riptide::RealtimeError> {
//! let client = Client::new(ClientConfig::new("wss://example.test/socket"))?;
//! client.connect().await?;
//!
//! let room = client.channel("room:lobby", ChannelConfig::default());
//! room.on_broadcast("message", |event, payload| {
//!     println!("{event}: {payload}");
//! });
//! room.subscribe(|status, _err| {
//!     if status == SubscribeStatus::Subscribed {
//!         println!("joined");
//!     }
//! });
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod presence;
pub mod protocol;
pub mod push;
pub mod transport;

pub use channel::{
    Channel, ChannelState, PostgresChange, PostgresFilter, SubscribeStatus,
};
pub use client::{Client, HeartbeatStatus};
pub use config::{ChannelConfig, ClientConfig, LogLevel};
pub use error::RealtimeError;
pub use http::{BroadcastBackend, BroadcastRequest};
pub use presence::{PresenceMeta, PresenceState};
pub use protocol::{Frame, Payload, WireMessage};
pub use push::{Push, SendStatus};
