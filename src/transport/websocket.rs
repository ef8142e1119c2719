//! WebSocket transport on tokio-tungstenite: the stream is split and a
//! writer task is fed over an unbounded channel so sends never block the
//! caller.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use super::{Transport, TransportConnector, TransportError, TransportEvent, TransportHandle};
use crate::protocol::WireMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Outbound {
    Send(WireMessage),
    Close(u16, String),
}

#[derive(Default)]
pub struct WebSocketConnector;

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(
        &self,
        url: Url,
        headers: &HashMap<String, String>,
    ) -> Result<TransportHandle, TransportError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::ConnectFailed(err.to_string()))?;
        for (key, value) in headers {
            let name: tokio_tungstenite::tungstenite::http::HeaderName = key
                .parse()
                .map_err(|_| TransportError::ConnectFailed(format!("invalid header {key}")))?;
            let value = value
                .parse()
                .map_err(|_| TransportError::ConnectFailed(format!("invalid value for {key}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|err| TransportError::ConnectFailed(err.to_string()))?;
        debug!(url = %url, "websocket connected");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(TransportEvent::Open);

        let pump = tokio::spawn(run_socket(stream, out_rx, event_tx));

        Ok(TransportHandle {
            transport: Box::new(WebSocketTransport {
                out_tx,
                pump: Some(pump),
            }),
            events: event_rx,
        })
    }
}

struct WebSocketTransport {
    out_tx: mpsc::UnboundedSender<Outbound>,
    pump: Option<JoinHandle<()>>,
}

impl Transport for WebSocketTransport {
    fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        self.out_tx
            .send(Outbound::Send(message))
            .map_err(|_| TransportError::NotConnected)
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self
            .out_tx
            .send(Outbound::Close(code, reason.to_string()));
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn run_socket(
    stream: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut sink, mut source) = stream.split();

    let writer = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            let message = match outbound {
                Outbound::Send(WireMessage::Text(text)) => Message::Text(text.into()),
                Outbound::Send(WireMessage::Binary(bytes)) => Message::Binary(bytes.into()),
                Outbound::Close(code, reason) => Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                })),
            };
            if let Err(err) = sink.send(message).await {
                warn!(error = %err, "websocket send failed");
                break;
            }
            if sink.flush().await.is_err() {
                break;
            }
        }
    });

    let mut close_sent = false;
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if event_tx
                    .send(TransportEvent::Message(WireMessage::Text(text.to_string())))
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Binary(bytes)) => {
                if event_tx
                    .send(TransportEvent::Message(WireMessage::Binary(bytes.into())))
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((1000, String::new()));
                trace!(code, %reason, "websocket closed by peer");
                let _ = event_tx.send(TransportEvent::Closed { code, reason });
                close_sent = true;
                break;
            }
            Ok(_) => {} // ping/pong handled by tungstenite
            Err(err) => {
                warn!(error = %err, "websocket read error");
                let _ = event_tx.send(TransportEvent::Error(err.to_string()));
                let _ = event_tx.send(TransportEvent::Closed {
                    code: 1006,
                    reason: err.to_string(),
                });
                close_sent = true;
                break;
            }
        }
    }
    if !close_sent {
        let _ = event_tx.send(TransportEvent::Closed {
            code: 1006,
            reason: "connection reset".to_string(),
        });
    }

    writer.abort();
    let _ = writer.await;
}
