//! WebSocket gateway.
//!
//! Clients speak JSON text frames. The first frame must be `authenticate`;
//! anything else, or a failed authentication, is answered with an
//! `operation_error` and the connection is closed. After joining, inbound
//! frames are queued on the session and session events are written back.

use crate::coordinator::EventSink;
use crate::registry::{ClientConnection, SessionRegistry};
use cadcollab_core::CollabError;
use cadcollab_proto::{ClientMessage, ServerEvent};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Listening WebSocket endpoint.
pub struct Gateway {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
}

impl Gateway {
    /// Bind the endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound.
    pub async fn bind(addr: &str, registry: Arc<SessionRegistry>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, registry })
    }

    /// Bound address.
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns error if accepting fails.
    pub async fn run(self) -> std::io::Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "Gateway listening");

        loop {
            let (stream, addr) = self.listener.accept().await?;
            tracing::debug!(%addr, "New TCP connection");

            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry).await {
                    tracing::warn!(%addr, error = %e, "Connection error");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let Some((token, project_id)) = read_authenticate(&mut ws_sender, &mut ws_receiver).await?
    else {
        return Ok(());
    };

    let (sink, mut events): (EventSink, _) = mpsc::unbounded_channel();
    let client = match registry.connect(&token, &project_id, sink).await {
        Ok(client) => client,
        Err(err) => {
            tracing::info!(%addr, project_id, code = err.code(), "Join refused");
            return reject(&mut ws_sender, &err).await;
        }
    };
    tracing::info!(
        %addr,
        connection = %client.id,
        user_id = %client.user_id,
        project_id,
        "Client joined"
    );

    let result = pump(&mut ws_sender, &mut ws_receiver, &mut events, &client).await;

    let connection = client.id;
    client.close().await;
    let _ = ws_sender.close().await;
    tracing::info!(%addr, %connection, "Client disconnected");
    result
}

/// Wait for the `authenticate` frame. `None` means the connection was
/// closed or refused.
async fn read_authenticate(
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
) -> Result<Option<(String, String)>, tokio_tungstenite::tungstenite::Error> {
    while let Some(frame) = ws_receiver.next().await {
        let refusal = match frame? {
            Message::Text(text) => match ClientMessage::from_json(&text) {
                Ok(ClientMessage::Authenticate { token, project_id }) => {
                    return Ok(Some((token, project_id)));
                }
                Ok(other) => format!("expected authenticate, got {}", other.kind()),
                Err(err) => err.to_string(),
            },
            Message::Binary(_) => "binary frames are not supported".to_string(),
            Message::Close(_) => return Ok(None),
            _ => continue,
        };

        reject(ws_sender, &CollabError::Auth(refusal)).await?;
        return Ok(None);
    }
    Ok(None)
}

async fn pump(
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
    events: &mut mpsc::UnboundedReceiver<ServerEvent>,
    client: &ClientConnection,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                let rejected = match frame {
                    Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                        Ok(message) => client.send(message).err(),
                        Err(err) => Some(CollabError::InvalidRequest(err.to_string())),
                    },
                    Some(Ok(Message::Binary(_))) => Some(CollabError::InvalidRequest(
                        "binary frames are not supported".to_string(),
                    )),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => None,
                    Some(Err(e)) => return Err(e),
                };
                if let Some(err) = rejected {
                    send_event(ws_sender, &ServerEvent::error(&err, None)).await?;
                }
            }

            event = events.recv() => match event {
                Some(event) => send_event(ws_sender, &event).await?,
                // The session dropped this connection.
                None => return Ok(()),
            },
        }
    }
}

async fn send_event(
    ws_sender: &mut WsSender,
    event: &ServerEvent,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match event.to_json() {
        Ok(text) => ws_sender.send(Message::Text(text)).await,
        Err(err) => {
            tracing::warn!(event = event.kind(), error = %err, "Dropping unencodable event");
            Ok(())
        }
    }
}

async fn reject(
    ws_sender: &mut WsSender,
    err: &CollabError,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    send_event(ws_sender, &ServerEvent::error(err, None)).await?;
    ws_sender.close().await
}
