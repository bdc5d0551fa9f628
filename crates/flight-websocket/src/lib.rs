//! # Flight WebSocket Server
//!
//! Live updates for authenticated flight observers:
//! - Per-flight subscriptions, checked against flight ownership
//! - Operator-wide warnings, delivered regardless of subscriptions
//! - Best-effort delivery with a bounded queue per connection
//!
//! ## Protocol
//!
//! Messages are JSON-encoded using the types from `flight_core::events`:
//! - Server → Client: `ServerMessage`
//! - Client → Server: `ClientMessage`

pub mod error;
pub mod hub;

pub use error::{WsError, WsResult};
pub use hub::{FlightAccess, WebSocketHub, DEFAULT_CLIENT_BUFFER};

use flight_core::{OperatorId, ServerMessage};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const WELCOME: &str = "Connected to flight tracker WebSocket server";

/// Resolves an observer credential to the operator it belongs to.
///
/// The error string is sent as the close reason.
pub trait ObserverAuthenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<OperatorId, String>;
}

/// Bind `port` on all interfaces and serve until `shutdown` is cancelled
pub async fn start_server(
    hub: Arc<WebSocketHub>,
    auth: Arc<dyn ObserverAuthenticator>,
    port: u16,
    shutdown: CancellationToken,
) -> WsResult<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("🔌 WebSocket server listening on ws://{}", addr);
    serve(listener, hub, auth, shutdown).await
}

/// Accept connections on an already bound listener
pub async fn serve(
    listener: TcpListener,
    hub: Arc<WebSocketHub>,
    auth: Arc<dyn ObserverAuthenticator>,
    shutdown: CancellationToken,
) -> WsResult<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("WebSocket server stopping");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let hub = hub.clone();
                    let auth = auth.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(hub, auth, stream, addr, shutdown).await {
                            debug!(peer = %addr, error = %e, "WebSocket connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept WebSocket connection");
                }
            }
        }
    }
}

/// Credential from `?token=` or an `Authorization: Bearer` header
fn extract_token(req: &Request) -> Option<String> {
    let from_query = req
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("token=")))
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    from_query.or_else(|| {
        req.headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    })
}

async fn send_json<S>(sink: &mut S, message: &ServerMessage) -> WsResult<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(message)?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Handle a single WebSocket connection
async fn handle_connection(
    hub: Arc<WebSocketHub>,
    auth: Arc<dyn ObserverAuthenticator>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> WsResult<()> {
    let mut token = None;
    let ws_stream = accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            token = extract_token(req);
            Ok(resp)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let verdict = match token.as_deref() {
        Some(token) => auth.authenticate(token),
        None => Err("Authentication required".to_string()),
    };
    let operator_id = match verdict {
        Ok(operator_id) => operator_id,
        Err(reason) => {
            warn!(peer = %addr, reason = %reason, "Rejected WebSocket observer");
            ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: reason.into(),
                })))
                .await?;
            return Ok(());
        }
    };

    let client_id = Uuid::new_v4();
    info!(client_id = %client_id, operator_id = %operator_id, peer = %addr, "🔗 WebSocket client connected");
    let mut outbound = hub.register_client(client_id, operator_id);

    let result = pump(&hub, client_id, &mut ws_sender, &mut ws_receiver, &mut outbound, &shutdown).await;

    hub.unregister_client(client_id);
    info!(client_id = %client_id, "🔌 WebSocket client disconnected");
    result
}

/// Move messages between one registered client and its socket until either side closes
async fn pump(
    hub: &WebSocketHub,
    client_id: Uuid,
    ws_sender: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
    outbound: &mut mpsc::Receiver<ServerMessage>,
    shutdown: &CancellationToken,
) -> WsResult<()> {
    send_json(
        ws_sender,
        &ServerMessage::Connected {
            message: WELCOME.to_string(),
        },
    )
    .await?;

    loop {
        tokio::select! {
            Some(message) = outbound.recv() => {
                send_json(ws_sender, &message).await?;
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = hub.handle_text(client_id, text.as_str()).await;
                    send_json(ws_sender, &reply).await?;
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(client_id = %client_id, "Unexpected binary message");
                    send_json(ws_sender, &ServerMessage::error("Invalid message format")).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                // Pings are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            _ = shutdown.cancelled() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flight_core::SessionId;
    use tokio_tungstenite::connect_async;

    struct PrefixAuth;

    impl ObserverAuthenticator for PrefixAuth {
        fn authenticate(&self, token: &str) -> Result<OperatorId, String> {
            if token.starts_with("op-") {
                Ok(OperatorId::new(token))
            } else {
                Err("Invalid token".into())
            }
        }
    }

    struct DenyAll;

    #[async_trait]
    impl FlightAccess for DenyAll {
        async fn can_observe(&self, _: &OperatorId, _: &SessionId) -> bool {
            false
        }
    }

    async fn spawn_server() -> (SocketAddr, Arc<WebSocketHub>, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = Arc::new(WebSocketHub::new(Arc::new(DenyAll), None));
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, hub.clone(), Arc::new(PrefixAuth), shutdown.clone()));
        (addr, hub, shutdown)
    }

    fn decode(message: Message) -> ServerMessage {
        match message {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_token_from_query_or_header() {
        let req = Request::builder().uri("/ws?foo=1&token=abc").body(()).unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("abc"));

        let req = Request::builder()
            .uri("/ws")
            .header("Authorization", "Bearer xyz")
            .body(())
            .unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("xyz"));

        let req = Request::builder().uri("/ws?token=").body(()).unwrap();
        assert_eq!(extract_token(&req), None);
    }

    #[tokio::test]
    async fn test_connect_and_ping() {
        let (addr, hub, shutdown) = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/?token=op-1")).await.unwrap();

        let welcome = decode(ws.next().await.unwrap().unwrap());
        assert!(matches!(welcome, ServerMessage::Connected { .. }));
        assert_eq!(hub.client_count(), 1);

        ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        assert_eq!(decode(ws.next().await.unwrap().unwrap()), ServerMessage::Pong);

        let flight = SessionId::new();
        ws.send(Message::Text(
            format!(r#"{{"type":"subscribe","flight_id":"{}"}}"#, flight.0).into(),
        ))
        .await
        .unwrap();
        assert_eq!(
            decode(ws.next().await.unwrap().unwrap()),
            ServerMessage::error("Flight not found or access denied")
        );

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_missing_token_closes_with_policy_code() {
        let (addr, hub, shutdown) = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();

        match ws.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Policy);
                assert_eq!(frame.reason.as_str(), "Authentication required");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(hub.client_count(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let (addr, _, shutdown) = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/?token=forged")).await.unwrap();

        assert!(matches!(
            ws.next().await.unwrap().unwrap(),
            Message::Close(Some(frame)) if frame.code == CloseCode::Policy
        ));
        shutdown.cancel();
    }
}
