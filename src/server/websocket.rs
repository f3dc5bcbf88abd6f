//! WebSocket subscription endpoint
//!
//! Upgrades /ws, registers the connection with the Broadcaster, and
//! runs one delivery loop per connection: outbound messages drain from
//! the subscriber's bounded buffer into the socket under the write
//! deadline; inbound frames are parsed for a `userId` field for logging
//! and otherwise ignored. Malformed frames get an `error` message back
//! without dropping the connection.
//!
//! A bearer token may arrive in the query string; it only enriches the
//! connection log; the feed itself is public.

use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tracing::{debug, info, warn};

use crate::auth::extract_token_from_query;
use crate::broadcast::ServerMessage;
use crate::routes::{full_body, BoxBody};
use crate::server::AppState;

type HyperWebSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

/// Handle the /ws upgrade request
pub async fn handle_ws_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    // Token is optional; log who connected when one is presented
    let authenticated_as = extract_token_from_query(req.uri().query())
        .and_then(|token| state.identity.verify_bearer(&token).ok())
        .map(|p| p.username);

    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => {
                        if let Some(username) = &authenticated_as {
                            info!(username = %username, "WebSocket subscriber authenticated");
                        }
                        handle_connection(state, ws).await;
                    }
                    Err(e) => {
                        warn!("WebSocket handshake failed: {:?}", e);
                    }
                }
            });

            let (parts, _) = response.into_parts();
            Response::from_parts(parts, full_body(bytes::Bytes::new()))
        }
        Err(e) => {
            warn!("WebSocket upgrade error: {:?}", e);
            let mut response = Response::new(full_body(format!("WebSocket upgrade failed: {e}")));
            *response.status_mut() = hyper::StatusCode::BAD_REQUEST;
            response
        }
    }
}

/// Per-connection loop: drain the outbound buffer, read client frames
async fn handle_connection(state: Arc<AppState>, ws: HyperWebSocket) {
    let (mut sink, mut stream) = ws.split();
    let (id, mut outbound) = state.broadcaster.subscribe();
    let write_timeout = state.args.subscriber_write_timeout();

    loop {
        tokio::select! {
            message = outbound.recv() => {
                match message {
                    Some(msg) => {
                        let json = match serde_json::to_string(msg.as_ref()) {
                            Ok(j) => j,
                            Err(e) => {
                                warn!(subscriber = %id, error = %e, "Message serialization failed");
                                continue;
                            }
                        };
                        // The write deadline is the slow-consumer detector on
                        // the delivery side; buffer overflow is the other
                        match tokio::time::timeout(write_timeout, sink.send(WsFrame::Text(json))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                debug!(subscriber = %id, error = %e, "Write failed, evicting");
                                break;
                            }
                            Err(_) => {
                                warn!(subscriber = %id, "Write deadline exceeded, evicting");
                                break;
                            }
                        }
                    }
                    // Buffer closed: evicted by the Broadcaster
                    None => {
                        debug!(subscriber = %id, "Outbound buffer closed");
                        break;
                    }
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(WsFrame::Text(text))) => {
                        state.broadcaster.touch(&id);
                        handle_client_frame(&state, &id, &text);
                    }
                    Some(Ok(WsFrame::Ping(data))) => {
                        let _ = sink.send(WsFrame::Pong(data)).await;
                    }
                    Some(Ok(WsFrame::Close(_))) => {
                        info!(subscriber = %id, "Subscriber disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(subscriber = %id, error = %e, "WebSocket read error");
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
        }
    }

    state.broadcaster.unsubscribe(&id);
    let _ = sink.close().await;
}

/// Client frames: a `{"type":"ping"}` message gets a `pong` back; any
/// other valid JSON is only mined for a userId to log. Frames that fail
/// to parse earn an error reply on this subscriber only.
fn handle_client_frame(state: &AppState, id: &crate::broadcast::SubscriberId, text: &str) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => {
            if value.get("type").and_then(|v| v.as_str()) == Some("ping") {
                state.broadcaster.send_to(
                    id,
                    ServerMessage::Pong {
                        timestamp: chrono::Utc::now().to_rfc3339(),
                    },
                );
                return;
            }
            if let Some(user_id) = value.get("userId").and_then(|v| v.as_str()) {
                debug!(subscriber = %id, user_id = user_id, "Client frame");
            }
        }
        Err(_) => {
            state.broadcaster.send_to(
                id,
                ServerMessage::Error {
                    error: "malformed message".to_string(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                },
            );
        }
    }
}
