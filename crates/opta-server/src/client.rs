//! Event WebSocket connections: backlog replay, then live delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opta_core::envelope::Envelope;
use opta_core::errors::DaemonError;
use opta_core::ids::SessionId;

use crate::auth;
use crate::error::ApiError;
use crate::protocol::handle_control;
use crate::server::AppState;

const CLOSE_POLICY: u16 = 1008;
const CLOSE_GOING_AWAY: u16 = 1001;

struct Connection {
    session_id: SessionId,
    cancel: CancellationToken,
}

/// Live event connections, keyed by a process-local id.
pub struct ClientRegistry {
    connections: DashMap<u64, Connection>,
    next_id: AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, session_id: &SessionId, parent: &CancellationToken) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        self.connections.insert(
            id,
            Connection {
                session_id: session_id.clone(),
                cancel: cancel.clone(),
            },
        );
        (id, cancel)
    }

    fn unregister(&self, id: u64) {
        self.connections.remove(&id);
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Close every connection watching `session_id`. Returns how many.
    pub fn disconnect_session(&self, session_id: &SessionId) -> usize {
        let mut closed = 0;
        for conn in self.connections.iter() {
            if conn.session_id == *session_id {
                conn.cancel.cancel();
                closed += 1;
            }
        }
        closed
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub session_id: SessionId,
    #[serde(default)]
    pub after_seq: u64,
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /ws?sessionId&afterSeq&token`. The token may also come as a bearer
/// header. Auth and session existence are checked before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<WsParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let presented = params.token.as_deref().or_else(|| auth::bearer(&headers));
    match presented {
        Some(token) if state.token.verify(token) => {}
        _ => return Err(DaemonError::Auth("missing or invalid token".into()).into()),
    }
    state.sessions.get_session(&params.session_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, params)))
}

type WsSink = SplitSink<WebSocket, WsMessage>;

async fn send_envelope(sink: &mut WsSink, envelope: &Envelope) -> Result<(), axum::Error> {
    match serde_json::to_string(envelope) {
        Ok(text) => sink.send(WsMessage::Text(text.into())).await,
        Err(e) => {
            warn!(seq = envelope.seq, error = %e, "failed to encode envelope");
            Ok(())
        }
    }
}

async fn close(sink: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = sink.send(WsMessage::Close(Some(frame))).await;
}

async fn handle_socket(socket: WebSocket, state: AppState, params: WsParams) {
    let session_id = params.session_id;
    let (conn_id, cancel) = state.clients.register(&session_id, &state.shutdown);
    info!(session_id = %session_id, conn_id, after_seq = params.after_seq, "event stream connected");

    // Subscribe before reading the backlog so nothing emitted in between is
    // lost; the overlap is dropped by seq below.
    let (tx, mut rx) = mpsc::channel::<Envelope>(state.config.max_send_queue.max(1));
    let overflow = CancellationToken::new();
    let subscription = {
        let overflow = overflow.clone();
        state.sessions.subscribe(&session_id, move |envelope| {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(envelope.clone()) {
                overflow.cancel();
            }
        })
    };

    let (mut sink, mut stream) = socket.split();
    let subscription = match subscription {
        Ok(sub) => sub,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "session vanished before stream start");
            close(&mut sink, CLOSE_POLICY, "session not found").await;
            state.clients.unregister(conn_id);
            return;
        }
    };

    let mut last_sent = params.after_seq;
    let backlog = match state.sessions.events_after(&session_id, params.after_seq, None) {
        Ok(events) => events,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "backlog read failed");
            close(&mut sink, CLOSE_POLICY, "backlog unavailable").await;
            state.clients.unregister(conn_id);
            return;
        }
    };
    let replayed = backlog.len();
    let mut open = true;
    for envelope in &backlog {
        if send_envelope(&mut sink, envelope).await.is_err() {
            open = false;
            break;
        }
        last_sent = envelope.seq;
    }
    debug!(session_id = %session_id, conn_id, replayed, last_sent, "backlog replayed");

    let heartbeat = Duration::from_secs(state.config.heartbeat_secs.max(1));
    let mut ping = interval_at(Instant::now() + heartbeat, heartbeat);

    while open {
        tokio::select! {
            _ = cancel.cancelled() => {
                close(&mut sink, CLOSE_GOING_AWAY, "closing").await;
                break;
            }
            _ = overflow.cancelled() => {
                warn!(session_id = %session_id, conn_id, "client too slow; dropping connection");
                close(&mut sink, CLOSE_POLICY, "send queue overflow").await;
                break;
            }
            Some(envelope) = rx.recv() => {
                if envelope.seq <= last_sent {
                    continue;
                }
                if send_envelope(&mut sink, &envelope).await.is_err() {
                    break;
                }
                last_sent = envelope.seq;
            }
            _ = ping.tick() => {
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let reply = handle_control(&state.sessions, &session_id, text.as_str());
                    match serde_json::to_string(&reply) {
                        Ok(json) => {
                            if sink.send(WsMessage::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode control reply"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(subscription);
    state.clients.unregister(conn_id);
    info!(session_id = %session_id, conn_id, last_sent, "event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_session_cancels_only_that_session() {
        let registry = ClientRegistry::new();
        let root = CancellationToken::new();
        let a = SessionId::from_raw("a");
        let b = SessionId::from_raw("b");
        let (_, ca) = registry.register(&a, &root);
        let (id_b, cb) = registry.register(&b, &root);
        assert_eq!(registry.count(), 2);

        assert_eq!(registry.disconnect_session(&a), 1);
        assert!(ca.is_cancelled());
        assert!(!cb.is_cancelled());

        registry.unregister(id_b);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn params_default_after_seq() {
        let params: WsParams = serde_json::from_str(r#"{"sessionId":"sess_1"}"#).unwrap();
        assert_eq!(params.after_seq, 0);
        assert!(params.token.is_none());
    }
}
