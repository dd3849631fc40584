//! WebSocket handler — per-connection read and write pumps.
//!
//! DESIGN
//! ======
//! The upgrade is authenticated before the hub ever sees the connection;
//! the account is fixed for the socket's lifetime. After upgrade the socket
//! is split:
//! - The write pump is the only writer. It drains the connection's bounded
//!   queue, coalesces whatever is already queued into one flush, and sends a
//!   ping after an idle ping period.
//! - The read pump decodes text frames into envelopes and dispatches them to
//!   the hub. Replies (acks, errors, pongs) go through the same queue as
//!   broadcasts, so ordering per connection is preserved.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → authenticate → `Connection::new` → `hub.register`
//! 2. Read pump runs until close, read error or read deadline expiry
//! 3. `hub.unregister` closes the queue; the write pump sends Close and exits

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use super::auth;
use crate::config::ConnectionLimits;
use crate::envelope::{Envelope, ErrorCode, ProtocolError, Request};
use crate::services::connection::Connection;
use crate::services::hub::Hub;
use crate::services::store::Account;
use crate::state::AppState;

/// Upper bound on a single batched write before the socket is considered dead.
const WRITE_WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = auth::request_token(&params, &headers) else {
        return (StatusCode::UNAUTHORIZED, "token required").into_response();
    };

    let account = match auth::authenticate(state.identity.as_ref(), &token).await {
        Ok(account) => account,
        Err(StatusCode::UNAUTHORIZED) => {
            return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response();
        }
        Err(status) => return (status, "token validation error").into_response(),
    };

    ws.max_message_size(state.limits.max_message_bytes)
        .on_upgrade(move |socket| run_ws(socket, state, account))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(socket: WebSocket, state: AppState, account: Account) {
    let limits = state.limits;
    let (conn, rx) = Connection::new(account, limits.queue_capacity);
    state.hub.register(Arc::clone(&conn)).await;
    info!(connection_id = %conn.id(), account_id = %conn.account_id(), "ws: client connected");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(sink, rx, limits));

    let writer_done = tokio::select! {
        () = read_pump(stream, &state.hub, &conn, limits.pong_wait) => false,
        _ = &mut writer => true,
    };

    debug!(connection_id = %conn.id(), rooms = conn.rooms().len(), writer_done, "ws: tearing down");
    state.hub.unregister(&conn).await;

    // Give the write pump a moment to flush and send Close.
    if !writer_done && timeout(WRITE_WAIT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(connection_id = %conn.id(), "ws: client disconnected");
}

async fn read_pump(mut stream: SplitStream<WebSocket>, hub: &Hub, conn: &Arc<Connection>, pong_wait: Duration) {
    loop {
        // Any inbound frame, pongs included, extends the deadline.
        let msg = match timeout(pong_wait, stream.next()).await {
            Err(_) => {
                info!(connection_id = %conn.id(), "ws: read deadline expired");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %conn.id(), error = %e, "ws: read error");
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                if let Some(reply) = process_inbound_text(hub, conn, text.as_str()).await {
                    conn.enqueue(reply);
                }
            }
            Message::Binary(_) => {
                conn.enqueue(Envelope::error_from(&ProtocolError::Binary, None));
            }
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn write_pump(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Envelope>, limits: ConnectionLimits) {
    let period = limits.ping_period();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(first) = next else {
                    // Queue closed by unregister.
                    let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                    return;
                };
                match timeout(WRITE_WAIT, write_batch(&mut sink, &mut rx, first)).await {
                    Ok(Ok(())) => ticker.reset(),
                    Ok(Err(e)) => {
                        debug!(error = %e, "ws: write error");
                        return;
                    }
                    Err(_) => {
                        warn!("ws: write deadline expired");
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if timeout(WRITE_WAIT, sink.send(Message::Ping(Bytes::new()))).await.map_or(true, |r| r.is_err()) {
                    return;
                }
            }
        }
    }
}

/// Write `first` plus everything already queued, then flush once.
async fn write_batch(
    sink: &mut SplitSink<WebSocket, Message>,
    rx: &mut mpsc::Receiver<Envelope>,
    first: Envelope,
) -> Result<(), axum::Error> {
    feed_envelope(sink, &first).await?;
    for _ in 0..rx.len() {
        let Ok(env) = rx.try_recv() else {
            break;
        };
        feed_envelope(sink, &env).await?;
    }
    sink.flush().await
}

async fn feed_envelope(sink: &mut SplitSink<WebSocket, Message>, env: &Envelope) -> Result<(), axum::Error> {
    match env.to_json() {
        Ok(json) => sink.feed(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, kind = ?env.kind, "ws: failed to serialize envelope");
            Ok(())
        }
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Decode one inbound text frame, run it against the hub and return the
/// reply for the sender, if any. The connection stays open on every error.
pub(crate) async fn process_inbound_text(hub: &Hub, conn: &Arc<Connection>, text: &str) -> Option<Envelope> {
    let envelope = match Envelope::parse(text) {
        Ok(env) => env,
        Err(e) => {
            warn!(connection_id = %conn.id(), error = %e, "ws: malformed envelope");
            return Some(Envelope::error_from(&e, Envelope::salvage_request_id(text)));
        }
    };

    let request_id = envelope.request_id.clone();
    let request = match Request::decode(&envelope) {
        Ok(request) => request,
        Err(e) => {
            warn!(connection_id = %conn.id(), kind = ?envelope.kind, error = %e, "ws: rejected request");
            return Some(Envelope::error_from(&e, request_id));
        }
    };

    debug!(connection_id = %conn.id(), kind = ?envelope.kind, request_id = ?request_id, "ws: recv");

    let result = match request {
        Request::JoinRoom(room) => hub
            .join_room(conn, room.room_id)
            .await
            .map(|env| Some(env.with_request_id(request_id.clone()))),
        Request::LeaveRoom(room) => Ok(Some(
            hub.leave_room(conn, room.room_id)
                .await
                .with_request_id(request_id.clone()),
        )),
        Request::SendMessage(msg) => hub.route_message(conn, msg, request_id.clone()).await.map(Some),
        Request::SendDirectMessage(msg) => hub
            .route_direct_message(conn, msg, request_id.clone())
            .await
            .map(Some),
        Request::Typing { room_id, typing } => {
            hub.broadcast_typing(conn, room_id, typing).await;
            Ok(None)
        }
        Request::MarkRead(mark) => hub.mark_read(conn, mark, request_id.clone()).await.map(Some),
        Request::Ping => Ok(Some(Envelope::pong(request_id.clone()))),
    };

    match result {
        Ok(reply) => reply,
        Err(e) => {
            warn!(connection_id = %conn.id(), code = e.error_code(), error = %e, "ws: request failed");
            Some(Envelope::error_from(&e, request_id))
        }
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
