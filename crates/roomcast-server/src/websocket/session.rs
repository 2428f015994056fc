//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use roomcast_core::ConnectionId;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::SessionContext;
use super::dispatch::{ON_CONNECT_EVENT, dispatch_text};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::connection::ClientConnection;
use crate::handle::ConnectionHandle;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_INBOUND_DROPS_TOTAL,
};

/// How long teardown waits for the writer to flush before aborting it.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long teardown waits for queued inbound frames before aborting the
/// dispatcher.
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame.
    ClientClosed,
    /// The inbound stream ended without a close frame.
    StreamEnded,
    /// Reading from the socket failed.
    TransportError,
    /// No traffic within the heartbeat timeout.
    HeartbeatTimeout,
    /// The server is stopping.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClientClosed => "client_closed",
            Self::StreamEnded => "stream_ended",
            Self::TransportError => "transport_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection and emits `onConnect` with `metadata`
/// 2. Dispatches inbound frames through middleware to the event bus, in order,
///    on a task of its own so a slow listener never stalls the socket
/// 3. Forwards the outbound queue to the socket and sends periodic pings
/// 4. Closes on client close, transport error, heartbeat timeout, or shutdown
/// 5. Unregisters the connection and leaves every room
#[instrument(skip_all, fields(client_id = %client_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    client_id: ConnectionId,
    ctx: SessionContext,
    metadata: Value,
) -> CloseReason {
    let (ws_tx, mut ws_rx) = ws.split();

    let (send_tx, send_rx) = mpsc::channel::<Arc<String>>(ctx.options.send_queue_capacity);
    let connection = Arc::new(ClientConnection::new(client_id.clone(), send_tx));
    let handle = ConnectionHandle::new(
        Arc::clone(&connection),
        Arc::clone(&ctx.rooms),
        Arc::clone(&ctx.connections),
    );

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    if ctx.connections.insert(Arc::clone(&connection)).is_some() {
        warn!("connection id already registered, replaced");
    }

    let closing = ctx.shutdown.child_token();
    let mut writer = tokio::spawn(run_writer(
        ws_tx,
        send_rx,
        ctx.options.heartbeat_interval,
        closing.clone(),
        ctx.shutdown.clone(),
    ));

    let _ = ctx
        .events
        .emit(ON_CONNECT_EVENT, (handle.clone(), vec![metadata]));

    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(ctx.options.send_queue_capacity);
    let mut dispatcher = tokio::spawn(run_dispatcher(inbound_rx, handle.clone(), ctx.clone()));

    let heartbeat = run_heartbeat(
        Arc::clone(&connection),
        ctx.options.heartbeat_interval,
        ctx.options.heartbeat_timeout,
        closing.clone(),
    );
    tokio::pin!(heartbeat);

    let reason = loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(error)) => {
                        warn!(%error, "websocket receive error");
                        break CloseReason::TransportError;
                    }
                    None => break CloseReason::StreamEnded,
                };
                connection.mark_alive();

                let text = match msg {
                    Message::Text(ref t) => Some(t.as_str()),
                    Message::Binary(ref data) => {
                        let text = std::str::from_utf8(data).ok();
                        if text.is_none() {
                            debug!(len = data.len(), "non-UTF8 binary frame ignored");
                        }
                        text
                    }
                    Message::Close(_) => break CloseReason::ClientClosed,
                    Message::Ping(_) | Message::Pong(_) => None,
                };
                let Some(text) = text else { continue };

                if let Err(mpsc::error::TrySendError::Full(_)) =
                    inbound_tx.try_send(text.to_owned())
                {
                    counter!(WS_INBOUND_DROPS_TOTAL).increment(1);
                    warn!(len = text.len(), "inbound queue full, frame dropped");
                }
            }
            result = &mut heartbeat => {
                break match result {
                    HeartbeatResult::TimedOut => {
                        warn!(timeout = ?ctx.options.heartbeat_timeout, "client unresponsive, disconnecting");
                        CloseReason::HeartbeatTimeout
                    }
                    HeartbeatResult::Cancelled => CloseReason::Shutdown,
                };
            }
            () = ctx.shutdown.cancelled() => break CloseReason::Shutdown,
        }
    };

    drop(inbound_tx);
    if tokio::time::timeout(DISPATCH_DRAIN_TIMEOUT, &mut dispatcher)
        .await
        .is_err()
    {
        debug!("dispatcher did not finish in time, aborting");
        dispatcher.abort();
    }

    closing.cancel();
    if ctx.connections.remove(&client_id).is_none() {
        warn!("connection missing from registry at close");
    }
    let _ = ctx.rooms.close_connection(&connection);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        debug!("writer did not finish in time, aborting");
        writer.abort();
    }

    info!(%reason, dropped = connection.drop_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    reason
}

/// Dispatch inbound frames one at a time until the queue closes.
///
/// A frame still in flight when the server stops is abandoned.
async fn run_dispatcher(
    mut inbound: mpsc::Receiver<String>,
    handle: ConnectionHandle,
    ctx: SessionContext,
) {
    while let Some(text) = inbound.recv().await {
        tokio::select! {
            _ = dispatch_text(&text, &handle, &ctx) => {}
            () = ctx.shutdown.cancelled() => {
                debug!("dispatch abandoned at shutdown");
                return;
            }
        }
    }
}

/// Drain the outbound queue into the socket, pinging every `ping_every`.
///
/// When `closing` fires, frames already queued are flushed and a close frame
/// is sent: `1001 going away` if the server is stopping, `1000` otherwise.
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<String>>,
    ping_every: Duration,
    closing: CancellationToken,
    server_shutdown: CancellationToken,
) {
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(text) = msg else { break };
                if sink.send(Message::Text(text.as_str().into())).await.is_err() {
                    return;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                    return;
                }
            }
            () = closing.cancelled() => break,
        }
    }

    while let Ok(text) = outbound.try_recv() {
        if sink.send(Message::Text(text.as_str().into())).await.is_err() {
            return;
        }
    }

    let frame = if server_shutdown.is_cancelled() {
        CloseFrame {
            code: close_code::AWAY,
            reason: "server shutting down".into(),
        }
    } else {
        CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        }
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
