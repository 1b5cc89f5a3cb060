use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use murmur_types::events::ClientCommand;

use crate::registry::SessionHandle;
use crate::router::{ConnectionContext, MessageRouter};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Longest excerpt of a malformed frame that ends up in the log.
const RAW_EXCERPT_CHARS: usize = 200;

/// Serve one WebSocket connection until the peer leaves or the heartbeat
/// times out. The session, if any, is released on every exit path.
pub async fn handle_connection(socket: WebSocket, router: MessageRouter) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut outbound) = SessionHandle::channel();
    let conn_id = handle.conn_id();
    let mut ctx = ConnectionContext::new(handle);

    info!("Connection {} opened", conn_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();

    // Single writer: replies, relayed messages and fan-out all funnel
    // through `outbound`, one frame per event.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = outbound.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode event for {}: {}", conn_id, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout on {} (missed {} pongs), dropping connection", conn_id, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_loop = async {
        while let Some(frame) = receiver.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Read error on {}: {}", conn_id, e);
                    break;
                }
            };
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => router.dispatch(&mut ctx, cmd).await,
                    Err(e) => {
                        let raw: String = text.chars().take(RAW_EXCERPT_CHARS).collect();
                        warn!("Bad envelope on {}: {} -- raw: {}", conn_id, e, raw);
                    }
                },
                Message::Binary(data) => {
                    warn!("Ignoring {}-byte binary frame on {}", data.len(), conn_id);
                }
                Message::Pong(_) => {
                    pong_received.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                Message::Ping(_) => {}
            }
        }
    };

    // Wait for either side to finish
    tokio::select! {
        _ = &mut send_task => {}
        _ = recv_loop => send_task.abort(),
    }

    let username = ctx.username().map(str::to_string);
    router.disconnect(&mut ctx).await;
    match username {
        Some(name) => info!("{} disconnected from {}", name, conn_id),
        None => info!("Connection {} closed before login", conn_id),
    }
}
