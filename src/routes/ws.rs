// WebSocket handler and snapshot stream

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};

use super::AppState;
use crate::models::VmSnapshot;
use crate::virsh::CommandRunner;

pub(super) const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
pub(super) const WS_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Decrements the /ws/vms connection count on drop (connect = +1, drop = -1).
struct WsVmGuard(Arc<AtomicUsize>);

impl Drop for WsVmGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn send_text(socket: &mut WebSocket, json: String) -> bool {
    matches!(
        timeout(WS_SEND_TIMEOUT, socket.send(Message::Text(json.into()))).await,
        Ok(Ok(()))
    )
}

pub(super) async fn ws_vms<R: CommandRunner>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<R>>,
) -> impl IntoResponse {
    let tx = state.vm_tx.clone();
    let conn_count = state.ws_vm_connections.clone();
    let snapshots = state.snapshots.clone();
    let names = state.repo.config().vm_names.clone();
    ws.on_upgrade(move |socket| async move {
        // Subscribe before reading the cache so no snapshot published in between is lost.
        let mut rx = tx.subscribe();
        let current: Vec<VmSnapshot> = {
            let guard = snapshots.read().await;
            names.iter().filter_map(|n| guard.get(n).cloned()).collect()
        };
        if let Err(e) = stream_vms(socket, &mut rx, conn_count, current).await {
            tracing::info!("VM stream error: {}", e);
        }
    })
}

async fn stream_vms(
    mut socket: WebSocket,
    rx: &mut broadcast::Receiver<VmSnapshot>,
    conn_count: Arc<AtomicUsize>,
    current: Vec<VmSnapshot>,
) -> anyhow::Result<()> {
    conn_count.fetch_add(1, Ordering::Relaxed);
    let _guard = WsVmGuard(conn_count);
    tracing::info!("Client connected to VM stream");

    let welcome = serde_json::json!({ "type": "info", "vms": current });
    if !send_text(&mut socket, serde_json::to_string(&welcome)?).await {
        return Ok(());
    }

    let mut ping_interval = tokio::time::interval(WS_PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(snapshot) => {
                        if !send_text(&mut socket, serde_json::to_string(&snapshot)?).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("WebSocket /ws/vms client lagged, skipped {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping_interval.tick() => {
                let r = timeout(WS_SEND_TIMEOUT, socket.send(Message::Ping(Bytes::new()))).await;
                if r.is_err() || r.unwrap_or(Ok(())).is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}
