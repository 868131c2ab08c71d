// HTTP + WebSocket routes

mod http;
mod ws;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::models::VmSnapshot;
use crate::poller::SnapshotStore;
use crate::version;
use crate::virsh::{CommandRunner, VirshRepo};

pub struct AppState<R: CommandRunner> {
    pub(crate) repo: Arc<VirshRepo<R>>,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) vm_tx: broadcast::Sender<VmSnapshot>,
    pub(crate) ws_vm_connections: Arc<AtomicUsize>,
}

impl<R: CommandRunner> AppState<R> {
    pub fn new(
        repo: Arc<VirshRepo<R>>,
        snapshots: SnapshotStore,
        vm_tx: broadcast::Sender<VmSnapshot>,
        ws_vm_connections: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            repo,
            snapshots,
            vm_tx,
            ws_vm_connections,
        }
    }
}

impl<R: CommandRunner> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            snapshots: self.snapshots.clone(),
            vm_tx: self.vm_tx.clone(),
            ws_vm_connections: self.ws_vm_connections.clone(),
        }
    }
}

pub fn app<R: CommandRunner>(state: AppState<R>) -> Router {
    Router::new()
        .route("/", get(|| async { version::BANNER })) // GET /
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/vms", get(http::list_vms::<R>)) // GET /api/vms
        .route("/api/vms/{name}", get(http::get_vm::<R>)) // GET /api/vms/{name}
        .route("/api/vms/{name}/info", get(http::vm_info::<R>))
        .route("/api/vms/{name}/vcpus", get(http::vcpus::<R>))
        .route("/api/vms/{name}/devices", get(http::devices::<R>))
        .route("/api/vms/{name}/{action}", post(http::perform_action::<R>))
        .route("/ws/vms", get(ws::ws_vms::<R>)) // WS /ws/vms
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
