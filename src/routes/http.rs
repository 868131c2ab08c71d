// GET/POST handlers: version, VM snapshots, on-demand details, lifecycle actions

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::AppState;
use crate::error::{ErrorKind, StructuredError};
use crate::models::VmAction;
use crate::version;
use crate::virsh::CommandRunner;

/// GET /version
pub(super) async fn version_handler() -> impl IntoResponse {
    Json(version::info())
}

/// HTTP status for a failed VM operation.
pub(crate) fn status_for(err: &StructuredError) -> StatusCode {
    if err.is_informational() {
        StatusCode::CONFLICT
    } else if err.kind == ErrorKind::NotFound {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_GATEWAY
    }
}

fn error_response(status: StatusCode, err: StructuredError) -> Response {
    (
        status,
        Json(serde_json::json!({ "ok": false, "error": err })),
    )
        .into_response()
}

fn unmanaged(name: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        StructuredError::new(
            ErrorKind::NotFound,
            format!("VM '{}' is not managed by this panel", name),
            None,
        ),
    )
}

/// GET /api/vms: Latest snapshot per configured VM, in configuration order.
pub(super) async fn list_vms<R: CommandRunner>(State(state): State<AppState<R>>) -> Response {
    let snapshots = state.snapshots.read().await;
    let vms: Vec<_> = state
        .repo
        .config()
        .vm_names
        .iter()
        .filter_map(|name| snapshots.get(name))
        .collect();
    Json(vms).into_response()
}

/// GET /api/vms/{name}
pub(super) async fn get_vm<R: CommandRunner>(
    State(state): State<AppState<R>>,
    Path(name): Path<String>,
) -> Response {
    if !state.repo.config().is_managed(&name) {
        return unmanaged(&name);
    }
    match state.snapshots.read().await.get(&name) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            StructuredError::new(
                ErrorKind::NotFound,
                format!("No sample for VM '{}' yet", name),
                Some("Retry after the next poll"),
            ),
        ),
    }
}

/// GET /api/vms/{name}/info: `virsh dominfo` fields.
pub(super) async fn vm_info<R: CommandRunner>(
    State(state): State<AppState<R>>,
    Path(name): Path<String>,
) -> Response {
    if !state.repo.config().is_managed(&name) {
        return unmanaged(&name);
    }
    match state.repo.vm_info(&name).await {
        Some(info) => Json(info).into_response(),
        None => error_response(
            StatusCode::BAD_GATEWAY,
            StructuredError::new(
                ErrorKind::Unknown,
                format!("Could not read info for VM '{}'", name),
                None,
            ),
        ),
    }
}

/// GET /api/vms/{name}/vcpus: Empty when the VM is not running.
pub(super) async fn vcpus<R: CommandRunner>(
    State(state): State<AppState<R>>,
    Path(name): Path<String>,
) -> Response {
    if !state.repo.config().is_managed(&name) {
        return unmanaged(&name);
    }
    Json(state.repo.vcpu_info(&name).await.unwrap_or_default()).into_response()
}

/// GET /api/vms/{name}/devices: Interfaces and virtio flags from the domain XML.
pub(super) async fn devices<R: CommandRunner>(
    State(state): State<AppState<R>>,
    Path(name): Path<String>,
) -> Response {
    if !state.repo.config().is_managed(&name) {
        return unmanaged(&name);
    }
    match state.repo.device_config(&name).await {
        Some(cfg) => Json(cfg).into_response(),
        None => error_response(
            StatusCode::BAD_GATEWAY,
            StructuredError::new(
                ErrorKind::Unknown,
                format!("Could not read the configuration of VM '{}'", name),
                None,
            ),
        ),
    }
}

/// POST /api/vms/{name}/{action}
pub(super) async fn perform_action<R: CommandRunner>(
    State(state): State<AppState<R>>,
    Path((name, action)): Path<(String, String)>,
) -> Response {
    let action: VmAction = match action.parse() {
        Ok(a) => a,
        Err(msg) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                StructuredError::new(ErrorKind::Unknown, msg, None),
            );
        }
    };
    match state.repo.perform(&name, action).await {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(err) => error_response(status_for(&err), err),
    }
}
