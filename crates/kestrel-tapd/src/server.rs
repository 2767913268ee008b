//! HTTP front end of the helper.
//!
//! ## Endpoints
//!
//! - `POST /` - create tap devices for a VM
//! - `DELETE /` - remove tap devices
//!
//! Any other method on `/` is answered with 405.

use crate::devices::{validate_name, TapDevices};
use crate::error::{Result, TapdError};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use kestrel_core::tapnet::protocol::{CreateRequest, CreateResponse, DeleteRequest};
use kestrel_core::tapnet::device_names;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Upper bound on interfaces per request.
pub const MAX_DEVICES_PER_REQUEST: usize = 32;

/// Shared state of the request handlers.
#[derive(Clone)]
pub struct AppState {
    devices: Arc<dyn TapDevices>,
    bridge: Arc<str>,
}

impl AppState {
    /// Manage `devices` on `bridge`.
    pub fn new(devices: Arc<dyn TapDevices>, bridge: impl Into<String>) -> Self {
        Self {
            devices,
            bridge: Arc::from(bridge.into()),
        }
    }

    /// Bridge taps are attached to.
    pub fn bridge(&self) -> &str {
        &self.bridge
    }
}

/// Build the helper's router.
pub fn build_router(state: AppState) -> Router {
    tracing::debug!(bridge = %state.bridge, "Building HTTP router");
    Router::new()
        .route("/", post(create_handler).delete(delete_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| TapdError::BadRequest(format!("invalid request body: {e}")))
}

async fn create_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CreateResponse>> {
    let request: CreateRequest = decode(&body)?;
    if request.count > MAX_DEVICES_PER_REQUEST {
        return Err(TapdError::BadRequest(format!(
            "at most {MAX_DEVICES_PER_REQUEST} devices per request, got {}",
            request.count
        )));
    }
    let names = device_names(&request.id, request.count);
    for name in &names {
        validate_name(name)?;
    }

    state.devices.check_bridge(&state.bridge).await?;

    let start = Instant::now();
    let mut created = Vec::with_capacity(names.len());
    for name in &names {
        if let Err(e) = state.devices.create(name, &state.bridge).await {
            tracing::warn!(id = %request.id, device = %name, error = %e, "Tap creation failed, rolling back");
            rollback(state.devices.as_ref(), &created).await;
            return Err(e);
        }
        created.push(name.clone());
    }

    tracing::info!(
        id = %request.id,
        devices = ?created,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Tap devices created"
    );
    Ok(Json(CreateResponse { devices: created }))
}

async fn rollback(devices: &dyn TapDevices, created: &[String]) {
    for name in created.iter().rev() {
        if let Err(e) = devices.delete(name).await {
            tracing::warn!(device = %name, error = %e, "Rollback failed to delete tap");
        }
    }
}

async fn delete_handler(State(state): State<AppState>, body: Bytes) -> Result<StatusCode> {
    let request: DeleteRequest = decode(&body)?;
    for name in &request.devices {
        validate_name(name)?;
    }

    let mut first_error = None;
    for name in &request.devices {
        if let Err(e) = state.devices.delete(name).await {
            tracing::warn!(device = %name, error = %e, "Tap deletion failed");
            first_error.get_or_insert(e);
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    tracing::info!(devices = ?request.devices, "Tap devices deleted");
    Ok(StatusCode::OK)
}

/// Serve the helper until `shutdown` completes.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::result::Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting tap helper");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
