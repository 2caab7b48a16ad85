use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::SessionConfig;
use crate::error::{RegistryError, TaskError};
use crate::inventory::{Device, DeviceInventory};
use crate::scheduler::{PollOutcome, StatusService, TaskToken};
use crate::session::{Connector, SessionAutomaton, SessionOutput, SessionRequest};
use crate::worker::TaskExecutor;

#[derive(Clone)]
pub struct ApiState {
    pub inventory: Arc<dyn DeviceInventory>,
    pub connector: Arc<dyn Connector>,
    pub executor: TaskExecutor,
    pub status: StatusService,
    pub session: Arc<SessionConfig>,
}

/// Result payload of a single-device version task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceVersion {
    pub device: String,
    pub target: String,
    pub version: String,
}

impl From<SessionOutput> for DeviceVersion {
    fn from(out: SessionOutput) -> Self {
        Self {
            device: out.device,
            target: out.target,
            version: out.output,
        }
    }
}

/// Result payload of a role-wide version task, keyed by hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleVersions {
    pub role: String,
    pub devices: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct DeviceResponse {
    self_url: String,
    hostname: String,
    loopback: String,
    mgmt_ip: String,
    role: String,
    vendor: String,
    os: String,
}

impl From<Device> for DeviceResponse {
    fn from(device: Device) -> Self {
        Self {
            self_url: device.url(),
            hostname: device.hostname,
            loopback: device.loopback,
            mgmt_ip: device.mgmt_ip,
            role: device.role,
            vendor: device.vendor,
            os: device.os,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    status: u16,
    error: String,
    message: String,
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Validation(String),
    Unavailable(String),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            ApiError::Validation(m) => (StatusCode::BAD_REQUEST, "validation", m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", m),
        };
        error_response(status, error, message)
    }
}

fn error_response(status: StatusCode, error: &str, message: String) -> Response {
    (
        status,
        Json(ErrorBody {
            status: status.as_u16(),
            error: error.to_string(),
            message,
        }),
    )
        .into_response()
}

fn accepted(token: &TaskToken, state: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        [(header::LOCATION, StatusService::location(token))],
        Json(json!({ "token": token.to_string(), "state": state })),
    )
        .into_response()
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/devices", get(list_devices_handler))
        .route("/devices/", get(list_devices_handler))
        .route("/devices/{id}", get(get_device_handler))
        .route("/devices/{id}/version", get(device_version_handler))
        .route("/status/{token}", get(task_status_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting HTTP API");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn list_devices_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let urls: Vec<String> = state.inventory.all().iter().map(Device::url).collect();
    Json(json!({ "device": urls }))
}

async fn get_device_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    match id.parse::<u64>().ok().and_then(|id| state.inventory.get(id)) {
        Some(device) => Json(DeviceResponse::from(device)).into_response(),
        None => ApiError::NotFound(format!("device {} not found", id)).into_response(),
    }
}

/// `/devices/{id}/version` runs one device; a non-numeric segment is taken
/// as a role and runs every device with that role.
async fn device_version_handler(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Response {
    let submitted = match key.parse::<u64>() {
        Ok(id) => submit_device_version(&state, id).await,
        Err(_) => submit_role_version(&state, &key).await,
    };
    match submitted {
        Ok(token) => accepted(&token, "pending"),
        Err(e) => e.into_response(),
    }
}

fn automaton_for(state: &ApiState, device: &Device) -> Result<SessionAutomaton, ApiError> {
    let request = SessionRequest::for_device(&state.session, &device.hostname, &device.mgmt_ip);
    SessionAutomaton::new(request).map_err(|e| ApiError::Validation(e.to_string()))
}

async fn submit_device_version(state: &ApiState, id: u64) -> Result<TaskToken, ApiError> {
    let device = state
        .inventory
        .get(id)
        .ok_or_else(|| ApiError::NotFound(format!("device {} not found", id)))?;
    let automaton = automaton_for(state, &device)?;
    let connector = state.connector.clone();

    let token = state
        .executor
        .submit(format!("version:{}", device.hostname), async move {
            let out = automaton.run(connector.as_ref()).await?;
            Ok::<_, TaskError>(DeviceVersion::from(out))
        })
        .await?;
    Ok(token)
}

async fn submit_role_version(state: &ApiState, role: &str) -> Result<TaskToken, ApiError> {
    let devices = state.inventory.with_role(role);
    if devices.is_empty() {
        return Err(ApiError::NotFound(format!("no devices with role {}", role)));
    }
    let automata = devices
        .iter()
        .map(|d| automaton_for(state, d))
        .collect::<Result<Vec<_>, _>>()?;
    let connector = state.connector.clone();
    let role_name = role.to_string();

    let token = state
        .executor
        .submit(format!("version:role:{}", role), async move {
            let mut devices = BTreeMap::new();
            for automaton in &automata {
                let out = automaton.run(connector.as_ref()).await?;
                devices.insert(out.device, out.output);
            }
            Ok::<_, TaskError>(RoleVersions {
                role: role_name,
                devices,
            })
        })
        .await?;
    Ok(token)
}

async fn task_status_handler(
    State(state): State<ApiState>,
    Path(token): Path<String>,
) -> Response {
    let Ok(parsed) = token.parse::<TaskToken>() else {
        return ApiError::NotFound(format!("task {} not found", token)).into_response();
    };

    match state.status.poll(&parsed).await {
        PollOutcome::Accepted { state, location } => (
            StatusCode::ACCEPTED,
            [(header::LOCATION, location)],
            Json(json!({ "token": parsed.to_string(), "state": state.to_string() })),
        )
            .into_response(),
        PollOutcome::Completed(result) => (StatusCode::OK, Json(result)).into_response(),
        PollOutcome::Failed(error) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            error.kind(),
            error.to_string(),
        ),
        PollOutcome::NotFound => {
            ApiError::NotFound(format!("task {} not found", token)).into_response()
        }
    }
}
