/**
 * API REST VIGIE - Frontière réseau de l'agrégateur
 *
 * ROUTES :
 * - POST /api/register            {name, address?}          -> {host_id, name, address}
 * - POST /api/heartbeat           {host_id, cpu_percent, mem_percent, net_rx_bytes, net_tx_bytes}
 * - GET  /api/hosts               état de la flotte
 * - GET  /api/hosts/{id}          état courant d'un hôte
 * - GET  /api/hosts/{id}/timeline?hours=24
 * - GET  /api/hosts/{id}/resources?hours=24&points=60
 * - GET  /api/hosts/{id}/samples?kind=heartbeat&limit=50
 * - GET  /health, /system/health
 *
 * SÉCURITÉ :
 * - Si une clé API est configurée, header x-api-key obligatoire sauf sur /health
 */

use crate::aggregator::{FleetStatus, HostStatus, SharedAggregator};
use crate::error::CollectorError;
use crate::health::{CollectorHealth, HealthTracker};
use crate::models::{HostId, Sample, SampleKind};
use crate::mqtt::HeartbeatIn;
use crate::timeline::{ResourcePoint, TimelineSlot};
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use time::Duration;
use tracing::{error, info, warn};

const DEFAULT_HOURS: u32 = 24;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: SharedAggregator,
    pub health: HealthTracker,
    pub api_key: Option<String>,
}

impl IntoResponse for CollectorError {
    fn into_response(self) -> Response {
        let status = match &self {
            CollectorError::NotFound(_) => StatusCode::NOT_FOUND,
            CollectorError::InvalidSample(_) | CollectorError::InvalidRequest(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            CollectorError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "[http] request failed");
        } else {
            warn!(error = %self, "[http] request rejected");
        }
        let body = Json(serde_json::json!({ "ok": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// IP du pair TCP, absente quand le serveur n'expose pas ConnectInfo (tests)
pub struct PeerIp(pub Option<IpAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(PeerIp(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip()),
        ))
    }
}

/// `Json` dont le rejet (corps illisible, champ manquant) suit le format d'erreur de l'API
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = CollectorError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(CollectorError::InvalidRequest(rejection.body_text())),
        }
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        warn!(path = %req.uri().path(), "[http] missing or invalid API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/register", post(register))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/hosts", get(list_hosts))
        .route("/api/hosts/{id}", get(get_host))
        .route("/api/hosts/{id}/timeline", get(get_timeline))
        .route("/api/hosts/{id}/resources", get(get_resources))
        .route("/api/hosts/{id}/samples", get(get_samples))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

#[derive(Debug, Deserialize)]
struct RegisterIn {
    name: String,
    address: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegisterOut {
    host_id: HostId,
    name: String,
    address: Option<String>,
}

// POST /api/register
async fn register(
    State(app): State<AppState>,
    PeerIp(peer): PeerIp,
    JsonBody(body): JsonBody<RegisterIn>,
) -> Result<Json<RegisterOut>, CollectorError> {
    let address = body.address.or_else(|| peer.map(|ip| ip.to_string()));
    let host = app.aggregator.register_host(&body.name, address).await?;
    Ok(Json(RegisterOut {
        host_id: host.id,
        name: host.name,
        address: host.address,
    }))
}

// POST /api/heartbeat
async fn heartbeat(
    State(app): State<AppState>,
    PeerIp(peer): PeerIp,
    JsonBody(body): JsonBody<HeartbeatIn>,
) -> Result<Json<serde_json::Value>, CollectorError> {
    let host_id = HostId::from(body.host_id.as_str());
    app.aggregator.record_heartbeat(&host_id, body.metrics())?;

    if let Some(ip) = peer {
        if let Err(e) = app.aggregator.observe_address(&host_id, &ip.to_string()).await {
            warn!(host_id = %host_id, error = %e, "[http] failed to update host address");
        }
    }
    Ok(Json(serde_json::json!({ "ok": true, "host_id": host_id })))
}

// GET /api/hosts
async fn list_hosts(State(app): State<AppState>) -> Json<FleetStatus> {
    Json(app.aggregator.list_hosts())
}

// GET /api/hosts/{id}
async fn get_host(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HostStatus>, CollectorError> {
    Ok(Json(app.aggregator.current_status(&HostId::from(id))?))
}

#[derive(Debug, Deserialize)]
struct WindowParams {
    hours: Option<u32>,
    points: Option<usize>,
}

fn hours(params: &WindowParams) -> Duration {
    Duration::hours(i64::from(params.hours.unwrap_or(DEFAULT_HOURS)))
}

// GET /api/hosts/{id}/timeline
async fn get_timeline(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<WindowParams>,
) -> Result<Json<Vec<TimelineSlot>>, CollectorError> {
    Ok(Json(app.aggregator.timeline(&HostId::from(id), hours(&params))?))
}

// GET /api/hosts/{id}/resources
async fn get_resources(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<WindowParams>,
) -> Result<Json<Vec<ResourcePoint>>, CollectorError> {
    Ok(Json(app.aggregator.resource_series(&HostId::from(id), hours(&params), params.points)?))
}

#[derive(Debug, Deserialize)]
struct SamplesParams {
    kind: Option<String>,
    limit: Option<usize>,
}

// GET /api/hosts/{id}/samples
async fn get_samples(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SamplesParams>,
) -> Result<Json<Vec<Sample>>, CollectorError> {
    let kind = params
        .kind
        .as_deref()
        .map(str::parse::<SampleKind>)
        .transpose()
        .map_err(CollectorError::InvalidRequest)?;
    Ok(Json(app.aggregator.recent(&HostId::from(id), kind, params.limit)?))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<CollectorHealth> {
    Json(app.health.get_health(&app.aggregator))
}

/// Attend Ctrl+C (ou SIGTERM sous Unix) pour l'arrêt propre
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "[http] failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "[http] failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("[http] shutdown signal received, draining requests");
}
