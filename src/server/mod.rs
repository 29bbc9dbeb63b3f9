//! # Server Module
//!
//! Thin HTTP surface over the cache, the settings documents and the power
//! sequencer.
//!
//! Read endpoints always answer with the best values currently known. Only
//! write and power endpoints can fail, and they answer with
//! `{"error": "..."}`.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::error::ProxyError;
use crate::ingest::{CacheFilter, CacheView, IngestCache};
use crate::power::{PowerError, PowerSequencer, PowerState};
use crate::settings::{SettingsPatch, SettingsStore};
use crate::validation;

/// Marker file present inside Docker containers
pub const CONTAINER_MARKER: &str = "/.dockerenv";

/// Shared server state
pub struct AppState {
    pub cache: Arc<IngestCache>,
    /// The receiver's own settings document
    pub receiver_settings: SettingsStore,
    /// Settings owned by this service (array angle)
    pub local_settings: SettingsStore,
    pub sequencer: Arc<PowerSequencer>,
    /// Whether relay and service control is allowed on this host
    pub power_controllable: bool,
}

/// Whether this host may drive the relay and the receiver service
pub fn power_controllable(enabled: bool) -> bool {
    enabled && !Path::new(CONTAINER_MARKER).exists()
}

/// Errors returned to HTTP clients
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotControllable,
    Timeout(String),
    Internal(String),
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Validation(msg) => ApiError::BadRequest(msg),
            ProxyError::Power(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PowerError> for ApiError {
    fn from(err: PowerError) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotControllable => StatusCode::FORBIDDEN,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) | ApiError::Timeout(msg) | ApiError::Internal(msg) => {
                msg.clone()
            }
            ApiError::NotControllable => "Power control is not available on this host".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            warn!("Request failed with {}: {}", status, message);
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `/cache` query string. An empty value (`?confidence=`) means no filter.
#[derive(Debug, Default, Deserialize)]
pub struct CacheQuery {
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub confidence: Option<f64>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub rssi: Option<f64>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub newer_than: Option<i64>,
}

fn empty_string_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let value = Option::<String>::deserialize(deserializer)?;
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(de::Error::custom),
    }
}

/// Integer given as a JSON number (fraction truncated) or a decimal string
fn lenient_integer<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(value), _) => Ok(value),
            (None, Some(value)) if value.is_finite() && value.abs() < i64::MAX as f64 => {
                Ok(value.trunc() as i64)
            }
            _ => Err(de::Error::custom(format!("{} is out of range", number))),
        },
        Value::String(raw) => raw
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("'{}' is not an integer", raw))),
        other => Err(de::Error::custom(format!("expected an integer, got {}", other))),
    }
}

impl From<CacheQuery> for CacheFilter {
    fn from(query: CacheQuery) -> Self {
        CacheFilter {
            min_confidence: query.confidence,
            min_rssi: query.rssi,
            newer_than: query.newer_than,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FrequencyRequest {
    #[serde(deserialize_with = "lenient_integer")]
    pub frequency_hz: i64,
}

#[derive(Debug, Deserialize)]
pub struct CoordinatesRequest {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
pub struct StationIdRequest {
    pub station_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ArrayAngleRequest {
    pub array_angle: f64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub fresh: bool,
    pub last_updated_ago_ms: Option<i64>,
    pub power_state: PowerState,
    pub cpu_temperature_c: Option<i32>,
    pub format_version: String,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PowerResponse {
    pub state: PowerState,
}

/// Run file I/O on the blocking pool
async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => Err(ApiError::Internal(format!("Blocking task failed: {}", e))),
    }
}

async fn handle_ping() -> Json<Value> {
    Json(json!({ "message": "ping" }))
}

async fn handle_cache(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CacheQuery>, QueryRejection>,
) -> ApiResult<Json<CacheView>> {
    let Query(query) = query?;
    let filter = CacheFilter::from(query);
    let cache = state.cache.clone();
    // may fall back to reading the receiver settings
    let view = blocking(move || Ok(cache.read(&filter))).await?;
    Ok(Json(view))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        fresh: state.cache.is_fresh(),
        last_updated_ago_ms: state.cache.last_mutated_ago_ms(),
        power_state: state.sequencer.current_state(),
        cpu_temperature_c: state.sequencer.probes().read_temperature().await,
        format_version: state.cache.format_version().to_string(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn handle_frequency(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<FrequencyRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(request) = payload?;
    let frequency_hz = validation::validate_frequency(request.frequency_hz)?;
    let store = state.receiver_settings.clone();
    blocking(move || store.update(&SettingsPatch::frequency(frequency_hz))).await?;
    info!("Receiver retuned to {} Hz", frequency_hz);
    Ok(StatusCode::OK)
}

async fn handle_coordinates(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CoordinatesRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(request) = payload?;
    let (lat, lon) = validation::validate_coordinates(request.lat, request.lon)?;
    let store = state.receiver_settings.clone();
    blocking(move || store.update(&SettingsPatch::coordinates(lat, lon))).await?;
    info!("Station coordinates set to {}, {}", lat, lon);
    Ok(StatusCode::OK)
}

async fn handle_station_id(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StationIdRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(request) = payload?;
    let station_id = validation::validate_station_id(&request.station_id)?.to_string();
    let store = state.receiver_settings.clone();
    let patch = SettingsPatch::station_id(&station_id);
    blocking(move || store.update(&patch)).await?;
    info!("Station id set to {}", station_id);
    Ok(StatusCode::OK)
}

async fn handle_array_angle(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ArrayAngleRequest>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(request) = payload?;
    let angle = validation::validate_angle(request.array_angle)?;
    let store = state.local_settings.clone();
    blocking(move || store.update(&SettingsPatch::array_angle(angle))).await?;
    state.cache.set_orientation_offset(Some(angle));
    Ok(StatusCode::OK)
}

async fn handle_power_state(State(state): State<Arc<AppState>>) -> Json<PowerResponse> {
    Json(PowerResponse {
        state: state.sequencer.probe_state().await,
    })
}

/// Run a sequencer operation on its own task.
///
/// A client that disconnects mid-sequence must not cancel the sequence and
/// leave the hardware half switched.
async fn run_detached<F, Fut>(state: &AppState, operation: F) -> ApiResult<Json<PowerResponse>>
where
    F: FnOnce(Arc<PowerSequencer>) -> Fut,
    Fut: Future<Output = Result<(), PowerError>> + Send + 'static,
{
    if !state.power_controllable {
        return Err(ApiError::NotControllable);
    }

    let task = tokio::spawn(operation(state.sequencer.clone()));
    match task.await {
        Ok(result) => result?,
        Err(e) => return Err(ApiError::Internal(format!("Power task failed: {}", e))),
    }

    Ok(Json(PowerResponse {
        state: state.sequencer.current_state(),
    }))
}

async fn handle_power_on(State(state): State<Arc<AppState>>) -> ApiResult<Json<PowerResponse>> {
    run_detached(&state, |seq| async move { seq.power_on().await }).await
}

async fn handle_power_off(State(state): State<Arc<AppState>>) -> ApiResult<Json<PowerResponse>> {
    run_detached(&state, |seq| async move { seq.power_off().await }).await
}

async fn handle_reboot(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    if !state.power_controllable {
        return Err(ApiError::NotControllable);
    }
    warn!("Reboot requested");
    state
        .sequencer
        .probes()
        .reboot()
        .await
        .map_err(|e| ApiError::Internal(format!("Reboot failed: {}", e)))?;
    Ok(StatusCode::ACCEPTED)
}

/// Build the axum router.
///
/// CORS is wide open: map clients on other origins read `/cache`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_ping))
        .route("/cache", get(handle_cache))
        .route("/health", get(handle_health))
        .route("/frequency", post(handle_frequency))
        .route("/coordinates", post(handle_coordinates))
        .route("/station_id", post(handle_station_id))
        .route("/array_angle", post(handle_array_angle))
        .route("/power", get(handle_power_state))
        .route("/power/on", post(handle_power_on))
        .route("/power/off", post(handle_power_off))
        .route("/reboot", post(handle_reboot))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
///
/// # Errors
///
/// Returns error if the address cannot be bound or the server fails.
pub async fn run_server<S>(state: Arc<AppState>, host: &str, port: u16, shutdown: S) -> std::io::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
