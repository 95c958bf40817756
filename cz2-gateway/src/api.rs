//! HTTP API layer.
//!
//! Thin adapter over the service, cache, and SSE manager: handlers parse
//! and validate, dispatch one call, and map the service's error taxonomy
//! onto HTTP statuses. No bus logic lives here.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use cz2_core::model::{FanMode, SystemMode};

use crate::cache::{now_epoch, snapshot_payload, StateCache};
use crate::config::Settings;
use crate::health::health_payload;
use crate::service::{CommandOp, HvacService, ServiceError};
use crate::sse::{SseError, SseManager};

pub struct AppState {
    pub settings: Settings,
    pub cache: Arc<StateCache>,
    pub service: Arc<HvacService>,
    pub sse: Arc<SseManager>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/update", post(force_update))
        .route("/system/mode", post(set_system_mode))
        .route("/system/fan", post(set_system_fan))
        .route("/zones/batch/temperature", post(set_batch_zone_temperature))
        .route("/zones/{zone_id}/temperature", post(set_zone_temperature))
        .route("/zones/{zone_id}/hold", post(set_zone_hold))
        .route("/status/live", get(get_live_status))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(cache_clear))
        .route("/events", get(events))
        .route("/sse/stats", get(sse_stats))
        .route("/health", get(health))
        .with_state(state)
}

// ── Error mapping ───────────────────────────────────────────────────────

pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"code": self.code, "message": self.message})),
        )
            .into_response()
    }
}

fn not_found(message: impl Into<String>) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn validation_error(message: impl Into<String>) -> ApiError {
    ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", message)
}

fn map_service_error(e: ServiceError) -> ApiError {
    match e {
        ServiceError::DeadlineExceeded(message) => {
            ApiError::new(StatusCode::GATEWAY_TIMEOUT, "timeout", message)
        }
        ServiceError::Unavailable(message) => ApiError::new(
            StatusCode::GATEWAY_TIMEOUT,
            "unavailable",
            format!("Could not communicate with HVAC controller: {message}"),
        ),
        ServiceError::FailedPrecondition(message) => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "protocol_error", message)
        }
        ServiceError::Internal(message) => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
        }
    }
}

// ── Validation ──────────────────────────────────────────────────────────

fn validate_zone(settings: &Settings, zone_id: u8) -> Result<(), ApiError> {
    if !(1..=settings.cz_zones).contains(&zone_id) {
        return Err(not_found(format!("Zone {zone_id} not found.")));
    }
    Ok(())
}

/// Setpoint ranges per the controller's limits; when both are given the
/// cool setpoint must sit at least 2°F above the heat setpoint.
fn validate_setpoints(heat: Option<u8>, cool: Option<u8>) -> Result<(), ApiError> {
    if let Some(heat) = heat {
        if !(45..=85).contains(&heat) {
            return Err(validation_error(format!(
                "Heat setpoint {heat}°F outside allowed range 45-85."
            )));
        }
    }
    if let Some(cool) = cool {
        if !(64..=99).contains(&cool) {
            return Err(validation_error(format!(
                "Cool setpoint {cool}°F outside allowed range 64-99."
            )));
        }
    }
    if let (Some(heat), Some(cool)) = (heat, cool) {
        if cool < heat + 2 {
            return Err(validation_error(format!(
                "Heat setpoint ({heat}°F) must be at least 2°F below cool setpoint \
                 ({cool}°F). Current gap: {}°F.",
                cool as i16 - heat as i16
            )));
        }
    }
    Ok(())
}

fn is_truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

fn mode_name(mode: SystemMode) -> String {
    serde_json::to_value(mode)
        .ok()
        .and_then(|value| value.as_str().map(String::from))
        .unwrap_or_default()
}

fn fan_name(fan: FanMode) -> String {
    serde_json::to_value(fan)
        .ok()
        .and_then(|value| value.as_str().map(String::from))
        .unwrap_or_default()
}

// ── Request bodies ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StatusQuery {
    flat: Option<String>,
    force: Option<String>,
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SystemModeArgs {
    mode: SystemMode,
    all: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SystemFanArgs {
    fan: FanMode,
}

#[derive(Debug, Deserialize)]
struct ZoneTemperatureArgs {
    heat: Option<u8>,
    cool: Option<u8>,
    temp: Option<bool>,
    hold: Option<bool>,
    out: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct BatchZoneTemperatureArgs {
    zones: Vec<u8>,
    heat: Option<u8>,
    cool: Option<u8>,
    temp: Option<bool>,
    hold: Option<bool>,
    out: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ZoneHoldArgs {
    hold: Option<bool>,
    temp: Option<bool>,
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn get_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Json<Value> {
    let flat = query.flat.as_deref() == Some("1");
    let force = query.force.as_deref() == Some("true");
    let raw = is_truthy(query.raw.as_deref());

    let (status, meta) = state.service.get_status(force, raw).await;
    if flat {
        Json(status.to_flat_payload(raw, now_epoch()))
    } else {
        Json(snapshot_payload(&status, &meta, raw))
    }
}

async fn force_update(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (status, meta) = state.service.get_status(true, false).await;
    let mut payload = snapshot_payload(&status, &meta, false);
    payload["message"] = Value::String("Status refreshed successfully".to_string());
    Json(payload)
}

async fn set_system_mode(
    State(state): State<Arc<AppState>>,
    Json(args): Json<SystemModeArgs>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .execute_command(CommandOp::SetSystemMode {
            mode: Some(args.mode),
            all_zones: args.all,
        })
        .await
        .map_err(map_service_error)?;

    let (status, meta) = state.cache.get();
    let mut payload = snapshot_payload(&status, &meta, false);
    payload["message"] = Value::String(format!("System mode set to {}", mode_name(args.mode)));
    Ok(Json(payload))
}

async fn set_system_fan(
    State(state): State<Arc<AppState>>,
    Json(args): Json<SystemFanArgs>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .execute_command(CommandOp::SetFanMode { fan: args.fan })
        .await
        .map_err(map_service_error)?;

    let (status, meta) = state.cache.get();
    let mut payload = snapshot_payload(&status, &meta, false);
    payload["message"] = Value::String(format!("Fan mode set to {}", fan_name(args.fan)));
    Ok(Json(payload))
}

async fn set_zone_temperature(
    State(state): State<Arc<AppState>>,
    Path(zone_id): Path<u8>,
    Json(args): Json<ZoneTemperatureArgs>,
) -> Result<Json<Value>, ApiError> {
    validate_zone(&state.settings, zone_id)?;
    validate_setpoints(args.heat, args.cool)?;

    state
        .service
        .execute_command(CommandOp::SetZoneSetpoints {
            zones: vec![zone_id],
            heat: args.heat,
            cool: args.cool,
            temporary: Some(args.temp.unwrap_or(false)),
            hold: Some(args.hold.unwrap_or(false)),
            out: Some(args.out.unwrap_or(false)),
        })
        .await
        .map_err(map_service_error)?;

    let (status, meta) = state.cache.get();
    let mut payload = snapshot_payload(&status, &meta, false);
    payload["message"] = Value::String(format!("Zone {zone_id} temperature updated"));
    Ok(Json(payload))
}

async fn set_batch_zone_temperature(
    State(state): State<Arc<AppState>>,
    Json(args): Json<BatchZoneTemperatureArgs>,
) -> Result<Json<Value>, ApiError> {
    if args.zones.is_empty() {
        return Err(validation_error("At least one zone is required."));
    }
    for &zone_id in &args.zones {
        validate_zone(&state.settings, zone_id)?;
    }
    validate_setpoints(args.heat, args.cool)?;

    let mut zones = args.zones.clone();
    zones.sort_unstable();
    zones.dedup();

    state
        .service
        .execute_command(CommandOp::SetZoneSetpoints {
            zones: zones.clone(),
            heat: args.heat,
            cool: args.cool,
            temporary: Some(args.temp.unwrap_or(false)),
            hold: Some(args.hold.unwrap_or(false)),
            out: Some(args.out.unwrap_or(false)),
        })
        .await
        .map_err(map_service_error)?;

    let zone_list = zones
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let (status, meta) = state.cache.get();
    let mut payload = snapshot_payload(&status, &meta, false);
    payload["message"] = Value::String(format!("Zones {zone_list} temperature updated"));
    Ok(Json(payload))
}

async fn set_zone_hold(
    State(state): State<Arc<AppState>>,
    Path(zone_id): Path<u8>,
    Json(args): Json<ZoneHoldArgs>,
) -> Result<Json<Value>, ApiError> {
    validate_zone(&state.settings, zone_id)?;

    state
        .service
        .execute_command(CommandOp::SetZoneSetpoints {
            zones: vec![zone_id],
            heat: None,
            cool: None,
            temporary: args.temp,
            hold: args.hold,
            out: None,
        })
        .await
        .map_err(map_service_error)?;

    let (status, meta) = state.cache.get();
    let mut payload = snapshot_payload(&status, &meta, false);
    payload["message"] = Value::String(format!("Zone {zone_id} hold settings updated"));
    Ok(Json(payload))
}

async fn get_live_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let (status, meta) = state.service.get_status(true, false).await;
    if !meta.connected {
        if let Some(error) = meta.error {
            return Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "unavailable",
                format!("Could not communicate with HVAC controller: {error}"),
            ));
        }
    }
    Ok(Json(json!({
        "status": status.to_payload(false),
        "source": "live",
        "timestamp": now_epoch(),
    })))
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    if !state.settings.enable_cache {
        return Err(not_found("Cache is not enabled"));
    }
    let stats = state.cache.stats();
    Ok(Json(serde_json::to_value(stats).unwrap_or(Value::Null)))
}

async fn cache_clear(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    if !state.settings.enable_cache {
        return Err(not_found("Cache is not enabled"));
    }
    state.cache.clear();
    Ok(Json(json!({"message": "Cache cleared successfully"})))
}

async fn events(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if !state.settings.enable_sse {
        return Err(not_found("SSE is not enabled"));
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .map(String::from);

    let subscriber = state
        .sse
        .subscribe(&addr.ip().to_string(), user_agent, last_event_id)
        .map_err(|e| {
            warn!(error = %e, "SSE subscription rejected");
            let SseError::ResourceExhausted(message) = e;
            ApiError::new(StatusCode::TOO_MANY_REQUESTS, "resource_exhausted", message)
        })?;

    let stream = state.sse.stream(subscriber, state.cache.clone());
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    Ok(response)
}

async fn sse_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    if !state.settings.enable_sse {
        return Err(not_found("SSE is not enabled"));
    }
    Ok(Json(state.sse.stats()))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(health_payload(&state.settings, &state.cache, &state.service))
}
