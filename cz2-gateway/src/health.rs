//! Health reporting: the `/health` payload and the optional outbound ping
//! to an external monitoring service.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::cache::{now_epoch, StateCache};
use crate::config::Settings;
use crate::service::HvacService;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire-and-forget ping to a monitoring endpoint. Failures are logged at
/// debug level only; monitoring must never degrade the gateway itself.
pub struct Healthcheck {
    url: String,
    zones: u8,
    client: reqwest::Client,
}

impl Healthcheck {
    pub fn new(url: String, zones: u8) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PING_TIMEOUT)
            .build()
            .unwrap_or_default();
        Healthcheck { url, zones, client }
    }

    pub async fn ping(&self) {
        let payload = json!({
            "hostname": whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string()),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "zones": self.zones,
        });
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %self.url, "healthcheck ping sent");
            }
            Ok(response) => {
                debug!(status = %response.status(), "healthcheck ping rejected");
            }
            Err(e) => {
                debug!(error = %e, "healthcheck ping failed");
            }
        }
    }
}

/// Build the `/health` payload: overall classification plus feature flags
/// and cache freshness.
///
/// Classification is three-valued: a stale or disconnected cache degrades
/// the service, and a refresh loop that was started but is no longer
/// running marks it unhealthy outright.
pub fn health_payload(
    settings: &Settings,
    cache: &StateCache,
    service: &HvacService,
) -> Value {
    let mut overall = "healthy";

    let mut payload = json!({
        "timestamp": now_epoch(),
        "features": {
            "cache_enabled": settings.enable_cache,
            "mqtt_enabled": settings.mqtt_enabled,
            "sse_enabled": settings.enable_sse,
        },
        "service": {
            "consecutive_errors": service.consecutive_errors(),
        },
    });

    let stats = cache.stats();
    if stats.is_stale || !stats.connected {
        overall = "degraded";
    }
    payload["cache"] = json!({
        "connected": stats.connected,
        "has_data": stats.has_data,
        "is_stale": stats.is_stale,
        "age_seconds": stats.age_seconds,
    });

    let refresh_loop = service.refresh_loop_running();
    payload["background"] = json!({
        "refresh_loop": match refresh_loop {
            None => "not_started",
            Some(true) => "running",
            Some(false) => "stopped",
        },
    });
    if refresh_loop == Some(false) {
        overall = "unhealthy";
    }

    payload["status"] = Value::String(overall.to_string());
    payload
}
