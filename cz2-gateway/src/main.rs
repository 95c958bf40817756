//! Composition root: settings, components, HTTP server, shutdown.
//!
//! Components are constructed and wired here and handed to the router as
//! shared state; nothing in the system is a process-wide singleton.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cz2_core::CzClient;
use cz2_gateway::api::{router, AppState};
use cz2_gateway::cache::StateCache;
use cz2_gateway::config::Settings;
use cz2_gateway::health::Healthcheck;
use cz2_gateway::mqtt::MqttPublisher;
use cz2_gateway::service::HvacService;
use cz2_gateway::sse::SseManager;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    info!(
        endpoint = %settings.cz_connect,
        zones = settings.cz_zones,
        "starting cz2 gateway"
    );

    let db_path = settings.enable_cache.then(|| settings.cache_db_path());
    let cache = Arc::new(StateCache::new(db_path.as_deref(), settings.cache_stale_seconds));

    let healthcheck = settings
        .healthcheck_url
        .clone()
        .map(|url| Arc::new(Healthcheck::new(url, settings.cz_zones)));

    let client = CzClient::new(&settings.cz_connect, settings.cz_zones, settings.cz_id);
    let service = HvacService::new(
        client,
        cache.clone(),
        healthcheck,
        Duration::from_secs(settings.command_timeout_seconds),
        Duration::from_secs(settings.cache_refresh_interval),
    );
    service.start();

    let sse = SseManager::new(
        settings.sse_max_subscribers(),
        settings.sse_max_subscribers_per_ip,
        Duration::from_secs(settings.sse_heartbeat_interval),
    );
    if settings.enable_sse {
        sse.start();
    }

    let mqtt = settings.mqtt_enabled.then(|| {
        let publisher = MqttPublisher::new(&settings);
        tokio::spawn(publisher.clone().run(cache.subscribe()));
        info!("MQTT publisher started");
        publisher
    });

    let bind_addr = format!("{}:{}", settings.api_host, settings.api_port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let state = Arc::new(AppState {
        settings,
        cache,
        service: service.clone(),
        sse: sse.clone(),
    });

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    service.stop().await;
    sse.stop();
    if let Some(mqtt) = mqtt {
        mqtt.disconnect().await;
    }
    info!("shutdown complete");
    Ok(())
}
