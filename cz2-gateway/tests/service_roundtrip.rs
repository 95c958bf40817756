//! End-to-end service tests against the mock panel: commands flow through
//! the bus lock, the cache, and back out.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockPanel, SilentPanel, UnreachablePanel};
use cz2_core::client::Connector;
use cz2_core::model::{FanMode, SystemMode, SystemStatus};
use cz2_core::CzClient;
use cz2_gateway::cache::{Source, StateCache};
use cz2_gateway::service::{CommandOp, HvacService, ServiceError};

fn make_service(
    connector: Box<dyn Connector>,
    cache: Arc<StateCache>,
    command_timeout: Duration,
) -> Arc<HvacService> {
    let client = CzClient::with_connector(connector, 4, 99);
    HvacService::new(
        client,
        cache,
        None,
        command_timeout,
        Duration::from_secs(300),
    )
}

#[tokio::test]
async fn set_fan_mode_round_trip() {
    let cache = Arc::new(StateCache::new(None, 60));
    let service = make_service(
        Box::new(MockPanel::new()),
        cache.clone(),
        Duration::from_secs(30),
    );

    let version_before = cache.get().1.version;
    let status = service
        .execute_command(CommandOp::SetFanMode { fan: FanMode::On })
        .await
        .expect("command should succeed");
    assert_eq!(status.fan_mode, FanMode::On);

    let (cached, meta) = cache.get();
    assert_eq!(meta.version, version_before + 1);
    assert_eq!(meta.source, Source::Command);
    assert_eq!(cached.fan_mode, FanMode::On);
    assert!(meta.connected);
    assert!(!meta.is_stale());
}

#[tokio::test]
async fn set_system_mode_round_trip() {
    let cache = Arc::new(StateCache::new(None, 60));
    let service = make_service(
        Box::new(MockPanel::new()),
        cache.clone(),
        Duration::from_secs(30),
    );

    let status = service
        .execute_command(CommandOp::SetSystemMode {
            mode: Some(SystemMode::Heat),
            all_zones: None,
        })
        .await
        .expect("command should succeed");
    assert_eq!(status.system_mode, SystemMode::Heat);
    assert_eq!(cache.get().0.system_mode, SystemMode::Heat);
}

#[tokio::test]
async fn zone_setpoints_round_trip() {
    let cache = Arc::new(StateCache::new(None, 60));
    let panel = MockPanel::new();
    let service = make_service(Box::new(panel), cache.clone(), Duration::from_secs(30));

    let status = service
        .execute_command(CommandOp::SetZoneSetpoints {
            zones: vec![1, 2],
            heat: Some(70),
            cool: Some(76),
            temporary: Some(true),
            hold: None,
            out: None,
        })
        .await
        .expect("command should succeed");

    assert_eq!(status.zones[0].heat_setpoint, 70);
    assert_eq!(status.zones[0].cool_setpoint, 76);
    assert!(status.zones[0].temporary);
    assert_eq!(status.zones[1].heat_setpoint, 70);
    // Zone 3 untouched.
    assert_eq!(status.zones[2].heat_setpoint, 68);
    assert_eq!(status.zones[2].cool_setpoint, 74);
}

#[tokio::test]
async fn forced_refresh_then_cached_read() {
    let cache = Arc::new(StateCache::new(None, 60));
    let service = make_service(
        Box::new(MockPanel::new()),
        cache.clone(),
        Duration::from_secs(30),
    );

    let (status, meta) = service.get_status(true, false).await;
    assert_eq!(meta.source, Source::Force);
    assert_eq!(status.outside_temp, 65);
    let version = meta.version;

    // Within staleness the cached snapshot answers; no version movement.
    let (_, meta) = service.get_status(false, false).await;
    assert_eq!(meta.version, version);
    assert_eq!(meta.source, Source::Force);
}

#[tokio::test]
async fn raw_request_refetches_when_blob_missing() {
    let cache = Arc::new(StateCache::new(None, 60));
    let service = make_service(
        Box::new(MockPanel::new()),
        cache.clone(),
        Duration::from_secs(30),
    );

    let (status, meta) = service.get_status(true, false).await;
    assert!(status.raw.is_none());
    let version = meta.version;

    // The cached snapshot has no raw blob, so this goes back to the bus.
    let (status, meta) = service.get_status(false, true).await;
    assert!(status.raw.is_some());
    assert!(meta.version > version);
    assert_eq!(meta.source, Source::Auto);

    // And now the blob is cached too.
    let version = meta.version;
    let (status, meta) = service.get_status(false, true).await;
    assert!(status.raw.is_some());
    assert_eq!(meta.version, version);
}

#[tokio::test]
async fn refresh_failure_preserves_last_good_snapshot() {
    let cache = Arc::new(StateCache::new(None, 60));
    let mut seeded = SystemStatus::empty();
    seeded.outside_temp = 65;
    cache.update(Some(seeded), Source::Auto, None);

    let service = make_service(
        Box::new(UnreachablePanel),
        cache.clone(),
        Duration::from_secs(30),
    );

    let (status, meta) = service.get_status(true, false).await;
    assert_eq!(status.outside_temp, 65);
    assert!(!meta.connected);
    assert_eq!(meta.source, Source::Error);
    assert!(meta.error.is_some());
    assert!(meta.is_stale());
    assert_eq!(service.consecutive_errors(), 1);
}

#[tokio::test]
async fn command_timeout_marks_cache_and_fails() {
    let cache = Arc::new(StateCache::new(None, 60));
    let service = make_service(
        Box::new(SilentPanel),
        cache.clone(),
        Duration::from_millis(200),
    );

    match service
        .execute_command(CommandOp::SetFanMode { fan: FanMode::On })
        .await
    {
        Err(ServiceError::DeadlineExceeded(message)) => {
            assert!(message.contains("timed out"));
        }
        other => panic!("expected deadline exceeded, got {other:?}"),
    }

    let (_, meta) = cache.get();
    assert!(!meta.connected);
    assert_eq!(meta.source, Source::Error);
    assert!(meta.error.is_some());
}

#[tokio::test]
async fn command_updates_reach_cache_subscribers() {
    let cache = Arc::new(StateCache::new(None, 60));
    let mut subscription = cache.subscribe();
    let service = make_service(
        Box::new(MockPanel::new()),
        cache.clone(),
        Duration::from_secs(30),
    );

    // Initial snapshot.
    let initial = subscription.rx.recv().await.unwrap();
    assert!(!initial.has_data);

    service
        .execute_command(CommandOp::SetFanMode { fan: FanMode::On })
        .await
        .expect("command should succeed");

    let update = subscription.rx.recv().await.unwrap();
    assert!(update.has_data);
    assert_eq!(update.meta.source, Source::Command);
    assert_eq!(update.status.fan_mode, FanMode::On);
}

#[tokio::test(start_paused = true)]
async fn refresh_loop_populates_cache() {
    let cache = Arc::new(StateCache::new(None, 60));
    let service = make_service(
        Box::new(MockPanel::new()),
        cache.clone(),
        Duration::from_secs(30),
    );
    service.start();

    // Warmup is five seconds; give the loop room to run one refresh.
    for _ in 0..100 {
        if cache.get().1.version > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let (status, meta) = cache.get();
    assert!(meta.version > 0);
    assert_eq!(meta.source, Source::AutoRefresh);
    assert_eq!(status.outside_temp, 65);

    service.stop().await;
}

#[tokio::test]
async fn stop_exits_promptly_during_warmup() {
    let cache = Arc::new(StateCache::new(None, 60));
    let service = make_service(
        Box::new(MockPanel::new()),
        cache.clone(),
        Duration::from_secs(30),
    );
    service.start();

    tokio::time::timeout(Duration::from_secs(2), service.stop())
        .await
        .expect("stop should return within the grace period");
}
