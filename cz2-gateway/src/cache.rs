//! Versioned state cache with durable snapshot and subscriber fan-out.
//!
//! One writer lock covers every mutation plus its persist and fan-out, so
//! the version counter is strictly increasing and each bump reaches
//! subscribers exactly once and in order. Readers take a separate read
//! lock. Fan-out never blocks: a full subscriber queue drops that update
//! for that subscriber only.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cz2_core::model::SystemStatus;

/// Capacity of each subscriber queue.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 10;

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Where a cache write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Init,
    Loaded,
    Auto,
    AutoRefresh,
    Force,
    Command,
    Error,
    Connect,
    Disconnect,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Init => "init",
            Source::Loaded => "loaded",
            Source::Auto => "auto",
            Source::AutoRefresh => "auto_refresh",
            Source::Force => "force",
            Source::Command => "command",
            Source::Error => "error",
            Source::Connect => "connect",
            Source::Disconnect => "disconnect",
        }
    }
}

/// Metadata describing the cached snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub connected: bool,
    pub last_update_ts: u64,
    pub stale_after_sec: u64,
    pub source: Source,
    pub version: u64,
    pub error: Option<String>,
}

impl CacheMeta {
    fn new(stale_after_sec: u64) -> Self {
        CacheMeta {
            connected: false,
            last_update_ts: 0,
            stale_after_sec,
            source: Source::Init,
            version: 0,
            error: None,
        }
    }

    pub fn is_stale_at(&self, now: u64) -> bool {
        if self.last_update_ts == 0 || !self.connected {
            return true;
        }
        now.saturating_sub(self.last_update_ts) > self.stale_after_sec
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(now_epoch())
    }

    /// JSON shape handed to HTTP and SSE clients; adds the derived
    /// staleness flag.
    pub fn payload(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert("is_stale".to_string(), Value::Bool(self.is_stale()));
        }
        value
    }
}

/// One fan-out message: the (possibly placeholder) snapshot plus metadata.
#[derive(Debug, Clone)]
pub struct CacheUpdate {
    pub status: SystemStatus,
    pub has_data: bool,
    pub meta: CacheMeta,
}

pub struct CacheSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<CacheUpdate>,
}

struct CacheSubscriber {
    id: u64,
    tx: mpsc::Sender<CacheUpdate>,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub has_data: bool,
    pub version: u64,
    pub connected: bool,
    pub is_stale: bool,
    pub last_update_ts: u64,
    pub age_seconds: Option<u64>,
    pub source: Source,
    pub subscriber_count: usize,
    pub error: Option<String>,
}

struct CacheInner {
    status: Option<SystemStatus>,
    meta: CacheMeta,
}

pub struct StateCache {
    stale_after_sec: u64,
    inner: RwLock<CacheInner>,
    store: Option<Mutex<Connection>>,
    subscribers: Mutex<Vec<CacheSubscriber>>,
    next_subscriber_id: AtomicU64,
}

impl StateCache {
    /// Open the cache, loading any persisted snapshot. A `None` path keeps
    /// the cache purely in memory.
    pub fn new(db_path: Option<&Path>, stale_after_sec: u64) -> Self {
        let store = db_path.and_then(|path| match open_store(path) {
            Ok(conn) => Some(Mutex::new(conn)),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to open cache database");
                None
            }
        });

        let cache = StateCache {
            stale_after_sec,
            inner: RwLock::new(CacheInner {
                status: None,
                meta: CacheMeta::new(stale_after_sec),
            }),
            store,
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
        };
        cache.load();
        cache
    }

    fn load(&self) {
        let Some(store) = &self.store else { return };
        let row: Option<(Option<String>, Option<String>)> = {
            let conn = store.lock();
            conn.query_row(
                "SELECT status_json, meta_json FROM cache_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok()
        };
        let Some((status_json, meta_json)) = row else {
            debug!("no persisted cache state");
            return;
        };

        let mut inner = self.inner.write();
        if let Some(raw) = status_json {
            match serde_json::from_str::<SystemStatus>(&raw) {
                Ok(status) => {
                    inner.status = Some(status);
                    info!("loaded cached status from database");
                }
                Err(e) => {
                    warn!(error = %e, "invalid persisted status, starting fresh");
                    inner.status = None;
                }
            }
        }
        if let Some(raw) = meta_json {
            match serde_json::from_str::<CacheMeta>(&raw) {
                Ok(mut meta) => {
                    meta.source = Source::Loaded;
                    meta.stale_after_sec = self.stale_after_sec;
                    info!(version = meta.version, "loaded cache metadata");
                    inner.meta = meta;
                }
                Err(e) => {
                    warn!(error = %e, "invalid persisted metadata, starting fresh");
                    inner.status = None;
                    inner.meta = CacheMeta::new(self.stale_after_sec);
                }
            }
        }
    }

    /// Current snapshot and metadata; substitutes the empty placeholder
    /// when nothing has been decoded yet.
    pub fn get(&self) -> (SystemStatus, CacheMeta) {
        let inner = self.inner.read();
        (
            inner.status.clone().unwrap_or_else(SystemStatus::empty),
            inner.meta.clone(),
        )
    }

    /// Apply a new snapshot (or record a failure) and notify subscribers.
    pub fn update(&self, status: Option<SystemStatus>, source: Source, error: Option<String>) {
        let mut inner = self.inner.write();
        inner.meta.version += 1;
        match status {
            Some(status) => {
                inner.status = Some(status);
                inner.meta.connected = true;
                inner.meta.error = None;
                // Only real data refreshes the staleness clock.
                inner.meta.last_update_ts = now_epoch();
            }
            None => {
                inner.meta.connected = false;
                inner.meta.error = error;
            }
        }
        inner.meta.source = source;

        self.persist(&inner);
        self.fan_out(&inner);
        info!(
            version = inner.meta.version,
            source = source.as_str(),
            connected = inner.meta.connected,
            "cache updated"
        );
    }

    /// Flip the connection flag without touching the staleness clock, so
    /// stale-detection keeps firing until real data arrives.
    pub fn set_connection_status(&self, connected: bool, source: Source, error: Option<String>) {
        let mut inner = self.inner.write();
        inner.meta.version += 1;
        inner.meta.connected = connected;
        inner.meta.source = source;
        inner.meta.error = error;

        self.persist(&inner);
        self.fan_out(&inner);
        info!(connected, source = source.as_str(), "connection status updated");
    }

    /// Drop the snapshot and reset metadata. The version counter survives
    /// so observers never see it move backwards.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        let version = inner.meta.version + 1;
        inner.status = None;
        inner.meta = CacheMeta {
            version,
            ..CacheMeta::new(self.stale_after_sec)
        };

        self.persist(&inner);
        self.fan_out(&inner);
        info!(version, "cache cleared");
    }

    /// Register a subscriber queue; the current snapshot is enqueued
    /// immediately.
    pub fn subscribe(&self) -> CacheSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        let initial = {
            let inner = self.inner.read();
            CacheUpdate {
                status: inner.status.clone().unwrap_or_else(SystemStatus::empty),
                has_data: inner.status.is_some(),
                meta: inner.meta.clone(),
            }
        };
        if tx.try_send(initial).is_err() {
            warn!("subscriber queue full, skipping initial state");
        }

        self.subscribers.lock().push(CacheSubscriber { id, tx });
        CacheSubscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|sub| sub.id != id);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        let now = now_epoch();
        CacheStats {
            has_data: inner.status.is_some(),
            version: inner.meta.version,
            connected: inner.meta.connected,
            is_stale: inner.meta.is_stale_at(now),
            last_update_ts: inner.meta.last_update_ts,
            age_seconds: (inner.meta.last_update_ts > 0)
                .then(|| now.saturating_sub(inner.meta.last_update_ts)),
            source: inner.meta.source,
            subscriber_count: self.subscribers.lock().len(),
            error: inner.meta.error.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Best-effort durable write; never fails the update.
    fn persist(&self, inner: &CacheInner) {
        let Some(store) = &self.store else { return };
        let status_json = inner
            .status
            .as_ref()
            .and_then(|status| serde_json::to_string(status).ok());
        let meta_json = match serde_json::to_string(&inner.meta) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize cache metadata");
                return;
            }
        };

        let conn = store.lock();
        let outcome = conn.execute(
            "INSERT OR REPLACE INTO cache_state (id, status_json, meta_json, updated_at)
             VALUES (1, ?1, ?2, ?3)",
            rusqlite::params![status_json, meta_json, now_epoch() as f64],
        );
        if let Err(e) = outcome {
            error!(error = %e, "failed to persist cache state");
        }
    }

    /// Non-blocking enqueue to every subscriber; slow consumers lose this
    /// update, dead ones are removed.
    fn fan_out(&self, inner: &CacheInner) {
        let update = CacheUpdate {
            status: inner.status.clone().unwrap_or_else(SystemStatus::empty),
            has_data: inner.status.is_some(),
            meta: inner.meta.clone(),
        };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| match sub.tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = sub.id, "subscriber queue full, dropping update");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = sub.id, "removing closed subscriber");
                false
            }
        });
    }

    #[cfg(test)]
    fn set_last_update_ts(&self, ts: u64, connected: bool) {
        let mut inner = self.inner.write();
        inner.meta.last_update_ts = ts;
        inner.meta.connected = connected;
    }
}

fn open_store(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         CREATE TABLE IF NOT EXISTS cache_state (
             id INTEGER PRIMARY KEY CHECK (id = 1),
             status_json TEXT,
             meta_json TEXT,
             updated_at REAL
         );",
    )?;
    info!(path = %path.display(), "cache database ready");
    Ok(conn)
}

/// JSON body shared by HTTP responses and SSE state events.
pub fn snapshot_payload(status: &SystemStatus, meta: &CacheMeta, include_raw: bool) -> Value {
    json!({
        "status": status.to_payload(include_raw),
        "meta": meta.payload(),
    })
}
