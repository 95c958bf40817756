//! HVAC service: serialized bus access with a cached view.
//!
//! Every operation follows the same connect-execute-disconnect cycle under
//! one bus lock, then writes its outcome to the cache after the lock is
//! released. A background loop keeps the cache warm; repeated failures back
//! off exponentially.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cz2_core::error::CzError;
use cz2_core::model::{FanMode, SystemMode, SystemStatus};
use cz2_core::CzClient;

use crate::cache::{CacheMeta, Source, StateCache};
use crate::health::Healthcheck;

/// Delay before the first background refresh, letting startup settle.
const REFRESH_WARMUP: Duration = Duration::from_secs(5);
/// Ceiling for the error backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// How long `stop` waits for the refresh loop to wind down.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Transport failed and the retry budget is spent.
    #[error("HVAC controller unavailable: {0}")]
    Unavailable(String),

    /// The controller answered, but not the way the protocol promises.
    #[error("HVAC protocol violation: {0}")]
    FailedPrecondition(String),

    /// The operation exceeded its deadline.
    #[error("{0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CzError> for ServiceError {
    fn from(e: CzError) -> Self {
        match e {
            CzError::Unreachable(_) | CzError::Transport(_) | CzError::ConnectionAborted(_) => {
                ServiceError::Unavailable(e.to_string())
            }
            CzError::Protocol(_) => ServiceError::FailedPrecondition(e.to_string()),
            CzError::Timeout(_) => ServiceError::DeadlineExceeded(e.to_string()),
            CzError::InvalidArgument(_) => ServiceError::Internal(e.to_string()),
        }
    }
}

/// A write operation dispatched through [`HvacService::execute_command`].
#[derive(Debug, Clone)]
pub enum CommandOp {
    SetSystemMode {
        mode: Option<SystemMode>,
        all_zones: Option<bool>,
    },
    SetFanMode {
        fan: FanMode,
    },
    SetZoneSetpoints {
        zones: Vec<u8>,
        heat: Option<u8>,
        cool: Option<u8>,
        temporary: Option<bool>,
        hold: Option<bool>,
        out: Option<bool>,
    },
}

impl CommandOp {
    fn name(&self) -> &'static str {
        match self {
            CommandOp::SetSystemMode { .. } => "set_system_mode",
            CommandOp::SetFanMode { .. } => "set_fan_mode",
            CommandOp::SetZoneSetpoints { .. } => "set_zone_setpoints",
        }
    }
}

pub struct HvacService {
    /// The bus lock: every wire exchange happens under this mutex.
    client: Mutex<CzClient>,
    cache: Arc<StateCache>,
    healthcheck: Option<Arc<Healthcheck>>,
    command_timeout: Duration,
    refresh_interval: Duration,
    consecutive_errors: AtomicU32,
    stop_tx: watch::Sender<bool>,
    refresh_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HvacService {
    pub fn new(
        client: CzClient,
        cache: Arc<StateCache>,
        healthcheck: Option<Arc<Healthcheck>>,
        command_timeout: Duration,
        refresh_interval: Duration,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(HvacService {
            client: Mutex::new(client),
            cache,
            healthcheck,
            command_timeout,
            refresh_interval,
            consecutive_errors: AtomicU32::new(0),
            stop_tx,
            refresh_task: parking_lot::Mutex::new(None),
        })
    }

    /// Spawn the background refresh loop.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.refresh_task.lock();
        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        info!(interval = ?self.refresh_interval, "starting background refresh loop");
        let service = self.clone();
        let stop_rx = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(service.refresh_loop(stop_rx)));
    }

    /// Signal the refresh loop and wait briefly for it to exit. An
    /// in-flight command keeps the bus lock and is allowed to finish.
    /// The finished handle is kept so health reporting can see that the
    /// loop is no longer running.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.refresh_task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!("refresh loop did not stop within grace period");
            }
            *self.refresh_task.lock() = Some(task);
        }
        info!("HVAC service stopped");
    }

    /// Liveness of the background refresh loop: `None` before the first
    /// `start`, `Some(false)` once a started loop has exited.
    pub fn refresh_loop_running(&self) -> Option<bool> {
        self.refresh_task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    /// Cached status, refreshed when stale, forced, or missing a requested
    /// raw blob. Failures are absorbed into the cache's error metadata.
    pub async fn get_status(
        &self,
        force_refresh: bool,
        include_raw: bool,
    ) -> (SystemStatus, CacheMeta) {
        let (status, meta) = self.cache.get();
        if !force_refresh && !meta.is_stale() {
            if include_raw && status.raw.is_none() {
                debug!("cached status lacks raw blob, refreshing");
            } else {
                debug!(version = meta.version, "returning cached status");
                return (status, meta);
            }
        }

        let source = if force_refresh {
            Source::Force
        } else {
            Source::Auto
        };
        info!(force = force_refresh, raw = include_raw, "fetching fresh status");
        self.refresh_once(source, include_raw).await
    }

    /// One connect-read-disconnect cycle. The cache is updated either way
    /// and its post-update state returned.
    async fn refresh_once(&self, source: Source, include_raw: bool) -> (SystemStatus, CacheMeta) {
        let outcome = {
            let mut client = self.client.lock().await;
            let result = match client.connect().await {
                Ok(()) => client.get_status_data(include_raw).await,
                Err(e) => Err(e),
            };
            client.close().await;
            result
        };

        // Bus lock released before the cache is touched.
        match outcome {
            Ok(status) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                self.cache.update(Some(status), source, None);
                self.ping_healthcheck();
            }
            Err(e) => {
                let failures = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                error!(failures, error = %e, "refresh failed");
                self.cache.update(None, Source::Error, Some(e.to_string()));
            }
        }
        self.cache.get()
    }

    /// Execute a write command under the bus lock and a hard deadline, then
    /// read back the status and publish it with the `command` tag.
    pub async fn execute_command(&self, op: CommandOp) -> Result<SystemStatus, ServiceError> {
        info!(operation = op.name(), "executing command");

        let outcome = tokio::time::timeout(self.command_timeout, async {
            let mut client = self.client.lock().await;
            let result = match client.connect().await {
                Ok(()) => {
                    let run = match &op {
                        CommandOp::SetSystemMode { mode, all_zones } => {
                            client.set_system_mode(*mode, *all_zones).await
                        }
                        CommandOp::SetFanMode { fan } => client.set_fan_mode(*fan).await,
                        CommandOp::SetZoneSetpoints {
                            zones,
                            heat,
                            cool,
                            temporary,
                            hold,
                            out,
                        } => {
                            client
                                .set_zone_setpoints(zones, *heat, *cool, *temporary, *hold, *out)
                                .await
                        }
                    };
                    match run {
                        Ok(()) => client.get_status_data(false).await,
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };
            client.close().await;
            result
        })
        .await;

        match outcome {
            Err(_elapsed) => {
                let message = format!(
                    "HVAC operation timed out after {} seconds; the controller may be \
                     unresponsive or the bus contended",
                    self.command_timeout.as_secs()
                );
                error!(operation = op.name(), "{message}");
                // The timed-out future was dropped mid-exchange; make sure
                // the transport is not left half-open.
                {
                    let mut client = self.client.lock().await;
                    client.close().await;
                }
                self.cache
                    .update(None, Source::Error, Some(message.clone()));
                Err(ServiceError::DeadlineExceeded(message))
            }
            Ok(Err(e)) => {
                self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
                error!(operation = op.name(), error = %e, "command failed");
                self.cache.update(None, Source::Error, Some(e.to_string()));
                Err(e.into())
            }
            Ok(Ok(status)) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                self.cache.update(Some(status.clone()), Source::Command, None);
                self.ping_healthcheck();
                info!(operation = op.name(), "command completed");
                Ok(status)
            }
        }
    }

    async fn refresh_loop(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(REFRESH_WARMUP) => {}
            _ = stop_rx.changed() => return,
        }

        loop {
            tokio::select! {
                _ = self.refresh_once(Source::AutoRefresh, false) => {}
                _ = stop_rx.changed() => break,
            }

            let mut wait = self.refresh_interval;
            let failures = self.consecutive_errors();
            if failures > 0 {
                let backoff = Duration::from_secs(
                    2u64.saturating_pow(failures.min(16)).min(MAX_BACKOFF.as_secs()),
                );
                warn!(failures, backoff = ?backoff, "backing off after refresh failures");
                wait += backoff;
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop_rx.changed() => break,
            }
        }
        info!("background refresh loop exited");
    }

    fn ping_healthcheck(&self) {
        if let Some(healthcheck) = &self.healthcheck {
            let healthcheck = healthcheck.clone();
            tokio::spawn(async move {
                healthcheck.ping().await;
            });
        }
    }
}
