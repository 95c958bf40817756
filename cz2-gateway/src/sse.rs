//! Server-sent-event distribution.
//!
//! Subscribers are admitted against global and per-IP caps and each own a
//! bounded queue. Broadcasts enqueue without ever blocking the writer: a
//! full queue drops the event for that subscriber, a closed one gets the
//! subscriber deregistered. Each live connection runs a pump task that
//! merges the subscriber's direct queue with a cache subscription and
//! terminates as soon as the peer goes away or a shutdown marker arrives.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{now_epoch, snapshot_payload, StateCache};

/// Capacity of each subscriber's outbound queue.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 50;
/// Capacity of the per-connection SSE body channel.
const STREAM_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    State,
    Delta,
    Ping,
    Error,
    CommandResult,
    Meta,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::State => "state",
            EventType::Delta => "delta",
            EventType::Ping => "ping",
            EventType::Error => "error",
            EventType::CommandResult => "result",
            EventType::Meta => "meta",
        }
    }
}

/// A formatted event sitting in a subscriber queue. `None` in the queue is
/// the shutdown marker.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event: &'static str,
    pub id: String,
    pub data: String,
}

struct Subscriber {
    ip_address: String,
    user_agent: String,
    connected_at: u64,
    last_ping: u64,
    update_count: u64,
    error_count: u64,
    last_event_id: Option<String>,
    tx: mpsc::Sender<Option<Envelope>>,
}

/// Returned by [`SseManager::subscribe`]; feeds one SSE connection.
#[derive(Debug)]
pub struct SubscriberHandle {
    pub id: String,
    rx: mpsc::Receiver<Option<Envelope>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SseError {
    #[error("{0}")]
    ResourceExhausted(String),
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<String, Subscriber>,
    by_ip: HashMap<String, HashSet<String>>,
    total_connections: u64,
    total_events_sent: u64,
    total_errors: u64,
}

pub struct SseManager {
    max_subscribers: usize,
    max_subscribers_per_ip: usize,
    heartbeat_interval: Duration,
    registry: Mutex<Registry>,
    event_id: AtomicU64,
    stop_tx: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl SseManager {
    pub fn new(
        max_subscribers: usize,
        max_subscribers_per_ip: usize,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(SseManager {
            max_subscribers,
            max_subscribers_per_ip,
            heartbeat_interval,
            registry: Mutex::new(Registry::default()),
            event_id: AtomicU64::new(0),
            stop_tx,
            heartbeat_task: Mutex::new(None),
        })
    }

    /// Start the heartbeat ping loop.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.heartbeat_task.lock();
        if task.is_some() {
            return;
        }
        let manager = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(manager.heartbeat_interval) => {
                        let now = now_epoch();
                        manager.broadcast(
                            EventType::Ping,
                            json!({"type": "ping", "timestamp": now}),
                            None,
                        );
                        manager.registry.lock().subscribers.values_mut().for_each(|sub| {
                            sub.last_ping = now;
                        });
                    }
                    _ = stop_rx.changed() => break,
                }
            }
        }));
        info!("SSE manager started");
    }

    /// Terminate every stream and clear the registry.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.heartbeat_task.lock().take() {
            task.abort();
        }
        let mut registry = self.registry.lock();
        for subscriber in registry.subscribers.values() {
            let _ = subscriber.tx.try_send(None);
        }
        registry.subscribers.clear();
        registry.by_ip.clear();
        info!("SSE manager stopped");
    }

    /// Admit a subscriber, enforcing global and per-IP caps.
    pub fn subscribe(
        &self,
        ip_address: &str,
        user_agent: &str,
        last_event_id: Option<String>,
    ) -> Result<SubscriberHandle, SseError> {
        let mut registry = self.registry.lock();

        if registry.subscribers.len() >= self.max_subscribers {
            return Err(SseError::ResourceExhausted(
                "maximum subscribers limit reached".to_string(),
            ));
        }
        let per_ip = registry
            .by_ip
            .get(ip_address)
            .map(HashSet::len)
            .unwrap_or(0);
        if per_ip >= self.max_subscribers_per_ip {
            return Err(SseError::ResourceExhausted(format!(
                "maximum subscribers per IP reached for {ip_address}"
            )));
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let now = now_epoch();
        registry.subscribers.insert(
            id.clone(),
            Subscriber {
                ip_address: ip_address.to_string(),
                user_agent: user_agent.to_string(),
                connected_at: now,
                last_ping: now,
                update_count: 0,
                error_count: 0,
                last_event_id,
                tx,
            },
        );
        registry
            .by_ip
            .entry(ip_address.to_string())
            .or_default()
            .insert(id.clone());
        registry.total_connections += 1;

        info!(
            subscriber = %id,
            ip = ip_address,
            total = registry.subscribers.len(),
            "new SSE subscriber"
        );
        Ok(SubscriberHandle { id, rx })
    }

    pub fn unsubscribe(&self, id: &str) {
        let mut registry = self.registry.lock();
        if let Some(subscriber) = registry.subscribers.remove(id) {
            if let Some(ids) = registry.by_ip.get_mut(&subscriber.ip_address) {
                ids.remove(id);
                if ids.is_empty() {
                    registry.by_ip.remove(&subscriber.ip_address);
                }
            }
            debug!(
                subscriber = %id,
                user_agent = %subscriber.user_agent,
                connected_for = now_epoch().saturating_sub(subscriber.connected_at),
                last_ping = subscriber.last_ping,
                last_event_id = ?subscriber.last_event_id,
                updates = subscriber.update_count,
                "subscriber session ended"
            );
            info!(
                subscriber = %id,
                remaining = registry.subscribers.len(),
                "SSE subscriber disconnected"
            );
        }
    }

    fn next_event_id(&self) -> String {
        (self.event_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Non-blocking fan-out of one event to every subscriber.
    pub fn broadcast(&self, event_type: EventType, data: Value, event_id: Option<String>) {
        let envelope = Envelope {
            event: event_type.as_str(),
            id: event_id.unwrap_or_else(|| self.next_event_id()),
            data: data.to_string(),
        };

        let mut registry = self.registry.lock();
        let mut dead = Vec::new();
        let mut sent = 0u64;
        for (id, subscriber) in registry.subscribers.iter_mut() {
            match subscriber.tx.try_send(Some(envelope.clone())) {
                Ok(()) => {
                    subscriber.update_count += 1;
                    sent += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %id, "queue full, dropping event");
                    subscriber.error_count += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    subscriber.error_count += 1;
                    dead.push(id.clone());
                }
            }
        }
        registry.total_events_sent += sent;
        for id in &dead {
            registry.total_errors += 1;
            if let Some(subscriber) = registry.subscribers.remove(id) {
                if let Some(ids) = registry.by_ip.get_mut(&subscriber.ip_address) {
                    ids.remove(id);
                    if ids.is_empty() {
                        registry.by_ip.remove(&subscriber.ip_address);
                    }
                }
            }
        }
    }

    /// Deliver one event to a single subscriber.
    pub fn send_to(&self, id: &str, event_type: EventType, data: Value) {
        let envelope = Envelope {
            event: event_type.as_str(),
            id: self.next_event_id(),
            data: data.to_string(),
        };
        let mut registry = self.registry.lock();
        if let Some(subscriber) = registry.subscribers.get_mut(id) {
            match subscriber.tx.try_send(Some(envelope)) {
                Ok(()) => {
                    subscriber.update_count += 1;
                    registry.total_events_sent += 1;
                }
                Err(_) => {
                    warn!(subscriber = %id, "failed to deliver direct event");
                    subscriber.error_count += 1;
                }
            }
        }
    }

    pub fn stats(&self) -> Value {
        let registry = self.registry.lock();
        json!({
            "total_connections": registry.total_connections,
            "current_connections": registry.subscribers.len(),
            "total_events_sent": registry.total_events_sent,
            "total_errors": registry.total_errors,
            "subscribers": registry.subscribers.len(),
            "unique_ips": registry.by_ip.len(),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }

    #[cfg(test)]
    fn error_count(&self, id: &str) -> u64 {
        self.registry
            .lock()
            .subscribers
            .get(id)
            .map(|sub| sub.error_count)
            .unwrap_or(0)
    }

    /// Build the SSE body for one connection: an initial `state` event,
    /// then whatever arrives on the direct queue or the cache subscription.
    /// The pump exits when the peer disconnects (body channel closes), the
    /// shutdown marker arrives, or the cache drops the subscription; either
    /// way the subscriber is deregistered and the cache queue released.
    pub fn stream(
        self: &Arc<Self>,
        mut subscriber: SubscriberHandle,
        cache: Arc<StateCache>,
    ) -> ReceiverStream<Result<Event, Infallible>> {
        let (out_tx, out_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let manager = self.clone();

        tokio::spawn(async move {
            let subscriber_id = subscriber.id.clone();
            let mut cache_sub = cache.subscribe();

            let (status, meta) = cache.get();
            let initial = Event::default()
                .event(EventType::State.as_str())
                .id(manager.next_event_id())
                .data(snapshot_payload(&status, &meta, false).to_string());
            if out_tx.send(Ok(initial)).await.is_err() {
                cache.unsubscribe(cache_sub.id);
                manager.unsubscribe(&subscriber_id);
                return;
            }

            loop {
                tokio::select! {
                    _ = out_tx.closed() => break,
                    queued = subscriber.rx.recv() => match queued {
                        Some(Some(envelope)) => {
                            let event = Event::default()
                                .event(envelope.event)
                                .id(envelope.id)
                                .data(envelope.data);
                            if out_tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        // Shutdown marker, or the manager dropped us.
                        Some(None) | None => break,
                    },
                    update = cache_sub.rx.recv() => match update {
                        Some(update) => {
                            let data = snapshot_payload(&update.status, &update.meta, false);
                            let event = Event::default()
                                .event(EventType::State.as_str())
                                .id(manager.next_event_id())
                                .data(data.to_string());
                            if out_tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }

            cache.unsubscribe(cache_sub.id);
            manager.unsubscribe(&subscriber_id);
            debug!(subscriber = %subscriber_id, "SSE stream closed");
        });

        ReceiverStream::new(out_rx)
    }
}
