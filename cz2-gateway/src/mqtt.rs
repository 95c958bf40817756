//! MQTT publisher: the flat snapshot, retained at QoS 1.
//!
//! The broker connection is lazy. A publish failure drops the client so
//! the next publish reconnects, rather than keeping a broken session
//! around.

use std::sync::Arc;

use rumqttc::{AsyncClient, MqttOptions, QoS};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use cz2_core::model::SystemStatus;

use crate::cache::{now_epoch, CacheSubscription, Source};
use crate::config::Settings;

const EVENT_CHANNEL_CAPACITY: usize = 10;

pub struct MqttPublisher {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    status_topic: String,
    client: Mutex<Option<AsyncClient>>,
}

impl MqttPublisher {
    pub fn new(settings: &Settings) -> Arc<Self> {
        Arc::new(MqttPublisher {
            host: settings.mqtt_host.clone(),
            port: settings.mqtt_port,
            username: settings.mqtt_user.clone(),
            password: settings.mqtt_password.clone(),
            status_topic: format!("{}/status", settings.mqtt_topic_prefix),
            client: Mutex::new(None),
        })
    }

    fn connect(&self) -> AsyncClient {
        let mut options = MqttOptions::new("cz2-gateway", &self.host, self.port);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        let (client, mut event_loop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);

        // The event loop must be driven for the client to make progress;
        // it ends when the connection breaks or the client is dropped.
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => debug!(?event, "mqtt event"),
                    Err(e) => {
                        warn!(error = %e, "mqtt event loop ended");
                        break;
                    }
                }
            }
        });

        info!(host = %self.host, port = self.port, "connected to MQTT broker");
        client
    }

    /// Publish one retained status message. Failures are absorbed; the
    /// next call starts from a fresh connection.
    pub async fn publish_status(&self, status: &SystemStatus) {
        let payload = status.to_flat_payload(false, now_epoch()).to_string();

        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect());
        }
        let Some(client) = guard.as_ref() else { return };

        match client
            .publish(&self.status_topic, QoS::AtLeastOnce, true, payload)
            .await
        {
            Ok(()) => {
                info!(topic = %self.status_topic, "published status to MQTT");
            }
            Err(e) => {
                error!(error = %e, "failed to publish to MQTT");
                *guard = None;
            }
        }
    }

    /// Drain a cache subscription, republishing every successful
    /// refresh/command snapshot until the cache shuts down.
    pub async fn run(self: Arc<Self>, mut subscription: CacheSubscription) {
        while let Some(update) = subscription.rx.recv().await {
            if !update.has_data {
                continue;
            }
            match update.meta.source {
                Source::Auto | Source::AutoRefresh | Source::Force | Source::Command => {
                    self.publish_status(&update.status).await;
                }
                _ => {}
            }
        }
        info!("MQTT publisher loop exited");
    }

    pub async fn disconnect(&self) {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.take() {
            let _ = client.disconnect().await;
            info!("disconnected from MQTT broker");
        }
    }
}
