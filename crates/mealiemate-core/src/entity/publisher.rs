//! Publishing entity state to the broker.
//!
//! [`Publisher`] is the narrow seam to the broker connection;
//! [`EntityPublisher`] layers the entity conventions (switch payloads, log
//! buffers, progress attributes) on top of it and is the only component
//! that writes entity state.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, SecondsFormat, Utc};
use serde_json::json;

use super::topics::{MAIN_SWITCH, Namespace};
use super::{EntityDescriptor, FieldSpec, FieldValue, SWITCH_OFF, SWITCH_ON, SensorStyle};

/// Upper bound on a log sensor's accumulated text. Oldest lines are
/// dropped first.
pub const MAX_LOG_CHARS: usize = 8_000;

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn retained(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }

    pub fn transient(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Broker-side publishing. Implementations must tolerate concurrent calls
/// from many plugin tasks.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<()>;
}

// Compile-time assertion: Publisher must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Publisher) {}
};

/// Entity-level publishing helpers over a shared [`Publisher`].
///
/// Cheap to clone; clones share the log buffers. Apart from
/// [`publish_discovery`](Self::publish_discovery), failures are logged and
/// swallowed so a broker hiccup never fails a plugin or the manager.
#[derive(Clone)]
pub struct EntityPublisher {
    inner: Arc<dyn Publisher>,
    namespace: Namespace,
    log_buffers: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl EntityPublisher {
    pub fn new(inner: Arc<dyn Publisher>, namespace: Namespace) -> Self {
        Self {
            inner,
            namespace,
            log_buffers: Arc::default(),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn send(&self, message: OutboundMessage) {
        let topic = message.topic.clone();
        if let Err(e) = self.inner.publish(message).await {
            tracing::warn!(topic = %topic, error = %e, "publish failed");
        }
    }

    /// Publish discovery configs and initial values, all retained.
    pub async fn publish_discovery(&self, entities: &[EntityDescriptor]) -> Result<()> {
        for entity in entities {
            let payload = serde_json::to_vec(&entity.discovery)
                .with_context(|| format!("failed to encode discovery for {}", entity.unique_id))?;
            self.inner
                .publish(OutboundMessage::retained(&entity.discovery_topic, payload))
                .await
                .with_context(|| format!("failed to publish discovery for {}", entity.unique_id))?;

            if let (Some(topic), Some(value)) = (&entity.state_topic, &entity.value) {
                self.inner
                    .publish(OutboundMessage::retained(topic, value.to_string()))
                    .await
                    .with_context(|| format!("failed to publish state for {}", entity.unique_id))?;
            }
        }
        Ok(())
    }

    /// Publish a plugin's main switch state.
    pub async fn set_enabled_state(&self, plugin_id: &str, enabled: bool) {
        let payload = if enabled { SWITCH_ON } else { SWITCH_OFF };
        self.send(OutboundMessage::retained(
            self.namespace.state_topic(plugin_id, MAIN_SWITCH),
            payload,
        ))
        .await;
    }

    /// Echo a configuration value on its state topic.
    pub async fn publish_value(&self, plugin_id: &str, field_id: &str, value: &FieldValue) {
        self.send(OutboundMessage::retained(
            self.namespace.state_topic(plugin_id, field_id),
            value.to_string(),
        ))
        .await;
    }

    /// Append a line to a log sensor and publish it: the state is the
    /// current timestamp, the `full_text` attribute the accumulated buffer.
    pub async fn log(&self, plugin_id: &str, sensor_id: &str, message: &str) {
        let full_text = {
            let mut buffers = self
                .log_buffers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let buffer = buffers
                .entry((plugin_id.to_owned(), sensor_id.to_owned()))
                .or_default();
            buffer.push_str(&format!("[{}] {message}\n", Local::now().format("%H:%M:%S")));
            trim_log(buffer);
            buffer.clone()
        };
        self.publish_log_state(plugin_id, sensor_id, &full_text).await;
    }

    async fn publish_log_state(&self, plugin_id: &str, sensor_id: &str, full_text: &str) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.send(OutboundMessage::retained(
            self.namespace.state_topic(plugin_id, sensor_id),
            now,
        ))
        .await;
        self.send(OutboundMessage::retained(
            self.namespace.attributes_topic(plugin_id, sensor_id),
            json!({ "full_text": full_text }).to_string(),
        ))
        .await;
    }

    /// Publish a progress percentage (clamped to 0..=100) and activity.
    pub async fn progress(&self, plugin_id: &str, sensor_id: &str, percent: u8, activity: &str) {
        let percent = percent.min(100);
        self.send(OutboundMessage::retained(
            self.namespace.state_topic(plugin_id, sensor_id),
            percent.to_string(),
        ))
        .await;
        self.send(OutboundMessage::retained(
            self.namespace.attributes_topic(plugin_id, sensor_id),
            json!({ "activity": activity }).to_string(),
        ))
        .await;
    }

    /// Return a sensor to its empty state. Idempotent; this is the one
    /// reset routine used at run start and by the scheduled sweep.
    pub async fn reset_sensor(&self, plugin_id: &str, sensor: &FieldSpec) {
        match sensor.sensor_style {
            Some(SensorStyle::Log) => {
                self.log_buffers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&(plugin_id.to_owned(), sensor.id.clone()));
                self.publish_log_state(plugin_id, &sensor.id, "").await;
            }
            Some(SensorStyle::Progress) => {
                self.progress(plugin_id, &sensor.id, 0, "Idle").await;
            }
            None => {
                self.send(OutboundMessage::retained(
                    self.namespace.state_topic(plugin_id, &sensor.id),
                    "",
                ))
                .await;
            }
        }
    }

    /// Service status binary sensor (`ON` while running; the broker's last
    /// will publishes `OFF`).
    pub async fn set_service_status(&self, online: bool) {
        let payload = if online { SWITCH_ON } else { SWITCH_OFF };
        self.send(OutboundMessage::retained(self.namespace.status_topic(), payload))
            .await;
    }

    /// Publish raw image bytes to an image entity.
    pub async fn publish_image(&self, plugin_id: &str, field_id: &str, bytes: Vec<u8>) {
        self.send(OutboundMessage::retained(
            self.namespace.image_topic(plugin_id, field_id),
            bytes,
        ))
        .await;
    }
}

impl std::fmt::Debug for EntityPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityPublisher")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Drop whole leading lines until the buffer fits.
fn trim_log(buffer: &mut String) {
    while buffer.len() > MAX_LOG_CHARS {
        match buffer.find('\n') {
            Some(idx) if idx + 1 < buffer.len() => {
                buffer.drain(..=idx);
            }
            _ => break,
        }
    }
}
