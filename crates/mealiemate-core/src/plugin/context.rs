//! Execution context handed to [`super::Plugin::run`].

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::PluginDescriptor;
use crate::config::PluginConfig;
use crate::entity::FieldValue;
use crate::entity::publisher::EntityPublisher;
use crate::services::Services;

/// Returned by [`PluginContext::checkpoint`] once cancellation has been
/// requested. Propagating it with `?` ends the run as cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("execution cancelled")]
pub struct Cancelled;

/// Severity of a feedback line. Every level except `Info` prefixes the
/// line with a marker so the hub view can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    /// A choice the language model made.
    Decision,
}

impl LogLevel {
    pub fn marker(self) -> &'static str {
        match self {
            Self::Info => "",
            Self::Success => "\u{2705} ",
            Self::Warning => "\u{26a0}\u{fe0f} ",
            Self::Error => "\u{274c} ",
            Self::Decision => "\u{1f916} ",
        }
    }

    /// `message` with this level's marker in front.
    pub fn render(self, message: &str) -> String {
        format!("{}{message}", self.marker())
    }
}

/// Everything one execution may touch: its configuration, its
/// cancellation token, its button inbox, its own entities and the injected
/// services.
pub struct PluginContext {
    plugin_id: String,
    execution_id: Uuid,
    snapshot: PluginConfig,
    live: Arc<RwLock<PluginConfig>>,
    live_fields: HashSet<String>,
    cancel: CancellationToken,
    buttons: mpsc::Receiver<String>,
    publisher: EntityPublisher,
    services: Services,
    feedback_sensor: Option<String>,
    progress_sensor: Option<String>,
}

pub(crate) struct ContextParts {
    pub execution_id: Uuid,
    pub snapshot: PluginConfig,
    pub live: Arc<RwLock<PluginConfig>>,
    pub cancel: CancellationToken,
    pub buttons: mpsc::Receiver<String>,
    pub publisher: EntityPublisher,
    pub services: Services,
}

impl PluginContext {
    pub(crate) fn new(descriptor: &PluginDescriptor, parts: ContextParts) -> Self {
        Self {
            plugin_id: descriptor.id.clone(),
            execution_id: parts.execution_id,
            snapshot: parts.snapshot,
            live: parts.live,
            live_fields: descriptor.live_fields().map(|f| f.id.clone()).collect(),
            cancel: parts.cancel,
            buttons: parts.buttons,
            publisher: parts.publisher,
            services: parts.services,
            feedback_sensor: descriptor.feedback_sensor().map(|f| f.id.clone()),
            progress_sensor: descriptor.progress_sensor().map(|f| f.id.clone()),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Configuration as it was when this execution started.
    pub fn config(&self) -> &PluginConfig {
        &self.snapshot
    }

    /// Current value of a field: the live record for fields declared live,
    /// the start snapshot for everything else.
    pub fn current(&self, field_id: &str) -> Option<FieldValue> {
        if self.live_fields.contains(field_id) {
            let live = self.live.read().unwrap_or_else(PoisonError::into_inner);
            live.get(field_id).cloned()
        } else {
            self.snapshot.get(field_id).cloned()
        }
    }

    /// Switch field through [`current`](Self::current); `false` when unset.
    pub fn flag(&self, field_id: &str) -> bool {
        self.current(field_id)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn number(&self, field_id: &str) -> Option<f64> {
        self.current(field_id).and_then(|v| v.as_f64())
    }

    pub fn text(&self, field_id: &str) -> Option<String> {
        match self.current(field_id) {
            Some(FieldValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe stopping point: `Err(Cancelled)` once a stop was requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once a stop was requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Next button press addressed to this execution. `None` once
    /// cancellation was requested.
    pub async fn next_button(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            button = self.buttons.recv() => button,
        }
    }

    // -----------------------------------------------------------------------
    // Feedback
    // -----------------------------------------------------------------------

    /// Append a line to the plugin's feedback sensor.
    pub async fn log(&self, message: &str) {
        self.log_at(LogLevel::Info, message).await;
    }

    pub async fn success(&self, message: &str) {
        self.log_at(LogLevel::Success, message).await;
    }

    pub async fn warning(&self, message: &str) {
        self.log_at(LogLevel::Warning, message).await;
    }

    pub async fn error(&self, message: &str) {
        self.log_at(LogLevel::Error, message).await;
    }

    pub async fn decision(&self, message: &str) {
        self.log_at(LogLevel::Decision, message).await;
    }

    /// Append a line at `level` to the feedback sensor. Warnings and errors
    /// are also traced at their own level.
    pub async fn log_at(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Warning => tracing::warn!(plugin_id = %self.plugin_id, "{message}"),
            LogLevel::Error => tracing::error!(plugin_id = %self.plugin_id, "{message}"),
            _ => tracing::info!(plugin_id = %self.plugin_id, "{message}"),
        }
        if let Some(sensor) = &self.feedback_sensor {
            self.publisher
                .log(&self.plugin_id, sensor, &level.render(message))
                .await;
        }
    }

    /// Append a line to a specific log sensor.
    pub async fn log_to(&self, sensor_id: &str, message: &str) {
        self.publisher.log(&self.plugin_id, sensor_id, message).await;
    }

    /// Report progress on the plugin's progress sensor, if it has one.
    pub async fn progress(&self, percent: u8, activity: &str) {
        tracing::debug!(plugin_id = %self.plugin_id, percent, activity, "progress");
        if let Some(sensor) = &self.progress_sensor {
            self.publisher
                .progress(&self.plugin_id, sensor, percent, activity)
                .await;
        }
    }

    pub async fn publish_image(&self, field_id: &str, bytes: Vec<u8>) {
        self.publisher
            .publish_image(&self.plugin_id, field_id, bytes)
            .await;
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("execution_id", &self.execution_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_lines_carry_no_marker() {
        assert_eq!(LogLevel::Info.render("Fetched 3 recipes"), "Fetched 3 recipes");
        assert_eq!(LogLevel::Warning.render("No recipes found."), "\u{26a0}\u{fe0f} No recipes found.");
        assert!(LogLevel::Success.render("done").ends_with(" done"));
        assert_ne!(LogLevel::Error.marker(), LogLevel::Decision.marker());
    }
}
