//! System coordinator.
//!
//! Publishes discovery at startup, applies routed messages from the single
//! intake stream in arrival order, and runs the housekeeping timers
//! (status heartbeat, day-boundary sensor sweep). Each duty is fallible on
//! its own; none of them can stop the loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::entity::publisher::EntityPublisher;
use crate::entity::schema;
use crate::manager::{ManagerConfig, PluginManager};
use crate::plugin::PluginRegistry;
use crate::router::{InboundMessage, Router, RouterAction, SystemCommand, UnroutableReason};
use crate::services::Services;

/// Coordinator timing.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interval of the service status heartbeat.
    pub heartbeat_interval: Duration,
    /// How often the day boundary is checked.
    pub sweep_check_interval: Duration,
    /// Grace period for running plugins on shutdown.
    pub shutdown_grace: Duration,
    pub manager: ManagerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3600),
            sweep_check_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            manager: ManagerConfig::default(),
        }
    }
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Plugins whose entities were all published.
    pub published: Vec<String>,
    /// Plugins that failed, with the cause.
    pub failed: Vec<(String, String)>,
}

/// Detects calendar day changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaySweep {
    last: NaiveDate,
}

impl DaySweep {
    pub fn new(today: NaiveDate) -> Self {
        Self { last: today }
    }

    /// `true` exactly once per new day.
    pub fn check(&mut self, today: NaiveDate) -> bool {
        if today != self.last {
            self.last = today;
            true
        } else {
            false
        }
    }
}

/// Source of the local calendar date for the day sweep.
pub type Today = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub struct Coordinator {
    registry: Arc<PluginRegistry>,
    router: Router,
    manager: PluginManager,
    publisher: EntityPublisher,
    config: CoordinatorConfig,
    today: Today,
}

impl Coordinator {
    pub fn new(
        registry: Arc<PluginRegistry>,
        publisher: EntityPublisher,
        services: Services,
        config: CoordinatorConfig,
    ) -> Self {
        let router = Router::new(Arc::clone(&registry), publisher.namespace().clone());
        let manager = PluginManager::new(
            Arc::clone(&registry),
            publisher.clone(),
            services,
            config.manager.clone(),
        );
        Self {
            registry,
            router,
            manager,
            publisher,
            config,
            today: Arc::new(|| Local::now().date_naive()),
        }
    }

    /// Replace the local date source of the day sweep.
    pub fn with_today(mut self, today: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.today = Arc::new(today);
        self
    }

    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Publish the system entities and every plugin's entities. A failing
    /// plugin is reported and skipped.
    pub async fn publish_discovery(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let ns = self.publisher.namespace();

        if let Err(e) = self
            .publisher
            .publish_discovery(&schema::system_entities(ns))
            .await
        {
            tracing::warn!(error = %format!("{e:#}"), "failed to publish system discovery");
        }

        for descriptor in self.registry.descriptors() {
            let result = match schema::build_entities(descriptor, ns) {
                Ok(entities) => self
                    .publisher
                    .publish_discovery(&entities)
                    .await
                    .map(|()| entities.len()),
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(count) => {
                    tracing::debug!(plugin_id = %descriptor.id, entities = count, "published discovery");
                    report.published.push(descriptor.id.clone());
                }
                Err(e) => {
                    let cause = format!("{e:#}");
                    tracing::warn!(plugin_id = %descriptor.id, error = %cause, "failed to publish discovery");
                    report.failed.push((descriptor.id.clone(), cause));
                }
            }
        }
        tracing::info!(
            published = report.published.len(),
            failed = report.failed.len(),
            "discovery published"
        );
        report
    }

    /// Reset every declared reset-sensor. Shared by the day sweep and the
    /// `reset_sensors` system command.
    pub async fn reset_scheduled_sensors(&self) {
        tracing::info!("resetting scheduled sensors");
        self.manager.reset_all_sensors().await;
    }

    /// Route one message and apply the resulting action.
    pub async fn handle(&self, message: &InboundMessage) -> RouterAction {
        let action = self.router.route(message);
        tracing::debug!(topic = %message.topic, retained = message.retained, ?action, "routed message");

        let applied = match &action {
            RouterAction::UpdateConfig {
                plugin_id,
                field_id,
                value,
            } => self
                .manager
                .update_config(plugin_id, field_id, value.clone())
                .await,
            RouterAction::SetEnabled { plugin_id, enabled } => self
                .manager
                .set_enabled(plugin_id, *enabled)
                .await
                .map(|_| ()),
            RouterAction::TriggerButton {
                plugin_id,
                field_id,
            } => self
                .manager
                .trigger_button(plugin_id, field_id)
                .await
                .map(|_| ()),
            RouterAction::SystemCommand(SystemCommand::Rediscover) => {
                self.publish_discovery().await;
                Ok(())
            }
            RouterAction::SystemCommand(SystemCommand::ResetSensors) => {
                self.reset_scheduled_sensors().await;
                Ok(())
            }
            RouterAction::Unroutable(reason) => {
                match reason {
                    UnroutableReason::OutsideNamespace | UnroutableReason::HubStatus(_) => {
                        tracing::debug!(topic = %message.topic, reason = %reason, "ignoring message");
                    }
                    _ => {
                        tracing::warn!(topic = %message.topic, reason = %reason, "dropping unroutable message");
                    }
                }
                Ok(())
            }
        };
        if let Err(e) = applied {
            tracing::warn!(topic = %message.topic, error = %e, "failed to apply message");
        }
        action
    }

    /// Run until `cancel` fires or the intake closes, then stop every
    /// plugin within the grace period and mark the service offline.
    ///
    /// Retained configuration arrives first on a fresh subscription, so it
    /// is applied before any live traffic on the same ordered stream.
    pub async fn run(
        &self,
        mut intake: mpsc::UnboundedReceiver<InboundMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let start = Instant::now();
        let first_tick = |period: Duration, name: &str| -> Result<Instant> {
            anyhow::ensure!(!period.is_zero(), "{name} interval must be non-zero");
            start
                .checked_add(period)
                .with_context(|| format!("{name} interval of {period:?} is out of range"))
        };
        let mut heartbeat = tokio::time::interval_at(
            first_tick(self.config.heartbeat_interval, "heartbeat")?,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep_tick = tokio::time::interval_at(
            first_tick(self.config.sweep_check_interval, "sweep check")?,
            self.config.sweep_check_interval,
        );
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = DaySweep::new((self.today)());

        tracing::info!(plugins = self.registry.len(), "coordinator running");
        self.publisher.set_service_status(true).await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("coordinator cancelled");
                    break;
                }
                message = intake.recv() => match message {
                    Some(message) => {
                        self.handle(&message).await;
                    }
                    None => {
                        tracing::warn!("message intake closed");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    tracing::debug!("heartbeat");
                    self.publisher.set_service_status(true).await;
                }
                _ = sweep_tick.tick() => {
                    if sweep.check((self.today)()) {
                        self.reset_scheduled_sensors().await;
                    }
                }
            }
        }

        let stragglers = self.manager.shutdown(self.config.shutdown_grace).await;
        if !stragglers.is_empty() {
            tracing::warn!(plugins = ?stragglers, "plugins still running at shutdown");
        }
        self.publisher.set_service_status(false).await;
        Ok(())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
