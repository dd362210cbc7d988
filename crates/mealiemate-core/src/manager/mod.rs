//! Plugin manager: per-plugin configuration and execution lifecycle.
//!
//! The manager owns one [`PluginSlot`] per registered plugin: the live
//! configuration record, the current [`ExecutionState`] and at most one
//! execution handle. Starting and stopping are serialized per slot by a
//! short synchronous lock, so concurrent enable requests can never create
//! a second execution of the same plugin.
//!
//! Each execution runs as its own task, supervised by a second task that
//! turns the body's result (including panics) into exactly one terminal
//! outcome, publishes it, and returns the slot to `Idle`.

pub mod state;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use state::{ExecutionState, TransitionError};

use crate::config::PluginConfig;
use crate::entity::publisher::EntityPublisher;
use crate::entity::{EntityKind, FieldValue};
use crate::plugin::context::ContextParts;
use crate::plugin::{Cancelled, PluginContext, PluginDescriptor, PluginRegistry};
use crate::services::Services;

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a stop request may take before a warning is logged.
    pub stop_grace: Duration,
    /// Buffered button presses per execution.
    pub button_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            button_capacity: 16,
        }
    }
}

/// Errors for requests the manager cannot apply.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManagerError {
    #[error("unknown plugin {0:?}")]
    UnknownPlugin(String),

    #[error("plugin {plugin} has no {expected} field {field:?}")]
    UnknownField {
        plugin: String,
        field: String,
        expected: &'static str,
    },

    #[error("value for {plugin}/{field} has the wrong type ({found})")]
    WrongValueType {
        plugin: String,
        field: String,
        found: &'static str,
    },
}

/// Result of an enable or disable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableOutcome {
    /// A new execution was started.
    Started(Uuid),
    /// An execution already exists; nothing changed.
    AlreadyRunning,
    /// The plugin could not be instantiated; it failed and is idle again.
    StartFailed,
    /// Cancellation was requested from the running execution.
    StopRequested,
    /// Nothing was running.
    AlreadyIdle,
}

/// Public view of an execution handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub execution_id: Uuid,
    pub started_at: DateTime<Utc>,
}

struct ExecutionHandle {
    info: HandleInfo,
    cancel: CancellationToken,
    buttons: mpsc::Sender<String>,
    /// Supervisor task; set once the body is spawned.
    supervisor: Option<JoinHandle<()>>,
}

struct RunSlot {
    state: ExecutionState,
    handle: Option<ExecutionHandle>,
}

/// Everything the manager tracks for one plugin id.
struct PluginSlot {
    descriptor: PluginDescriptor,
    config: Arc<RwLock<PluginConfig>>,
    run: Mutex<RunSlot>,
    state_tx: watch::Sender<ExecutionState>,
}

impl PluginSlot {
    fn new(descriptor: &PluginDescriptor) -> Self {
        let (state_tx, _) = watch::channel(ExecutionState::Idle);
        Self {
            config: Arc::new(RwLock::new(PluginConfig::defaults_for(descriptor))),
            descriptor: descriptor.clone(),
            run: Mutex::new(RunSlot {
                state: ExecutionState::Idle,
                handle: None,
            }),
            state_tx,
        }
    }

    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn lock(&self) -> MutexGuard<'_, RunSlot> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn config_snapshot(&self) -> PluginConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn owns(run: &RunSlot, execution_id: Uuid) -> bool {
        run.handle
            .as_ref()
            .is_some_and(|h| h.info.execution_id == execution_id)
    }

    fn transition(&self, run: &mut RunSlot, to: ExecutionState) -> Result<(), TransitionError> {
        let from = run.state;
        if !ExecutionState::is_valid_transition(from, to) {
            return Err(TransitionError {
                plugin_id: self.id().to_owned(),
                from,
                to,
            });
        }
        tracing::debug!(plugin_id = %self.id(), %from, %to, "state transition");
        run.state = to;
        self.state_tx.send_replace(to);
        Ok(())
    }

    fn transition_logged(&self, run: &mut RunSlot, to: ExecutionState) {
        if let Err(e) = self.transition(run, to) {
            tracing::error!(error = %e, "rejected state transition");
        }
    }
}

/// How an execution ended.
enum Outcome {
    Completed,
    Failed(anyhow::Error),
    Cancelled,
}

impl Outcome {
    fn state(&self) -> ExecutionState {
        match self {
            Self::Completed => ExecutionState::Completed,
            Self::Failed(_) => ExecutionState::Failed,
            Self::Cancelled => ExecutionState::Cancelled,
        }
    }

    /// Classify the body task's result. Any result after a stop request
    /// counts as cancelled; a panic counts as a failure.
    fn from_join(
        plugin_id: &str,
        result: Result<anyhow::Result<()>, JoinError>,
        cancel: &CancellationToken,
    ) -> Self {
        match result {
            Ok(Ok(())) if cancel.is_cancelled() => Self::Cancelled,
            Ok(Ok(())) => Self::Completed,
            Ok(Err(e)) if is_cancellation(&e) => Self::Cancelled,
            Ok(Err(e)) if cancel.is_cancelled() => {
                tracing::debug!(plugin_id, error = %format!("{e:#}"), "error while stopping");
                Self::Cancelled
            }
            Ok(Err(e)) => Self::Failed(e),
            Err(join) if join.is_panic() => {
                let payload = join.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                Self::Failed(anyhow::anyhow!("plugin panicked: {message}"))
            }
            Err(_) => Self::Cancelled,
        }
    }
}

fn is_cancellation(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<Cancelled>())
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Inner {
    registry: Arc<PluginRegistry>,
    publisher: EntityPublisher,
    services: Services,
    slots: BTreeMap<String, Arc<PluginSlot>>,
    config: ManagerConfig,
}

/// Owns the configuration and execution state of every plugin.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<Inner>,
}

impl PluginManager {
    pub fn new(
        registry: Arc<PluginRegistry>,
        publisher: EntityPublisher,
        services: Services,
        config: ManagerConfig,
    ) -> Self {
        let slots = registry
            .descriptors()
            .map(|d| (d.id.clone(), Arc::new(PluginSlot::new(d))))
            .collect();
        Self {
            inner: Arc::new(Inner {
                registry,
                publisher,
                services,
                slots,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    fn slot(&self, plugin_id: &str) -> Result<&Arc<PluginSlot>, ManagerError> {
        self.inner
            .slots
            .get(plugin_id)
            .ok_or_else(|| ManagerError::UnknownPlugin(plugin_id.to_owned()))
    }

    pub fn state(&self, plugin_id: &str) -> Option<ExecutionState> {
        self.inner.slots.get(plugin_id).map(|s| s.lock().state)
    }

    pub fn handle(&self, plugin_id: &str) -> Option<HandleInfo> {
        self.inner
            .slots
            .get(plugin_id)
            .and_then(|s| s.lock().handle.as_ref().map(|h| h.info))
    }

    /// Snapshot of a plugin's live configuration record.
    pub fn config(&self, plugin_id: &str) -> Option<PluginConfig> {
        self.inner.slots.get(plugin_id).map(|s| s.config_snapshot())
    }

    /// Watch a plugin's state. Intermediate states may be skipped by slow
    /// receivers.
    pub fn subscribe(&self, plugin_id: &str) -> Option<watch::Receiver<ExecutionState>> {
        self.inner.slots.get(plugin_id).map(|s| s.state_tx.subscribe())
    }

    /// Ids of plugins with an execution handle.
    pub fn running(&self) -> Vec<String> {
        self.inner
            .slots
            .values()
            .filter(|s| s.lock().handle.is_some())
            .map(|s| s.id().to_owned())
            .collect()
    }

    /// Wait until a plugin reaches `target`. Returns `false` on timeout or
    /// for an unknown plugin.
    pub async fn wait_for_state(
        &self,
        plugin_id: &str,
        target: ExecutionState,
        timeout: Duration,
    ) -> bool {
        let Some(mut rx) = self.subscribe(plugin_id) else {
            return false;
        };
        tokio::time::timeout(timeout, wait_for(&mut rx, target))
            .await
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Enable / disable
    // -----------------------------------------------------------------------

    /// Turn a plugin on or off.
    ///
    /// Enabling starts an execution unless one exists (idempotent).
    /// Disabling requests cooperative cancellation and returns without
    /// waiting; the execution reaches `Cancelled` at its next checkpoint.
    pub async fn set_enabled(
        &self,
        plugin_id: &str,
        enabled: bool,
    ) -> Result<EnableOutcome, ManagerError> {
        let slot = Arc::clone(self.slot(plugin_id)?);
        if enabled {
            Ok(self.start(slot).await)
        } else {
            Ok(self.stop(&slot).await)
        }
    }

    async fn start(&self, slot: Arc<PluginSlot>) -> EnableOutcome {
        let (info, cancel, buttons) = {
            let mut run = slot.lock();
            if run.handle.is_some() {
                tracing::info!(plugin_id = %slot.id(), state = %run.state, "plugin already running");
                return EnableOutcome::AlreadyRunning;
            }
            if let Err(e) = slot.transition(&mut run, ExecutionState::Starting) {
                tracing::error!(error = %e, "cannot start plugin");
                return EnableOutcome::AlreadyRunning;
            }
            let cancel = CancellationToken::new();
            let (tx, rx) = mpsc::channel(self.inner.config.button_capacity.max(1));
            let info = HandleInfo {
                execution_id: Uuid::new_v4(),
                started_at: Utc::now(),
            };
            run.handle = Some(ExecutionHandle {
                info,
                cancel: cancel.clone(),
                buttons: tx,
                supervisor: None,
            });
            (info, cancel, rx)
        };

        let plugin_id = slot.id().to_owned();
        let execution_id = info.execution_id;
        tracing::info!(plugin_id = %plugin_id, execution_id = %execution_id, "starting plugin");

        let snapshot = slot.config_snapshot();
        self.inner.reset_sensors(&slot).await;
        self.inner.publisher.set_enabled_state(&plugin_id, true).await;

        let created = match self.inner.registry.get(&plugin_id) {
            Some(registered) => registered.factory().create(&snapshot, &self.inner.services),
            None => Err(anyhow::anyhow!("plugin {plugin_id} is not registered")),
        };
        let plugin = match created {
            Ok(plugin) => plugin,
            Err(e) => {
                tracing::error!(
                    plugin_id = %plugin_id,
                    error = %format!("{e:#}"),
                    "failed to instantiate plugin"
                );
                self.inner
                    .finish(&slot, execution_id, Outcome::Failed(e))
                    .await;
                return EnableOutcome::StartFailed;
            }
        };

        {
            let mut run = slot.lock();
            slot.transition_logged(&mut run, ExecutionState::Running);
        }

        if cancel.is_cancelled() {
            self.inner
                .finish(&slot, execution_id, Outcome::Cancelled)
                .await;
            return EnableOutcome::Started(execution_id);
        }

        let ctx = PluginContext::new(
            &slot.descriptor,
            ContextParts {
                execution_id,
                snapshot,
                live: Arc::clone(&slot.config),
                cancel: cancel.clone(),
                buttons,
                publisher: self.inner.publisher.clone(),
                services: self.inner.services.clone(),
            },
        );

        let inner = Arc::clone(&self.inner);
        let supervised = Arc::clone(&slot);
        let supervisor = tokio::spawn(async move {
            let body = tokio::spawn(async move { plugin.run(ctx).await });
            let outcome = Outcome::from_join(supervised.id(), body.await, &cancel);
            inner.finish(&supervised, execution_id, outcome).await;
        });

        // A supervisor that already finished has cleared the handle.
        if let Some(handle) = slot
            .lock()
            .handle
            .as_mut()
            .filter(|h| h.info.execution_id == execution_id)
        {
            handle.supervisor = Some(supervisor);
        }
        EnableOutcome::Started(execution_id)
    }

    async fn stop(&self, slot: &Arc<PluginSlot>) -> EnableOutcome {
        let token = slot.lock().handle.as_ref().map(|h| h.cancel.clone());
        let Some(token) = token else {
            self.inner.publisher.set_enabled_state(slot.id(), false).await;
            return EnableOutcome::AlreadyIdle;
        };
        if token.is_cancelled() {
            return EnableOutcome::StopRequested;
        }

        tracing::info!(plugin_id = %slot.id(), "stop requested");
        token.cancel();

        let mut rx = slot.state_tx.subscribe();
        let grace = self.inner.config.stop_grace;
        let plugin_id = slot.id().to_owned();
        tokio::spawn(async move {
            let stopped = tokio::time::timeout(grace, wait_for(&mut rx, ExecutionState::Idle)).await;
            if stopped.is_err() {
                tracing::warn!(
                    plugin_id = %plugin_id,
                    grace_secs = grace.as_secs(),
                    "plugin has not stopped within the grace period"
                );
            }
        });
        EnableOutcome::StopRequested
    }

    // -----------------------------------------------------------------------
    // Configuration and buttons
    // -----------------------------------------------------------------------

    /// Write a value to the live configuration record and echo it on the
    /// field's state topic. A running execution only observes it when the
    /// field is declared live; otherwise it applies to the next run.
    pub async fn update_config(
        &self,
        plugin_id: &str,
        field_id: &str,
        value: FieldValue,
    ) -> Result<(), ManagerError> {
        let slot = self.slot(plugin_id)?;
        let field = slot
            .descriptor
            .field(field_id)
            .filter(|f| f.kind.holds_value())
            .ok_or_else(|| ManagerError::UnknownField {
                plugin: plugin_id.to_owned(),
                field: field_id.to_owned(),
                expected: "configurable",
            })?;
        if !value.matches_kind(field.kind) {
            return Err(ManagerError::WrongValueType {
                plugin: plugin_id.to_owned(),
                field: field_id.to_owned(),
                found: value.type_name(),
            });
        }

        slot.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(field_id, value.clone());

        let running = slot.lock().handle.is_some();
        if running && !field.live {
            tracing::info!(
                plugin_id,
                field_id,
                value = %value,
                "config updated, takes effect on the next run"
            );
        } else {
            tracing::debug!(plugin_id, field_id, value = %value, "config updated");
        }

        self.inner
            .publisher
            .publish_value(plugin_id, field_id, &value)
            .await;
        Ok(())
    }

    /// Deliver a button press to the running execution. Returns whether it
    /// was delivered; presses while idle are dropped.
    pub async fn trigger_button(
        &self,
        plugin_id: &str,
        field_id: &str,
    ) -> Result<bool, ManagerError> {
        let slot = self.slot(plugin_id)?;
        let is_button = slot
            .descriptor
            .field(field_id)
            .is_some_and(|f| f.kind == EntityKind::Button);
        if !is_button {
            return Err(ManagerError::UnknownField {
                plugin: plugin_id.to_owned(),
                field: field_id.to_owned(),
                expected: "button",
            });
        }

        let sender = slot.lock().handle.as_ref().map(|h| h.buttons.clone());
        let Some(sender) = sender else {
            tracing::info!(plugin_id, button = field_id, "button pressed while idle, ignoring");
            return Ok(false);
        };
        match sender.try_send(field_id.to_owned()) {
            Ok(()) => {
                tracing::debug!(plugin_id, button = field_id, "button delivered");
                Ok(true)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(plugin_id, button = field_id, "button queue full, dropping press");
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(plugin_id, button = field_id, "execution no longer accepts buttons");
                Ok(false)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sensors and shutdown
    // -----------------------------------------------------------------------

    /// Reset the declared reset-sensors of one plugin.
    pub async fn reset_sensors(&self, plugin_id: &str) -> Result<(), ManagerError> {
        let slot = self.slot(plugin_id)?;
        self.inner.reset_sensors(slot).await;
        Ok(())
    }

    /// Reset the declared reset-sensors of every plugin.
    pub async fn reset_all_sensors(&self) {
        for slot in self.inner.slots.values() {
            self.inner.reset_sensors(slot).await;
        }
    }

    /// Cancel every execution and wait up to `grace` for all of them to
    /// return to `Idle`. Returns the ids that did not stop in time.
    ///
    /// Executions are awaited through their supervisor task, so the outcome
    /// is published before this returns.
    pub async fn shutdown(&self, grace: Duration) -> Vec<String> {
        let mut supervisors = BTreeMap::new();
        for slot in self.inner.slots.values() {
            let mut run = slot.lock();
            if let Some(handle) = run.handle.as_mut() {
                tracing::info!(plugin_id = %slot.id(), "cancelling for shutdown");
                handle.cancel.cancel();
                if let Some(task) = handle.supervisor.take() {
                    supervisors.insert(slot.id(), task);
                }
            }
        }

        let waits = self.inner.slots.values().map(|slot| {
            let supervisor = supervisors.remove(slot.id());
            async move {
                let stopped = match supervisor {
                    Some(task) => match tokio::time::timeout(grace, task).await {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            tracing::error!(plugin_id = %slot.id(), error = %e, "plugin supervisor failed");
                            false
                        }
                        Err(_) => false,
                    },
                    None => {
                        let mut rx = slot.state_tx.subscribe();
                        tokio::time::timeout(grace, wait_for(&mut rx, ExecutionState::Idle))
                            .await
                            .is_ok()
                    }
                };
                (slot.id(), stopped)
            }
        });

        join_all(waits)
            .await
            .into_iter()
            .filter(|(_, stopped)| !stopped)
            .map(|(id, _)| {
                tracing::warn!(plugin_id = %id, "plugin did not stop before shutdown deadline");
                id.to_owned()
            })
            .collect()
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.inner.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Inner {
    async fn reset_sensors(&self, slot: &PluginSlot) {
        for sensor_id in &slot.descriptor.reset_sensors {
            if let Some(sensor) = slot.descriptor.field(sensor_id) {
                self.publisher.reset_sensor(slot.id(), sensor).await;
            }
        }
    }

    /// Record the terminal state, publish the outcome once, then return the
    /// slot to `Idle` and clear the handle.
    async fn finish(&self, slot: &PluginSlot, execution_id: Uuid, outcome: Outcome) {
        {
            let mut run = slot.lock();
            if !PluginSlot::owns(&run, execution_id) {
                tracing::warn!(
                    plugin_id = %slot.id(),
                    execution_id = %execution_id,
                    "finished execution no longer owns the slot"
                );
                return;
            }
            slot.transition_logged(&mut run, outcome.state());
        }

        self.publish_outcome(slot, &outcome).await;

        let mut run = slot.lock();
        slot.transition_logged(&mut run, ExecutionState::Idle);
        run.handle = None;
    }

    async fn publish_outcome(&self, slot: &PluginSlot, outcome: &Outcome) {
        let plugin_id = slot.id();
        let feedback = slot.descriptor.feedback_sensor();
        let progress = slot.descriptor.progress_sensor();

        match outcome {
            Outcome::Completed => {
                tracing::info!(plugin_id, "plugin completed");
                if let Some(sensor) = feedback {
                    self.publisher
                        .log(plugin_id, &sensor.id, "Completed successfully")
                        .await;
                }
                if let Some(sensor) = progress {
                    self.publisher
                        .progress(plugin_id, &sensor.id, 100, "Finished")
                        .await;
                }
            }
            Outcome::Failed(e) => {
                let message = format!("Error: {e:#}");
                tracing::error!(plugin_id, error = %format!("{e:#}"), "plugin failed");
                if let Some(sensor) = feedback {
                    self.publisher.log(plugin_id, &sensor.id, &message).await;
                }
                if let Some(sensor) = progress {
                    self.publisher
                        .progress(plugin_id, &sensor.id, 0, "Failed")
                        .await;
                }
            }
            Outcome::Cancelled => {
                tracing::info!(plugin_id, "plugin stopped");
                self.reset_sensors(slot).await;
                if let Some(sensor) = progress {
                    self.publisher
                        .progress(plugin_id, &sensor.id, 0, "Stopped")
                        .await;
                }
            }
        }
        self.publisher.set_enabled_state(plugin_id, false).await;
    }
}

/// Resolve once the watched state equals `target`. Returns `false` if the
/// sender is gone.
async fn wait_for(rx: &mut watch::Receiver<ExecutionState>, target: ExecutionState) -> bool {
    loop {
        let current = *rx.borrow_and_update();
        if current == target {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}
