//! The `Plugin` and `PluginFactory` traits.
//!
//! Both traits are object-safe so factories can be stored as
//! `Box<dyn PluginFactory>` in the [`super::PluginRegistry`] and instances
//! run as `Box<dyn Plugin>`.

use anyhow::Result;
use async_trait::async_trait;

use super::context::PluginContext;
use crate::config::PluginConfig;
use crate::entity::topics::MAIN_SWITCH;
use crate::entity::{EntityKind, FieldSpec, SensorStyle};
use crate::services::Services;

/// A single execution of a plugin.
///
/// `run` is the execution entry point. It is scheduled as its own task;
/// returning `Err` marks the execution as failed, and so does a panic.
/// Implementations should call [`PluginContext::checkpoint`] between
/// external calls so a disable request can stop them cleanly.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn run(&self, ctx: PluginContext) -> Result<()>;
}

/// Constructor for a plugin, registered once at startup.
pub trait PluginFactory: Send + Sync {
    /// The plugin's identity and entity surface. Must return the same
    /// descriptor on every call.
    fn descriptor(&self) -> PluginDescriptor;

    /// Create a fresh instance for one execution, from the configuration
    /// snapshot taken at start and the injected collaborators.
    fn create(&self, config: &PluginConfig, services: &Services) -> Result<Box<dyn Plugin>>;
}

// Compile-time assertion: both traits must be object-safe.
const _: () = {
    fn _assert_plugin_object_safe(_: &dyn Plugin) {}
    fn _assert_factory_object_safe(_: &dyn PluginFactory) {}
};

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Identity and declared entity surface of a plugin. Immutable once
/// registered.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    /// Stable id; the plugin's topic segment.
    pub id: String,
    pub name: String,
    pub description: String,
    /// Declared fields, excluding the implicit main switch.
    pub fields: Vec<FieldSpec>,
    /// Sensor ids cleared at the start of every run and on the daily sweep.
    pub reset_sensors: Vec<String>,
}

impl PluginDescriptor {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            description: String::new(),
            fields: Vec::new(),
            reset_sensors: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_owned();
        self
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_reset_sensor(mut self, sensor_id: &str) -> Self {
        self.reset_sensors.push(sensor_id.to_owned());
        self
    }

    /// Look up a declared field.
    pub fn field(&self, field_id: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.id == field_id)
    }

    /// Kind of a field id, including the implicit main switch.
    pub fn field_kind(&self, field_id: &str) -> Option<EntityKind> {
        if field_id == MAIN_SWITCH {
            return Some(EntityKind::Switch);
        }
        self.field(field_id).map(|f| f.kind)
    }

    /// Sensor that receives outcome text: a log sensor named `feedback`,
    /// else the first declared log sensor.
    pub fn feedback_sensor(&self) -> Option<&FieldSpec> {
        let is_log = |f: &&FieldSpec| f.sensor_style == Some(SensorStyle::Log);
        self.fields
            .iter()
            .filter(is_log)
            .find(|f| f.id == "feedback")
            .or_else(|| self.fields.iter().find(is_log))
    }

    /// First declared progress sensor.
    pub fn progress_sensor(&self) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|f| f.sensor_style == Some(SensorStyle::Progress))
    }

    /// Fields a running execution may observe live.
    pub fn live_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NumberRange;

    fn descriptor() -> PluginDescriptor {
        PluginDescriptor::new("shopping_list", "Shopping List")
            .with_field(FieldSpec::number("days", "Days", 7.0, NumberRange::new(1.0, 30.0, 1.0)))
            .with_field(FieldSpec::log_sensor("details", "Details"))
            .with_field(FieldSpec::log_sensor("feedback", "Feedback"))
            .with_field(FieldSpec::progress_sensor("progress", "Progress"))
            .with_field(FieldSpec::switch("include_today", "Include Today", false).live())
    }

    #[test]
    fn field_kind_includes_main_switch() {
        let d = descriptor();
        assert_eq!(d.field_kind("switch"), Some(EntityKind::Switch));
        assert_eq!(d.field_kind("days"), Some(EntityKind::Number));
        assert_eq!(d.field_kind("missing"), None);
        assert!(d.field("switch").is_none());
    }

    #[test]
    fn feedback_sensor_prefers_named_feedback() {
        let d = descriptor();
        assert_eq!(d.feedback_sensor().map(|f| f.id.as_str()), Some("feedback"));
        assert_eq!(d.progress_sensor().map(|f| f.id.as_str()), Some("progress"));
    }

    #[test]
    fn feedback_sensor_falls_back_to_first_log() {
        let d = PluginDescriptor::new("p", "P")
            .with_field(FieldSpec::log_sensor("details", "Details"))
            .with_field(FieldSpec::log_sensor("other", "Other"));
        assert_eq!(d.feedback_sensor().map(|f| f.id.as_str()), Some("details"));
        assert!(PluginDescriptor::new("q", "Q").feedback_sensor().is_none());
    }

    #[test]
    fn live_fields_are_opt_in() {
        let d = descriptor();
        let live: Vec<_> = d.live_fields().map(|f| f.id.as_str()).collect();
        assert_eq!(live, vec!["include_today"]);
    }
}
