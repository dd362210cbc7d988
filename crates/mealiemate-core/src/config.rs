//! Per-plugin configuration record.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::entity::FieldValue;
use crate::plugin::PluginDescriptor;

/// Mapping of field id to current value for one plugin.
///
/// Created from the descriptor's defaults at registration, mutated by
/// routed `UpdateConfig` actions, and snapshotted at execution start.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PluginConfig {
    values: BTreeMap<String, FieldValue>,
}

impl PluginConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration holding every declared default.
    pub fn defaults_for(descriptor: &PluginDescriptor) -> Self {
        let values = descriptor
            .fields
            .iter()
            .filter(|f| f.kind.holds_value())
            .filter_map(|f| f.default.clone().map(|v| (f.id.clone(), v)))
            .collect();
        Self { values }
    }

    pub fn get(&self, field_id: &str) -> Option<&FieldValue> {
        self.values.get(field_id)
    }

    /// Set a value, returning the previous one.
    pub fn set(&mut self, field_id: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.values.insert(field_id.into(), value)
    }

    pub fn bool(&self, field_id: &str) -> Option<bool> {
        self.get(field_id).and_then(FieldValue::as_bool)
    }

    pub fn number(&self, field_id: &str) -> Option<f64> {
        self.get(field_id).and_then(FieldValue::as_f64)
    }

    pub fn text(&self, field_id: &str) -> Option<&str> {
        self.get(field_id).and_then(FieldValue::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
