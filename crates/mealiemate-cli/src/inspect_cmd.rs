//! `mealiemate plugins` and `mealiemate discovery`: inspect the entity
//! surface without a broker.

use anyhow::{Context, Result};
use serde_json::{Value, json};

use mealiemate_core::entity::schema::{build_entities, system_entities};
use mealiemate_core::{Namespace, PluginRegistry};

/// Human-readable listing of every plugin and its topics.
pub fn render_plugins(registry: &PluginRegistry, ns: &Namespace) -> Result<String> {
    let mut out = String::new();
    for descriptor in registry.descriptors() {
        out.push_str(&format!("{} ({})\n", descriptor.id, descriptor.name));
        if !descriptor.description.is_empty() {
            out.push_str(&format!("  {}\n", descriptor.description));
        }
        let entities = build_entities(descriptor, ns)
            .with_context(|| format!("invalid plugin {}", descriptor.id))?;
        for entity in entities {
            let topic = entity
                .command_topic
                .as_ref()
                .or(entity.state_topic.as_ref())
                .or(entity.image_topic.as_ref())
                .map_or("", String::as_str);
            let live = descriptor
                .field(&entity.field_id)
                .is_some_and(|f| f.live);
            out.push_str(&format!(
                "  {:<16} {:<14} {topic}{}\n",
                entity.field_id,
                entity.kind.to_string(),
                if live { "  (live)" } else { "" }
            ));
        }
        out.push('\n');
    }
    Ok(out)
}

/// Every discovery message `run` would publish, as `{topic, payload}`
/// objects: the system entities first, then each plugin's.
pub fn discovery_document(registry: &PluginRegistry, ns: &Namespace) -> Result<Value> {
    let mut messages = Vec::new();
    let mut entities = system_entities(ns);
    for descriptor in registry.descriptors() {
        entities.extend(
            build_entities(descriptor, ns)
                .with_context(|| format!("invalid plugin {}", descriptor.id))?,
        );
    }
    for entity in entities {
        messages.push(json!({ "topic": entity.discovery_topic, "payload": entity.discovery }));
    }
    Ok(Value::Array(messages))
}

/// Number of entities the hub can control, for the summary line.
pub fn controllable_count(registry: &PluginRegistry, ns: &Namespace) -> usize {
    registry
        .descriptors()
        .filter_map(|d| build_entities(d, ns).ok())
        .flatten()
        .filter(|e| e.kind.is_controllable())
        .count()
}
