//! Entity schema builder.
//!
//! Validates a [`PluginDescriptor`] and expands it into
//! [`EntityDescriptor`]s. Validation runs once at registration, so a
//! malformed plugin is a startup error rather than a runtime one.

use std::collections::HashSet;

use serde_json::{Map, Value, json};

use super::topics::{MAIN_SWITCH, Namespace, STATUS_SEGMENT, SYSTEM_SEGMENT, is_valid_identifier};
use super::{EntityDescriptor, EntityKind, FieldSpec, FieldValue, SensorStyle, SWITCH_OFF, SWITCH_ON};
use crate::plugin::PluginDescriptor;

/// A programmer error in a plugin's declared entity surface.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid plugin id {0:?}: expected lowercase letters, digits and underscores")]
    InvalidPluginId(String),

    #[error("plugin id {0:?} is reserved")]
    ReservedPluginId(String),

    #[error("plugin {plugin}: invalid field id {field:?}")]
    InvalidFieldId { plugin: String, field: String },

    #[error("plugin {plugin}: field id {field:?} is reserved")]
    ReservedFieldId { plugin: String, field: String },

    #[error("plugin {plugin}: duplicate field {field:?}")]
    DuplicateField { plugin: String, field: String },

    #[error("plugin {plugin}: {kind} field {field:?} has an invalid default")]
    InvalidDefault {
        plugin: String,
        field: String,
        kind: EntityKind,
    },

    #[error("plugin {plugin}: number field {field:?} needs a valid range containing its default")]
    InvalidRange { plugin: String, field: String },

    #[error("plugin {plugin}: {kind} field {field:?} does not support {attribute}")]
    UnsupportedAttribute {
        plugin: String,
        field: String,
        kind: EntityKind,
        attribute: &'static str,
    },

    #[error("plugin {plugin}: reset sensor {field:?} is not a declared sensor")]
    UnknownResetSensor { plugin: String, field: String },
}

/// Validate a descriptor. Every check here guards an assumption the router
/// or manager relies on.
pub fn validate(descriptor: &PluginDescriptor) -> Result<(), SchemaError> {
    let plugin = &descriptor.id;
    if !is_valid_identifier(plugin) {
        return Err(SchemaError::InvalidPluginId(plugin.clone()));
    }
    if plugin == SYSTEM_SEGMENT || plugin == STATUS_SEGMENT {
        return Err(SchemaError::ReservedPluginId(plugin.clone()));
    }

    let mut seen = HashSet::new();
    for field in &descriptor.fields {
        let field_err = || (plugin.clone(), field.id.clone());
        if !is_valid_identifier(&field.id) {
            let (plugin, field) = field_err();
            return Err(SchemaError::InvalidFieldId { plugin, field });
        }
        if field.id == MAIN_SWITCH {
            let (plugin, field) = field_err();
            return Err(SchemaError::ReservedFieldId { plugin, field });
        }
        if !seen.insert(field.id.as_str()) {
            let (plugin, field) = field_err();
            return Err(SchemaError::DuplicateField { plugin, field });
        }
        validate_field(plugin, field)?;
    }

    for sensor in &descriptor.reset_sensors {
        let declared = descriptor
            .field(sensor)
            .is_some_and(|f| f.kind == EntityKind::Sensor);
        if !declared {
            return Err(SchemaError::UnknownResetSensor {
                plugin: plugin.clone(),
                field: sensor.clone(),
            });
        }
    }
    Ok(())
}

fn validate_field(plugin: &str, field: &FieldSpec) -> Result<(), SchemaError> {
    let unsupported = |attribute| SchemaError::UnsupportedAttribute {
        plugin: plugin.to_owned(),
        field: field.id.clone(),
        kind: field.kind,
        attribute,
    };

    match (&field.default, field.kind.holds_value()) {
        (Some(value), true) if value.matches_kind(field.kind) => {}
        (None, false) => {}
        _ => {
            return Err(SchemaError::InvalidDefault {
                plugin: plugin.to_owned(),
                field: field.id.clone(),
                kind: field.kind,
            });
        }
    }

    if field.kind == EntityKind::Number {
        let in_range = match (&field.range, &field.default) {
            (Some(range), Some(FieldValue::Number(n))) => range.is_valid() && range.contains(*n),
            _ => false,
        };
        if !in_range {
            return Err(SchemaError::InvalidRange {
                plugin: plugin.to_owned(),
                field: field.id.clone(),
            });
        }
    } else if field.range.is_some() {
        return Err(unsupported("a number range"));
    }

    match (field.kind, field.max_length) {
        (EntityKind::Text, Some(max)) => {
            let default_len = field
                .default
                .as_ref()
                .and_then(FieldValue::as_str)
                .map_or(0, |s| s.chars().count());
            if max == 0 || default_len > max {
                return Err(unsupported("this maximum length"));
            }
        }
        (EntityKind::Text, None) => {}
        (_, Some(_)) => return Err(unsupported("a maximum length")),
        (_, None) => {}
    }

    if field.sensor_style.is_some() && field.kind != EntityKind::Sensor {
        return Err(unsupported("a sensor style"));
    }
    if field.live && !field.kind.holds_value() {
        return Err(unsupported("live updates"));
    }
    Ok(())
}

/// The implicit main switch of every plugin.
pub fn main_switch(descriptor: &PluginDescriptor) -> FieldSpec {
    FieldSpec::switch(MAIN_SWITCH, &descriptor.name, false).with_icon("mdi:play")
}

/// Expand a descriptor into its entities: the main switch first, then the
/// declared fields in declaration order.
pub fn build_entities(
    descriptor: &PluginDescriptor,
    namespace: &Namespace,
) -> Result<Vec<EntityDescriptor>, SchemaError> {
    validate(descriptor)?;
    let switch = main_switch(descriptor);
    let entities = std::iter::once(&switch)
        .chain(descriptor.fields.iter())
        .map(|field| build_entity(descriptor, field, namespace))
        .collect();
    Ok(entities)
}

fn build_entity(
    descriptor: &PluginDescriptor,
    field: &FieldSpec,
    ns: &Namespace,
) -> EntityDescriptor {
    let plugin_id = descriptor.id.as_str();
    let field_id = field.id.as_str();
    let kind = field.kind;

    let name = if field_id == MAIN_SWITCH {
        descriptor.name.clone()
    } else {
        format!("{} {}", descriptor.name, field.name)
    };
    let unique_id = ns.unique_id(plugin_id, field_id);

    let state_topic = match kind {
        EntityKind::Button | EntityKind::Image => None,
        _ => Some(ns.state_topic(plugin_id, field_id)),
    };
    let command_topic = kind
        .is_controllable()
        .then(|| ns.command_topic(plugin_id, field_id));
    let attributes_topic =
        (kind == EntityKind::Sensor).then(|| ns.attributes_topic(plugin_id, field_id));
    let image_topic = (kind == EntityKind::Image).then(|| ns.image_topic(plugin_id, field_id));

    let mut payload = Map::new();
    payload.insert("name".into(), json!(name));
    payload.insert("unique_id".into(), json!(unique_id));
    payload.insert("object_id".into(), json!(unique_id));
    payload.insert("device".into(), device_block(ns));
    if let Some(topic) = &state_topic {
        payload.insert("state_topic".into(), json!(topic));
    }
    if let Some(topic) = &command_topic {
        payload.insert("command_topic".into(), json!(topic));
    }
    if let Some(icon) = &field.icon {
        payload.insert("icon".into(), json!(icon));
    }

    let mut value = field.default.clone();
    match kind {
        EntityKind::Switch | EntityKind::BinarySensor => {
            payload.insert("payload_on".into(), json!(SWITCH_ON));
            payload.insert("payload_off".into(), json!(SWITCH_OFF));
            if kind == EntityKind::Switch {
                payload.insert("state_on".into(), json!(SWITCH_ON));
                payload.insert("state_off".into(), json!(SWITCH_OFF));
            }
        }
        EntityKind::Number => {
            if let Some(range) = &field.range {
                payload.insert("min".into(), json!(range.min));
                payload.insert("max".into(), json!(range.max));
                payload.insert("step".into(), json!(range.step));
                if let Some(unit) = &range.unit {
                    payload.insert("unit_of_measurement".into(), json!(unit));
                }
            }
            payload.insert("mode".into(), json!("box"));
            payload.insert("retain".into(), json!(true));
        }
        EntityKind::Text => {
            if let Some(max) = field.max_length {
                payload.insert("max".into(), json!(max));
            }
            payload.insert("mode".into(), json!("text"));
            payload.insert("retain".into(), json!(true));
        }
        EntityKind::Button => {
            payload.insert("payload_press".into(), json!("PRESS"));
        }
        EntityKind::Sensor => {
            if let Some(topic) = &attributes_topic {
                payload.insert("json_attributes_topic".into(), json!(topic));
            }
            match field.sensor_style {
                Some(SensorStyle::Log) => {
                    payload.insert("device_class".into(), json!("timestamp"));
                }
                Some(SensorStyle::Progress) => {
                    payload.insert("unit_of_measurement".into(), json!("%"));
                    payload.insert("state_class".into(), json!("measurement"));
                    value = Some(FieldValue::Number(0.0));
                }
                None => {}
            }
        }
        EntityKind::Image => {
            if let Some(topic) = &image_topic {
                payload.insert("image_topic".into(), json!(topic));
            }
            payload.insert("content_type".into(), json!("image/png"));
        }
    }

    EntityDescriptor {
        kind,
        plugin_id: plugin_id.to_owned(),
        field_id: field_id.to_owned(),
        unique_id,
        name,
        state_topic,
        command_topic,
        attributes_topic,
        image_topic,
        discovery_topic: ns.discovery_topic(kind, plugin_id, field_id),
        discovery: Value::Object(payload),
        value,
    }
}

/// Device block shared by every entity, so the hub groups them together.
pub fn device_block(ns: &Namespace) -> Value {
    json!({
        "identifiers": [ns.root()],
        "name": "MealieMate",
        "manufacturer": "MealieMate",
        "model": "Plugin coordinator",
        "sw_version": env!("CARGO_PKG_VERSION"),
    })
}

/// System-level entities: the service status sensor and one button per
/// system command.
pub fn system_entities(ns: &Namespace) -> Vec<EntityDescriptor> {
    let status_unique = ns.unique_id(STATUS_SEGMENT, "state");
    let status = EntityDescriptor {
        kind: EntityKind::BinarySensor,
        plugin_id: STATUS_SEGMENT.to_owned(),
        field_id: "state".to_owned(),
        unique_id: status_unique.clone(),
        name: "MealieMate Status".to_owned(),
        state_topic: Some(ns.status_topic()),
        command_topic: None,
        attributes_topic: None,
        image_topic: None,
        discovery_topic: ns.discovery_topic(EntityKind::BinarySensor, STATUS_SEGMENT, "state"),
        discovery: json!({
            "name": "MealieMate Status",
            "unique_id": status_unique,
            "object_id": status_unique,
            "state_topic": ns.status_topic(),
            "payload_on": SWITCH_ON,
            "payload_off": SWITCH_OFF,
            "device_class": "connectivity",
            "device": device_block(ns),
        }),
        value: None,
    };

    let buttons = [
        ("rediscover", "Rediscover Entities", "mdi:refresh"),
        ("reset_sensors", "Reset Sensors", "mdi:broom"),
    ]
    .into_iter()
    .map(|(command, name, icon)| {
        let unique_id = ns.unique_id(SYSTEM_SEGMENT, command);
        let command_topic = ns.system_command_topic(command);
        EntityDescriptor {
            kind: EntityKind::Button,
            plugin_id: SYSTEM_SEGMENT.to_owned(),
            field_id: command.to_owned(),
            unique_id: unique_id.clone(),
            name: format!("MealieMate {name}"),
            state_topic: None,
            command_topic: Some(command_topic.clone()),
            attributes_topic: None,
            image_topic: None,
            discovery_topic: ns.discovery_topic(EntityKind::Button, SYSTEM_SEGMENT, command),
            discovery: json!({
                "name": format!("MealieMate {name}"),
                "unique_id": unique_id,
                "object_id": unique_id,
                "command_topic": command_topic,
                "payload_press": "PRESS",
                "icon": icon,
                "device": device_block(ns),
            }),
            value: None,
        }
    });

    std::iter::once(status).chain(buttons).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NumberRange;

    fn shopping_list() -> PluginDescriptor {
        PluginDescriptor::new("shopping_list", "Shopping List")
            .with_field(
                FieldSpec::number("days", "Days", 7.0, NumberRange::new(1.0, 30.0, 1.0).with_unit("days")),
            )
            .with_field(FieldSpec::switch("include_today", "Include Today", false))
            .with_field(FieldSpec::text("note", "Note", ""))
            .with_field(FieldSpec::button("retry", "Retry"))
            .with_field(FieldSpec::log_sensor("feedback", "Feedback"))
            .with_field(FieldSpec::progress_sensor("progress", "Progress"))
            .with_field(FieldSpec::image("preview", "Preview"))
            .with_reset_sensor("feedback")
    }

    #[test]
    fn builds_main_switch_first() {
        let entities = build_entities(&shopping_list(), &Namespace::default()).unwrap();
        assert_eq!(entities.len(), 8);
        let switch = &entities[0];
        assert_eq!(switch.field_id, "switch");
        assert_eq!(switch.kind, EntityKind::Switch);
        assert_eq!(switch.name, "Shopping List");
        assert_eq!(switch.value, Some(FieldValue::Bool(false)));
        assert_eq!(
            switch.command_topic.as_deref(),
            Some("mealiemate/shopping_list/switch/set")
        );
    }

    #[test]
    fn build_is_deterministic() {
        let ns = Namespace::default();
        let a = build_entities(&shopping_list(), &ns).unwrap();
        let b = build_entities(&shopping_list(), &ns).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn number_discovery_carries_range_and_retain() {
        let entities = build_entities(&shopping_list(), &Namespace::default()).unwrap();
        let days = entities.iter().find(|e| e.field_id == "days").unwrap();
        assert_eq!(
            days.discovery_topic,
            "homeassistant/number/mealiemate/shopping_list_days/config"
        );
        assert_eq!(days.discovery["min"], json!(1.0));
        assert_eq!(days.discovery["max"], json!(30.0));
        assert_eq!(days.discovery["unit_of_measurement"], json!("days"));
        assert_eq!(days.discovery["retain"], json!(true));
        assert_eq!(days.discovery["device"]["identifiers"], json!(["mealiemate"]));
        assert_eq!(days.value, Some(FieldValue::Number(7.0)));
    }

    #[test]
    fn read_only_kinds_have_no_command_topic() {
        let entities = build_entities(&shopping_list(), &Namespace::default()).unwrap();
        for entity in &entities {
            assert_eq!(
                entity.command_topic.is_some(),
                entity.kind.is_controllable(),
                "{}",
                entity.field_id
            );
        }
        let feedback = entities.iter().find(|e| e.field_id == "feedback").unwrap();
        assert_eq!(
            feedback.attributes_topic.as_deref(),
            Some("mealiemate/shopping_list/feedback/attributes")
        );
        assert_eq!(feedback.discovery["device_class"], json!("timestamp"));
        let button = entities.iter().find(|e| e.field_id == "retry").unwrap();
        assert!(button.state_topic.is_none());
        let preview = entities.iter().find(|e| e.field_id == "preview").unwrap();
        assert_eq!(
            preview.image_topic.as_deref(),
            Some("mealiemate/shopping_list/preview/image")
        );
    }

    #[test]
    fn rejects_reserved_and_invalid_ids() {
        let err = validate(&PluginDescriptor::new("system", "System")).unwrap_err();
        assert_eq!(err, SchemaError::ReservedPluginId("system".into()));

        let err = validate(&PluginDescriptor::new("Bad-Id", "Bad")).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidPluginId(_)));

        let d = PluginDescriptor::new("p", "P").with_field(FieldSpec::switch("switch", "S", false));
        assert!(matches!(validate(&d), Err(SchemaError::ReservedFieldId { .. })));

        let d = PluginDescriptor::new("p", "P").with_field(FieldSpec::button("has space", "B"));
        assert!(matches!(validate(&d), Err(SchemaError::InvalidFieldId { .. })));
    }

    #[test]
    fn rejects_duplicate_fields() {
        let d = PluginDescriptor::new("p", "P")
            .with_field(FieldSpec::button("go", "Go"))
            .with_field(FieldSpec::switch("go", "Go", false));
        assert!(matches!(validate(&d), Err(SchemaError::DuplicateField { .. })));
    }

    #[test]
    fn rejects_mismatched_defaults() {
        let mut field = FieldSpec::switch("flag", "Flag", false);
        field.default = Some(FieldValue::Number(1.0));
        let d = PluginDescriptor::new("p", "P").with_field(field);
        assert!(matches!(validate(&d), Err(SchemaError::InvalidDefault { .. })));

        let mut button = FieldSpec::button("go", "Go");
        button.default = Some(FieldValue::Bool(true));
        let d = PluginDescriptor::new("p", "P").with_field(button);
        assert!(matches!(validate(&d), Err(SchemaError::InvalidDefault { .. })));
    }

    #[test]
    fn rejects_bad_ranges() {
        let d = PluginDescriptor::new("p", "P").with_field(FieldSpec::number(
            "days",
            "Days",
            40.0,
            NumberRange::new(1.0, 30.0, 1.0),
        ));
        assert!(matches!(validate(&d), Err(SchemaError::InvalidRange { .. })));

        let mut field = FieldSpec::number("days", "Days", 3.0, NumberRange::new(1.0, 30.0, 1.0));
        field.range = None;
        let d = PluginDescriptor::new("p", "P").with_field(field);
        assert!(matches!(validate(&d), Err(SchemaError::InvalidRange { .. })));
    }

    #[test]
    fn rejects_unsupported_attributes() {
        let d = PluginDescriptor::new("p", "P").with_field(FieldSpec::button("go", "Go").live());
        assert!(matches!(
            validate(&d),
            Err(SchemaError::UnsupportedAttribute {
                attribute: "live updates",
                ..
            })
        ));

        let d = PluginDescriptor::new("p", "P")
            .with_field(FieldSpec::switch("flag", "Flag", false).with_max_length(10));
        assert!(matches!(validate(&d), Err(SchemaError::UnsupportedAttribute { .. })));
    }

    #[test]
    fn reset_sensors_must_be_declared_sensors() {
        let d = PluginDescriptor::new("p", "P")
            .with_field(FieldSpec::switch("flag", "Flag", false))
            .with_reset_sensor("flag");
        assert!(matches!(validate(&d), Err(SchemaError::UnknownResetSensor { .. })));

        let d = PluginDescriptor::new("p", "P").with_reset_sensor("ghost");
        assert!(matches!(validate(&d), Err(SchemaError::UnknownResetSensor { .. })));
    }

    #[test]
    fn system_entities_cover_status_and_commands() {
        let ns = Namespace::default();
        let entities = system_entities(&ns);
        assert_eq!(entities.len(), 3);
        assert_eq!(entities[0].state_topic.as_deref(), Some("mealiemate/status/state"));
        let topics: Vec<_> = entities[1..]
            .iter()
            .filter_map(|e| e.command_topic.as_deref())
            .collect();
        assert_eq!(
            topics,
            vec!["mealiemate/system/rediscover/set", "mealiemate/system/reset_sensors/set"]
        );
    }
}
