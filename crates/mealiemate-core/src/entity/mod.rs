//! Entities: the typed values a plugin exposes to the home-automation hub.
//!
//! A plugin declares its configuration surface as a list of [`FieldSpec`]s.
//! The [`schema`] module turns those into [`EntityDescriptor`]s with
//! deterministic topics, and [`publisher::EntityPublisher`] is the single
//! writer of entity state on the broker.

pub mod publisher;
pub mod schema;
pub mod topics;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Entity kind
// ---------------------------------------------------------------------------

/// Kind of an exposed entity. Mirrors the hub's MQTT discovery components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Switch,
    Number,
    Text,
    Button,
    Sensor,
    BinarySensor,
    Image,
}

impl EntityKind {
    /// Discovery component name (the `{component}` segment of the
    /// discovery topic).
    pub fn component(self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::Number => "number",
            Self::Text => "text",
            Self::Button => "button",
            Self::Sensor => "sensor",
            Self::BinarySensor => "binary_sensor",
            Self::Image => "image",
        }
    }

    /// Whether the hub can send commands to entities of this kind.
    pub fn is_controllable(self) -> bool {
        matches!(self, Self::Switch | Self::Number | Self::Text | Self::Button)
    }

    /// Whether entities of this kind hold a configuration value.
    pub fn holds_value(self) -> bool {
        matches!(self, Self::Switch | Self::Number | Self::Text)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.component())
    }
}

impl FromStr for EntityKind {
    type Err = EntityKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "switch" => Ok(Self::Switch),
            "number" => Ok(Self::Number),
            "text" => Ok(Self::Text),
            "button" => Ok(Self::Button),
            "sensor" => Ok(Self::Sensor),
            "binary_sensor" => Ok(Self::BinarySensor),
            "image" => Ok(Self::Image),
            other => Err(EntityKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EntityKind`] string.
#[derive(Debug, Clone)]
pub struct EntityKindParseError(pub String);

impl fmt::Display for EntityKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid entity kind: {:?}", self.0)
    }
}

impl std::error::Error for EntityKindParseError {}

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// Current value of a configurable field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value has the shape a field of `kind` stores.
    pub fn matches_kind(&self, kind: EntityKind) -> bool {
        matches!(
            (self, kind),
            (Self::Bool(_), EntityKind::Switch)
                | (Self::Number(_), EntityKind::Number)
                | (Self::Text(_), EntityKind::Text)
        )
    }

    /// Short name of the value's type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
        }
    }
}

/// Formats the value as a broker payload: `ON`/`OFF`, a decimal number
/// (`3` rather than `3.0` for integral values), or the raw text.
impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => f.write_str(SWITCH_ON),
            Self::Bool(false) => f.write_str(SWITCH_OFF),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Switch payload for "on".
pub const SWITCH_ON: &str = "ON";
/// Switch payload for "off".
pub const SWITCH_OFF: &str = "OFF";

// ---------------------------------------------------------------------------
// Field specs
// ---------------------------------------------------------------------------

/// Numeric bounds of a `number` field.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub unit: Option<String>,
}

impl NumberRange {
    pub fn new(min: f64, max: f64, step: f64) -> Self {
        Self {
            min,
            max,
            step,
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// A range is usable when its bounds are finite, ordered, and the step
    /// is positive.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite()
            && self.max.is_finite()
            && self.min <= self.max
            && self.step.is_finite()
            && self.step > 0.0
    }
}

/// How a `sensor` field renders its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorStyle {
    /// Timestamp state plus an accumulated `full_text` attribute.
    Log,
    /// Percentage state plus an `activity` attribute.
    Progress,
}

/// Default maximum length of text fields, matching the hub's own limit.
pub const DEFAULT_TEXT_MAX: usize = 255;

/// Declaration of a single field of a plugin's entity surface.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    pub default: Option<FieldValue>,
    pub range: Option<NumberRange>,
    pub max_length: Option<usize>,
    pub sensor_style: Option<SensorStyle>,
    /// Whether a running execution observes updates to this field.
    /// Updates to non-live fields apply to the next run.
    pub live: bool,
    pub icon: Option<String>,
}

impl FieldSpec {
    fn bare(id: &str, name: &str, kind: EntityKind) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            kind,
            default: None,
            range: None,
            max_length: None,
            sensor_style: None,
            live: false,
            icon: None,
        }
    }

    pub fn switch(id: &str, name: &str, default: bool) -> Self {
        Self {
            default: Some(FieldValue::Bool(default)),
            ..Self::bare(id, name, EntityKind::Switch)
        }
    }

    pub fn number(id: &str, name: &str, default: f64, range: NumberRange) -> Self {
        Self {
            default: Some(FieldValue::Number(default)),
            range: Some(range),
            ..Self::bare(id, name, EntityKind::Number)
        }
    }

    pub fn text(id: &str, name: &str, default: &str) -> Self {
        Self {
            default: Some(FieldValue::Text(default.to_owned())),
            max_length: Some(DEFAULT_TEXT_MAX),
            ..Self::bare(id, name, EntityKind::Text)
        }
    }

    pub fn button(id: &str, name: &str) -> Self {
        Self::bare(id, name, EntityKind::Button)
    }

    pub fn log_sensor(id: &str, name: &str) -> Self {
        Self {
            sensor_style: Some(SensorStyle::Log),
            ..Self::bare(id, name, EntityKind::Sensor)
        }
    }

    pub fn progress_sensor(id: &str, name: &str) -> Self {
        Self {
            sensor_style: Some(SensorStyle::Progress),
            ..Self::bare(id, name, EntityKind::Sensor)
        }
    }

    pub fn binary_sensor(id: &str, name: &str) -> Self {
        Self::bare(id, name, EntityKind::BinarySensor)
    }

    pub fn image(id: &str, name: &str) -> Self {
        Self::bare(id, name, EntityKind::Image)
    }

    /// Mark the field as observable by a running execution.
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    pub fn with_icon(mut self, icon: &str) -> Self {
        self.icon = Some(icon.to_owned());
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

// ---------------------------------------------------------------------------
// Entity descriptors
// ---------------------------------------------------------------------------

/// A fully resolved entity: topics, discovery payload and initial value.
///
/// Produced by [`schema::build_entities`]; every topic is a pure function of
/// `(plugin_id, field_id, kind)` and the [`topics::Namespace`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    pub kind: EntityKind,
    pub plugin_id: String,
    pub field_id: String,
    pub unique_id: String,
    pub name: String,
    pub state_topic: Option<String>,
    pub command_topic: Option<String>,
    pub attributes_topic: Option<String>,
    pub image_topic: Option<String>,
    pub discovery_topic: String,
    pub discovery: serde_json::Value,
    /// Initial value published alongside discovery.
    pub value: Option<FieldValue>,
}
