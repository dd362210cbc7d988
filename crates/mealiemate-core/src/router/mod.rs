//! Message router: inbound broker messages to [`RouterAction`]s.
//!
//! Routing is a pure function of the message and the registry snapshot.
//! The router never performs I/O; the coordinator applies the action.
//! Retained messages replayed at startup take exactly the same path as
//! live ones. The hub birth message is the exception: only a live
//! `online` republishes discovery.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::entity::topics::{MAIN_SWITCH, Namespace, SYSTEM_SEGMENT, TopicPath};
use crate::entity::{EntityKind, FieldSpec, FieldValue, SWITCH_OFF, SWITCH_ON};
use crate::plugin::PluginRegistry;

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained: false,
        }
    }

    pub fn retained(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            retained: true,
            ..Self::new(topic, payload)
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Commands addressed to the coordinator rather than a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    /// Republish every discovery config.
    Rediscover,
    /// Run the scheduled sensor sweep now.
    ResetSensors,
}

impl fmt::Display for SystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Rediscover => "rediscover",
            Self::ResetSensors => "reset_sensors",
        };
        f.write_str(s)
    }
}

impl FromStr for SystemCommand {
    type Err = SystemCommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rediscover" => Ok(Self::Rediscover),
            "reset_sensors" => Ok(Self::ResetSensors),
            other => Err(SystemCommandParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SystemCommand`] string.
#[derive(Debug, Clone)]
pub struct SystemCommandParseError(pub String);

impl fmt::Display for SystemCommandParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid system command: {:?}", self.0)
    }
}

impl std::error::Error for SystemCommandParseError {}

/// Outcome of routing one message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterAction {
    UpdateConfig {
        plugin_id: String,
        field_id: String,
        value: FieldValue,
    },
    SetEnabled {
        plugin_id: String,
        enabled: bool,
    },
    TriggerButton {
        plugin_id: String,
        field_id: String,
    },
    SystemCommand(SystemCommand),
    /// Logged and dropped; never fatal.
    Unroutable(UnroutableReason),
}

/// Why a message could not be routed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnroutableReason {
    #[error("topic is outside the command namespace")]
    OutsideNamespace,

    #[error("unknown plugin {0:?}")]
    UnknownPlugin(String),

    #[error("plugin {plugin} has no field {field:?}")]
    UnknownField { plugin: String, field: String },

    #[error("{kind} {plugin}/{field} is read-only")]
    ReadOnly {
        plugin: String,
        field: String,
        kind: EntityKind,
    },

    #[error("unknown system command {0:?}")]
    UnknownSystemCommand(String),

    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("invalid payload {payload:?} for {plugin}/{field}: {detail}")]
    InvalidPayload {
        plugin: String,
        field: String,
        payload: String,
        detail: String,
    },

    #[error("hub status {0:?} needs no action")]
    HubStatus(String),
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Maps messages to actions against a fixed registry.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<PluginRegistry>,
    namespace: Namespace,
}

impl Router {
    pub fn new(registry: Arc<PluginRegistry>, namespace: Namespace) -> Self {
        Self {
            registry,
            namespace,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Route one message.
    pub fn route(&self, message: &InboundMessage) -> RouterAction {
        match self.try_route(message) {
            Ok(action) => action,
            Err(reason) => RouterAction::Unroutable(reason),
        }
    }

    fn try_route(&self, message: &InboundMessage) -> Result<RouterAction, UnroutableReason> {
        let (owner, leaf) = match self.namespace.parse(&message.topic) {
            Some(TopicPath::Command { owner, leaf }) => (owner, leaf),
            Some(TopicPath::HubStatus) => {
                let status = payload_str(message)?.trim();
                // A retained birth message is redelivered on every subscribe,
                // right after startup discovery went out.
                return if status == "online" && !message.retained {
                    Ok(RouterAction::SystemCommand(SystemCommand::Rediscover))
                } else {
                    Err(UnroutableReason::HubStatus(status.to_owned()))
                };
            }
            None => return Err(UnroutableReason::OutsideNamespace),
        };

        if owner == SYSTEM_SEGMENT {
            return leaf
                .parse()
                .map(RouterAction::SystemCommand)
                .map_err(|_| UnroutableReason::UnknownSystemCommand(leaf.to_owned()));
        }

        let descriptor = self
            .registry
            .descriptor(owner)
            .ok_or_else(|| UnroutableReason::UnknownPlugin(owner.to_owned()))?;
        let plugin_id = descriptor.id.clone();
        let field_id = leaf.to_owned();

        if leaf == MAIN_SWITCH {
            let enabled = parse_switch(payload_str(message)?).ok_or_else(|| {
                invalid(&plugin_id, &field_id, message, "expected ON or OFF".into())
            })?;
            return Ok(RouterAction::SetEnabled { plugin_id, enabled });
        }

        let field = descriptor
            .field(leaf)
            .ok_or_else(|| UnroutableReason::UnknownField {
                plugin: plugin_id.clone(),
                field: field_id.clone(),
            })?;

        if field.kind == EntityKind::Button {
            return Ok(RouterAction::TriggerButton {
                plugin_id,
                field_id,
            });
        }
        if !field.kind.holds_value() {
            return Err(UnroutableReason::ReadOnly {
                plugin: plugin_id,
                field: field_id,
                kind: field.kind,
            });
        }

        let payload = payload_str(message)?;
        let value = parse_value(field, payload)
            .map_err(|detail| invalid(&plugin_id, &field_id, message, detail))?;
        Ok(RouterAction::UpdateConfig {
            plugin_id,
            field_id,
            value,
        })
    }
}

fn payload_str(message: &InboundMessage) -> Result<&str, UnroutableReason> {
    std::str::from_utf8(&message.payload).map_err(|_| UnroutableReason::NotUtf8)
}

fn invalid(plugin: &str, field: &str, message: &InboundMessage, detail: String) -> UnroutableReason {
    UnroutableReason::InvalidPayload {
        plugin: plugin.to_owned(),
        field: field.to_owned(),
        payload: String::from_utf8_lossy(&message.payload).into_owned(),
        detail,
    }
}

fn parse_switch(payload: &str) -> Option<bool> {
    match payload {
        SWITCH_ON => Some(true),
        SWITCH_OFF => Some(false),
        _ => None,
    }
}

/// Interpret a payload according to the field's kind.
fn parse_value(field: &FieldSpec, payload: &str) -> Result<FieldValue, String> {
    match field.kind {
        EntityKind::Switch => parse_switch(payload)
            .map(FieldValue::Bool)
            .ok_or_else(|| "expected ON or OFF".to_owned()),
        EntityKind::Number => {
            let n: f64 = payload
                .trim()
                .parse()
                .map_err(|_| "not a number".to_owned())?;
            if !n.is_finite() {
                return Err("not a finite number".to_owned());
            }
            if let Some(range) = &field.range {
                if !range.contains(n) {
                    return Err(format!("outside range {}..={}", range.min, range.max));
                }
            }
            Ok(FieldValue::Number(n))
        }
        EntityKind::Text => {
            if let Some(max) = field.max_length {
                if payload.chars().count() > max {
                    return Err(format!("longer than {max} characters"));
                }
            }
            Ok(FieldValue::Text(payload.to_owned()))
        }
        kind => Err(format!("{kind} fields take no value")),
    }
}
