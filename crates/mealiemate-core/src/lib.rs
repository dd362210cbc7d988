//! Core of the MealieMate plugin coordinator.
//!
//! ```text
//! broker --> Router --> PluginManager --> Plugin task
//!   ^                        |                |
//!   +---- EntityPublisher <--+----------------+
//! ```
//!
//! - [`entity`]: field kinds, topic namespace, discovery schema, publishing.
//! - [`plugin`]: the plugin contract and the static registry.
//! - [`router`]: maps inbound broker messages to actions.
//! - [`manager`]: per-plugin configuration and execution lifecycle.
//! - [`coordinator`]: startup discovery, message intake and housekeeping.
//! - [`services`]: interfaces of the external collaborators plugins call.

pub mod config;
pub mod coordinator;
pub mod entity;
pub mod manager;
pub mod plugin;
pub mod router;
pub mod services;

pub use config::PluginConfig;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use entity::publisher::{EntityPublisher, OutboundMessage, Publisher};
pub use entity::topics::Namespace;
pub use entity::{EntityDescriptor, EntityKind, FieldSpec, FieldValue};
pub use manager::{ExecutionState, PluginManager};
pub use plugin::{LogLevel, Plugin, PluginContext, PluginDescriptor, PluginFactory, PluginRegistry};
pub use router::{InboundMessage, Router, RouterAction};
pub use services::Services;
