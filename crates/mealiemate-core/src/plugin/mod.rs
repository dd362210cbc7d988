//! Plugin contract and registry.
//!
//! ```text
//! PluginRegistry --get("shopping_list")--> &dyn PluginFactory
//!     |                                        |
//!     |   descriptor() --> PluginDescriptor    |
//!     |   create(config, services) ------------+
//!     |        |
//!     |        v
//!     |   Box<dyn Plugin> --run(PluginContext)--> Result<()>
//! ```

pub mod context;
pub mod registry;
pub mod trait_def;

pub use context::{Cancelled, LogLevel, PluginContext};
pub use registry::{PluginRegistry, RegistryError};
pub use trait_def::{Plugin, PluginDescriptor, PluginFactory};
