//! Concrete collaborators for the MealieMate core: the MQTT broker bridge
//! and the HTTP clients behind [`RecipeService`] and [`LanguageModel`].
//!
//! [`RecipeService`]: mealiemate_core::services::RecipeService
//! [`LanguageModel`]: mealiemate_core::services::LanguageModel

pub mod config;
pub mod error;
pub mod mealie;
pub mod mqtt;
pub mod openai;

pub use config::{LlmConfig, MealieConfig, MqttConfig};
pub use error::HttpStatusError;
pub use mealie::MealieClient;
pub use mqtt::{MqttListener, MqttPublisher};
pub use openai::OpenAiClient;
