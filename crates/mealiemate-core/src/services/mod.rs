//! External collaborators injected into plugins.
//!
//! The core treats both services as opaque: their failures are ordinary
//! plugin-level errors. Concrete HTTP clients live in `mealiemate-clients`.

pub mod llm;
pub mod recipes;

use std::sync::Arc;

pub use llm::{ChatMessage, ChatRole, CompletionRequest, LanguageModel};
pub use recipes::{
    Food, Ingredient, MealPlanEntry, NewMealPlanEntry, Organizer, Recipe, RecipeService, RecipeSummary,
};

/// Collaborators handed to every plugin instance.
#[derive(Clone)]
pub struct Services {
    pub recipes: Arc<dyn RecipeService>,
    pub llm: Arc<dyn LanguageModel>,
}

impl Services {
    pub fn new(recipes: Arc<dyn RecipeService>, llm: Arc<dyn LanguageModel>) -> Self {
        Self { recipes, llm }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
