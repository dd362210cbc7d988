//! Built-in MealieMate plugins.
//!
//! - [`shopping_list`]: consolidates the upcoming meal plan into a Mealie
//!   shopping list.
//! - [`recipe_tagger`]: classifies recipes into tags and a category.
//! - [`meal_planner`]: proposes meals for the unplanned days.
//! - [`ingredient_merger`]: reports foods stored under several names.
//! - [`mealplan_fetcher`]: publishes the upcoming plan as a table.

pub mod ingredient_merger;
pub mod meal_planner;
pub mod mealplan_fetcher;
pub mod recipe_tagger;
pub mod shopping_list;

use mealiemate_core::PluginFactory;

pub use ingredient_merger::IngredientMergerFactory;
pub use meal_planner::MealPlannerFactory;
pub use mealplan_fetcher::MealplanFetcherFactory;
pub use recipe_tagger::RecipeTaggerFactory;
pub use shopping_list::ShoppingListFactory;

/// The static registration table handed to
/// [`PluginRegistry::discover`](mealiemate_core::PluginRegistry::discover).
pub fn builtin_factories() -> Vec<Box<dyn PluginFactory>> {
    vec![
        Box::new(ShoppingListFactory),
        Box::new(RecipeTaggerFactory),
        Box::new(MealPlannerFactory),
        Box::new(IngredientMergerFactory),
        Box::new(MealplanFetcherFactory),
    ]
}

/// Progress within a `base..base + span` band after `done` of `total` steps.
pub(crate) fn step_percent(base: u8, span: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return base.saturating_add(span);
    }
    let step = (usize::from(span) * done.min(total)) / total;
    base.saturating_add(u8::try_from(step).unwrap_or(span))
}

/// Renders a model-provided scalar as text: strings as-is, numbers without
/// quotes, anything else empty.
pub(crate) fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.trim().to_owned(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
