//! Recipe-data service interface and its wire types.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A tag or category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organizer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slug: String,
}

/// Recipe as returned by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeSummary {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<Organizer>,
    #[serde(default, rename = "recipeCategory")]
    pub categories: Vec<Organizer>,
}

/// The food an ingredient line refers to, when the line is parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Food {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub food: Option<Food>,
}

impl Ingredient {
    /// Human-readable line: the service's rendered `display`, else the note.
    pub fn text(&self) -> Option<&str> {
        self.display
            .as_deref()
            .or(self.note.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Name of the parsed food, if any.
    pub fn food_name(&self) -> Option<&str> {
        self.food
            .as_ref()
            .map(|f| f.name.trim())
            .filter(|s| !s.is_empty())
    }
}

/// Full recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub recipe_ingredient: Vec<Ingredient>,
    #[serde(default)]
    pub tags: Vec<Organizer>,
    #[serde(default, rename = "recipeCategory")]
    pub categories: Vec<Organizer>,
}

/// An existing meal-plan entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealPlanEntry {
    #[serde(default)]
    pub id: Option<i64>,
    pub date: NaiveDate,
    pub entry_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub recipe_id: Option<String>,
    #[serde(default)]
    pub recipe: Option<RecipeSummary>,
}

/// A meal-plan entry to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMealPlanEntry {
    pub date: NaiveDate,
    pub entry_type: String,
    pub title: String,
    pub text: String,
    pub recipe_id: Option<String>,
}

/// Recipe retrieval and update, meal plans and shopping lists.
#[async_trait]
pub trait RecipeService: Send + Sync {
    async fn list_recipes(&self) -> Result<Vec<RecipeSummary>>;

    async fn get_recipe(&self, slug: &str) -> Result<Recipe>;

    async fn list_tags(&self) -> Result<Vec<Organizer>>;

    async fn list_categories(&self) -> Result<Vec<Organizer>>;

    async fn create_tag(&self, name: &str) -> Result<Organizer>;

    async fn create_category(&self, name: &str) -> Result<Organizer>;

    /// Replace a recipe's tags and categories.
    async fn update_recipe_organizers(
        &self,
        slug: &str,
        tags: &[Organizer],
        categories: &[Organizer],
    ) -> Result<()>;

    /// Entries dated within `start..=end`.
    async fn get_meal_plan(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<MealPlanEntry>>;

    async fn create_meal_plan_entry(&self, entry: &NewMealPlanEntry) -> Result<()>;

    /// Create a shopping list and return its id.
    async fn create_shopping_list(&self, name: &str) -> Result<String>;

    async fn add_shopping_list_item(&self, list_id: &str, note: &str) -> Result<()>;
}

// Compile-time assertion: RecipeService must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn RecipeService) {}
};
