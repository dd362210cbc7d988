//! Recipe classification into a fixed tag and category vocabulary.
//!
//! Every recipe with ingredients is sent to the model together with the
//! allowed vocabulary. Answers outside the vocabulary are dropped. The
//! remaining names are mapped onto existing Mealie organizers (case
//! insensitive), missing ones are created, and the recipe is patched.
//! `dry_run` is read live, so it can be flipped while a run is underway.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use mealiemate_core::config::PluginConfig;
use mealiemate_core::entity::FieldSpec;
use mealiemate_core::services::{ChatMessage, CompletionRequest, Organizer, RecipeSummary};
use mealiemate_core::{Plugin, PluginContext, PluginDescriptor, PluginFactory, Services};

use crate::step_percent;

pub const PLUGIN_ID: &str = "recipe_tagger";

/// Allowed tags, grouped for the prompt.
pub const TAG_GROUPS: &[(&str, &[&str])] = &[
    (
        "Main Ingredients",
        &[
            "Red Meat", "Poultry", "Fish", "Seafood", "Eggs", "Dairy", "Legumes", "Grains",
            "Vegetables", "Fruits", "Mushrooms", "Nuts",
        ],
    ),
    (
        "Nutritional Profile",
        &[
            "Normal", "Vegetarian", "Vegan", "High Protein", "Low Carb", "High Fiber",
            "Low-Calorie", "High Fat", "Iron-Rich", "Calcium-Rich", "Vitamin-Packed",
        ],
    ),
    ("Time & Effort", &["Quick", "30 min", "Long-Cooking", "Meal Prep-Friendly"]),
];

pub const CATEGORIES: &[&str] = &[
    "Breakfast", "Lunch", "Dinner", "Snack", "Dessert", "Appetizer", "Side Dish", "Soup",
    "Salad", "Smoothie", "Sauce/Dressing", "Baked Goods",
];

fn is_allowed_tag(tag: &str) -> bool {
    TAG_GROUPS.iter().any(|(_, tags)| tags.contains(&tag))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawClassification {
    tags: Vec<String>,
    category: Option<String>,
}

/// Model answer restricted to the allowed vocabulary.
#[derive(Debug, Default, PartialEq)]
pub struct Classification {
    pub tags: Vec<String>,
    pub category: Option<String>,
    /// Tags and categories the model returned outside the vocabulary.
    pub rejected: Vec<String>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.category.is_none()
    }
}

fn validate(raw: RawClassification) -> Classification {
    let mut result = Classification::default();
    for tag in raw.tags {
        let tag = tag.trim().to_owned();
        if is_allowed_tag(&tag) {
            if !result.tags.contains(&tag) {
                result.tags.push(tag);
            }
        } else {
            result.rejected.push(tag);
        }
    }
    match raw.category.map(|c| c.trim().to_owned()) {
        Some(c) if CATEGORIES.contains(&c.as_str()) => result.category = Some(c),
        Some(c) if !c.is_empty() => result.rejected.push(c),
        _ => {}
    }
    result
}

fn prompt(name: &str, ingredients: &[String]) -> String {
    let mut prompt = format!(
        "You are a recipe classification assistant. Classify the recipe strictly \
         with the allowed tags and categories below and never invent new ones.\n\n\
         Recipe name: {name}\nIngredients: {}\n\nAllowed tags:\n",
        ingredients.join(", ")
    );
    for (group, tags) in TAG_GROUPS {
        prompt.push_str(&format!("- {group}: {}\n", tags.join(", ")));
    }
    prompt.push_str(&format!(
        "\nAllowed categories: {}\n\nAnswer with JSON: \
         {{\"tags\": [\"tag1\", \"tag2\"], \"category\": \"category\"}}",
        CATEGORIES.join(", ")
    ));
    prompt
}

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(PLUGIN_ID, "Recipe Tagger")
        .with_description("Tags and categorises every recipe with the language model.")
        .with_field(FieldSpec::switch("dry_run", "Dry Run", false).live().with_icon("mdi:test-tube"))
        .with_field(FieldSpec::log_sensor("feedback", "Feedback"))
        .with_field(FieldSpec::progress_sensor("progress", "Progress"))
        .with_reset_sensor("feedback")
}

pub struct RecipeTaggerFactory;

impl PluginFactory for RecipeTaggerFactory {
    fn descriptor(&self) -> PluginDescriptor {
        descriptor()
    }

    fn create(&self, _config: &PluginConfig, services: &Services) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(RecipeTagger {
            services: services.clone(),
        }))
    }
}

struct RecipeTagger {
    services: Services,
}

/// Existing organizers by lowercase name.
#[derive(Debug, Default)]
struct Organizers {
    tags: HashMap<String, Organizer>,
    categories: HashMap<String, Organizer>,
}

impl Organizers {
    fn index(items: Vec<Organizer>) -> HashMap<String, Organizer> {
        items
            .into_iter()
            .map(|o| (o.name.to_lowercase(), o))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Updated,
    Skipped,
}

#[derive(Debug, Default)]
struct Stats {
    processed: usize,
    updated: usize,
    skipped: usize,
    errors: usize,
}

impl RecipeTagger {
    async fn classify(&self, name: &str, ingredients: &[String]) -> Result<Classification> {
        let request = CompletionRequest::new(vec![ChatMessage::user(prompt(name, ingredients))]);
        let value = self
            .services
            .llm
            .complete_json(&request)
            .await
            .context("classification failed")?;
        let raw: RawClassification =
            serde_json::from_value(value).context("unexpected classification format")?;
        Ok(validate(raw))
    }

    async fn resolve_tag(&self, organizers: &mut Organizers, name: &str) -> Result<Organizer> {
        if let Some(tag) = organizers.tags.get(&name.to_lowercase()) {
            return Ok(tag.clone());
        }
        let tag = self
            .services
            .recipes
            .create_tag(name)
            .await
            .with_context(|| format!("failed to create tag {name}"))?;
        organizers.tags.insert(name.to_lowercase(), tag.clone());
        Ok(tag)
    }

    async fn resolve_category(&self, organizers: &mut Organizers, name: &str) -> Result<Organizer> {
        if let Some(category) = organizers.categories.get(&name.to_lowercase()) {
            return Ok(category.clone());
        }
        let category = self
            .services
            .recipes
            .create_category(name)
            .await
            .with_context(|| format!("failed to create category {name}"))?;
        organizers
            .categories
            .insert(name.to_lowercase(), category.clone());
        Ok(category)
    }

    async fn tag_recipe(
        &self,
        ctx: &PluginContext,
        organizers: &mut Organizers,
        summary: &RecipeSummary,
    ) -> Result<Outcome> {
        let recipe = self.services.recipes.get_recipe(&summary.slug).await?;
        let ingredients: Vec<String> = recipe
            .recipe_ingredient
            .iter()
            .filter_map(|i| i.text())
            .map(str::to_owned)
            .collect();
        if ingredients.is_empty() {
            ctx.log(&format!("{}: no ingredients, skipping", recipe.name)).await;
            return Ok(Outcome::Skipped);
        }

        ctx.checkpoint()?;
        let classification = self.classify(&recipe.name, &ingredients).await?;
        if !classification.rejected.is_empty() {
            ctx.log(&format!(
                "{}: ignoring unknown labels {}",
                recipe.name,
                classification.rejected.join(", ")
            ))
            .await;
        }
        if classification.is_empty() {
            ctx.log(&format!("{}: no tags or category assigned", recipe.name)).await;
            return Ok(Outcome::Skipped);
        }

        let category_text = classification.category.as_deref().unwrap_or("unchanged");
        if ctx.flag("dry_run") {
            ctx.log(&format!(
                "[dry run] {}: tags {}, category {category_text}",
                recipe.name,
                classification.tags.join(", ")
            ))
            .await;
            return Ok(Outcome::Updated);
        }

        ctx.checkpoint()?;
        let mut tags = Vec::with_capacity(classification.tags.len());
        for name in &classification.tags {
            tags.push(self.resolve_tag(organizers, name).await?);
        }
        let categories = match &classification.category {
            Some(name) => vec![self.resolve_category(organizers, name).await?],
            None => recipe.categories.clone(),
        };
        self.services
            .recipes
            .update_recipe_organizers(&recipe.slug, &tags, &categories)
            .await
            .with_context(|| format!("failed to update {}", recipe.slug))?;
        ctx.log(&format!(
            "{}: tags {}, category {category_text}",
            recipe.name,
            classification.tags.join(", ")
        ))
        .await;
        Ok(Outcome::Updated)
    }
}

#[async_trait]
impl Plugin for RecipeTagger {
    async fn run(&self, ctx: PluginContext) -> Result<()> {
        ctx.progress(0, "Fetching recipes").await;
        let recipes = self
            .services
            .recipes
            .list_recipes()
            .await
            .context("failed to list recipes")?;
        if recipes.is_empty() {
            ctx.log("No recipes found.").await;
            return Ok(());
        }
        ctx.log(&format!("Fetched {} recipes.", recipes.len())).await;

        ctx.checkpoint()?;
        ctx.progress(10, "Loading tags and categories").await;
        let mut organizers = Organizers {
            tags: Organizers::index(
                self.services.recipes.list_tags().await.context("failed to list tags")?,
            ),
            categories: Organizers::index(
                self.services
                    .recipes
                    .list_categories()
                    .await
                    .context("failed to list categories")?,
            ),
        };

        let total = recipes.len();
        let mut stats = Stats::default();
        for (i, summary) in recipes.iter().enumerate() {
            ctx.checkpoint()?;
            ctx.progress(
                step_percent(20, 70, i, total),
                &format!("Processing recipe {}/{total}", i + 1),
            )
            .await;
            match self.tag_recipe(&ctx, &mut organizers, summary).await {
                Ok(Outcome::Updated) => {
                    stats.processed += 1;
                    stats.updated += 1;
                }
                Ok(Outcome::Skipped) => {
                    stats.processed += 1;
                    stats.skipped += 1;
                }
                Err(e) => {
                    // Cancellation inside a recipe ends the whole run.
                    ctx.checkpoint()?;
                    stats.errors += 1;
                    tracing::warn!(plugin_id = PLUGIN_ID, recipe = %summary.slug, error = %format!("{e:#}"), "recipe failed");
                    ctx.log(&format!("Error processing {}: {e:#}", summary.slug)).await;
                }
            }
        }

        ctx.log(&format!(
            "Processed {}/{total} recipes, Updated {}, Skipped {}, Errors {}",
            stats.processed, stats.updated, stats.skipped, stats.errors
        ))
        .await;
        Ok(())
    }
}
