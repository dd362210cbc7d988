//! Shopping list generation from the upcoming meal plan.
//!
//! Collects the ingredient lines of every planned recipe in the window,
//! asks the model to merge them into package-sized items grouped by aisle,
//! then writes the result as a new Mealie shopping list.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{Days, Local, NaiveDate};
use serde::Deserialize;
use serde_json::json;

use mealiemate_core::config::PluginConfig;
use mealiemate_core::entity::{FieldSpec, NumberRange};
use mealiemate_core::services::{ChatMessage, CompletionRequest, MealPlanEntry};
use mealiemate_core::{Plugin, PluginContext, PluginDescriptor, PluginFactory, Services};

use crate::{scalar_text, step_percent};

pub const PLUGIN_ID: &str = "shopping_list";

const DEFAULT_DAYS: f64 = 7.0;

const SYSTEM_PROMPT: &str = "\
You are a grocery shopping assistant. You receive a JSON object whose \
`ingredients` array lists every ingredient line of the planned recipes. \
Merge duplicates and similar items, add up their quantities and round them \
to realistic package sizes (1 L milk, 500 g flour, 12 eggs). Assign every \
item one category out of: Dairy, Meats, Fish, Spices, Condiments, Nuts, \
Vegetables, Fruits, Grains & Baking, Canned & Packaged Goods, Oils & Liquids, \
Other. Keep at least one item per distinct ingredient. Answer with a JSON \
object {\"shopping_list\": [{\"name\", \"quantity\", \"unit\", \"category\", \
\"merged_items\": [original lines]}], \"feedback\": [strings]} and use \
`feedback` to flag missing quantities, items put under Other and unusual \
merges.";

/// One consolidated item as returned by the model.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShoppingItem {
    pub name: String,
    pub quantity: serde_json::Value,
    pub unit: serde_json::Value,
    pub category: String,
    pub merged_items: Vec<String>,
}

impl ShoppingItem {
    /// The note written to Mealie: `"{quantity} {unit} {name}"` without
    /// empty parts.
    pub fn note(&self) -> String {
        [scalar_text(&self.quantity), scalar_text(&self.unit), self.name.trim().to_owned()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Consolidated {
    shopping_list: Vec<ShoppingItem>,
    feedback: Vec<String>,
}

/// First and last day of the shopping window. Starts tomorrow unless
/// `include_today` is set, and always ends `days` days from today.
pub fn shopping_window(today: NaiveDate, days: u32, include_today: bool) -> (NaiveDate, NaiveDate) {
    let end = today
        .checked_add_days(Days::new(u64::from(days.max(1))))
        .unwrap_or(today);
    let start = if include_today {
        today
    } else {
        today.succ_opt().unwrap_or(today)
    };
    (start, end)
}

/// Recipe references of the planned entries, in plan order. Entries
/// without a recipe (notes, free text) are skipped; a recipe planned twice
/// is listed twice.
fn planned_recipes(plan: &[MealPlanEntry]) -> Vec<String> {
    plan.iter()
        .filter_map(|entry| {
            entry
                .recipe
                .as_ref()
                .map(|r| r.slug.clone())
                .or_else(|| entry.recipe_id.clone())
        })
        .collect()
}

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(PLUGIN_ID, "Shopping List")
        .with_description("Builds a Mealie shopping list from the upcoming meal plan.")
        .with_field(
            FieldSpec::number("days", "Days", DEFAULT_DAYS, NumberRange::new(1.0, 30.0, 1.0).with_unit("days"))
                .with_icon("mdi:calendar-range"),
        )
        .with_field(FieldSpec::switch("include_today", "Include Today", false))
        .with_field(FieldSpec::log_sensor("feedback", "Feedback"))
        .with_field(FieldSpec::progress_sensor("progress", "Progress"))
        .with_reset_sensor("feedback")
}

pub struct ShoppingListFactory;

impl PluginFactory for ShoppingListFactory {
    fn descriptor(&self) -> PluginDescriptor {
        descriptor()
    }

    fn create(&self, config: &PluginConfig, services: &Services) -> Result<Box<dyn Plugin>> {
        let days = config.number("days").unwrap_or(DEFAULT_DAYS);
        Ok(Box::new(ShoppingList {
            days: days.round().clamp(1.0, 30.0) as u32,
            include_today: config.bool("include_today").unwrap_or(false),
            services: services.clone(),
        }))
    }
}

struct ShoppingList {
    days: u32,
    include_today: bool,
    services: Services,
}

impl ShoppingList {
    async fn collect_ingredients(&self, ctx: &PluginContext, recipes: &[String]) -> Result<Vec<String>> {
        let mut ingredients = Vec::new();
        for (i, slug) in recipes.iter().enumerate() {
            ctx.checkpoint()?;
            ctx.progress(
                step_percent(10, 40, i, recipes.len()),
                &format!("Reading recipe {}/{}", i + 1, recipes.len()),
            )
            .await;
            match self.services.recipes.get_recipe(slug).await {
                Ok(recipe) => ingredients.extend(
                    recipe
                        .recipe_ingredient
                        .iter()
                        .filter_map(|ingredient| ingredient.text())
                        .map(str::to_owned),
                ),
                Err(e) => {
                    tracing::warn!(plugin_id = PLUGIN_ID, recipe = %slug, error = %format!("{e:#}"), "recipe unavailable");
                    ctx.log(&format!("Could not fetch recipe {slug}: {e:#}")).await;
                }
            }
        }
        ingredients.sort();
        Ok(ingredients)
    }

    async fn consolidate(&self, ingredients: &[String]) -> Result<Consolidated> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(json!({ "ingredients": ingredients }).to_string()),
        ])
        .with_temperature(0.0);
        let value = self
            .services
            .llm
            .complete_json(&request)
            .await
            .context("failed to consolidate ingredients")?;
        serde_json::from_value(value).context("unexpected shopping list format")
    }
}

#[async_trait]
impl Plugin for ShoppingList {
    async fn run(&self, ctx: PluginContext) -> Result<()> {
        ctx.progress(0, "Reading meal plan").await;
        let today = Local::now().date_naive();
        let (start, end) = shopping_window(today, self.days, self.include_today);
        ctx.log(&format!("Building shopping list for {start} to {end}")).await;

        let plan = self
            .services
            .recipes
            .get_meal_plan(start, end)
            .await
            .context("failed to fetch meal plan")?;
        ctx.checkpoint()?;

        let recipes = planned_recipes(&plan);
        if recipes.is_empty() {
            ctx.log("No recipes planned in this window, nothing to buy.").await;
            return Ok(());
        }

        let ingredients = self.collect_ingredients(&ctx, &recipes).await?;
        if ingredients.is_empty() {
            ctx.log("Planned recipes have no ingredients, nothing to buy.").await;
            return Ok(());
        }

        ctx.progress(50, "Consolidating ingredients").await;
        let consolidated = self.consolidate(&ingredients).await?;
        ctx.checkpoint()?;

        ctx.log(&format!(
            "Shopping list consolidated from {} to {} items.",
            ingredients.len(),
            consolidated.shopping_list.len()
        ))
        .await;
        for item in &consolidated.shopping_list {
            let mut line = format!("{} ({})", item.note(), item.category);
            if !item.merged_items.is_empty() {
                line.push_str(&format!(" <- {}", item.merged_items.join(", ")));
            }
            ctx.log(&line).await;
        }
        for issue in &consolidated.feedback {
            ctx.log(&format!("Note: {issue}")).await;
        }
        if consolidated.shopping_list.is_empty() {
            bail!("model returned an empty shopping list");
        }

        ctx.progress(70, "Creating shopping list").await;
        let name = format!("Mealplan {}", today.format("%d %b"));
        let list_id = self
            .services
            .recipes
            .create_shopping_list(&name)
            .await
            .context("failed to create shopping list")?;

        let total = consolidated.shopping_list.len();
        let mut failed = 0;
        for (i, item) in consolidated.shopping_list.iter().enumerate() {
            ctx.checkpoint()?;
            ctx.progress(step_percent(70, 30, i, total), &format!("Adding item {}/{total}", i + 1))
                .await;
            if let Err(e) = self
                .services
                .recipes
                .add_shopping_list_item(&list_id, &item.note())
                .await
            {
                failed += 1;
                ctx.log(&format!("Could not add {}: {e:#}", item.note())).await;
            }
        }

        ctx.log(&format!("Created shopping list {name} with {} items.", total - failed)).await;
        tracing::info!(plugin_id = PLUGIN_ID, list = %name, items = total - failed, failed, "shopping list written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn window_starts_tomorrow_by_default() {
        assert_eq!(
            shopping_window(day(2025, 2, 27), 3, false),
            (day(2025, 2, 28), day(2025, 3, 2))
        );
        assert_eq!(
            shopping_window(day(2025, 2, 27), 3, true),
            (day(2025, 2, 27), day(2025, 3, 2))
        );
    }

    #[test]
    fn window_is_at_least_one_day() {
        assert_eq!(
            shopping_window(day(2025, 1, 1), 0, false),
            (day(2025, 1, 2), day(2025, 1, 2))
        );
    }

    #[test]
    fn note_skips_empty_parts() {
        let item: ShoppingItem = serde_json::from_value(json!({
            "name": "Onions", "quantity": 3, "unit": "", "category": "Vegetables"
        }))
        .unwrap();
        assert_eq!(item.note(), "3 Onions");

        let item: ShoppingItem = serde_json::from_value(json!({
            "name": "Milk", "quantity": "1", "unit": "L"
        }))
        .unwrap();
        assert_eq!(item.note(), "1 L Milk");
    }

    #[test]
    fn descriptor_declares_window_fields() {
        let descriptor = descriptor();
        assert_eq!(descriptor.field("days").unwrap().range.as_ref().unwrap().max, 30.0);
        assert!(descriptor.field("include_today").is_some());
        assert_eq!(descriptor.reset_sensors, ["feedback"]);
        assert!(descriptor.progress_sensor().is_some());
    }
}
