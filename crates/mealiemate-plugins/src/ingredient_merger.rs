//! Duplicate food detection across the recipe catalog.
//!
//! Reads the parsed food of every ingredient line, sends the distinct
//! names to the model in batches and collects the sets it considers the
//! same food under different names. Nothing is written back to Mealie;
//! the merge suggestions are published as a markdown report on the
//! `results` sensor.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use mealiemate_core::config::PluginConfig;
use mealiemate_core::entity::{FieldSpec, NumberRange};
use mealiemate_core::services::{ChatMessage, CompletionRequest};
use mealiemate_core::{Plugin, PluginContext, PluginDescriptor, PluginFactory, Services};

use crate::step_percent;

pub const PLUGIN_ID: &str = "ingredient_merger";

const DEFAULT_BATCH_SIZE: f64 = 50.0;

const PROMPT: &str = "\
You are a culinary expert reviewing the foods used across a recipe \
collection. Find foods that are EXACTLY the same thing under different \
names, such as 'heavy cream' and 'cream 15% fat', 'parmesan' and \
'parmigiano', or 'scallion' and 'green onion'. Never merge different forms \
(garlic cloves and garlic powder), preparations (fresh and sun-dried \
tomatoes), parts (lemon juice and lemon zest), varieties (red and green \
bell pepper), or a general food with a specific variety (onion and yellow \
onion). Answer with a JSON object {\"merge_suggestions\": [{\"ingredients\": \
[names from the list], \"recommended_name\": \"standard name\", \"reason\": \
\"short explanation\"}]} and an empty array when nothing should be merged.";

/// One set of foods the model wants merged.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MergeSuggestion {
    pub ingredients: Vec<String>,
    pub recommended_name: String,
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MergeAnswer {
    merge_suggestions: Vec<MergeSuggestion>,
}

/// Distinct parsed foods of one recipe.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipeFoods {
    pub slug: String,
    pub name: String,
    pub foods: BTreeSet<String>,
}

/// A checked suggestion with the recipes that use its foods.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    pub suggestion: MergeSuggestion,
    /// `(recipe name, foods of the suggestion it uses)`.
    pub recipes: Vec<(String, Vec<String>)>,
}

/// All distinct foods, sorted.
pub fn unique_foods(catalog: &[RecipeFoods]) -> Vec<String> {
    catalog
        .iter()
        .flat_map(|r| r.foods.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Keeps the suggestion's foods that appear in `batch`, deduplicated.
/// Returns `None` when fewer than two remain, since there is nothing left
/// to merge.
pub fn check_suggestion(mut suggestion: MergeSuggestion, batch: &[String]) -> Option<MergeSuggestion> {
    let mut seen = BTreeSet::new();
    suggestion
        .ingredients
        .retain(|food| batch.contains(food) && seen.insert(food.clone()));
    (suggestion.ingredients.len() >= 2).then_some(suggestion)
}

/// Attach the recipes that use any food of `suggestion`.
pub fn locate(suggestion: MergeSuggestion, catalog: &[RecipeFoods]) -> Merge {
    let recipes = catalog
        .iter()
        .filter_map(|recipe| {
            let used: Vec<String> = suggestion
                .ingredients
                .iter()
                .filter(|food| recipe.foods.contains(*food))
                .cloned()
                .collect();
            (!used.is_empty()).then(|| (recipe.name.clone(), used))
        })
        .collect();
    Merge { suggestion, recipes }
}

/// Markdown report of all merges.
pub fn render_report(merges: &[Merge]) -> String {
    let mut out = vec![
        "## Ingredient Merger Results".to_owned(),
        String::new(),
        format!("Found **{}** sets of ingredients that should be merged.", merges.len()),
        String::new(),
    ];
    for (i, merge) in merges.iter().enumerate() {
        let s = &merge.suggestion;
        out.push(format!("### {}. Merge: {}", i + 1, s.ingredients.join(", ")));
        out.push(format!("**Recommended name:** {}", s.recommended_name));
        out.push(format!("**Reason:** {}", s.reason));
        if !merge.recipes.is_empty() {
            out.push(String::new());
            out.push(format!("**Found in {} recipes:**", merge.recipes.len()));
            for (name, used) in &merge.recipes {
                out.push(format!("- {name} (uses: {})", used.join(", ")));
            }
        }
        out.push(String::new());
        out.push("---".to_owned());
        out.push(String::new());
    }
    out.join("\n")
}

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(PLUGIN_ID, "Ingredient Merger")
        .with_description("Finds foods that appear under different names across recipes.")
        .with_field(
            FieldSpec::number(
                "batch_size",
                "Batch Size",
                DEFAULT_BATCH_SIZE,
                NumberRange::new(10.0, 200.0, 10.0),
            )
            .with_icon("mdi:format-list-numbered"),
        )
        .with_field(FieldSpec::log_sensor("feedback", "Merger Feedback"))
        .with_field(FieldSpec::log_sensor("results", "Merge Suggestions"))
        .with_field(FieldSpec::progress_sensor("progress", "Progress"))
        .with_reset_sensor("feedback")
        .with_reset_sensor("results")
}

pub struct IngredientMergerFactory;

impl PluginFactory for IngredientMergerFactory {
    fn descriptor(&self) -> PluginDescriptor {
        descriptor()
    }

    fn create(&self, config: &PluginConfig, services: &Services) -> Result<Box<dyn Plugin>> {
        let batch_size = config.number("batch_size").unwrap_or(DEFAULT_BATCH_SIZE);
        Ok(Box::new(IngredientMerger {
            batch_size: batch_size.round().clamp(10.0, 200.0) as usize,
            services: services.clone(),
        }))
    }
}

struct IngredientMerger {
    batch_size: usize,
    services: Services,
}

impl IngredientMerger {
    async fn read_catalog(&self, ctx: &PluginContext) -> Result<Option<Vec<RecipeFoods>>> {
        let recipes = self
            .services
            .recipes
            .list_recipes()
            .await
            .context("failed to list recipes")?;
        if recipes.is_empty() {
            ctx.warning("No recipes found.").await;
            return Ok(None);
        }
        ctx.success(&format!("Fetched {} recipes.", recipes.len())).await;

        let mut catalog = Vec::new();
        for (i, summary) in recipes.iter().enumerate() {
            ctx.checkpoint()?;
            ctx.progress(
                step_percent(0, 40, i, recipes.len()),
                &format!("Reading recipe {}/{}", i + 1, recipes.len()),
            )
            .await;
            let recipe = match self.services.recipes.get_recipe(&summary.slug).await {
                Ok(recipe) => recipe,
                Err(e) => {
                    ctx.warning(&format!("Could not fetch recipe {}: {e:#}", summary.slug)).await;
                    continue;
                }
            };
            let foods: BTreeSet<String> = recipe
                .recipe_ingredient
                .iter()
                .filter_map(|ingredient| ingredient.food_name())
                .map(str::to_owned)
                .collect();
            if !foods.is_empty() {
                catalog.push(RecipeFoods {
                    slug: recipe.slug,
                    name: recipe.name,
                    foods,
                });
            }
        }
        Ok(Some(catalog))
    }

    async fn analyze_batch(&self, batch: &[String]) -> Result<Vec<MergeSuggestion>> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(PROMPT),
            ChatMessage::user(format!("Foods: {}", batch.join(", "))),
        ])
        .with_temperature(0.1);
        let value = self
            .services
            .llm
            .complete_json(&request)
            .await
            .context("merge analysis failed")?;
        let answer: MergeAnswer =
            serde_json::from_value(value).context("unexpected merge suggestion format")?;
        Ok(answer
            .merge_suggestions
            .into_iter()
            .filter_map(|s| check_suggestion(s, batch))
            .collect())
    }
}

#[async_trait]
impl Plugin for IngredientMerger {
    async fn run(&self, ctx: PluginContext) -> Result<()> {
        ctx.progress(0, "Fetching recipes").await;
        let Some(catalog) = self.read_catalog(&ctx).await? else {
            return Ok(());
        };

        let foods = unique_foods(&catalog);
        if foods.is_empty() {
            ctx.warning("No parsed ingredients to compare.").await;
            return Ok(());
        }
        ctx.log(&format!("Found {} unique ingredients across all recipes", foods.len()))
            .await;

        let batches: Vec<&[String]> = foods.chunks(self.batch_size.max(1)).collect();
        let mut suggestions = Vec::new();
        for (i, batch) in batches.iter().enumerate() {
            ctx.checkpoint()?;
            let number = i + 1;
            ctx.progress(
                step_percent(40, 55, i, batches.len()),
                &format!("Analyzing batch {number}/{}", batches.len()),
            )
            .await;
            ctx.log(&format!(
                "Processing batch {number}/{} ({} ingredients)",
                batches.len(),
                batch.len()
            ))
            .await;

            let found = self.analyze_batch(batch).await?;
            if found.is_empty() {
                ctx.log(&format!("No merge suggestions found in batch {number}")).await;
            } else {
                ctx.success(&format!("Found {} merge suggestions in batch {number}", found.len()))
                    .await;
            }
            suggestions.extend(found);
        }

        if suggestions.is_empty() {
            ctx.log("No ingredients found that should be merged.").await;
            return Ok(());
        }

        let merges: Vec<Merge> = suggestions
            .into_iter()
            .map(|s| locate(s, &catalog))
            .collect();
        ctx.success(&format!(
            "Found {} sets of ingredients that should be merged",
            merges.len()
        ))
        .await;
        for merge in &merges {
            ctx.decision(&format!(
                "Merge: {} -> {}",
                merge.suggestion.ingredients.join(", "),
                merge.suggestion.recommended_name
            ))
            .await;
        }
        ctx.log_to("results", &render_report(&merges)).await;
        tracing::info!(plugin_id = PLUGIN_ID, merges = merges.len(), "merge analysis finished");
        Ok(())
    }
}
