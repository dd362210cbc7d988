//! Meal plan proposals for the days not yet planned.
//!
//! The model sees the recipe catalog, the last two weeks of the plan and
//! the days to fill, and answers with a lunch and a dinner recipe id per
//! day. With `review` on, the proposal is posted to the feedback sensor and
//! nothing is written until the `accept` button is pressed; `reject` drops
//! it. `review` is read live, right before the proposal would be written.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{Days, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;

use mealiemate_core::config::PluginConfig;
use mealiemate_core::entity::{FieldSpec, NumberRange};
use mealiemate_core::services::{
    ChatMessage, CompletionRequest, MealPlanEntry, NewMealPlanEntry, RecipeSummary,
};
use mealiemate_core::{Plugin, PluginContext, PluginDescriptor, PluginFactory, Services};

use crate::step_percent;

pub const PLUGIN_ID: &str = "meal_planner";

pub const DEFAULT_MESSAGE: &str = "Generate a mealplan please.";

const DEFAULT_DAYS: f64 = 7.0;

/// Days of history sent along so recent meals are not repeated.
const HISTORY_DAYS: u64 = 15;

/// Meal slots filled per day, as named in the model's answer.
const SLOTS: [&str; 2] = ["Lunch", "Dinner"];

const SYSTEM_NOTES: &str = "\
You plan healthy, balanced meals. You receive the recipe catalog (id, name, \
tags, categories), the current meal plan and the days to fill. Return only \
a JSON object {\"mealPlan\": {\"YYYY-MM-DD\": {\"Lunch\": \"recipe id\", \
\"Dinner\": \"recipe id\"}}, \"feedback\": \"short summary of the plan\"}. \
Only include the requested days and never change existing meals. Use \
recipe ids exactly as given; every meal must come from the catalog. Keep \
protein, vegetables and carbohydrates balanced each day, avoid the same \
main ingredient on consecutive days and avoid recipes used in the last two \
weeks when possible. Pizza at most once a week, on Friday dinner. Prefer \
salads for dinner. Weekend lunches may be heavier. Follow the user's \
requests when they do not break these rules.";

#[derive(Debug, Serialize)]
struct CatalogEntry<'a> {
    id: &'a str,
    name: &'a str,
    tags: Vec<&'a str>,
    categories: Vec<&'a str>,
}

impl<'a> From<&'a RecipeSummary> for CatalogEntry<'a> {
    fn from(recipe: &'a RecipeSummary) -> Self {
        Self {
            id: &recipe.id,
            name: &recipe.name,
            tags: recipe.tags.iter().map(|t| t.name.as_str()).collect(),
            categories: recipe.categories.iter().map(|c| c.name.as_str()).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Proposal {
    #[serde(rename = "mealPlan")]
    meal_plan: BTreeMap<String, HashMap<String, String>>,
    feedback: String,
}

/// One meal the planner intends to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMeal {
    pub date: NaiveDate,
    /// Lowercase entry type (`lunch` / `dinner`).
    pub entry_type: String,
    pub recipe_id: String,
}

impl PlannedMeal {
    fn is_in(&self, plan: &[MealPlanEntry]) -> bool {
        plan.iter().any(|e| {
            e.date == self.date
                && e.entry_type == self.entry_type
                && e.recipe_id.as_deref() == Some(self.recipe_id.as_str())
        })
    }

    fn to_entry(&self) -> NewMealPlanEntry {
        NewMealPlanEntry {
            date: self.date,
            entry_type: self.entry_type.clone(),
            title: String::new(),
            text: String::new(),
            recipe_id: Some(self.recipe_id.clone()),
        }
    }
}

/// Days to plan: from the day after the later of `latest` and `today`,
/// through `today + days`. Empty when the plan already reaches that far.
pub fn days_to_plan(latest: Option<NaiveDate>, today: NaiveDate, days: u32) -> Vec<NaiveDate> {
    let from = latest.map_or(today, |l| l.max(today));
    let Some(end) = today.checked_add_days(Days::new(u64::from(days))) else {
        return Vec::new();
    };
    from.iter_days().skip(1).take_while(|d| *d <= end).collect()
}

/// Meals proposed for the requested days with known recipes, in date then
/// slot order. Everything else is reported in `dropped`.
fn planned_meals(
    proposal: &Proposal,
    requested: &[NaiveDate],
    catalog: &HashMap<&str, &str>,
    dropped: &mut Vec<String>,
) -> Vec<PlannedMeal> {
    let mut meals = Vec::new();
    for (date_text, slots) in &proposal.meal_plan {
        let Ok(date) = date_text.parse::<NaiveDate>() else {
            dropped.push(format!("invalid date {date_text}"));
            continue;
        };
        if !requested.contains(&date) {
            dropped.push(format!("{date} was not requested"));
            continue;
        }
        for slot in SLOTS {
            let Some(recipe_id) = slots.get(slot).filter(|id| !id.is_empty()) else {
                continue;
            };
            if !catalog.contains_key(recipe_id.as_str()) {
                dropped.push(format!("{date} {slot}: unknown recipe {recipe_id}"));
                continue;
            }
            meals.push(PlannedMeal {
                date,
                entry_type: slot.to_lowercase(),
                recipe_id: recipe_id.clone(),
            });
        }
    }
    meals
}

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(PLUGIN_ID, "Meal Planner")
        .with_description("Fills the unplanned days of the Mealie meal plan.")
        .with_field(
            FieldSpec::number("days", "Days", DEFAULT_DAYS, NumberRange::new(1.0, 14.0, 1.0).with_unit("days"))
                .with_icon("mdi:calendar-range"),
        )
        .with_field(FieldSpec::text("message", "Message", DEFAULT_MESSAGE).with_icon("mdi:message-text"))
        .with_field(FieldSpec::switch("review", "Review Before Saving", true).live())
        .with_field(FieldSpec::button("accept", "Accept Plan").with_icon("mdi:check"))
        .with_field(FieldSpec::button("reject", "Reject Plan").with_icon("mdi:close"))
        .with_field(FieldSpec::log_sensor("feedback", "Feedback"))
        .with_field(FieldSpec::progress_sensor("progress", "Progress"))
        .with_reset_sensor("feedback")
}

pub struct MealPlannerFactory;

impl PluginFactory for MealPlannerFactory {
    fn descriptor(&self) -> PluginDescriptor {
        descriptor()
    }

    fn create(&self, config: &PluginConfig, services: &Services) -> Result<Box<dyn Plugin>> {
        let days = config.number("days").unwrap_or(DEFAULT_DAYS);
        let message = config
            .text("message")
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MESSAGE);
        Ok(Box::new(MealPlanner {
            days: days.round().clamp(1.0, 14.0) as u32,
            message: message.to_owned(),
            services: services.clone(),
        }))
    }
}

struct MealPlanner {
    days: u32,
    message: String,
    services: Services,
}

enum Review {
    Accepted,
    Rejected,
}

impl MealPlanner {
    async fn propose(
        &self,
        recipes: &[RecipeSummary],
        plan: &[MealPlanEntry],
        days: &[NaiveDate],
    ) -> Result<Proposal> {
        let current: Vec<_> = plan
            .iter()
            .map(|e| json!({ "date": e.date, "entryType": e.entry_type, "recipeId": e.recipe_id }))
            .collect();
        let system = json!({
            "days": days,
            "recipesCatalog": recipes.iter().map(CatalogEntry::from).collect::<Vec<_>>(),
            "currentMealPlan": current,
            "notes": SYSTEM_NOTES,
        });
        let request = CompletionRequest::new(vec![
            ChatMessage::system(system.to_string()),
            ChatMessage::user(self.message.clone()),
        ]);
        let value = self
            .services
            .llm
            .complete_json(&request)
            .await
            .context("meal plan generation failed")?;
        serde_json::from_value(value).context("unexpected meal plan format")
    }

    /// Wait for `accept` or `reject`. `None` once the run is cancelled.
    async fn await_review(ctx: &mut PluginContext) -> Option<Review> {
        while let Some(button) = ctx.next_button().await {
            match button.as_str() {
                "accept" => return Some(Review::Accepted),
                "reject" => return Some(Review::Rejected),
                other => tracing::debug!(plugin_id = PLUGIN_ID, button = other, "ignoring button"),
            }
        }
        None
    }
}

#[async_trait]
impl Plugin for MealPlanner {
    async fn run(&self, mut ctx: PluginContext) -> Result<()> {
        ctx.progress(0, "Fetching recipes").await;
        let recipes = self
            .services
            .recipes
            .list_recipes()
            .await
            .context("failed to list recipes")?;
        if recipes.is_empty() {
            bail!("no recipes available to plan with");
        }
        let names: HashMap<&str, &str> = recipes
            .iter()
            .map(|r| (r.id.as_str(), r.name.as_str()))
            .collect();

        ctx.checkpoint()?;
        ctx.progress(10, "Fetching meal plan").await;
        let today = Local::now().date_naive();
        let history_start = today.checked_sub_days(Days::new(HISTORY_DAYS)).unwrap_or(today);
        let horizon = today
            .checked_add_days(Days::new(u64::from(self.days)))
            .unwrap_or(today);
        let plan = self
            .services
            .recipes
            .get_meal_plan(history_start, horizon)
            .await
            .context("failed to fetch meal plan")?;

        let latest = plan.iter().map(|e| e.date).max();
        let days = days_to_plan(latest, today, self.days);
        if days.is_empty() {
            ctx.log("The meal plan already covers the requested days.").await;
            return Ok(());
        }
        ctx.log(&format!("Planning {} days starting {}", days.len(), days[0])).await;

        ctx.checkpoint()?;
        ctx.progress(20, "Asking the model for a plan").await;
        let proposal = self.propose(&recipes, &plan, &days).await?;
        ctx.checkpoint()?;

        if !proposal.feedback.is_empty() {
            ctx.log(&proposal.feedback).await;
        }
        let mut dropped = Vec::new();
        let meals = planned_meals(&proposal, &days, &names, &mut dropped);
        for reason in &dropped {
            ctx.log(&format!("Ignored: {reason}")).await;
        }
        for meal in &meals {
            let name = names.get(meal.recipe_id.as_str()).copied().unwrap_or(meal.recipe_id.as_str());
            ctx.log(&format!("{} {}: {name}", meal.date, meal.entry_type)).await;
        }

        let (existing, new): (Vec<_>, Vec<_>) = meals.into_iter().partition(|m| m.is_in(&plan));
        if new.is_empty() {
            ctx.log("Nothing new to add to the meal plan.").await;
            return Ok(());
        }

        if ctx.flag("review") {
            ctx.progress(50, "Waiting for review").await;
            ctx.log(&format!(
                "Press Accept to save {} meals to Mealie or Reject to discard them.",
                new.len()
            ))
            .await;
            match Self::await_review(&mut ctx).await {
                Some(Review::Accepted) => ctx.log("Plan accepted.").await,
                Some(Review::Rejected) => {
                    ctx.log("Plan rejected, nothing saved.").await;
                    return Ok(());
                }
                None => {
                    ctx.checkpoint()?;
                    return Ok(());
                }
            }
        }

        let total = new.len();
        let mut added = 0;
        for (i, meal) in new.iter().enumerate() {
            ctx.checkpoint()?;
            ctx.progress(step_percent(60, 40, i, total), &format!("Saving meal {}/{total}", i + 1))
                .await;
            match self.services.recipes.create_meal_plan_entry(&meal.to_entry()).await {
                Ok(()) => added += 1,
                Err(e) => {
                    ctx.log(&format!("Could not save {} {}: {e:#}", meal.date, meal.entry_type))
                        .await;
                }
            }
        }

        let unique_days: HashSet<NaiveDate> = new.iter().map(|m| m.date).collect();
        ctx.log(&format!(
            "Added {added} meals over {} days, skipped {} existing.",
            unique_days.len(),
            existing.len()
        ))
        .await;
        tracing::info!(plugin_id = PLUGIN_ID, added, skipped = existing.len(), "meal plan written");
        Ok(())
    }
}
