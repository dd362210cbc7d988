//! Upcoming meal plan as a markdown table on the `mealplan` sensor.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};

use mealiemate_core::config::PluginConfig;
use mealiemate_core::entity::{FieldSpec, NumberRange};
use mealiemate_core::services::MealPlanEntry;
use mealiemate_core::{Plugin, PluginContext, PluginDescriptor, PluginFactory, Services};

pub const PLUGIN_ID: &str = "mealplan_fetcher";

const DEFAULT_DAYS: f64 = 7.0;

const EMPTY_SLOT: &str = "-";

/// Days shown in the table: `days` consecutive days starting today or
/// tomorrow.
pub fn table_days(today: NaiveDate, days: u32, include_today: bool) -> Vec<NaiveDate> {
    let start = if include_today {
        Some(today)
    } else {
        today.succ_opt()
    };
    start
        .into_iter()
        .flat_map(|start| start.iter_days())
        .take(days.max(1) as usize)
        .collect()
}

fn meal_link(entry: &MealPlanEntry, base_url: &str) -> Option<String> {
    match &entry.recipe {
        Some(recipe) if !base_url.is_empty() && !recipe.slug.is_empty() => Some(format!(
            "[{}]({base_url}/g/home/r/{})",
            recipe.name, recipe.slug
        )),
        Some(recipe) => Some(recipe.name.clone()),
        None => entry.title.clone().filter(|t| !t.trim().is_empty()),
    }
}

/// Markdown table with a lunch and a dinner column per day. Recipes link
/// into Mealie when `base_url` is set.
pub fn render_table(days: &[NaiveDate], plan: &[MealPlanEntry], base_url: &str) -> String {
    let base_url = base_url.trim().trim_end_matches('/');
    let mut slots: BTreeMap<(NaiveDate, String), Vec<String>> = BTreeMap::new();
    for entry in plan {
        if let Some(link) = meal_link(entry, base_url) {
            slots
                .entry((entry.date, entry.entry_type.to_lowercase()))
                .or_default()
                .push(link);
        }
    }

    let cell = |date: NaiveDate, slot: &str| {
        slots
            .get(&(date, slot.to_owned()))
            .map(|meals| meals.join(", "))
            .unwrap_or_else(|| EMPTY_SLOT.to_owned())
    };

    let mut lines = vec![
        "| Day | Lunch | Dinner |".to_owned(),
        "|-----|-------|--------|".to_owned(),
    ];
    for &date in days {
        lines.push(format!(
            "| {} | {} | {} |",
            date.format("%A"),
            cell(date, "lunch"),
            cell(date, "dinner")
        ));
    }
    lines.join("\n")
}

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(PLUGIN_ID, "Meal Plan Fetcher")
        .with_description("Publishes the upcoming meal plan as a table.")
        .with_field(
            FieldSpec::number("days", "Fetcher Days", DEFAULT_DAYS, NumberRange::new(1.0, 14.0, 1.0).with_unit("days"))
                .with_icon("mdi:calendar-range"),
        )
        .with_field(FieldSpec::switch("include_today", "From Today", false))
        .with_field(FieldSpec::text("mealie_url", "Mealie URL", "").with_icon("mdi:link"))
        .with_field(FieldSpec::log_sensor("feedback", "Feedback"))
        .with_field(FieldSpec::log_sensor("mealplan", "Formatted Meal Plan"))
        .with_field(FieldSpec::progress_sensor("progress", "Progress"))
        .with_reset_sensor("mealplan")
}

pub struct MealplanFetcherFactory;

impl PluginFactory for MealplanFetcherFactory {
    fn descriptor(&self) -> PluginDescriptor {
        descriptor()
    }

    fn create(&self, config: &PluginConfig, services: &Services) -> Result<Box<dyn Plugin>> {
        let days = config.number("days").unwrap_or(DEFAULT_DAYS);
        Ok(Box::new(MealplanFetcher {
            days: days.round().clamp(1.0, 14.0) as u32,
            include_today: config.bool("include_today").unwrap_or(false),
            base_url: config.text("mealie_url").unwrap_or_default().to_owned(),
            services: services.clone(),
        }))
    }
}

struct MealplanFetcher {
    days: u32,
    include_today: bool,
    base_url: String,
    services: Services,
}

#[async_trait]
impl Plugin for MealplanFetcher {
    async fn run(&self, ctx: PluginContext) -> Result<()> {
        ctx.progress(0, "Fetching meal plan").await;
        let today = Local::now().date_naive();
        let days = table_days(today, self.days, self.include_today);
        let (Some(&start), Some(&end)) = (days.first(), days.last()) else {
            return Ok(());
        };

        let plan = self
            .services
            .recipes
            .get_meal_plan(start, end)
            .await
            .context("failed to fetch meal plan")?;
        ctx.checkpoint()?;

        ctx.progress(60, "Formatting meal plan").await;
        ctx.log_to("mealplan", &render_table(&days, &plan, &self.base_url))
            .await;
        ctx.success(&format!(
            "Meal plan for {start} to {end} published ({} entries).",
            plan.len()
        ))
        .await;
        tracing::info!(plugin_id = PLUGIN_ID, %start, %end, entries = plan.len(), "meal plan published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mealiemate_core::services::RecipeSummary;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn entry(date: NaiveDate, entry_type: &str, slug: &str, name: &str) -> MealPlanEntry {
        MealPlanEntry {
            id: None,
            date,
            entry_type: entry_type.into(),
            title: None,
            recipe_id: Some(format!("id-{slug}")),
            recipe: Some(RecipeSummary {
                id: format!("id-{slug}"),
                slug: slug.into(),
                name: name.into(),
                tags: Vec::new(),
                categories: Vec::new(),
            }),
        }
    }

    #[test]
    fn table_days_start_tomorrow_unless_today_included() {
        assert_eq!(
            table_days(day(2025, 2, 27), 3, false),
            [day(2025, 2, 28), day(2025, 3, 1), day(2025, 3, 2)]
        );
        assert_eq!(table_days(day(2025, 2, 27), 1, true), [day(2025, 2, 27)]);
        assert_eq!(table_days(day(2025, 2, 27), 0, true).len(), 1);
    }

    #[test]
    fn table_links_recipes_and_marks_empty_slots() {
        let days = [day(2025, 3, 3), day(2025, 3, 4)];
        let plan = vec![
            entry(day(2025, 3, 3), "Lunch", "salad", "Salad"),
            entry(day(2025, 3, 3), "dinner", "soup", "Soup"),
            entry(day(2025, 3, 9), "dinner", "late", "Too Late"),
        ];
        let table = render_table(&days, &plan, "https://mealie.lan/");
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "| Day | Lunch | Dinner |");
        assert_eq!(
            lines[2],
            "| Monday | [Salad](https://mealie.lan/g/home/r/salad) | [Soup](https://mealie.lan/g/home/r/soup) |"
        );
        assert_eq!(lines[3], "| Tuesday | - | - |");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn table_without_url_uses_plain_names_and_titles() {
        let mut note = entry(day(2025, 3, 3), "dinner", "x", "x");
        note.recipe = None;
        note.title = Some("Leftovers".into());
        let plan = vec![entry(day(2025, 3, 3), "lunch", "salad", "Salad"), note];
        let table = render_table(&[day(2025, 3, 3)], &plan, "");
        assert!(table.ends_with("| Monday | Salad | Leftovers |"));
    }
}
