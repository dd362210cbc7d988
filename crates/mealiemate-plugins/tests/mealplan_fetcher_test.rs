//! Meal plan fetcher plugin against fake collaborators.

mod common;

use mealiemate_core::FieldValue;
use mealiemate_test_utils::recipe;

use common::{feedback, in_days, rig, run_to_end, sensor_text, today};

#[tokio::test]
async fn publishes_the_week_as_a_table() {
    let rig = rig();
    rig.recipes.add_recipe(recipe("salad", "Salad", &[]));
    rig.recipes.add_recipe(recipe("soup", "Soup", &[]));
    rig.recipes.plan(today(), "soup");
    rig.recipes.plan_meal(in_days(1), "lunch", "salad");
    rig.recipes.plan(in_days(1), "soup");
    rig.coordinator
        .manager()
        .update_config("mealplan_fetcher", "mealie_url", FieldValue::Text("https://mealie.lan".into()))
        .await
        .unwrap();

    run_to_end(&rig, "mealplan_fetcher").await;

    let table = sensor_text(&rig, "mealplan_fetcher", "mealplan");
    let tomorrow = in_days(1).format("%A").to_string();
    assert!(table.contains("| Day | Lunch | Dinner |"), "{table}");
    assert!(
        table.contains(&format!(
            "| {tomorrow} | [Salad](https://mealie.lan/g/home/r/salad) | [Soup](https://mealie.lan/g/home/r/soup) |"
        )),
        "{table}"
    );
    assert_eq!(table.matches(" | - | - |").count(), 6, "{table}");

    let text = feedback(&rig, "mealplan_fetcher");
    assert!(text.contains("published (2 entries)"), "{text}");
    assert!(text.contains("Completed successfully"), "{text}");
    assert!(!table.contains("Completed successfully"), "{table}");
}

#[tokio::test]
async fn include_today_shifts_the_window() {
    let rig = rig();
    rig.recipes.add_recipe(recipe("soup", "Soup", &[]));
    rig.recipes.plan(today(), "soup");
    let manager = rig.coordinator.manager();
    manager
        .update_config("mealplan_fetcher", "include_today", FieldValue::Bool(true))
        .await
        .unwrap();
    manager
        .update_config("mealplan_fetcher", "days", FieldValue::Number(2.0))
        .await
        .unwrap();

    run_to_end(&rig, "mealplan_fetcher").await;

    let table = sensor_text(&rig, "mealplan_fetcher", "mealplan");
    let today_name = today().format("%A").to_string();
    assert!(table.contains(&format!("| {today_name} | - | Soup |")), "{table}");
    assert_eq!(table.lines().filter(|l| l.contains(" | - | - |")).count(), 1, "{table}");
}

#[tokio::test]
async fn service_failure_is_reported() {
    let rig = rig();
    rig.recipes.fail_with("mealie down");

    run_to_end(&rig, "mealplan_fetcher").await;

    let text = feedback(&rig, "mealplan_fetcher");
    assert!(text.contains("Error: failed to fetch meal plan: mealie down"), "{text}");
}
