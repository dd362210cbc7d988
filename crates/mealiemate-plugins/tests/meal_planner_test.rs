//! Meal planner plugin against fake collaborators, including the review
//! flow driven by button presses.

mod common;

use serde_json::{Value, json};

use mealiemate_core::{ExecutionState, FieldValue};
use mealiemate_test_utils::{TestRig, WAIT, recipe};

use common::{feedback, in_days, rig, run_to_end, wait_for_feedback};

fn stock(rig: &TestRig) {
    rig.recipes.add_recipe(recipe("pasta", "Pasta", &["200 g spaghetti"]));
    rig.recipes.add_recipe(recipe("curry", "Curry", &["1 onion"]));
}

async fn configure(rig: &TestRig, days: f64, review: bool) {
    let manager = rig.coordinator.manager();
    manager
        .update_config("meal_planner", "days", FieldValue::Number(days))
        .await
        .unwrap();
    manager
        .update_config("meal_planner", "review", FieldValue::Bool(review))
        .await
        .unwrap();
}

fn proposal() -> Value {
    json!({
        "mealPlan": {
            in_days(1).to_string(): {"Lunch": "id-pasta", "Dinner": "id-curry"},
            in_days(2).to_string(): {"Lunch": "ghost"}
        },
        "feedback": "Balanced week"
    })
}

#[tokio::test]
async fn writes_proposal_without_review() {
    let rig = rig();
    stock(&rig);
    configure(&rig, 2.0, false).await;
    rig.llm.push_response(proposal());

    run_to_end(&rig, "meal_planner").await;

    let entries = rig.recipes.created_entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].date, in_days(1));
    assert_eq!(entries[0].entry_type, "lunch");
    assert_eq!(entries[0].recipe_id.as_deref(), Some("id-pasta"));
    assert_eq!(entries[1].entry_type, "dinner");
    assert!(entries[1].title.is_empty());

    let request = &rig.llm.requests()[0];
    let system: Value = serde_json::from_str(&request.messages[0].content).unwrap();
    assert_eq!(system["days"], json!([in_days(1), in_days(2)]));
    assert_eq!(system["recipesCatalog"][0]["id"], "id-pasta");
    assert_eq!(request.messages[1].content, "Generate a mealplan please.");

    let text = feedback(&rig, "meal_planner");
    assert!(text.contains("Balanced week"), "{text}");
    assert!(text.contains("unknown recipe ghost"), "{text}");
    assert!(text.contains("Added 2 meals over 1 days"), "{text}");
}

#[tokio::test]
async fn message_field_is_sent_to_the_model() {
    let rig = rig();
    stock(&rig);
    configure(&rig, 2.0, false).await;
    rig.coordinator
        .manager()
        .update_config("meal_planner", "message", FieldValue::Text("No fish this week".into()))
        .await
        .unwrap();
    rig.llm.push_response(json!({"mealPlan": {}, "feedback": ""}));

    run_to_end(&rig, "meal_planner").await;

    assert_eq!(rig.llm.requests()[0].messages[1].content, "No fish this week");
    assert!(feedback(&rig, "meal_planner").contains("Nothing new to add"));
}

#[tokio::test]
async fn review_waits_for_accept() {
    let rig = rig();
    stock(&rig);
    configure(&rig, 2.0, true).await;
    rig.llm.push_response(proposal());
    let manager = rig.coordinator.manager();

    manager.set_enabled("meal_planner", true).await.unwrap();
    wait_for_feedback(&rig, "meal_planner", "Press Accept").await;
    assert!(rig.recipes.created_entries().is_empty());
    assert_eq!(manager.state("meal_planner"), Some(ExecutionState::Running));

    assert!(manager.trigger_button("meal_planner", "accept").await.unwrap());
    assert!(manager.wait_for_state("meal_planner", ExecutionState::Idle, WAIT).await);
    assert_eq!(rig.recipes.created_entries().len(), 2);
}

#[tokio::test]
async fn reject_discards_proposal() {
    let rig = rig();
    stock(&rig);
    configure(&rig, 2.0, true).await;
    rig.llm.push_response(proposal());
    let manager = rig.coordinator.manager();

    manager.set_enabled("meal_planner", true).await.unwrap();
    wait_for_feedback(&rig, "meal_planner", "Press Accept").await;
    manager.trigger_button("meal_planner", "reject").await.unwrap();
    assert!(manager.wait_for_state("meal_planner", ExecutionState::Idle, WAIT).await);

    assert!(rig.recipes.created_entries().is_empty());
    assert!(feedback(&rig, "meal_planner").contains("Plan rejected"));
}

#[tokio::test]
async fn disable_during_review_writes_nothing() {
    let rig = rig();
    stock(&rig);
    configure(&rig, 2.0, true).await;
    rig.llm.push_response(proposal());
    let manager = rig.coordinator.manager();

    manager.set_enabled("meal_planner", true).await.unwrap();
    wait_for_feedback(&rig, "meal_planner", "Press Accept").await;
    manager.set_enabled("meal_planner", false).await.unwrap();
    assert!(manager.wait_for_state("meal_planner", ExecutionState::Idle, WAIT).await);

    assert!(rig.recipes.created_entries().is_empty());
    assert_eq!(
        rig.publisher.last_payload("mealiemate/meal_planner/progress/attributes").as_deref(),
        Some(r#"{"activity":"Stopped"}"#)
    );
}

#[tokio::test]
async fn covered_plan_needs_no_model() {
    let rig = rig();
    stock(&rig);
    configure(&rig, 2.0, false).await;
    rig.recipes.plan(in_days(2), "pasta");

    run_to_end(&rig, "meal_planner").await;

    assert!(rig.llm.requests().is_empty());
    assert!(feedback(&rig, "meal_planner").contains("already covers"));
}

#[tokio::test]
async fn plans_after_latest_entry() {
    let rig = rig();
    stock(&rig);
    configure(&rig, 3.0, false).await;
    rig.recipes.plan(in_days(1), "pasta");
    rig.llm.push_response(json!({
        "mealPlan": {
            in_days(1).to_string(): {"Dinner": "id-curry"},
            in_days(2).to_string(): {"Dinner": "id-curry"}
        }
    }));

    run_to_end(&rig, "meal_planner").await;

    let request = &rig.llm.requests()[0];
    let system: Value = serde_json::from_str(&request.messages[0].content).unwrap();
    assert_eq!(system["days"], json!([in_days(2), in_days(3)]));
    assert_eq!(system["currentMealPlan"][0]["recipeId"], "id-pasta");

    let entries = rig.recipes.created_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].date, in_days(2));
    assert!(feedback(&rig, "meal_planner").contains("was not requested"));
}

#[tokio::test]
async fn no_recipes_is_an_error() {
    let rig = rig();
    run_to_end(&rig, "meal_planner").await;
    assert!(feedback(&rig, "meal_planner").contains("Error: no recipes available"));
}
