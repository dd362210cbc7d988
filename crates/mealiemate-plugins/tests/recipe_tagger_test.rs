//! Recipe tagger plugin against fake collaborators.

mod common;

use serde_json::json;

use mealiemate_core::FieldValue;
use mealiemate_test_utils::{TestRig, recipe};

use common::{feedback, rig, run_to_end};

fn stock(rig: &TestRig) {
    rig.recipes.add_recipe(recipe("pasta", "Pasta", &["200 g spaghetti", "1 onion"]));
    rig.recipes.add_recipe(recipe("water", "Water", &[]));
    rig.recipes.add_tag("Quick");
    rig.recipes.add_category("Dinner");
}

#[tokio::test]
async fn tags_recipes_and_creates_missing_organizers() {
    let rig = rig();
    stock(&rig);
    rig.llm
        .push_response(json!({"tags": ["Grains", "Quick", "Spicy"], "category": "Dinner"}));

    run_to_end(&rig, "recipe_tagger").await;

    assert_eq!(
        rig.recipes.organizer_updates(),
        [("pasta".to_owned(), vec!["Grains".to_owned(), "Quick".to_owned()], vec!["Dinner".to_owned()])]
    );
    let tags: Vec<String> = rig.recipes.tags().into_iter().map(|t| t.name).collect();
    assert_eq!(tags, ["Quick", "Grains"]);
    assert_eq!(rig.llm.requests().len(), 1);

    let text = feedback(&rig, "recipe_tagger");
    assert!(text.contains("ignoring unknown labels Spicy"), "{text}");
    assert!(text.contains("Water: no ingredients"), "{text}");
    assert!(text.contains("Processed 2/2 recipes, Updated 1, Skipped 1, Errors 0"), "{text}");
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let rig = rig();
    stock(&rig);
    rig.llm.push_response(json!({"tags": ["Grains"], "category": "Dinner"}));
    rig.coordinator
        .manager()
        .update_config("recipe_tagger", "dry_run", FieldValue::Bool(true))
        .await
        .unwrap();

    run_to_end(&rig, "recipe_tagger").await;

    assert!(rig.recipes.organizer_updates().is_empty());
    assert_eq!(rig.recipes.tags().len(), 1);
    let text = feedback(&rig, "recipe_tagger");
    assert!(text.contains("[dry run] Pasta: tags Grains, category Dinner"), "{text}");
}

#[tokio::test]
async fn one_failing_recipe_does_not_stop_the_run() {
    let rig = rig();
    rig.recipes.add_recipe(recipe("pasta", "Pasta", &["200 g spaghetti"]));
    rig.recipes.add_recipe(recipe("salad", "Salad", &["1 lettuce"]));
    rig.llm.push_error("rate limited");
    rig.llm.push_response(json!({"tags": ["Vegetables"], "category": "Salad"}));

    run_to_end(&rig, "recipe_tagger").await;

    assert_eq!(
        rig.recipes.organizer_updates(),
        [("salad".to_owned(), vec!["Vegetables".to_owned()], vec!["Salad".to_owned()])]
    );
    let text = feedback(&rig, "recipe_tagger");
    assert!(text.contains("Error processing pasta"), "{text}");
    assert!(text.contains("Updated 1, Skipped 0, Errors 1"), "{text}");
    assert!(text.contains("Completed successfully"), "{text}");
}

#[tokio::test]
async fn category_is_kept_when_model_gives_none() {
    let rig = rig();
    let mut pasta = recipe("pasta", "Pasta", &["200 g spaghetti"]);
    pasta.categories = vec![mealiemate_core::services::Organizer {
        id: "c9".into(),
        name: "Lunch".into(),
        slug: "lunch".into(),
    }];
    rig.recipes.add_recipe(pasta);
    rig.llm.push_response(json!({"tags": ["Grains"]}));

    run_to_end(&rig, "recipe_tagger").await;

    assert_eq!(
        rig.recipes.organizer_updates(),
        [("pasta".to_owned(), vec!["Grains".to_owned()], vec!["Lunch".to_owned()])]
    );
}

#[tokio::test]
async fn no_recipes_completes() {
    let rig = rig();
    run_to_end(&rig, "recipe_tagger").await;
    assert!(rig.llm.requests().is_empty());
    assert!(feedback(&rig, "recipe_tagger").contains("No recipes found."));
}
