//! Mealie client tests against a local HTTP double.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde_json::{Value, json};

use mealiemate_clients::{HttpStatusError, MealieClient, MealieConfig};
use mealiemate_core::services::{NewMealPlanEntry, Organizer, RecipeService};

const TOKEN: &str = "test-token";

/// Requests seen by the double: `(method path, query or body)`.
#[derive(Clone, Default)]
struct Recorded(Arc<Mutex<Vec<(String, Value)>>>);

impl Recorded {
    fn push(&self, what: &str, value: Value) {
        self.0.lock().unwrap().push((what.to_owned(), value));
    }

    fn all(&self) -> Vec<(String, Value)> {
        self.0.lock().unwrap().clone()
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn list_recipes(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!({
        "page": 1,
        "items": [
            {"id": "r1", "slug": "pasta", "name": "Pasta", "tags": [], "recipeCategory": []},
            {"id": "r2", "slug": "curry", "name": "Curry"}
        ]
    })))
}

async fn get_recipe(Path(slug): Path<String>) -> Result<Json<Value>, StatusCode> {
    if slug != "pasta" {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({
        "id": "r1",
        "slug": "pasta",
        "name": "Pasta",
        "recipeIngredient": [{"display": "200 g spaghetti"}]
    })))
}

async fn patch_recipe(
    State(recorded): State<Recorded>,
    Path(slug): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    recorded.push(&format!("PATCH {slug}"), body);
    Json(json!({}))
}

async fn meal_plans(
    State(recorded): State<Recorded>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    recorded.push("GET mealplans", json!(query));
    Json(json!({
        "items": [{
            "id": 4,
            "date": "2025-03-02",
            "entryType": "dinner",
            "recipeId": "r1",
            "recipe": {"id": "r1", "slug": "pasta", "name": "Pasta"}
        }]
    }))
}

async fn create_meal_plan(State(recorded): State<Recorded>, Json(body): Json<Value>) -> StatusCode {
    recorded.push("POST mealplans", body);
    StatusCode::CREATED
}

async fn create_list(
    State(recorded): State<Recorded>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    recorded.push("POST lists", body);
    (StatusCode::CREATED, Json(json!({"id": "list-9", "name": "x"})))
}

async fn create_item(State(recorded): State<Recorded>, Json(body): Json<Value>) -> StatusCode {
    recorded.push("POST items", body);
    StatusCode::CREATED
}

async fn create_tag(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let name = body["name"].as_str().unwrap_or_default().to_owned();
    (
        StatusCode::CREATED,
        Json(json!({"id": "t-new", "name": name, "slug": name.to_lowercase()})),
    )
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn app(recorded: Recorded) -> Router {
    Router::new()
        .route("/api/recipes", get(list_recipes))
        .route("/api/recipes/{slug}", get(get_recipe).patch(patch_recipe))
        .route("/api/households/mealplans", get(meal_plans).post(create_meal_plan))
        .route("/api/households/shopping/lists", post(create_list))
        .route("/api/households/shopping/items", post(create_item))
        .route(
            "/api/organizers/tags",
            get(|| async { Json(json!({"items": [{"id": "t1", "name": "Quick", "slug": "quick"}]})) })
                .post(create_tag),
        )
        .with_state(recorded)
}

async fn start() -> (MealieClient, Recorded) {
    let recorded = Recorded::default();
    let addr = serve(app(recorded.clone())).await;
    let client = MealieClient::new(&MealieConfig::new(format!("http://{addr}/"), TOKEN)).unwrap();
    (client, recorded)
}

#[tokio::test]
async fn lists_recipes_with_bearer_token() {
    let (client, _) = start().await;
    let recipes = client.list_recipes().await.unwrap();
    assert_eq!(recipes.len(), 2);
    assert_eq!(recipes[1].slug, "curry");
    assert!(recipes[1].tags.is_empty());
}

#[tokio::test]
async fn wrong_token_is_an_error() {
    let addr = serve(app(Recorded::default())).await;
    let client = MealieClient::new(&MealieConfig::new(format!("http://{addr}"), "wrong")).unwrap();

    let err = client.list_recipes().await.unwrap_err();
    let status = err.downcast_ref::<HttpStatusError>().unwrap();
    assert_eq!(status.status, StatusCode::UNAUTHORIZED);
    assert_eq!(status.endpoint, "/api/recipes");
}

#[tokio::test]
async fn missing_recipe_reports_status_and_endpoint() {
    let (client, _) = start().await;
    let recipe = client.get_recipe("pasta").await.unwrap();
    assert_eq!(recipe.recipe_ingredient[0].text(), Some("200 g spaghetti"));

    let err = client.get_recipe("nothing").await.unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("404"), "{message}");
    assert!(message.contains("/api/recipes/nothing"), "{message}");
}

#[tokio::test]
async fn meal_plan_window_is_sent_as_query() {
    let (client, recorded) = start().await;
    let start_day = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
    let end_day = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();

    let entries = client.get_meal_plan(start_day, end_day).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].recipe.as_ref().unwrap().slug, "pasta");

    let (what, query) = &recorded.all()[0];
    assert_eq!(what, "GET mealplans");
    assert_eq!(query["start_date"], "2025-03-01");
    assert_eq!(query["end_date"], "2025-03-07");
}

#[tokio::test]
async fn writes_use_mealie_payload_shapes() {
    let (client, recorded) = start().await;

    let list_id = client.create_shopping_list("Week 10").await.unwrap();
    assert_eq!(list_id, "list-9");
    client.add_shopping_list_item(&list_id, "2 onions").await.unwrap();
    client
        .create_meal_plan_entry(&NewMealPlanEntry {
            date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            entry_type: "dinner".into(),
            title: String::new(),
            text: String::new(),
            recipe_id: Some("r1".into()),
        })
        .await
        .unwrap();
    let tag = Organizer {
        id: "t1".into(),
        name: "Quick".into(),
        slug: "quick".into(),
    };
    client
        .update_recipe_organizers("pasta", &[tag], &[])
        .await
        .unwrap();

    let requests = recorded.all();
    assert_eq!(requests[0].0, "POST lists");
    assert_eq!(requests[0].1["name"], "Week 10");
    assert_eq!(requests[1].0, "POST items");
    assert_eq!(requests[1].1["shoppingListId"], "list-9");
    assert_eq!(requests[1].1["note"], "2 onions");
    assert_eq!(requests[1].1["isFood"], false);
    assert_eq!(requests[2].0, "POST mealplans");
    assert_eq!(requests[2].1["entryType"], "dinner");
    assert_eq!(requests[3].0, "PATCH pasta");
    assert_eq!(requests[3].1["tags"][0]["slug"], "quick");
    assert_eq!(requests[3].1["recipeCategory"], json!([]));
}

#[tokio::test]
async fn organizers_list_and_create() {
    let (client, _) = start().await;
    let tags = client.list_tags().await.unwrap();
    assert_eq!(tags[0].name, "Quick");

    let created = client.create_tag("Vegetarian").await.unwrap();
    assert_eq!(created.id, "t-new");
    assert_eq!(created.slug, "vegetarian");
}
