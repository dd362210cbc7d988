//! Mealie REST client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use mealiemate_core::services::{
    MealPlanEntry, NewMealPlanEntry, Organizer, Recipe, RecipeService, RecipeSummary,
};

use crate::config::MealieConfig;
use crate::error::check_status;

/// Paginated listing envelope.
#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

/// Bearer-token JSON client for the Mealie API.
#[derive(Clone)]
pub struct MealieClient {
    http: Client,
    base_url: String,
}

impl MealieClient {
    pub fn new(config: &MealieConfig) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .context("Mealie token is not a valid header value")?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("failed to build Mealie HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base_url)
    }

    async fn send(
        &self,
        request: RequestBuilder,
        method: &'static str,
        endpoint: &str,
    ) -> Result<reqwest::Response> {
        tracing::debug!(method, endpoint, "mealie request");
        let response = request
            .send()
            .await
            .with_context(|| format!("{method} {endpoint} failed"))?;
        Ok(check_status(response, method, endpoint).await?)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let request = self.http.get(self.url(endpoint)).query(query);
        self.send(request, "GET", endpoint)
            .await?
            .json()
            .await
            .with_context(|| format!("invalid response from GET {endpoint}"))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let request = self.http.post(self.url(endpoint)).json(body);
        self.send(request, "POST", endpoint)
            .await?
            .json()
            .await
            .with_context(|| format!("invalid response from POST {endpoint}"))
    }

    async fn list_organizers(&self, endpoint: &str) -> Result<Vec<Organizer>> {
        let page: Page<Organizer> = self.get_json(endpoint, &all_pages()).await?;
        Ok(page.items)
    }
}

fn all_pages() -> [(&'static str, String); 1] {
    [("perPage", "-1".to_owned())]
}

#[async_trait]
impl RecipeService for MealieClient {
    async fn list_recipes(&self) -> Result<Vec<RecipeSummary>> {
        let page: Page<RecipeSummary> = self.get_json("/api/recipes", &all_pages()).await?;
        Ok(page.items)
    }

    async fn get_recipe(&self, slug: &str) -> Result<Recipe> {
        self.get_json(&format!("/api/recipes/{slug}"), &[]).await
    }

    async fn list_tags(&self) -> Result<Vec<Organizer>> {
        self.list_organizers("/api/organizers/tags").await
    }

    async fn list_categories(&self) -> Result<Vec<Organizer>> {
        self.list_organizers("/api/organizers/categories").await
    }

    async fn create_tag(&self, name: &str) -> Result<Organizer> {
        let tag = self
            .post_json("/api/organizers/tags", &json!({ "name": name }))
            .await?;
        tracing::info!(tag = name, "created tag");
        Ok(tag)
    }

    async fn create_category(&self, name: &str) -> Result<Organizer> {
        let category = self
            .post_json("/api/organizers/categories", &json!({ "name": name }))
            .await?;
        tracing::info!(category = name, "created category");
        Ok(category)
    }

    async fn update_recipe_organizers(
        &self,
        slug: &str,
        tags: &[Organizer],
        categories: &[Organizer],
    ) -> Result<()> {
        let endpoint = format!("/api/recipes/{slug}");
        let body = json!({ "tags": tags, "recipeCategory": categories });
        let request = self.http.patch(self.url(&endpoint)).json(&body);
        self.send(request, "PATCH", &endpoint).await?;
        Ok(())
    }

    async fn get_meal_plan(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<MealPlanEntry>> {
        let query = [
            ("start_date", start.to_string()),
            ("end_date", end.to_string()),
            ("perPage", "-1".to_owned()),
        ];
        let page: Page<MealPlanEntry> = self
            .get_json("/api/households/mealplans", &query)
            .await?;
        Ok(page.items)
    }

    async fn create_meal_plan_entry(&self, entry: &NewMealPlanEntry) -> Result<()> {
        let endpoint = "/api/households/mealplans";
        let request = self.http.post(self.url(endpoint)).json(entry);
        self.send(request, "POST", endpoint).await?;
        Ok(())
    }

    async fn create_shopping_list(&self, name: &str) -> Result<String> {
        let created: Created = self
            .post_json("/api/households/shopping/lists", &json!({ "name": name }))
            .await?;
        tracing::info!(list = name, id = %created.id, "created shopping list");
        Ok(created.id)
    }

    async fn add_shopping_list_item(&self, list_id: &str, note: &str) -> Result<()> {
        let endpoint = "/api/households/shopping/items";
        let body = json!({
            "shoppingListId": list_id,
            "note": note,
            "isFood": false,
            "disableAmount": true,
        });
        let request = self.http.post(self.url(endpoint)).json(&body);
        self.send(request, "POST", endpoint).await?;
        Ok(())
    }
}

impl std::fmt::Debug for MealieClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MealieClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
