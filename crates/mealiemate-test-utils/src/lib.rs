//! Shared test utilities for MealieMate integration tests.
//!
//! Provides in-memory doubles for every seam of the core:
//! - [`RecordingPublisher`]: captures everything published to the broker.
//! - [`FakeRecipeService`] / [`FakeLanguageModel`]: scripted collaborators.
//! - [`ScriptedPlugin`]: a plugin factory whose executions follow a
//!   [`Script`] and report what they saw through a [`Probe`].
//! - [`TestRig`]: a coordinator wired to all of the above.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::NaiveDate;

use mealiemate_core::config::PluginConfig;
use mealiemate_core::entity::{FieldSpec, FieldValue, NumberRange};
use mealiemate_core::services::{
    CompletionRequest, Food, LanguageModel, MealPlanEntry, NewMealPlanEntry, Organizer, Recipe,
    RecipeService, RecipeSummary,
};
use mealiemate_core::{
    Coordinator, CoordinatorConfig, EntityPublisher, Namespace, OutboundMessage, Plugin,
    PluginContext, PluginDescriptor, PluginFactory, PluginRegistry, Publisher, Services,
};

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Publisher that records every message in order.
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<OutboundMessage>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent publish fail (nothing is recorded).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Payloads published to `topic`, oldest first.
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload_str().into_owned())
            .collect()
    }

    pub fn last_payload(&self, topic: &str) -> Option<String> {
        self.payloads(topic).pop()
    }

    pub fn topics(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.topic.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("broker unavailable");
        }
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recipe service
// ---------------------------------------------------------------------------

/// A shopping list created through [`FakeRecipeService`].
#[derive(Debug, Clone, PartialEq)]
pub struct FakeShoppingList {
    pub id: String,
    pub name: String,
    pub items: Vec<String>,
}

#[derive(Default)]
struct RecipeState {
    recipes: Vec<Recipe>,
    tags: Vec<Organizer>,
    categories: Vec<Organizer>,
    meal_plan: Vec<MealPlanEntry>,
    created_entries: Vec<NewMealPlanEntry>,
    shopping_lists: Vec<FakeShoppingList>,
    organizer_updates: Vec<(String, Vec<String>, Vec<String>)>,
    fail: Option<String>,
}

/// In-memory recipe service.
#[derive(Default)]
pub struct FakeRecipeService {
    state: Mutex<RecipeState>,
}

fn organizer(id: &str, name: &str) -> Organizer {
    Organizer {
        id: id.to_owned(),
        name: name.to_owned(),
        slug: name.to_lowercase().replace(' ', "-"),
    }
}

/// A recipe with the given ingredient lines.
pub fn recipe(slug: &str, name: &str, ingredients: &[&str]) -> Recipe {
    Recipe {
        id: format!("id-{slug}"),
        slug: slug.to_owned(),
        name: name.to_owned(),
        description: None,
        recipe_ingredient: ingredients
            .iter()
            .map(|line| mealiemate_core::services::Ingredient {
                display: Some((*line).to_owned()),
                note: None,
                quantity: None,
                food: None,
            })
            .collect(),
        tags: Vec::new(),
        categories: Vec::new(),
    }
}

/// A recipe whose ingredient lines are parsed into the given foods.
pub fn recipe_with_foods(slug: &str, name: &str, foods: &[&str]) -> Recipe {
    let mut recipe = recipe(slug, name, foods);
    for ingredient in &mut recipe.recipe_ingredient {
        ingredient.food = ingredient.display.clone().map(|name| Food { id: None, name });
    }
    recipe
}

fn summary(recipe: &Recipe) -> RecipeSummary {
    RecipeSummary {
        id: recipe.id.clone(),
        slug: recipe.slug.clone(),
        name: recipe.name.clone(),
        tags: recipe.tags.clone(),
        categories: recipe.categories.clone(),
    }
}

impl FakeRecipeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_recipe(&self, recipe: Recipe) {
        self.state.lock().unwrap().recipes.push(recipe);
    }

    pub fn add_tag(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let id = format!("tag-{}", state.tags.len() + 1);
        state.tags.push(organizer(&id, name));
    }

    pub fn add_category(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let id = format!("cat-{}", state.categories.len() + 1);
        state.categories.push(organizer(&id, name));
    }

    /// Plan `slug` for `date` as dinner.
    pub fn plan(&self, date: NaiveDate, slug: &str) {
        self.plan_meal(date, "dinner", slug);
    }

    /// Plan `slug` for `date` under `entry_type` (`lunch`, `dinner`, ...).
    pub fn plan_meal(&self, date: NaiveDate, entry_type: &str, slug: &str) {
        let mut state = self.state.lock().unwrap();
        let recipe = state.recipes.iter().find(|r| r.slug == slug).map(summary);
        state.meal_plan.push(MealPlanEntry {
            id: None,
            date,
            entry_type: entry_type.to_owned(),
            title: None,
            recipe_id: recipe.as_ref().map(|r| r.id.clone()),
            recipe,
        });
    }

    /// Make every call fail with `message`.
    pub fn fail_with(&self, message: &str) {
        self.state.lock().unwrap().fail = Some(message.to_owned());
    }

    pub fn shopping_lists(&self) -> Vec<FakeShoppingList> {
        self.state.lock().unwrap().shopping_lists.clone()
    }

    pub fn created_entries(&self) -> Vec<NewMealPlanEntry> {
        self.state.lock().unwrap().created_entries.clone()
    }

    /// `(slug, tag names, category names)` for every organizer update.
    pub fn organizer_updates(&self) -> Vec<(String, Vec<String>, Vec<String>)> {
        self.state.lock().unwrap().organizer_updates.clone()
    }

    pub fn tags(&self) -> Vec<Organizer> {
        self.state.lock().unwrap().tags.clone()
    }

    fn check(&self) -> Result<()> {
        match &self.state.lock().unwrap().fail {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RecipeService for FakeRecipeService {
    async fn list_recipes(&self) -> Result<Vec<RecipeSummary>> {
        self.check()?;
        Ok(self.state.lock().unwrap().recipes.iter().map(summary).collect())
    }

    async fn get_recipe(&self, slug: &str) -> Result<Recipe> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .recipes
            .iter()
            .find(|r| r.slug == slug)
            .cloned()
            .ok_or_else(|| anyhow!("recipe {slug} not found"))
    }

    async fn list_tags(&self) -> Result<Vec<Organizer>> {
        self.check()?;
        Ok(self.tags())
    }

    async fn list_categories(&self) -> Result<Vec<Organizer>> {
        self.check()?;
        Ok(self.state.lock().unwrap().categories.clone())
    }

    async fn create_tag(&self, name: &str) -> Result<Organizer> {
        self.check()?;
        self.add_tag(name);
        Ok(self.tags().pop().unwrap())
    }

    async fn create_category(&self, name: &str) -> Result<Organizer> {
        self.check()?;
        self.add_category(name);
        Ok(self.state.lock().unwrap().categories.last().cloned().unwrap())
    }

    async fn update_recipe_organizers(
        &self,
        slug: &str,
        tags: &[Organizer],
        categories: &[Organizer],
    ) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if let Some(recipe) = state.recipes.iter_mut().find(|r| r.slug == slug) {
            recipe.tags = tags.to_vec();
            recipe.categories = categories.to_vec();
        }
        state.organizer_updates.push((
            slug.to_owned(),
            tags.iter().map(|t| t.name.clone()).collect(),
            categories.iter().map(|c| c.name.clone()).collect(),
        ));
        Ok(())
    }

    async fn get_meal_plan(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<MealPlanEntry>> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .meal_plan
            .iter()
            .filter(|e| e.date >= start && e.date <= end)
            .cloned()
            .collect())
    }

    async fn create_meal_plan_entry(&self, entry: &NewMealPlanEntry) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .created_entries
            .push(entry.clone());
        Ok(())
    }

    async fn create_shopping_list(&self, name: &str) -> Result<String> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let id = format!("list-{}", state.shopping_lists.len() + 1);
        state.shopping_lists.push(FakeShoppingList {
            id: id.clone(),
            name: name.to_owned(),
            items: Vec::new(),
        });
        Ok(id)
    }

    async fn add_shopping_list_item(&self, list_id: &str, note: &str) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let list = state
            .shopping_lists
            .iter_mut()
            .find(|l| l.id == list_id)
            .ok_or_else(|| anyhow!("shopping list {list_id} not found"))?;
        list.items.push(note.to_owned());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

/// Language model answering from a queue of scripted responses.
#[derive(Default)]
pub struct FakeLanguageModel {
    responses: Mutex<VecDeque<Result<serde_json::Value, String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeLanguageModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_response(&self, value: serde_json::Value) {
        self.responses.lock().unwrap().push_back(Ok(value));
    }

    pub fn push_error(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_owned()));
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for FakeLanguageModel {
    async fn complete_json(&self, request: &CompletionRequest) -> Result<serde_json::Value> {
        self.requests.lock().unwrap().push(request.clone());
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(anyhow!("{message}")),
            None => Err(anyhow!("no scripted completion left")),
        }
    }
}

/// Services backed by fresh fakes.
pub fn fake_services() -> (Services, Arc<FakeRecipeService>, Arc<FakeLanguageModel>) {
    let recipes = FakeRecipeService::new();
    let llm = FakeLanguageModel::new();
    let services = Services::new(recipes.clone(), llm.clone());
    (services, recipes, llm)
}

// ---------------------------------------------------------------------------
// Scripted plugin
// ---------------------------------------------------------------------------

/// What a scripted execution does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Return `Ok` immediately.
    Complete,
    /// Return an error with this message.
    Fail(String),
    /// Panic with this message.
    Panic(String),
    /// Wait for cancellation, then stop at a checkpoint.
    WaitForCancel,
    /// Record button presses (and the observed field) until cancelled.
    CollectButtons,
    /// Ignore cancellation and sleep this long before completing.
    Stubborn(Duration),
}

/// Observations made by scripted executions.
#[derive(Debug, Default)]
pub struct Probe {
    runs: AtomicUsize,
    configs: Mutex<Vec<PluginConfig>>,
    buttons: Mutex<Vec<(String, Option<FieldValue>)>>,
}

impl Probe {
    /// Number of executions that reached `run`.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Configuration snapshots handed to `create`, oldest first.
    pub fn configs(&self) -> Vec<PluginConfig> {
        self.configs.lock().unwrap().clone()
    }

    /// Button presses with the observed field's value at press time.
    pub fn buttons(&self) -> Vec<(String, Option<FieldValue>)> {
        self.buttons.lock().unwrap().clone()
    }
}

/// Plugin factory driven by a [`Script`].
pub struct ScriptedPlugin {
    descriptor: PluginDescriptor,
    script: Script,
    observe: Option<String>,
    fail_create: bool,
    probe: Arc<Probe>,
}

impl ScriptedPlugin {
    pub fn new(descriptor: PluginDescriptor, script: Script) -> Self {
        Self {
            descriptor,
            script,
            observe: None,
            fail_create: false,
            probe: Arc::default(),
        }
    }

    /// Record `ctx.current(field)` on every button press.
    pub fn observing(mut self, field_id: &str) -> Self {
        self.observe = Some(field_id.to_owned());
        self
    }

    /// Make `create` fail.
    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn probe(&self) -> Arc<Probe> {
        Arc::clone(&self.probe)
    }
}

impl PluginFactory for ScriptedPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        self.descriptor.clone()
    }

    fn create(&self, config: &PluginConfig, _services: &Services) -> Result<Box<dyn Plugin>> {
        self.probe.configs.lock().unwrap().push(config.clone());
        if self.fail_create {
            bail!("cannot construct {}", self.descriptor.id);
        }
        Ok(Box::new(ScriptedRun {
            script: self.script.clone(),
            observe: self.observe.clone(),
            probe: Arc::clone(&self.probe),
        }))
    }
}

struct ScriptedRun {
    script: Script,
    observe: Option<String>,
    probe: Arc<Probe>,
}

#[async_trait]
impl Plugin for ScriptedRun {
    async fn run(&self, mut ctx: PluginContext) -> Result<()> {
        self.probe.runs.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Complete => {
                ctx.log("working").await;
                Ok(())
            }
            Script::Fail(message) => Err(anyhow!("{message}")),
            Script::Panic(message) => panic!("{message}"),
            Script::WaitForCancel => {
                ctx.cancelled().await;
                ctx.checkpoint()?;
                Ok(())
            }
            Script::CollectButtons => {
                while let Some(button) = ctx.next_button().await {
                    let observed = self.observe.as_deref().and_then(|f| ctx.current(f));
                    self.probe.buttons.lock().unwrap().push((button, observed));
                }
                ctx.checkpoint()?;
                Ok(())
            }
            Script::Stubborn(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptors and rig
// ---------------------------------------------------------------------------

/// `shopping_list`: `days` (number 1..=30, default 7), `include_today`
/// (switch), feedback and progress sensors.
pub fn shopping_list_descriptor() -> PluginDescriptor {
    PluginDescriptor::new("shopping_list", "Shopping List")
        .with_field(FieldSpec::number("days", "Days", 7.0, NumberRange::new(1.0, 30.0, 1.0)))
        .with_field(FieldSpec::switch("include_today", "Include Today", false))
        .with_field(FieldSpec::log_sensor("feedback", "Feedback"))
        .with_field(FieldSpec::progress_sensor("progress", "Progress"))
        .with_reset_sensor("feedback")
}

/// `recipe_tagger`: `dry_run` (live switch), feedback sensor.
pub fn recipe_tagger_descriptor() -> PluginDescriptor {
    PluginDescriptor::new("recipe_tagger", "Recipe Tagger")
        .with_field(FieldSpec::switch("dry_run", "Dry Run", false).live())
        .with_field(FieldSpec::log_sensor("feedback", "Feedback"))
        .with_reset_sensor("feedback")
}

/// `meal_planner`: `days` (number 1..=14), `message` (text), `review`
/// (live switch), `accept` button, feedback sensor.
pub fn meal_planner_descriptor() -> PluginDescriptor {
    PluginDescriptor::new("meal_planner", "Meal Planner")
        .with_field(FieldSpec::number("days", "Days", 7.0, NumberRange::new(1.0, 14.0, 1.0)))
        .with_field(FieldSpec::text("message", "Message", ""))
        .with_field(FieldSpec::switch("review", "Review", true).live())
        .with_field(FieldSpec::button("accept", "Accept"))
        .with_field(FieldSpec::log_sensor("feedback", "Feedback"))
        .with_reset_sensor("feedback")
}

/// Coordinator over a recording publisher and fake services.
pub struct TestRig {
    pub publisher: Arc<RecordingPublisher>,
    pub recipes: Arc<FakeRecipeService>,
    pub llm: Arc<FakeLanguageModel>,
    pub coordinator: Coordinator,
}

impl TestRig {
    pub fn new(factories: Vec<Box<dyn PluginFactory>>) -> Self {
        Self::with_config(factories, fast_config())
    }

    pub fn with_config(factories: Vec<Box<dyn PluginFactory>>, config: CoordinatorConfig) -> Self {
        let registry = PluginRegistry::discover(factories).expect("valid test plugins");
        let publisher = RecordingPublisher::new();
        let (services, recipes, llm) = fake_services();
        let entity_publisher = EntityPublisher::new(publisher.clone(), Namespace::default());
        let coordinator = Coordinator::new(Arc::new(registry), entity_publisher, services, config);
        Self {
            publisher,
            recipes,
            llm,
            coordinator,
        }
    }
}

/// Coordinator timings short enough for tests.
pub fn fast_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig {
        shutdown_grace: Duration::from_secs(2),
        ..CoordinatorConfig::default()
    };
    config.manager.stop_grace = Duration::from_secs(2);
    config
}

/// Default wait used by tests polling for a state.
pub const WAIT: Duration = Duration::from_secs(5);
