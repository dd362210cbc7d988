//! Helpers shared by the plugin integration tests.

#![allow(dead_code)]

use std::time::Duration;

use chrono::{Days, Local, NaiveDate};

use mealiemate_core::ExecutionState;
use mealiemate_plugins::builtin_factories;
use mealiemate_test_utils::{TestRig, WAIT};

pub fn rig() -> TestRig {
    TestRig::new(builtin_factories())
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn in_days(days: u64) -> NaiveDate {
    today().checked_add_days(Days::new(days)).unwrap()
}

/// Accumulated feedback text of a plugin.
pub fn feedback(rig: &TestRig, plugin_id: &str) -> String {
    sensor_text(rig, plugin_id, "feedback")
}

/// Accumulated text of any log sensor.
pub fn sensor_text(rig: &TestRig, plugin_id: &str, sensor_id: &str) -> String {
    let topic = format!("mealiemate/{plugin_id}/{sensor_id}/attributes");
    let payload = rig.publisher.last_payload(&topic).unwrap_or_default();
    let value: serde_json::Value = serde_json::from_str(&payload).unwrap_or_default();
    value["full_text"].as_str().unwrap_or_default().to_owned()
}

/// Enable a plugin and wait for its execution to end.
pub async fn run_to_end(rig: &TestRig, plugin_id: &str) {
    let manager = rig.coordinator.manager();
    manager.set_enabled(plugin_id, true).await.unwrap();
    assert!(
        manager.wait_for_state(plugin_id, ExecutionState::Idle, WAIT).await,
        "{plugin_id} did not finish"
    );
}

/// Poll until the plugin's feedback contains `needle`.
pub async fn wait_for_feedback(rig: &TestRig, plugin_id: &str, needle: &str) {
    let found = tokio::time::timeout(WAIT, async {
        while !feedback(rig, plugin_id).contains(needle) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(found.is_ok(), "feedback never contained {needle:?}: {}", feedback(rig, plugin_id));
}
