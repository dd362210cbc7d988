//! Coordinator tests: discovery, replay, system commands and the run loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;

use mealiemate_core::router::SystemCommand;
use mealiemate_core::{ExecutionState, InboundMessage, PluginFactory, RouterAction};
use mealiemate_test_utils::{
    Script, ScriptedPlugin, TestRig, WAIT, fast_config, meal_planner_descriptor,
    recipe_tagger_descriptor, shopping_list_descriptor,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn rig() -> TestRig {
    let factories: Vec<Box<dyn PluginFactory>> = vec![
        Box::new(ScriptedPlugin::new(shopping_list_descriptor(), Script::Complete)),
        Box::new(ScriptedPlugin::new(meal_planner_descriptor(), Script::Complete)),
        Box::new(ScriptedPlugin::new(recipe_tagger_descriptor(), Script::WaitForCancel)),
    ];
    TestRig::new(factories)
}

// ===========================================================================
// Discovery
// ===========================================================================

#[tokio::test]
async fn discovery_publishes_every_entity_retained() {
    let rig = rig();
    let report = rig.coordinator.publish_discovery().await;

    assert_eq!(report.published, ["meal_planner", "recipe_tagger", "shopping_list"]);
    assert!(report.failed.is_empty());

    let configs: Vec<_> = rig
        .publisher
        .messages()
        .into_iter()
        .filter(|m| m.topic.ends_with("/config"))
        .collect();
    assert!(configs.iter().all(|m| m.retain));

    let topics: Vec<&str> = configs.iter().map(|m| m.topic.as_str()).collect();
    for expected in [
        "homeassistant/switch/mealiemate/shopping_list_switch/config",
        "homeassistant/number/mealiemate/shopping_list_days/config",
        "homeassistant/switch/mealiemate/shopping_list_include_today/config",
        "homeassistant/sensor/mealiemate/shopping_list_feedback/config",
        "homeassistant/sensor/mealiemate/shopping_list_progress/config",
        "homeassistant/text/mealiemate/meal_planner_message/config",
        "homeassistant/button/mealiemate/meal_planner_accept/config",
        "homeassistant/binary_sensor/mealiemate/status_state/config",
        "homeassistant/button/mealiemate/system_rediscover/config",
    ] {
        assert!(topics.contains(&expected), "missing {expected}");
    }

    let days: serde_json::Value = serde_json::from_str(
        &rig.publisher
            .last_payload("homeassistant/number/mealiemate/shopping_list_days/config")
            .unwrap(),
    )
    .unwrap();
    assert_eq!(days["command_topic"], "mealiemate/shopping_list/days/set");
    assert_eq!(days["state_topic"], "mealiemate/shopping_list/days/state");
    assert_eq!(days["min"], 1.0);
    assert_eq!(days["max"], 30.0);
}

#[tokio::test]
async fn discovery_failures_are_reported_per_plugin() {
    let rig = rig();
    rig.publisher.set_failing(true);

    let report = rig.coordinator.publish_discovery().await;
    assert!(report.published.is_empty());
    assert_eq!(report.failed.len(), 3);
    assert!(report.failed.iter().all(|(_, cause)| cause.contains("broker unavailable")));
}

#[tokio::test]
async fn hub_birth_republishes_discovery() {
    let rig = rig();
    let action = rig
        .coordinator
        .handle(&InboundMessage::new("homeassistant/status", "online"))
        .await;
    assert_eq!(action, RouterAction::SystemCommand(SystemCommand::Rediscover));
    assert!(
        rig.publisher
            .topics()
            .iter()
            .any(|t| t == "homeassistant/switch/mealiemate/shopping_list_switch/config")
    );
}

#[tokio::test]
async fn retained_hub_birth_does_not_repeat_discovery() {
    let rig = rig();
    rig.coordinator.publish_discovery().await;
    let configs = |rig: &TestRig| {
        rig.publisher
            .topics()
            .iter()
            .filter(|t| t.ends_with("/config"))
            .count()
    };
    let before = configs(&rig);

    let action = rig
        .coordinator
        .handle(&InboundMessage::retained("homeassistant/status", "online"))
        .await;

    assert!(matches!(action, RouterAction::Unroutable(_)), "{action:?}");
    assert_eq!(configs(&rig), before);
}

// ===========================================================================
// Replay and system commands
// ===========================================================================

#[tokio::test]
async fn retained_replay_restores_state() {
    let rig = rig();
    let manager = rig.coordinator.manager();

    for message in [
        InboundMessage::retained("mealiemate/recipe_tagger/switch/set", "ON"),
        InboundMessage::retained("mealiemate/meal_planner/days/set", "5"),
    ] {
        rig.coordinator.handle(&message).await;
    }

    assert_eq!(manager.config("meal_planner").unwrap().number("days"), Some(5.0));
    assert_eq!(manager.state("recipe_tagger"), Some(ExecutionState::Running));
    assert_eq!(manager.state("shopping_list"), Some(ExecutionState::Idle));
}

#[tokio::test]
async fn unroutable_messages_change_nothing() {
    let rig = rig();
    for (topic, payload) in [
        ("mealiemate/pizza/switch/set", "ON"),
        ("mealiemate/shopping_list/days/set", "forty"),
        ("mealiemate/shopping_list/feedback/set", "x"),
        ("somewhere/else", "ON"),
    ] {
        let action = rig.coordinator.handle(&InboundMessage::new(topic, payload)).await;
        assert!(matches!(action, RouterAction::Unroutable(_)), "{topic}");
    }
    let manager = rig.coordinator.manager();
    assert!(manager.running().is_empty());
    assert_eq!(manager.config("shopping_list").unwrap().number("days"), Some(7.0));
    assert!(rig.publisher.messages().is_empty());
}

#[tokio::test]
async fn reset_sensors_command_clears_feedback() {
    let rig = rig();
    let manager = rig.coordinator.manager();
    manager.set_enabled("shopping_list", true).await.unwrap();
    assert!(manager.wait_for_state("shopping_list", ExecutionState::Idle, WAIT).await);

    rig.coordinator
        .handle(&InboundMessage::new("mealiemate/system/reset_sensors/set", "PRESS"))
        .await;

    for plugin in ["shopping_list", "meal_planner", "recipe_tagger"] {
        let topic = format!("mealiemate/{plugin}/feedback/attributes");
        let payload = rig.publisher.last_payload(&topic).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["full_text"], "", "{plugin}");
    }
}

// ===========================================================================
// Run loop
// ===========================================================================

#[tokio::test]
async fn run_applies_intake_in_order_and_shuts_down() {
    let rig = rig();
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    tx.send(InboundMessage::retained("mealiemate/meal_planner/days/set", "4"))
        .unwrap();
    tx.send(InboundMessage::retained("mealiemate/recipe_tagger/switch/set", "ON"))
        .unwrap();
    tx.send(InboundMessage::new("mealiemate/meal_planner/days/set", "9"))
        .unwrap();

    let coordinator = &rig.coordinator;
    let run = {
        let cancel = cancel.clone();
        async move { coordinator.run(rx, cancel).await }
    };
    let observe = async {
        let manager = rig.coordinator.manager();
        assert!(manager.wait_for_state("recipe_tagger", ExecutionState::Running, WAIT).await);
        for _ in 0..50 {
            if manager.config("meal_planner").unwrap().number("days") == Some(9.0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(run, observe);
    result.unwrap();

    let manager = rig.coordinator.manager();
    assert_eq!(manager.config("meal_planner").unwrap().number("days"), Some(9.0));
    assert_eq!(
        rig.publisher.payloads("mealiemate/meal_planner/days/state"),
        ["4", "9"]
    );
    assert_eq!(manager.state("recipe_tagger"), Some(ExecutionState::Idle));

    let status = rig.publisher.payloads("mealiemate/status/state");
    assert_eq!(status.first().map(String::as_str), Some("ON"));
    assert_eq!(status.last().map(String::as_str), Some("OFF"));
}

#[tokio::test]
async fn run_exits_when_intake_closes() {
    let rig = TestRig::with_config(
        vec![Box::new(ScriptedPlugin::new(
            shopping_list_descriptor(),
            Script::Complete,
        ))],
        fast_config(),
    );
    let (tx, rx) = mpsc::unbounded_channel::<InboundMessage>();
    drop(tx);

    tokio::time::timeout(WAIT, rig.coordinator.run(rx, CancellationToken::new()))
        .await
        .expect("run loop exits")
        .unwrap();
    assert_eq!(
        rig.publisher.last_payload("mealiemate/status/state").as_deref(),
        Some("OFF")
    );
}

#[tokio::test]
async fn out_of_range_intervals_fail_the_run() {
    let mut config = fast_config();
    config.heartbeat_interval = Duration::MAX;
    let rig = TestRig::with_config(
        vec![Box::new(ScriptedPlugin::new(
            shopping_list_descriptor(),
            Script::Complete,
        ))],
        config,
    );
    let (_tx, rx) = mpsc::unbounded_channel::<InboundMessage>();

    let err = rig
        .coordinator
        .run(rx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("heartbeat interval"), "{err:#}");
    assert!(rig.publisher.messages().is_empty());
}

// ===========================================================================
// Housekeeping timers
// ===========================================================================

fn feedback_text(rig: &TestRig, plugin: &str) -> String {
    let topic = format!("mealiemate/{plugin}/feedback/attributes");
    let payload = rig.publisher.last_payload(&topic).unwrap_or_default();
    let value: serde_json::Value = serde_json::from_str(&payload).unwrap_or_default();
    value["full_text"].as_str().unwrap_or_default().to_owned()
}

#[tokio::test(start_paused = true)]
async fn heartbeat_republishes_online_status() {
    let rig = rig();
    let (_tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let run = rig.coordinator.run(rx, cancel.clone());
    let observe = async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let early = rig.publisher.payloads("mealiemate/status/state");
        tokio::time::sleep(Duration::from_secs(3600)).await;
        let later = rig.publisher.payloads("mealiemate/status/state");
        cancel.cancel();
        (early, later)
    };
    let (result, (early, later)) = tokio::join!(run, observe);
    result.unwrap();

    assert_eq!(early, ["ON"]);
    assert_eq!(later, ["ON", "ON"]);
}

#[tokio::test(start_paused = true)]
async fn day_change_resets_feedback_sensors() {
    let today = Arc::new(Mutex::new(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()));
    let mut rig = rig();
    let clock = Arc::clone(&today);
    rig.coordinator = rig.coordinator.with_today(move || *clock.lock().unwrap());

    let manager = rig.coordinator.manager();
    manager.set_enabled("shopping_list", true).await.unwrap();
    assert!(manager.wait_for_state("shopping_list", ExecutionState::Idle, WAIT).await);
    assert!(feedback_text(&rig, "shopping_list").contains("Completed successfully"));

    let (_tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let run = rig.coordinator.run(rx, cancel.clone());
    let observe = async {
        tokio::time::sleep(Duration::from_secs(150)).await;
        let same_day = feedback_text(&rig, "shopping_list");

        *today.lock().unwrap() = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        let next_day = feedback_text(&rig, "shopping_list");
        cancel.cancel();
        (same_day, next_day)
    };
    let (result, (same_day, next_day)) = tokio::join!(run, observe);
    result.unwrap();

    assert!(same_day.contains("Completed successfully"), "{same_day:?}");
    assert_eq!(next_day, "");
}
