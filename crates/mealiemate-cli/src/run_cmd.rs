//! `mealiemate run`: connect, publish discovery and route broker messages
//! until a shutdown signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mealiemate_clients::{MealieClient, OpenAiClient, mqtt};
use mealiemate_core::{Coordinator, EntityPublisher, PluginRegistry, Services};
use mealiemate_plugins::builtin_factories;

use crate::config::Settings;

/// How long the listener may take to flush the disconnect.
const LISTENER_DRAIN: Duration = Duration::from_secs(5);

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    tokio::signal::ctrl_c().await.ok();
}

/// First signal cancels, second force-exits.
fn install_signal_handler(cancel: CancellationToken) {
    let got_first_signal = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            shutdown_signal().await;
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel.cancel();
        }
    });
}

/// Run the service until shutdown.
pub async fn run_service(settings: Settings) -> Result<()> {
    let registry = PluginRegistry::discover(builtin_factories())
        .context("built-in plugins failed to register")?;
    tracing::info!(plugins = ?registry.list(), "plugins registered");

    let recipes = MealieClient::new(&settings.mealie)?;
    let llm = OpenAiClient::new(settings.llm.clone())?;
    tracing::info!(mealie = %settings.mealie.base_url, model = %llm.model(), "collaborators ready");
    let services = Services::new(Arc::new(recipes), Arc::new(llm));

    let (broker, listener) = mqtt::connect(&settings.mqtt, &settings.namespace).await?;
    let (intake, messages) = mpsc::unbounded_channel();
    // The listener must poll before anything is published, or the client's
    // request queue fills up.
    let mut listener_task = tokio::spawn(listener.run(intake));

    let publisher = EntityPublisher::new(Arc::new(broker.clone()), settings.namespace.clone());
    let coordinator = Coordinator::new(
        Arc::new(registry),
        publisher,
        services,
        settings.coordinator.clone(),
    );

    let report = coordinator.publish_discovery().await;
    for (plugin_id, error) in &report.failed {
        tracing::error!(plugin_id = %plugin_id, error = %error, "discovery failed");
    }
    tracing::info!(published = report.published.len(), failed = report.failed.len(), "discovery published");

    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone());
    let result = coordinator.run(messages, cancel).await;

    if let Err(e) = broker.disconnect().await {
        tracing::warn!(error = %format!("{e:#}"), "unclean MQTT disconnect");
    }
    if tokio::time::timeout(LISTENER_DRAIN, &mut listener_task).await.is_err() {
        tracing::warn!("MQTT listener did not stop, aborting it");
        listener_task.abort();
    }

    tracing::info!("mealiemate stopped");
    result
}
