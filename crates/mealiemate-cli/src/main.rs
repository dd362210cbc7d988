mod config;
mod inspect_cmd;
mod run_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mealiemate_core::PluginRegistry;
use mealiemate_plugins::builtin_factories;

use config::{Overrides, Resolver};

#[derive(Parser)]
#[command(name = "mealiemate", version, about = "MQTT plugin coordinator for Mealie automations")]
struct Cli {
    /// Config file (defaults to ~/.config/mealiemate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// MQTT broker host (overrides MQTT_BROKER env var)
    #[arg(long, global = true)]
    broker: Option<String>,

    /// Mealie base URL (overrides MEALIE_URL env var)
    #[arg(long, global = true)]
    mealie_url: Option<String>,

    /// Topic namespace root (overrides MEALIEMATE_TOPIC_ROOT env var)
    #[arg(long, global = true)]
    topic_root: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and serve the plugins until interrupted
    Run,
    /// List registered plugins and their entity topics
    Plugins,
    /// Print the discovery messages as JSON (no broker required)
    Discovery,
    /// Write a config file template
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            config: self.config.clone(),
            broker: self.broker.clone(),
            mealie_url: self.mealie_url.clone(),
            topic_root: self.topic_root.clone(),
        }
    }
}

/// Execute the `mealiemate init` command: write the config template.
fn cmd_init(overrides: &Overrides, force: bool) -> anyhow::Result<()> {
    let path = overrides.config.clone().unwrap_or_else(config::config_path);

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    config::save_config(&path, &config::template(overrides))?;

    println!("Config written to {}", path.display());
    println!();
    println!("Next: fill in mealie.token and openai.api_key, then run `mealiemate run`.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let overrides = cli.overrides();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(&overrides, force)?;
        }
        Commands::Run => {
            let settings = Resolver::from_environment(overrides)?.settings()?;
            run_cmd::run_service(settings).await?;
        }
        Commands::Plugins => {
            let ns = Resolver::from_environment(overrides)?.namespace()?;
            let registry = PluginRegistry::discover(builtin_factories())?;
            print!("{}", inspect_cmd::render_plugins(&registry, &ns)?);
            println!(
                "{} plugins, {} controllable entities",
                registry.len(),
                inspect_cmd::controllable_count(&registry, &ns)
            );
        }
        Commands::Discovery => {
            let ns = Resolver::from_environment(overrides)?.namespace()?;
            let registry = PluginRegistry::discover(builtin_factories())?;
            let document = inspect_cmd::discovery_document(&registry, &ns)?;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
    }

    Ok(())
}
