//! Configuration file management for mealiemate.
//!
//! Provides a TOML config file at `~/.config/mealiemate/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use mealiemate_clients::{LlmConfig, MealieConfig, MqttConfig};
use mealiemate_core::entity::topics::is_valid_identifier;
use mealiemate_core::{CoordinatorConfig, Namespace};

pub const ENV_MQTT_BROKER: &str = "MQTT_BROKER";
pub const ENV_MQTT_PORT: &str = "MQTT_PORT";
pub const ENV_MQTT_USERNAME: &str = "MQTT_USERNAME";
pub const ENV_MQTT_PASSWORD: &str = "MQTT_PASSWORD";
pub const ENV_MQTT_CLIENT_ID: &str = "MQTT_CLIENT_ID";
pub const ENV_MEALIE_URL: &str = "MEALIE_URL";
pub const ENV_MEALIE_TOKEN: &str = "MEALIE_TOKEN";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_OPENAI_MODEL: &str = "OPENAI_MODEL";
pub const ENV_OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";
pub const ENV_TOPIC_ROOT: &str = "MEALIEMATE_TOPIC_ROOT";
pub const ENV_DISCOVERY_PREFIX: &str = "MEALIEMATE_DISCOVERY_PREFIX";
pub const ENV_HEARTBEAT_SECS: &str = "MEALIEMATE_HEARTBEAT_SECS";
pub const ENV_SHUTDOWN_GRACE_SECS: &str = "MEALIEMATE_SHUTDOWN_GRACE_SECS";

pub const DEFAULT_HEARTBEAT_SECS: u64 = 3600;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
pub const MAX_HEARTBEAT_SECS: u64 = 86_400;
pub const MAX_SHUTDOWN_GRACE_SECS: u64 = 3_600;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub mqtt: MqttSection,
    pub mealie: MealieSection,
    pub openai: OpenAiSection,
    pub service: ServiceSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub broker: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MealieSection {
    pub url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSection {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub topic_root: Option<String>,
    pub discovery_prefix: Option<String>,
    pub heartbeat_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the mealiemate config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/mealiemate` or
/// `~/.config/mealiemate`, on every platform.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mealiemate");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("mealiemate")
}

/// Return the path to the mealiemate config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file. A missing file is `None`; an unreadable
/// or malformed one is an error.
pub fn load_config(path: &Path) -> Result<Option<ConfigFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

/// Serialize and write a config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix since the file holds secrets.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Config file written by `mealiemate init`: every setting present, with
/// defaults and empty secrets to fill in.
pub fn template(overrides: &Overrides) -> ConfigFile {
    ConfigFile {
        mqtt: MqttSection {
            broker: Some(overrides.broker.clone().unwrap_or_else(|| "localhost".to_owned())),
            port: Some(MqttConfig::DEFAULT_PORT),
            username: Some(String::new()),
            password: Some(String::new()),
            client_id: Some(MqttConfig::DEFAULT_CLIENT_ID.to_owned()),
        },
        mealie: MealieSection {
            url: Some(
                overrides
                    .mealie_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:9925".to_owned()),
            ),
            token: Some(String::new()),
        },
        openai: OpenAiSection {
            api_key: Some(String::new()),
            model: Some(LlmConfig::DEFAULT_MODEL.to_owned()),
            base_url: Some(LlmConfig::DEFAULT_BASE_URL.to_owned()),
        },
        service: ServiceSection {
            topic_root: Some(
                overrides
                    .topic_root
                    .clone()
                    .unwrap_or_else(|| Namespace::DEFAULT_ROOT.to_owned()),
            ),
            discovery_prefix: Some(Namespace::DEFAULT_DISCOVERY_PREFIX.to_owned()),
            heartbeat_secs: Some(DEFAULT_HEARTBEAT_SECS),
            shutdown_grace_secs: Some(DEFAULT_SHUTDOWN_GRACE_SECS),
        },
    }
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is not set; export it or add it to {path} (`mealiemate init` writes a template)")]
    Missing { key: &'static str, path: String },

    #[error("invalid {key} {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub broker: Option<String>,
    pub mealie_url: Option<String>,
    pub topic_root: Option<String>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mqtt: MqttConfig,
    pub mealie: MealieConfig,
    pub llm: LlmConfig,
    pub namespace: Namespace,
    pub coordinator: CoordinatorConfig,
}

/// The three configuration sources, captured once.
#[derive(Debug)]
pub struct Resolver {
    overrides: Overrides,
    env: HashMap<String, String>,
    file: ConfigFile,
    path: PathBuf,
}

/// Empty strings count as unset in every source.
fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_owned)
}

impl Resolver {
    /// Capture the process environment and the config file (the
    /// `--config` path, else [`config_path`]).
    pub fn from_environment(overrides: Overrides) -> Result<Self> {
        let path = overrides.config.clone().unwrap_or_else(config_path);
        let file = load_config(&path)?.unwrap_or_default();
        Ok(Self::new(overrides, std::env::vars().collect(), file, path))
    }

    pub fn new(
        overrides: Overrides,
        env: HashMap<String, String>,
        file: ConfigFile,
        path: PathBuf,
    ) -> Self {
        Self {
            overrides,
            env,
            file,
            path,
        }
    }

    /// CLI flag > env var > config file.
    fn lookup(&self, cli: Option<&str>, key: &str, file: Option<&str>) -> Option<String> {
        non_empty(cli)
            .or_else(|| non_empty(self.env.get(key).map(String::as_str)))
            .or_else(|| non_empty(file))
    }

    fn required(
        &self,
        cli: Option<&str>,
        key: &'static str,
        file: Option<&str>,
    ) -> Result<String, ConfigError> {
        self.lookup(cli, key, file).ok_or_else(|| ConfigError::Missing {
            key,
            path: self.path.display().to_string(),
        })
    }

    /// Numeric setting: env var > config file > default.
    fn number<T>(&self, key: &'static str, file: Option<T>, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match non_empty(self.env.get(key).map(String::as_str)) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
            None => Ok(file.unwrap_or(default)),
        }
    }

    /// Topic namespace; needs no credentials.
    pub fn namespace(&self) -> Result<Namespace, ConfigError> {
        let service = &self.file.service;
        let root = self
            .lookup(
                self.overrides.topic_root.as_deref(),
                ENV_TOPIC_ROOT,
                service.topic_root.as_deref(),
            )
            .unwrap_or_else(|| Namespace::DEFAULT_ROOT.to_owned());
        if !is_valid_identifier(&root) {
            return Err(ConfigError::Invalid {
                key: ENV_TOPIC_ROOT,
                value: root,
                reason: "must be lowercase letters, digits and underscores".to_owned(),
            });
        }
        let prefix = self
            .lookup(None, ENV_DISCOVERY_PREFIX, service.discovery_prefix.as_deref())
            .unwrap_or_else(|| Namespace::DEFAULT_DISCOVERY_PREFIX.to_owned());
        Ok(Namespace::new(root, prefix))
    }

    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let file = &self.file;

        let mut mqtt = MqttConfig::new(self.required(
            self.overrides.broker.as_deref(),
            ENV_MQTT_BROKER,
            file.mqtt.broker.as_deref(),
        )?);
        mqtt.port = self.number(ENV_MQTT_PORT, file.mqtt.port, MqttConfig::DEFAULT_PORT)?;
        mqtt.username = self.lookup(None, ENV_MQTT_USERNAME, file.mqtt.username.as_deref());
        mqtt.password = self.lookup(None, ENV_MQTT_PASSWORD, file.mqtt.password.as_deref());
        if let Some(client_id) =
            self.lookup(None, ENV_MQTT_CLIENT_ID, file.mqtt.client_id.as_deref())
        {
            mqtt.client_id = client_id;
        }

        let mealie = MealieConfig::new(
            self.required(
                self.overrides.mealie_url.as_deref(),
                ENV_MEALIE_URL,
                file.mealie.url.as_deref(),
            )?,
            self.required(None, ENV_MEALIE_TOKEN, file.mealie.token.as_deref())?,
        );

        let mut llm = LlmConfig::new(self.required(
            None,
            ENV_OPENAI_API_KEY,
            file.openai.api_key.as_deref(),
        )?);
        if let Some(model) = self.lookup(None, ENV_OPENAI_MODEL, file.openai.model.as_deref()) {
            llm = llm.with_model(model);
        }
        if let Some(base_url) =
            self.lookup(None, ENV_OPENAI_BASE_URL, file.openai.base_url.as_deref())
        {
            llm = llm.with_base_url(base_url);
        }

        let heartbeat = self.number(
            ENV_HEARTBEAT_SECS,
            file.service.heartbeat_secs,
            DEFAULT_HEARTBEAT_SECS,
        )?;
        check_bounds(ENV_HEARTBEAT_SECS, heartbeat, 1, MAX_HEARTBEAT_SECS, "one day")?;
        let grace = self.number(
            ENV_SHUTDOWN_GRACE_SECS,
            file.service.shutdown_grace_secs,
            DEFAULT_SHUTDOWN_GRACE_SECS,
        )?;
        check_bounds(ENV_SHUTDOWN_GRACE_SECS, grace, 0, MAX_SHUTDOWN_GRACE_SECS, "one hour")?;
        let mut coordinator = CoordinatorConfig {
            heartbeat_interval: Duration::from_secs(heartbeat),
            shutdown_grace: Duration::from_secs(grace),
            ..CoordinatorConfig::default()
        };
        coordinator.manager.stop_grace = Duration::from_secs(grace);

        Ok(Settings {
            mqtt,
            mealie,
            llm,
            namespace: self.namespace()?,
            coordinator,
        })
    }
}

/// Durations feed `Instant` arithmetic, so they stay well inside its range.
fn check_bounds(
    key: &'static str,
    secs: u64,
    min: u64,
    max: u64,
    max_label: &str,
) -> Result<(), ConfigError> {
    let reason = if secs < min {
        "must be at least one second".to_owned()
    } else if secs > max {
        format!("must be at most {max_label} ({max} seconds)")
    } else {
        return Ok(());
    };
    Err(ConfigError::Invalid {
        key,
        value: secs.to_string(),
        reason,
    })
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
