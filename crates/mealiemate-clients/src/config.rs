use std::time::Duration;

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    /// How long to wait for the first `ConnAck`.
    pub connect_timeout: Duration,
}

impl MqttConfig {
    pub const DEFAULT_PORT: u16 = 1883;
    pub const DEFAULT_CLIENT_ID: &str = "mealiemate";

    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Self::DEFAULT_PORT,
            username: None,
            password: None,
            client_id: Self::DEFAULT_CLIENT_ID.to_owned(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Credentials are only sent when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

/// Mealie API settings.
#[derive(Debug, Clone)]
pub struct MealieConfig {
    /// Base URL without a trailing slash, e.g. `http://mealie:9925`.
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
}

impl MealieConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token: token.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Chat-completion API settings. Any OpenAI-compatible endpoint works.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub temperature: f32,
}

impl LlmConfig {
    pub const DEFAULT_MODEL: &str = "gpt-4o";
    pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: Self::DEFAULT_MODEL.to_owned(),
            base_url: Self::DEFAULT_BASE_URL.to_owned(),
            timeout: Duration::from_secs(120),
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            temperature: 0.1,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}
