//! Configuration parsing and validation for chatrelay.
//!
//! Every section is optional; an empty file (or no file at all) yields the
//! built-in routing table for the chatpro upstream.

use serde::Deserialize;
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8000")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Upstream chat service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Value sent in the `origin` header on every upstream request.
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Longest wait for response headers, and then between two body chunks,
    /// in one upstream round.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Model routing table, tested in order.
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,
}

fn default_origin() -> String {
    "https://chatpro.ai-pro.org".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            routes: default_routes(),
        }
    }
}

/// One entry of the model routing table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    /// Model-name prefix this route claims (e.g., "claude").
    pub prefix: String,
    /// Endpoint family tag sent upstream as `endpoint`.
    pub family: String,
    /// Full URL of the upstream ask endpoint for this family.
    pub url: String,
}

impl RouteConfig {
    fn new(prefix: &str, family: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            family: family.to_string(),
            url: format!("https://chatpro.ai-pro.org/api/ask/{}", family),
        }
    }
}

fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig::new("gpt", "openAI"),
        RouteConfig::new("o1", "openAI"),
        RouteConfig::new("claude", "claude"),
        RouteConfig::new("gemini", "gemini"),
    ]
}

/// Continuation behavior for truncated upstream replies.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Maximum number of re-prompts after a `length` finish before the
    /// truncation is passed through to the client.
    #[serde(default = "default_max_continuations")]
    pub max_continuations: u32,
    /// Appended after the transcript on every upstream request.
    #[serde(default = "default_steering_instruction")]
    pub steering_instruction: String,
    /// User message sent when asking the upstream to keep going.
    #[serde(default = "default_continuation_prompt")]
    pub continuation_prompt: String,
}

fn default_max_continuations() -> u32 {
    8
}

fn default_steering_instruction() -> String {
    "Please follow and reply to the user\u{2019}s recent messages and avoid answers that summarize the conversation history."
        .to_string()
}

fn default_continuation_prompt() -> String {
    "Please continue your output and do not repeat the previous content".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_continuations: default_max_continuations(),
            steering_instruction: default_steering_instruction(),
            continuation_prompt: default_continuation_prompt(),
        }
    }
}

/// Static model list served by `GET /v1/models`.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_models")]
    pub models: Vec<String>,
}

fn default_models() -> Vec<String> {
    [
        "o1-preview",
        "o1-mini",
        "gpt-4o",
        "gpt-4o-mini",
        "claude-3.5-sonnet",
        "claude-3.5-haiku",
        "claude-3-opus",
        "claude-3-sonnet",
        "claude-3-haiku",
        "gemini-exp-1121",
        "gemini-exp-1114",
        "gemini-1.5-pro",
        "gemini-1.5-pro-latest",
        "gemini-1.5-flash",
        "gemini-1.5-flash-latest",
        "gemini-pro",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, expanding `${VAR}` references.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string, expanding `${VAR}` references.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        let config = config.expand_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise fall back to built-in defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Expand `${VAR}` references in the origin and every route URL.
    fn expand_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.upstream.origin = expand_env_vars_with(&self.upstream.origin, "upstream.origin", &lookup)?;
        for route in &mut self.upstream.routes {
            let field = format!("upstream.routes[{}].url", route.prefix);
            route.url = expand_env_vars_with(&route.url, &field, &lookup)?;
        }
        Ok(self)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.routes.is_empty() {
            return Err(ConfigError::Validation(
                "At least one upstream route is required".to_string(),
            ));
        }

        for route in &self.upstream.routes {
            if route.prefix.is_empty() || route.family.is_empty() || route.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Route {:?} has an empty prefix, family or url",
                    route
                )));
            }
        }

        if self.upstream.read_timeout_secs == 0 || self.upstream.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Upstream timeouts must be greater than zero".to_string(),
            ));
        }

        if self.catalog.models.is_empty() {
            tracing::warn!("Model catalog is empty - /v1/models will list nothing");
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{field}': {message}")]
    EnvVar {
        var: String,
        field: String,
        message: String,
    },
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/api`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, field: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            field: field.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                field: field.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            field: field.to_string(),
            message: format!("Environment variable '{}' is not set", var_name),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}
