//! Engine Configuration
//!
//! [`EngineConfig`] says where the chat API lives and how a session behaves:
//! the opening statement, the input form, and which reads follow a finished
//! answer. The file lives at `$XDG_CONFIG_HOME/convo/engine.toml`.
//!
//! # Layering
//!
//! Each layer only sets the keys it names; later layers win:
//!
//! - built-in defaults
//! - the `engine.toml` file, when present
//! - `CONVO_*` environment variables
//! - [`ConfigOverrides`] from the command line
//!
//! # Example
//!
//! ```toml
//! [api]
//! base_url = "https://chat.example.com/api"
//! connect_timeout_ms = 5000
//! stream_buffer = 100
//!
//! [chat]
//! opening_statement = "Hi {{name}}, how can I help?"
//! suggested_questions = ["What can you do?"]
//! suggested_questions_after_answer = true
//! fetch_conversation_messages = true
//!
//! [[chat.inputs_form]]
//! variable = "name"
//! type = "text-input"
//! required = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::DEFAULT_STREAM_BUFFER;
use crate::inputs::InputField;

// =============================================================================
// Errors
// =============================================================================

/// Why an [`EngineConfig`] could not be built
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `engine.toml` exists but could not be read
    #[error("Cannot read {path}: {source}")]
    ReadError {
        /// File that was opened
        path: PathBuf,
        /// I/O failure
        source: std::io::Error,
    },

    /// `engine.toml` is not valid TOML or has mistyped keys
    #[error("Malformed engine.toml: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value is out of range after all layers were applied
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Highest layer that contributed to a configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line overrides
    Cli,
    /// `CONVO_*` variables
    Env,
    /// `engine.toml`
    File,
    /// Nothing but built-in defaults
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// engine.toml layout
// =============================================================================

/// `[api]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiToml {
    /// Base URL of the chat API
    pub base_url: Option<String>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Event channel capacity per stream
    pub stream_buffer: Option<usize>,
}

/// `[chat]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatToml {
    /// Opening statement template
    pub opening_statement: Option<String>,

    /// Suggested questions shown with the opening statement
    pub suggested_questions: Option<Vec<String>>,

    /// Fetch suggested follow-ups after each answer
    pub suggested_questions_after_answer: Option<bool>,

    /// Refetch the persisted message after each answer
    pub fetch_conversation_messages: Option<bool>,

    /// Input form variables
    pub inputs_form: Option<Vec<InputField>>,
}

/// Whole `engine.toml` document
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineToml {
    /// API section
    pub api: ApiToml,

    /// Chat section
    pub chat: ChatToml,
}

// =============================================================================
// Resolved configuration
// =============================================================================

/// Resolved engine configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Base URL of the chat API (no trailing slash)
    pub base_url: String,

    /// Connection timeout for every request
    pub connect_timeout: Duration,

    /// Event channel capacity per stream
    pub stream_buffer: usize,

    /// Opening statement template (`{{var}}` substituted from inputs)
    pub opening_statement: Option<String>,

    /// Suggested questions attached to the opening statement
    pub suggested_questions: Vec<String>,

    /// Fetch suggested follow-ups after each answer
    pub suggested_questions_after_answer: bool,

    /// Refetch the persisted message after each answer
    pub fetch_conversation_messages: bool,

    /// Input form variables checked before each send
    pub inputs_form: Vec<InputField>,

    /// `engine.toml` that contributed, if one was found
    pub config_file_path: Option<PathBuf>,

    pub(crate) source: ConfigSource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5001/api".to_string(),
            connect_timeout: Duration::from_secs(10),
            stream_buffer: DEFAULT_STREAM_BUFFER,
            opening_statement: None,
            suggested_questions: Vec::new(),
            suggested_questions_after_answer: false,
            fetch_conversation_messages: true,
            inputs_form: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl EngineConfig {
    /// Built-in defaults only
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check values that would make the engine unusable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "api.base_url must be an http(s) URL, got `{}`",
                self.base_url
            )));
        }
        if self.stream_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "api.stream_buffer must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.inputs_form {
            if !seen.insert(field.variable.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate input variable `{}`",
                    field.variable
                )));
            }
        }
        Ok(())
    }

    /// Load defaults overridden by `CONVO_*` environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        apply_env_config(&mut config, |key| std::env::var(key).ok());
        config
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Where `engine.toml` is looked up (`None` without a config home)
///
/// Returns `$XDG_CONFIG_HOME/convo/engine.toml` or
/// `~/.config/convo/engine.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("convo").join("engine.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns a [`ConfigError`] when `engine.toml` exists but is malformed.
/// A missing file just leaves the defaults in place.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns a [`ConfigError`] when the file exists but is unreadable or malformed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<EngineConfig, ConfigError> {
    load_config_with_env(path.as_deref(), |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Returns a [`ConfigError`] when the file exists but is unreadable or malformed.
pub fn load_config_with_env<F>(path: Option<&Path>, lookup: F) -> Result<EngineConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = EngineConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            let toml_config: EngineToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Engine configuration read"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "No engine.toml, keeping defaults"
            );
        }
    }

    apply_env_config(&mut config, lookup);

    Ok(config)
}

fn apply_toml_config(config: &mut EngineConfig, toml: EngineToml) {
    if let Some(url) = toml.api.base_url {
        config.base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(ms) = toml.api.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(buffer) = toml.api.stream_buffer {
        config.stream_buffer = buffer;
    }

    if toml.chat.opening_statement.is_some() {
        config.opening_statement = toml.chat.opening_statement;
    }
    if let Some(questions) = toml.chat.suggested_questions {
        config.suggested_questions = questions;
    }
    if let Some(enabled) = toml.chat.suggested_questions_after_answer {
        config.suggested_questions_after_answer = enabled;
    }
    if let Some(enabled) = toml.chat.fetch_conversation_messages {
        config.fetch_conversation_messages = enabled;
    }
    if let Some(form) = toml.chat.inputs_form {
        config.inputs_form = form;
    }
}

fn parse_flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

fn apply_env_config<F>(config: &mut EngineConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("CONVO_BASE_URL") {
        config.base_url = url.trim_end_matches('/').to_string();
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = lookup("CONVO_CONNECT_TIMEOUT") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.connect_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(buffer) = lookup("CONVO_STREAM_BUFFER") {
        if let Ok(n) = buffer.parse::<usize>() {
            config.stream_buffer = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(statement) = lookup("CONVO_OPENING_STATEMENT") {
        config.opening_statement = Some(statement);
        config.source = ConfigSource::Env;
    }
    if let Some(enabled) = lookup("CONVO_SUGGESTED_QUESTIONS") {
        config.suggested_questions_after_answer = parse_flag(&enabled);
        config.source = ConfigSource::Env;
    }
    if let Some(enabled) = lookup("CONVO_FETCH_MESSAGES") {
        config.fetch_conversation_messages = parse_flag(&enabled);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// Command-line overrides
// =============================================================================

/// Command-line overrides applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,

    /// Connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Suggested questions after answer override
    pub suggested_questions_after_answer: Option<bool>,
}

impl ConfigOverrides {
    /// No overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Override the connect timeout
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    /// Set suggested questions override
    #[must_use]
    pub fn with_suggested_questions(mut self, enabled: bool) -> Self {
        self.suggested_questions_after_answer = Some(enabled);
        self
    }

    /// Write every set override into `config`
    pub fn apply(&self, config: &mut EngineConfig) {
        if self.base_url.is_some()
            || self.connect_timeout_ms.is_some()
            || self.suggested_questions_after_answer.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref url) = self.base_url {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = self.suggested_questions_after_answer {
            config.suggested_questions_after_answer = enabled;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
