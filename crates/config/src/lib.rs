//! Configuration loading, validation, and management for ctxgate.
//!
//! Loads configuration from `~/.ctxgate/config.toml` with environment
//! variable overrides. Validates all settings at startup and on every
//! hot reload (see [`watcher`]).

pub mod watcher;

pub use watcher::{ConfigWatcher, WatchHandle};

use ctxgate_core::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.ctxgate/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Fallback credential for providers that do not carry their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider that receives unprefixed models. Falls back to the first
    /// configured provider (by id) when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,

    /// Context pipeline settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Long-term memory settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Circuit breaker settings shared by upstreams and memory
    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Upstream call settings
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Traffic log settings
    #[serde(default)]
    pub traffic: TrafficConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Upstream providers keyed by id
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("pipeline", &self.pipeline)
            .field("memory", &self.memory)
            .field("breaker", &self.breaker)
            .field("upstream", &self.upstream)
            .field("traffic", &self.traffic)
            .field("logging", &self.logging)
            .field("providers", &self.providers)
            .finish()
    }
}

// ── Provider ──────────────────────────────────────────────────────────────

/// One upstream provider.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registry id; filled from the `[providers.<id>]` key on load
    #[serde(default, skip_serializing)]
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// OpenAI-compatible base URL, e.g. `https://api.moonshot.cn/v1`
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model used when the request names none
    #[serde(default)]
    pub default_model: String,

    /// Allow-list; empty means any model
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-provider timeout; falls back to `[upstream] timeout_secs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Extra headers sent with every upstream request
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            base_url: base_url.into(),
            api_key: None,
            default_model: default_model.into(),
            models: Vec::new(),
            enabled: true,
            timeout_secs: None,
            headers: HashMap::new(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Whether `model` passes the allow-list.
    pub fn allows_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("default_model", &self.default_model)
            .field("models", &self.models)
            .field("enabled", &self.enabled)
            .field("timeout_secs", &self.timeout_secs)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ── Sections ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// When false the assembler forwards messages unchanged
    #[serde(default = "default_true")]
    pub optimization_enabled: bool,

    /// Sliding-window capacity in turns
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    /// Fenced code blocks longer than this many chars protect their message
    #[serde(default = "default_code_block_protect_chars")]
    pub code_block_protect_chars: usize,

    /// Regexes stripped from system messages
    #[serde(default = "default_boilerplate_patterns")]
    pub boilerplate_patterns: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_history_turns() -> usize {
    10
}
fn default_code_block_protect_chars() -> usize {
    500
}
fn default_boilerplate_patterns() -> Vec<String> {
    vec![
        r"(?i)as an ai language model,?\s*".into(),
        r"(?im)^[ \t]*(please )?(remember|note) that you are an? (ai|helpful) assistant\.?[ \t]*$"
            .into(),
    ]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            optimization_enabled: true,
            history_turns: default_history_turns(),
            code_block_protect_chars: default_code_block_protect_chars(),
            boilerplate_patterns: default_boilerplate_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Records injected per request
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum cosine similarity for a record to be injected
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Budget for embed + search
    #[serde(default = "default_memory_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
}

fn default_top_k() -> usize {
    3
}
fn default_similarity_threshold() -> f32 {
    0.5
}
fn default_memory_timeout_ms() -> u64 {
    500
}
fn default_embedding_dimension() -> usize {
    384
}

impl MemoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            timeout_ms: default_memory_timeout_ms(),
            embedding_dimension: default_embedding_dimension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_open_duration_secs")]
    pub open_duration_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_duration_secs() -> u64 {
    60
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            open_duration: Duration::from_secs(self.open_duration_secs),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_secs: default_open_duration_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_upstream_timeout_secs() -> u64 {
    120
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Ring buffer size; oldest records are dropped first
    #[serde(default = "default_traffic_capacity")]
    pub capacity: usize,
}

fn default_traffic_capacity() -> usize {
    1000
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            capacity: default_traffic_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from the default location with env overrides.
    ///
    /// Priority: env vars > config file > defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        // Environment variable overrides (highest priority)
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_toml_str(&content, path)
    }

    /// Parse and validate TOML content. `path` is only used in errors.
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        for (id, provider) in config.providers.iter_mut() {
            if provider.id.is_empty() {
                provider.id = id.clone();
            }
            if provider.name.is_empty() {
                provider.name = id.clone();
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Apply `CTXGATE_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("CTXGATE_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(provider) = lookup("CTXGATE_DEFAULT_PROVIDER") {
            self.default_provider = Some(provider);
        }
        if let Some(level) = lookup("CTXGATE_LOG") {
            self.logging.level = level;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".ctxgate")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.history_turns == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.history_turns must be at least 1".into(),
            ));
        }

        for pattern in &self.pipeline.boilerplate_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::ValidationError(format!(
                    "invalid boilerplate pattern '{pattern}': {e}"
                )));
            }
        }

        if !(-1.0..=1.0).contains(&self.memory.similarity_threshold) {
            return Err(ConfigError::ValidationError(
                "memory.similarity_threshold must be between -1.0 and 1.0".into(),
            ));
        }

        if self.memory.embedding_dimension == 0 {
            return Err(ConfigError::ValidationError(
                "memory.embedding_dimension must be > 0".into(),
            ));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }

        if self.traffic.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "traffic.capacity must be > 0".into(),
            ));
        }

        for (id, provider) in &self.providers {
            if provider.id != *id {
                return Err(ConfigError::ValidationError(format!(
                    "provider id '{}' does not match its table key '{id}'",
                    provider.id
                )));
            }
            if id.contains(':') {
                return Err(ConfigError::ValidationError(format!(
                    "provider id '{id}' must not contain ':'"
                )));
            }
            if provider.enabled && provider.base_url.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "provider '{id}' has no base_url"
                )));
            }
        }

        if let Some(default) = &self.default_provider {
            if !self.providers.is_empty() && !self.providers.contains_key(default) {
                return Err(ConfigError::ValidationError(format!(
                    "default_provider '{default}' is not configured"
                )));
            }
        }

        Ok(())
    }

    /// Effective timeout for a provider.
    pub fn provider_timeout(&self, provider: &ProviderConfig) -> Duration {
        Duration::from_secs(provider.timeout_secs.unwrap_or(self.upstream.timeout_secs))
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: None,
            pipeline: PipelineConfig::default(),
            memory: MemoryConfig::default(),
            breaker: BreakerSettings::default(),
            upstream: UpstreamConfig::default(),
            traffic: TrafficConfig::default(),
            logging: LoggingConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Failed to write config file at {path}: {reason}")]
    WriteError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default_provider = "openai"

[pipeline]
history_turns = 5

[breaker]
failure_threshold = 3
open_duration_secs = 30

[providers.openai]
name = "OpenAI"
base_url = "https://api.openai.com/v1"
api_key = "sk-test"
default_model = "gpt-4o"

[providers.kimi]
base_url = "https://api.moonshot.cn/v1"
default_model = "moonshot-v1-8k"
models = ["moonshot-v1-8k", "moonshot-v1-32k"]
timeout_secs = 30
"#;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.memory.top_k, 3);
        assert_eq!(config.traffic.capacity, 1000);
        assert!(config.pipeline.optimization_enabled);
    }

    #[test]
    fn parses_sections_and_fills_provider_ids() {
        let config = AppConfig::from_toml_str(SAMPLE, Path::new("sample.toml")).unwrap();
        assert_eq!(config.default_provider.as_deref(), Some("openai"));
        assert_eq!(config.pipeline.history_turns, 5);
        assert_eq!(config.breaker.to_breaker_config().failure_threshold, 3);

        let kimi = &config.providers["kimi"];
        assert_eq!(kimi.id, "kimi");
        assert_eq!(kimi.name, "kimi");
        assert!(kimi.enabled);
        assert!(kimi.allows_model("moonshot-v1-32k"));
        assert!(!kimi.allows_model("gpt-4o"));
        assert_eq!(config.provider_timeout(kimi), Duration::from_secs(30));
        assert_eq!(
            config.provider_timeout(&config.providers["openai"]),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn config_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = AppConfig::from_toml_str(SAMPLE, Path::new("sample.toml")).unwrap();
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.providers.len(), 2);
        assert_eq!(loaded.providers["openai"].api_key.as_deref(), Some("sk-test"));
        assert_eq!(loaded.providers["kimi"].models.len(), 2);
        assert_eq!(loaded.breaker.open_duration_secs, 30);
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert!(config.providers.is_empty());
        assert!(config.default_provider.is_none());
    }

    #[test]
    fn invalid_boilerplate_pattern_rejected() {
        let mut config = AppConfig::default();
        config.pipeline.boilerplate_patterns.push("([unclosed".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn unknown_default_provider_rejected() {
        let toml_str = r#"
default_provider = "missing"

[providers.openai]
base_url = "https://api.openai.com/v1"
"#;
        let err = AppConfig::from_toml_str(toml_str, Path::new("x.toml")).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn provider_id_with_colon_rejected() {
        let toml_str = r#"
[providers."a:b"]
base_url = "https://example.com/v1"
"#;
        assert!(AppConfig::from_toml_str(toml_str, Path::new("x.toml")).is_err());
    }

    #[test]
    fn env_overrides_win() {
        let mut config = AppConfig::default();
        config.apply_overrides(|key| match key {
            "CTXGATE_API_KEY" => Some("sk-env".into()),
            "CTXGATE_LOG" => Some("debug".into()),
            _ => None,
        });
        assert_eq!(config.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.logging.level, "debug");
        assert!(config.default_provider.is_none());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = AppConfig::from_toml_str(SAMPLE, Path::new("sample.toml")).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-test"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("[pipeline]"));
        assert!(toml_str.contains("history_turns = 10"));
    }
}
