//! # Configuration Management Module
//!
//! Loads and validates the TOML configuration for the bridge.
//!
//! ## Configuration Structure
//!
//! - [`BotSection`] - command prefix, reply budget, auto start
//! - [`MeshtasticConfig`] - serial device settings
//! - [`LlmConfig`] - completion service endpoint, model and credential
//! - [`DedupConfig`] - bounds of the duplicate packet record
//! - [`DispatchConfig`] - unbounded vs pooled query dispatch
//! - [`LoggingConfig`] - log level and optional file
//!
//! Every section has defaults, so a file only needs the values that differ:
//!
//! ```toml
//! [bot]
//! command_prefix = "!"
//! max_response_length = 200
//!
//! [meshtastic]
//! port = "/dev/ttyUSB0"
//!
//! [llm]
//! model = "gpt-4o-mini"
//! ```
//!
//! The file is read once at startup. The parts the pipeline uses are copied
//! into an immutable [`BotConfig`] snapshot when the service is armed, so
//! nothing running reads this structure concurrently.

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::fs;

use crate::errors::ConfigError;

pub const DEFAULT_COMMAND_PREFIX: &str = "!";
pub const DEFAULT_MAX_RESPONSE_LENGTH: usize = 200;
/// Shortest reply budget that still leaves room for one character plus "..."
pub const MIN_RESPONSE_LENGTH: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bot: BotSection,
    #[serde(default)]
    pub meshtastic: MeshtasticConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSection {
    #[serde(default = "default_prefix")]
    pub command_prefix: String,
    /// Accepts an integer or a numeric string. Anything else (or zero) falls
    /// back to the default of 200 when the service is armed.
    #[serde(
        default = "default_max_len_setting",
        deserialize_with = "lenient_length"
    )]
    pub max_response_length: Option<usize>,
    /// Start answering as soon as the device is connected and the service is armed.
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_prefix() -> String {
    DEFAULT_COMMAND_PREFIX.to_string()
}

fn default_max_len_setting() -> Option<usize> {
    Some(DEFAULT_MAX_RESPONSE_LENGTH)
}

fn default_true() -> bool {
    true
}

impl Default for BotSection {
    fn default() -> Self {
        Self {
            command_prefix: default_prefix(),
            max_response_length: default_max_len_setting(),
            auto_start: true,
        }
    }
}

/// Parse `max_response_length` without failing the whole file: numbers and
/// numeric strings are accepted, anything else becomes `None`.
fn lenient_length<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }
    let parsed = match Raw::deserialize(deserializer)? {
        Raw::Int(n) if n > 0 => Some(n as usize),
        Raw::Int(_) => None,
        Raw::Text(s) => s.trim().parse::<usize>().ok().filter(|n| *n > 0),
        Raw::Other(_) => None,
    };
    Ok(parsed)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshtasticConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Channel index replies are broadcast on (0 = primary)
    pub channel: u32,
    /// Minimum gap between consecutive text sends (ms)
    #[serde(default = "default_min_send_gap")]
    pub min_send_gap_ms: u64,
}

fn default_min_send_gap() -> u64 {
    2000
}

impl Default for MeshtasticConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            channel: 0,
            min_send_gap_ms: default_min_send_gap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// API key; when empty the `OPENAI_API_KEY` environment variable is used.
    #[serde(default)]
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    pub temperature: f32,
    /// Characters per token used to derive the token ceiling from the reply budget.
    pub chars_per_token: u32,
    /// Client-level request timeout. Unset means the HTTP client default (none).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_seconds: Option<u64>,
    /// Optional system prompt override; `{max_chars}` is replaced with the budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            chars_per_token: 2,
            request_timeout_seconds: None,
            system_prompt: None,
        }
    }
}

impl LlmConfig {
    /// Resolve the credential from config, then from `OPENAI_API_KEY`.
    pub fn resolve_api_key(&self) -> std::result::Result<String, ConfigError> {
        let configured = self.api_key.trim();
        if !configured.is_empty() {
            return Ok(configured.to_string());
        }
        match std::env::var("OPENAI_API_KEY") {
            Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
            _ => Err(ConfigError::MissingCredential),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Maximum number of remembered packet ids
    pub capacity: usize,
    /// Seconds a packet id is remembered
    pub window_seconds: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            window_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One task per query, no cap
    #[default]
    Unbounded,
    /// Fixed worker pool fed by a bounded queue
    Pool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producer waits for queue space
    #[default]
    Block,
    /// The incoming query is refused
    RejectNewest,
    /// The oldest queued query is discarded
    DropOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Interval for the periodic stats log (0 disables it)
    pub stats_interval_seconds: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Unbounded,
            workers: 4,
            queue_capacity: 32,
            overflow: OverflowPolicy::Block,
            stats_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshai.log".to_string()),
        }
    }
}

/// Immutable settings a dispatched unit works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    pub command_prefix: String,
    pub max_response_length: usize,
}

impl BotConfig {
    pub fn new(
        command_prefix: impl Into<String>,
        max_response_length: usize,
    ) -> std::result::Result<Self, ConfigError> {
        let command_prefix = command_prefix.into();
        if command_prefix.is_empty() {
            return Err(ConfigError::EmptyPrefix);
        }
        if max_response_length < MIN_RESPONSE_LENGTH {
            return Err(ConfigError::DegenerateLength(max_response_length));
        }
        Ok(Self {
            command_prefix,
            max_response_length,
        })
    }

    /// Validate the `[bot]` section into a snapshot. An unparseable or zero
    /// length is reset to the default; every other problem is an error.
    pub fn from_section(section: &BotSection) -> std::result::Result<Self, ConfigError> {
        let max_len = match section.max_response_length {
            Some(n) => n,
            None => {
                warn!(
                    "Invalid max_response_length; resetting to {}",
                    DEFAULT_MAX_RESPONSE_LENGTH
                );
                DEFAULT_MAX_RESPONSE_LENGTH
            }
        };
        Self::new(section.command_prefix.clone(), max_len)
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            command_prefix: DEFAULT_COMMAND_PREFIX.to_string(),
            max_response_length: DEFAULT_MAX_RESPONSE_LENGTH,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        Self::from_toml(&content).map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.dispatch.mode == DispatchMode::Pool
            && (config.dispatch.workers == 0 || config.dispatch.queue_capacity == 0)
        {
            return Err(ConfigError::Invalid(
                "dispatch.workers and dispatch.queue_capacity must be positive in pool mode"
                    .to_string(),
            )
            .into());
        }
        if config.llm.chars_per_token == 0 {
            return Err(ConfigError::Invalid("llm.chars_per_token must be positive".to_string()).into());
        }
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}
