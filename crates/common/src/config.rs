//! Configuration structures for ShardChat
//!
//! Configurations are loaded from YAML files and can be built from
//! environment variables. Every section has serde defaults so a config file
//! only needs to name what it changes.

use crate::error::{Result, ShardChatError};
use serde::{Deserialize, Serialize};
use shardchat_proto::{GenerateRequest, TransformKind, Turn};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardChatConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub conversation: ConversationConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Worker pool and relay deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Number of shard workers
    #[serde(default = "default_world_size")]
    pub world_size: usize,

    /// How long to wait for the primary shard to report ready
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,

    /// How long to wait for each streamed item
    #[serde(default = "default_item_timeout")]
    pub item_timeout_ms: u64,

    /// How long the primary waits for replica digests after a response
    #[serde(default = "default_desync_check_timeout")]
    pub desync_check_timeout_ms: u64,
}

/// Prompt rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Name of a conversation template preset
    #[serde(default = "default_template")]
    pub template: String,

    /// Whether the generated continuation starts with its own leading space
    #[serde(default = "default_space_part_of_next_word")]
    pub space_part_of_next_word: bool,
}

/// Request defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_gen_len")]
    pub max_gen_len: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default)]
    pub seed: u64,

    #[serde(default)]
    pub transform: TransformKind,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

/// Default value functions
fn default_world_size() -> usize {
    1
}

fn default_ready_timeout() -> u64 {
    30_000
}

fn default_item_timeout() -> u64 {
    60_000
}

fn default_desync_check_timeout() -> u64 {
    5_000
}

fn default_template() -> String {
    "default".to_string()
}

fn default_space_part_of_next_word() -> bool {
    true
}

fn default_max_gen_len() -> usize {
    512
}

fn default_temperature() -> f32 {
    0.1
}

fn default_top_p() -> f32 {
    0.75
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            world_size: default_world_size(),
            ready_timeout_ms: default_ready_timeout(),
            item_timeout_ms: default_item_timeout(),
            desync_check_timeout_ms: default_desync_check_timeout(),
        }
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            template: default_template(),
            space_part_of_next_word: default_space_part_of_next_word(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_gen_len: default_max_gen_len(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            seed: 0,
            transform: TransformKind::default(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
            structured_logging: false,
        }
    }
}

impl ShardChatConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ShardChatError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: ShardChatConfig = serde_yaml::from_str(&content).map_err(|e| {
            ShardChatError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = ShardChatConfig::default();

        if let Some(world_size) = env_parse::<usize>("SHARDCHAT_WORLD_SIZE")? {
            config.orchestrator.world_size = world_size;
        }
        if let Some(timeout) = env_parse::<u64>("SHARDCHAT_READY_TIMEOUT_MS")? {
            config.orchestrator.ready_timeout_ms = timeout;
        }
        if let Some(timeout) = env_parse::<u64>("SHARDCHAT_ITEM_TIMEOUT_MS")? {
            config.orchestrator.item_timeout_ms = timeout;
        }
        if let Ok(template) = std::env::var("SHARDCHAT_TEMPLATE") {
            config.conversation.template = template;
        }
        if let Some(seed) = env_parse::<u64>("SHARDCHAT_SEED")? {
            config.generation.seed = seed;
        }
        if let Ok(level) = std::env::var("SHARDCHAT_LOG_LEVEL") {
            config.observability.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let orchestrator = &self.orchestrator;
        if orchestrator.world_size == 0 {
            return Err(ShardChatError::config("world_size must be at least 1"));
        }
        if orchestrator.ready_timeout_ms == 0
            || orchestrator.item_timeout_ms == 0
            || orchestrator.desync_check_timeout_ms == 0
        {
            return Err(ShardChatError::config("orchestrator timeouts must be positive"));
        }

        if self.conversation.template.is_empty() {
            return Err(ShardChatError::config("conversation template name is empty"));
        }

        let generation = &self.generation;
        if generation.max_gen_len == 0 {
            return Err(ShardChatError::config("max_gen_len must be at least 1"));
        }
        if !(generation.temperature >= 0.0) {
            return Err(ShardChatError::config(format!(
                "Invalid temperature: {}",
                generation.temperature
            )));
        }
        if !(generation.top_p > 0.0 && generation.top_p <= 1.0) {
            return Err(ShardChatError::config(format!(
                "top_p must be in (0, 1], got {}",
                generation.top_p
            )));
        }

        Ok(())
    }
}

impl OrchestratorConfig {
    /// Get the ready wait bound as Duration
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Get the per-item wait bound as Duration
    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    /// Get the replica digest wait bound as Duration
    pub fn desync_check_timeout(&self) -> Duration {
        Duration::from_millis(self.desync_check_timeout_ms)
    }
}

impl GenerationConfig {
    /// Build a text-only request carrying these defaults
    pub fn request(&self, turns: Vec<Turn>) -> GenerateRequest {
        let mut request =
            GenerateRequest::new(turns, self.max_gen_len, self.temperature, self.top_p)
                .with_seed(self.seed);
        request.transform = self.transform;
        request
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ShardChatError::Config(format!("Invalid value for {}: {}", key, raw))),
        Err(_) => Ok(None),
    }
}
