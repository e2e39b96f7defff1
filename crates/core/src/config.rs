use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `ABTRACK__`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_assignment_ttl_days")]
    pub assignment_ttl_days: u32,
    #[serde(default = "default_pending_visit_ttl_days")]
    pub pending_visit_ttl_days: u32,
    /// Caps sampling to the first two declared variations.
    #[serde(default)]
    pub constrained_mode: bool,
    #[serde(default = "default_order_value")]
    pub default_order_value: f64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_control_aliases")]
    pub control_aliases: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Local,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

// Default functions
fn default_inactivity_timeout_ms() -> u64 {
    3000
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_assignment_ttl_days() -> u32 {
    365
}
fn default_pending_visit_ttl_days() -> u32 {
    1
}
fn default_order_value() -> f64 {
    1.0
}
fn default_key_prefix() -> String {
    "abtrack".to_string()
}
fn default_control_aliases() -> Vec<String> {
    ["control", "original", "default", "a", "variation-a", "version-a"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_store_backend() -> StoreBackend {
    StoreBackend::Local
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_local_max_entries() -> usize {
    100_000
}
fn default_channel_capacity() -> usize {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            assignment_ttl_days: default_assignment_ttl_days(),
            pending_visit_ttl_days: default_pending_visit_ttl_days(),
            constrained_mode: false,
            default_order_value: default_order_value(),
            key_prefix: default_key_prefix(),
            control_aliases: default_control_aliases(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: default_redis_url(),
            local_max_entries: default_local_max_entries(),
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("ABTRACK")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("engine.control_aliases"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
