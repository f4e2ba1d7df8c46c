use cachesync_core::BackoffPolicy;
use cachesync_core::protocol::{DEFAULT_EVENTS_CHANNEL, DEFAULT_INVALIDATION_CHANNEL, ReservedChannels};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Pub/sub channels, instance identity and recovery timings
    #[serde(default)]
    pub pubsub: PubSubConfig,
    /// Local cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.port_attempts == 0 {
            return Err("server.port_attempts must be > 0".into());
        }
        // Redis validations
        if self.redis.enabled && self.redis.url.is_empty() {
            return Err("redis.enabled=true requires redis.url".into());
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        // Pub/sub validations
        let ps = &self.pubsub;
        if ps.events_channel.is_empty() || ps.invalidation_channel.is_empty() {
            return Err("pubsub channel names must not be empty".into());
        }
        if ps.events_channel == ps.invalidation_channel {
            return Err("pubsub.events_channel and pubsub.invalidation_channel must differ".into());
        }
        if ps.initial_channels.iter().any(|c| c.is_empty()) {
            return Err("pubsub.initial_channels must not contain empty names".into());
        }
        if ps.initial_patterns.iter().any(|p| p.is_empty()) {
            return Err("pubsub.initial_patterns must not contain empty patterns".into());
        }
        if ps.cache_hit_channel.is_empty() || ps.cache_miss_channel.is_empty() {
            return Err("pubsub cache hit/miss channel names must not be empty".into());
        }
        if ps.health_check_interval_ms == 0 {
            return Err("pubsub.health_check_interval_ms must be > 0".into());
        }
        if ps.retry_backoff_ms == 0 {
            return Err("pubsub.retry_backoff_ms must be > 0".into());
        }
        if ps.backoff == BackoffKind::Exponential && ps.max_backoff_ms < ps.retry_backoff_ms {
            return Err("pubsub.max_backoff_ms must be >= pubsub.retry_backoff_ms".into());
        }
        if let Some(id) = &ps.instance_id {
            if id.trim().is_empty() {
                return Err("pubsub.instance_id must not be blank".into());
            }
        }
        // Cache validations
        if self.cache.max_entries == 0 {
            return Err("cache.max_entries must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    /// Addresses to try binding, in order.
    pub fn candidate_addrs(&self) -> Vec<SocketAddr> {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        (0..self.server.port_attempts)
            .filter_map(|offset| self.server.port.checked_add(offset))
            .map(|port| SocketAddr::from((host, port)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How many consecutive ports to try when `port` is taken.
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    3000
}
fn default_port_attempts() -> u16 {
    11
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            port_attempts: default_port_attempts(),
        }
    }
}

/// Redis configuration. Without Redis the instance runs on a private
/// in-memory bus and only invalidates itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,
    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Publisher connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
    /// Delay between subscriber reconnection attempts
    #[serde(default = "default_redis_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_redis_enabled() -> bool {
    true
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_redis_pool_size() -> usize {
    4
}
fn default_redis_timeout_ms() -> u64 {
    5000
}
fn default_redis_reconnect_delay_ms() -> u64 {
    1000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            reconnect_delay_ms: default_redis_reconnect_delay_ms(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubConfig {
    /// Identity stamped on published invalidations. Falls back to the
    /// `INSTANCE_ID` environment variable, then to a generated id.
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default = "default_events_channel")]
    pub events_channel: String,
    #[serde(default = "default_invalidation_channel")]
    pub invalidation_channel: String,
    /// Channels subscribed at startup
    #[serde(default = "default_initial_channels")]
    pub initial_channels: Vec<String>,
    /// Glob patterns subscribed at startup; deliveries are logged only
    #[serde(default = "default_initial_patterns")]
    pub initial_patterns: Vec<String>,
    /// Where the demo endpoint announces cache hits and misses
    #[serde(default = "default_cache_hit_channel")]
    pub cache_hit_channel: String,
    #[serde(default = "default_cache_miss_channel")]
    pub cache_miss_channel: String,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Pause before a recovery run, absorbs short blips
    #[serde(default = "default_recovery_debounce_ms")]
    pub recovery_debounce_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Upper bound for exponential backoff
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Keys deleted one by one when the cache store cannot clear itself
    #[serde(default = "default_known_keys")]
    pub known_keys: Vec<String>,
}

fn default_events_channel() -> String {
    DEFAULT_EVENTS_CHANNEL.to_string()
}
fn default_invalidation_channel() -> String {
    DEFAULT_INVALIDATION_CHANNEL.to_string()
}
fn default_initial_channels() -> Vec<String> {
    vec![default_events_channel(), default_invalidation_channel()]
}
fn default_initial_patterns() -> Vec<String> {
    vec!["user:*".to_string()]
}
fn default_cache_hit_channel() -> String {
    "cache:hit".to_string()
}
fn default_cache_miss_channel() -> String {
    "cache:miss".to_string()
}
fn default_health_check_interval_ms() -> u64 {
    5000
}
fn default_recovery_debounce_ms() -> u64 {
    1000
}
fn default_retry_backoff_ms() -> u64 {
    5000
}
fn default_max_backoff_ms() -> u64 {
    300_000
}
fn default_known_keys() -> Vec<String> {
    vec!["hello".to_string()]
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            events_channel: default_events_channel(),
            invalidation_channel: default_invalidation_channel(),
            initial_channels: default_initial_channels(),
            initial_patterns: default_initial_patterns(),
            cache_hit_channel: default_cache_hit_channel(),
            cache_miss_channel: default_cache_miss_channel(),
            health_check_interval_ms: default_health_check_interval_ms(),
            recovery_debounce_ms: default_recovery_debounce_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            backoff: BackoffKind::default(),
            max_backoff_ms: default_max_backoff_ms(),
            known_keys: default_known_keys(),
        }
    }
}

impl PubSubConfig {
    pub fn reserved_channels(&self) -> ReservedChannels {
        ReservedChannels::new(&self.events_channel, &self.invalidation_channel)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn recovery_debounce(&self) -> Duration {
        Duration::from_millis(self.recovery_debounce_ms)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        let initial = Duration::from_millis(self.retry_backoff_ms);
        match self.backoff {
            BackoffKind::Fixed => BackoffPolicy::fixed(initial),
            BackoffKind::Exponential => {
                BackoffPolicy::exponential(initial, Duration::from_millis(self.max_backoff_ms))
            }
        }
    }

    /// Resolve the instance id: config, then `INSTANCE_ID`, then
    /// `<hostname>-<random>`.
    pub fn resolve_instance_id(&self) -> String {
        if let Some(id) = self.instance_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        if let Ok(id) = std::env::var("INSTANCE_ID") {
            if !id.trim().is_empty() {
                return id.trim().to_string();
            }
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "instance".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{host}-{}", &suffix[..8])
    }
}

/// Local cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for values stored by the demo endpoints
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_ttl_secs() -> u64 {
    60
}
fn default_max_entries() -> usize {
    100
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_FILE: &str = "cachesync.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., CACHESYNC__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("CACHESYNC")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("pubsub.initial_channels")
                .with_list_parse_key("pubsub.initial_patterns")
                .with_list_parse_key("pubsub.known_keys"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
