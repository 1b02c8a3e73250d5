use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://query.ampre.ca/odata";
pub const DEFAULT_STATUS_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_RECORD_LIMIT: u32 = 2500;
/// Six daily full-sync windows of `DEFAULT_RECORD_LIMIT` records each.
pub const DEFAULT_MAX_PROPERTIES: u64 = 15_000;

/// Top-level config (mlsync.toml + MLSYNC_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MlsyncConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ampre: AmpreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Which AMPRE token scope the sync authenticates with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Feed {
    /// Public-facing IDX feed.
    Idx,
    /// Fuller-access VOW feed.
    #[default]
    Vow,
}

/// Connection settings for the AMPRE OData API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmpreConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub idx_token: String,
    #[serde(default)]
    pub vow_token: String,
    #[serde(default)]
    pub feed: Feed,
    /// `$top` of a single HTTP request.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Total attempts per request, including the first one.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Fixed delay between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Listing keys per `Media` lookup during image refresh.
    #[serde(default = "default_media_batch_size")]
    pub media_batch_size: usize,
    /// Default city filter ANDed into every property query.
    #[serde(default)]
    pub city: Option<String>,
}

impl AmpreConfig {
    /// Bearer token for the configured feed.
    pub fn token(&self) -> &str {
        match self.feed {
            Feed::Idx => &self.idx_token,
            Feed::Vow => &self.vow_token,
        }
    }
}

impl Default for AmpreConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            idx_token: String::new(),
            vow_token: String::new(),
            feed: Feed::default(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            media_batch_size: default_media_batch_size(),
            city: None,
        }
    }
}

/// Executor policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Records per run when a trigger or CLI call doesn't say otherwise.
    #[serde(default = "default_record_limit")]
    pub record_limit: u32,
    /// Full-sync offset wraps back to 0 at this many records.
    #[serde(default = "default_max_properties")]
    pub max_properties: u64,
    /// Lease lifetime; a crashed holder blocks its sync type at most this long.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// How far back the very first incremental run looks.
    #[serde(default = "default_lookback_hours")]
    pub incremental_lookback_hours: u32,
    /// Lifetime of the cached `/status` snapshot.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            record_limit: default_record_limit(),
            max_properties: default_max_properties(),
            lock_ttl_secs: default_lock_ttl_secs(),
            incremental_lookback_hours: default_lookback_hours(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Trigger table. Times are "HH:MM" in UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_full_windows")]
    pub full_windows: Vec<String>,
    #[serde(default = "default_record_limit")]
    pub full_limit: u32,
    #[serde(default = "default_incremental_every_mins")]
    pub incremental_every_mins: u64,
    #[serde(default = "default_incremental_limit")]
    pub incremental_limit: u32,
    #[serde(default = "default_image_refresh_at")]
    pub image_refresh_at: String,
    #[serde(default = "default_record_limit")]
    pub image_limit: u32,
    #[serde(default = "bool_true")]
    pub image_skip_existing: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            full_windows: default_full_windows(),
            full_limit: default_record_limit(),
            incremental_every_mins: default_incremental_every_mins(),
            incremental_limit: default_incremental_limit(),
            image_refresh_at: default_image_refresh_at(),
            image_limit: default_record_limit(),
            image_skip_existing: true,
        }
    }
}

/// Status HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_status_port")]
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: DEFAULT_STATUS_PORT,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_page_size() -> u32 {
    100
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2_000
}
fn default_media_batch_size() -> usize {
    20
}
fn default_record_limit() -> u32 {
    DEFAULT_RECORD_LIMIT
}
fn default_max_properties() -> u64 {
    DEFAULT_MAX_PROPERTIES
}
fn default_lock_ttl_secs() -> u64 {
    3_600
}
fn default_lookback_hours() -> u32 {
    24
}
fn default_cache_ttl_secs() -> u64 {
    30
}
fn default_full_windows() -> Vec<String> {
    ["01:00", "05:00", "09:00", "13:00", "17:00", "21:00"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_incremental_every_mins() -> u64 {
    30
}
fn default_incremental_limit() -> u32 {
    500
}
fn default_image_refresh_at() -> String {
    "03:30".to_string()
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_status_port() -> u16 {
    DEFAULT_STATUS_PORT
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mlsync/mlsync.db", home)
}

impl MlsyncConfig {
    /// Load config from a TOML file with MLSYNC_* env var overrides.
    ///
    /// Nested keys use a double underscore: `MLSYNC_AMPRE__VOW_TOKEN`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("MLSYNC_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: MlsyncConfig = figment
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        use crate::error::CoreError;
        if self.ampre.page_size == 0 {
            return Err(CoreError::Config("ampre.page_size must be > 0".into()));
        }
        if self.ampre.retry_attempts == 0 {
            return Err(CoreError::Config("ampre.retry_attempts must be >= 1".into()));
        }
        if self.ampre.media_batch_size == 0 {
            return Err(CoreError::Config("ampre.media_batch_size must be > 0".into()));
        }
        if self.sync.max_properties == 0 {
            return Err(CoreError::Config("sync.max_properties must be > 0".into()));
        }
        if self.sync.lock_ttl_secs == 0 {
            return Err(CoreError::Config("sync.lock_ttl_secs must be > 0".into()));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.mlsync/mlsync.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = MlsyncConfig::from_figment(Figment::new()).unwrap();
        assert_eq!(config.ampre.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.sync.record_limit, 2500);
        assert_eq!(config.schedule.full_windows.len(), 6);
        assert_eq!(config.ampre.feed, Feed::Vow);
        assert!(config.schedule.image_skip_existing);
    }

    #[test]
    fn toml_overrides_nested_values() {
        let toml = r#"
            [ampre]
            feed = "idx"
            idx_token = "public"
            vow_token = "private"
            city = "Toronto"

            [sync]
            max_properties = 12500
        "#;
        let config = MlsyncConfig::from_figment(Figment::new().merge(Toml::string(toml))).unwrap();
        assert_eq!(config.ampre.token(), "public");
        assert_eq!(config.ampre.city.as_deref(), Some("Toronto"));
        assert_eq!(config.sync.max_properties, 12500);
        // untouched sections keep their defaults
        assert_eq!(config.sync.lock_ttl_secs, 3_600);
    }

    #[test]
    fn vow_feed_selects_vow_token() {
        let ampre = AmpreConfig {
            idx_token: "a".into(),
            vow_token: "b".into(),
            ..AmpreConfig::default()
        };
        assert_eq!(ampre.token(), "b");
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let toml = "[ampre]\npage_size = 0\n";
        let err = MlsyncConfig::from_figment(Figment::new().merge(Toml::string(toml))).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
