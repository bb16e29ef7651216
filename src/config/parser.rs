use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub labels: LabelsConfig,
    #[serde(default)]
    pub relays: Vec<RelayConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_auto_delete_ignore_days")]
    pub auto_delete_ignore_days: u32,
    #[serde(default = "default_mapping_retention_days")]
    pub mapping_retention_days: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_worker_backoff_ms")]
    pub worker_backoff_ms: u64,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_disable_everyone_mention")]
    pub disable_everyone_mention: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            auto_delete_ignore_days: default_auto_delete_ignore_days(),
            mapping_retention_days: default_mapping_retention_days(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            worker_backoff_ms: default_worker_backoff_ms(),
            port: default_port(),
            bind_address: default_bind_address(),
            disable_everyone_mention: default_disable_everyone_mention(),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub bot_token: String,
    #[serde(default = "default_use_privileged_intents")]
    pub use_privileged_intents: bool,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("bot_token", &"[REDACTED]")
            .field("use_privileged_intents", &self.use_privileged_intents)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            filename: Some(default_mapping_file()),
        }
    }
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        if self.connection_string().starts_with("sqlite://") {
            DbType::Sqlite
        } else {
            DbType::Json
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref file) = self.filename {
            format!("json://{}", file)
        } else {
            String::new()
        }
    }

    /// Filesystem path of the store, with the scheme prefix removed.
    pub fn path(&self) -> String {
        let url = self.connection_string();
        let stripped = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("json://"))
            .unwrap_or(&url);
        stripped.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Json,
    Sqlite,
}

/// Localisable strings stamped into relayed copies.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LabelsConfig {
    #[serde(default = "default_edited_label")]
    pub edited: String,
    #[serde(default = "default_edited_at_label")]
    pub edited_at: String,
    #[serde(default = "default_recall_marker")]
    pub recall_marker: String,
    #[serde(default = "default_recall_alert")]
    pub recall_alert: String,
    #[serde(default = "default_recalled_at_label")]
    pub recalled_at: String,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            edited: default_edited_label(),
            edited_at: default_edited_at_label(),
            recall_marker: default_recall_marker(),
            recall_alert: default_recall_alert(),
            recalled_at: default_recalled_at_label(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    pub source_id: i64,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub target_id: i64,
    #[serde(default)]
    pub target_topic_id: Option<i64>,
    #[serde(default)]
    pub source_topic_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("MIRROR_BRIDGE_BOT_TOKEN") {
            self.auth.bot_token = value;
        }
        if let Ok(value) = std::env::var("MIRROR_BRIDGE_TIMEZONE") {
            self.bridge.timezone = value;
        }
    }
}

fn default_timezone() -> String {
    "Asia/Tokyo".to_string()
}

fn default_auto_delete_ignore_days() -> u32 {
    30
}

fn default_mapping_retention_days() -> u32 {
    90
}

fn default_cleanup_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_worker_backoff_ms() -> u64 {
    1000
}

fn default_port() -> u16 {
    9006
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_disable_everyone_mention() -> bool {
    true
}

fn default_use_privileged_intents() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_mapping_file() -> String {
    "data/message_mapping.json".to_string()
}

fn default_edited_label() -> String {
    "✏️ (edited)".to_string()
}

fn default_edited_at_label() -> String {
    "🕐 Edited at".to_string()
}

fn default_recall_marker() -> String {
    "#recalled".to_string()
}

fn default_recall_alert() -> String {
    "⚠️ Message recalled ⚠️".to_string()
}

fn default_recalled_at_label() -> String {
    "🕐 Recalled at".to_string()
}
