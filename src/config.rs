use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub transport: TransportConfig,
    pub lifecycle: LifecycleConfig,
    pub webhook: WebhookConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 31000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.wa-gateway/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub sidecar_url: String,
    pub poll_timeout_seconds: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sidecar_url: "http://127.0.0.1:4040".to_string(),
            poll_timeout_seconds: 30,
        }
    }
}

impl TransportConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub connect_timeout_seconds: u64,
    pub settle_delay_ms: u64,
    pub retry_backoff_seconds: u64,
    pub max_start_attempts: Option<u32>,
    pub restart_delay_seconds: u64,
    pub history_count: usize,
    pub history_pacing_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 30,
            settle_delay_ms: 3000,
            retry_backoff_seconds: 10,
            max_start_attempts: None,
            restart_delay_seconds: 10,
            history_count: 50,
            history_pacing_ms: 300,
        }
    }
}

impl LifecycleConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_seconds)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_seconds)
    }

    pub fn history_pacing(&self) -> Duration {
        Duration::from_millis(self.history_pacing_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub stale_token_marker: String,
    pub timeout_seconds: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            stale_token_marker: "invalid callback token".to_string(),
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_messages: Option<usize>,
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("WA_GATEWAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.wa-gateway/wa-gateway.json"))
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();
    let mut cfg = load_config_file(&config_path).unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg
}

pub fn load_config_file(path: &std::path::Path) -> Option<Config> {
    if !path.exists() {
        return None;
    }
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Config>(&raw) {
        Ok(cfg) => Some(cfg),
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring unparseable config file: {err}");
            None
        }
    }
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(port) = env::var("WA_GATEWAY_PORT") {
        if let Ok(port) = port.trim().parse::<u16>() {
            cfg.server.port = port;
        }
    }

    if let Ok(url) = env::var("WA_GATEWAY_DATABASE_URL") {
        if !url.trim().is_empty() {
            cfg.database.url = Some(url);
        }
    }

    if let Ok(path) = env::var("WA_GATEWAY_SQLITE_PATH") {
        if !path.trim().is_empty() {
            cfg.database.sqlite_path = path;
        }
    }

    if let Ok(url) = env::var("WA_GATEWAY_SIDECAR_URL") {
        if !url.trim().is_empty() {
            cfg.transport.sidecar_url = url;
        }
    }
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}?mode=rwc", path.to_string_lossy())
}
