use async_trait::async_trait;
use dashmap::DashMap;
use std::{env, net::SocketAddr, path::PathBuf, time::Duration};
use tracing::{info, warn};

use crate::error::{FlexError, FlexResult};

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Reads the process environment, after loading an optional `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        match &env_file {
            Some(path) if path.exists() => {
                dotenvy::from_path(path).ok();
                info!("Loaded .env from {}", path.display());
            }
            Some(path) => warn!("could not load .env from {}", path.display()),
            None => {
                if let Ok(path) = dotenvy::dotenv() {
                    info!("Loaded .env from {}", path.display());
                }
            }
        }

        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(path) => format!("EnvConfigManager({})", path.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            map: DashMap::new(),
        })
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.set(key, value);
        self
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_WEBSOCKET_PORT: u16 = 4010;
pub const DEFAULT_NODE_ENV: &str = "development";

/// Resolved settings for the flexibility service.
#[derive(Debug, Clone, PartialEq)]
pub struct FlexConfig {
    /// Raw `FEATURE_FLAGS` JSON blob, parsed lazily by the flag service.
    pub feature_flags: Option<String>,
    pub host: String,
    pub port: u16,
    pub websocket_port: u16,
    pub node_env: String,
    pub app_version: String,
    pub bind_addr: SocketAddr,
    pub cleanup_interval: Option<Duration>,
    pub hook_timeout: Option<Duration>,
}

impl Default for FlexConfig {
    fn default() -> Self {
        Self {
            feature_flags: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            websocket_port: DEFAULT_WEBSOCKET_PORT,
            node_env: DEFAULT_NODE_ENV.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            cleanup_interval: None,
            hook_timeout: None,
        }
    }
}

impl FlexConfig {
    pub async fn load(config: &ConfigManager) -> FlexResult<Self> {
        let defaults = FlexConfig::default();

        let port = parse_opt::<u16>(config, "PORT").await?.unwrap_or(defaults.port);
        let websocket_port = parse_opt::<u16>(config, "WEBSOCKET_PORT")
            .await?
            .unwrap_or(defaults.websocket_port);
        let bind_addr = parse_opt::<SocketAddr>(config, "BIND_ADDR")
            .await?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], port)));
        let cleanup_interval = parse_opt::<u64>(config, "SERVICE_CLEANUP_INTERVAL_SECS")
            .await?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let hook_timeout = parse_opt::<u64>(config, "PLUGIN_HOOK_TIMEOUT_MS")
            .await?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Ok(Self {
            feature_flags: config.get("FEATURE_FLAGS").await,
            host: config.get("HOST").await.unwrap_or(defaults.host),
            port,
            websocket_port,
            node_env: config.get("NODE_ENV").await.unwrap_or(defaults.node_env),
            app_version: config.get("APP_VERSION").await.unwrap_or(defaults.app_version),
            bind_addr,
            cleanup_interval,
            hook_timeout,
        })
    }
}

async fn parse_opt<T>(config: &ConfigManager, key: &str) -> FlexResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match config.get(key).await {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| FlexError::Config {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}
