use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

pub const CHUNK_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(default = "default_origin_timeout_secs")]
    pub origin_timeout_secs: u64,

    #[serde(default = "default_client_idle_timeout_secs")]
    pub client_idle_timeout_secs: u64,

    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            port: default_port(),
            bind_address: default_bind_address(),
            max_total_bytes: default_max_total_bytes(),
            chunk_size: default_chunk_size(),
            origin_timeout_secs: default_origin_timeout_secs(),
            client_idle_timeout_secs: default_client_idle_timeout_secs(),
            stats_interval_secs: default_stats_interval_secs(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Loads from `VIDCACHE_CONFIG` (or the platform default path), falling back to
    /// built-in defaults when the file is absent, then applies `VIDCACHE_*` env overrides.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        let mut config = if config_path.exists() {
            debug!("Loading config from {:?}", config_path);
            let contents =
                fs::read_to_string(&config_path).context("failed to read config file")?;
            let config: Config = toml::from_str(&contents).context("failed to parse config file")?;
            info!("config loaded successfully");
            config
        } else {
            info!("no config file found at {:?}, using defaults", config_path);
            let config = Config::default();
            config.save()?;
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(&config_path, contents).context("failed to write config file")?;

        debug!("config saved to {:?}", config_path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow::anyhow!("port must be non-zero"));
        }
        if self.max_total_bytes == 0 {
            return Err(anyhow::anyhow!("max_total_bytes must be greater than 0"));
        }
        if self.chunk_size == 0 {
            return Err(anyhow::anyhow!("chunk_size must be greater than 0"));
        }
        if self.origin_timeout_secs == 0 {
            return Err(anyhow::anyhow!("origin_timeout_secs must be greater than 0"));
        }
        if self.client_idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!(
                "client_idle_timeout_secs must be greater than 0"
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("VIDCACHE_CACHE_ROOT") {
            self.cache_root = PathBuf::from(v);
        }
        if let Ok(v) = env::var("VIDCACHE_PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            } else {
                tracing::warn!("ignoring non-numeric VIDCACHE_PORT={:?}", v);
            }
        }
        if let Ok(v) = env::var("VIDCACHE_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Ok(v) = env::var("VIDCACHE_MAX_TOTAL_BYTES") {
            if let Ok(n) = v.parse() {
                self.max_total_bytes = n;
            } else {
                tracing::warn!("ignoring non-numeric VIDCACHE_MAX_TOTAL_BYTES={:?}", v);
            }
        }
        if let Ok(v) = env::var("VIDCACHE_LOG_FILTER") {
            self.log_filter = v;
        }
    }

    fn config_path() -> Result<PathBuf> {
        if let Ok(v) = env::var("VIDCACHE_CONFIG") {
            return Ok(PathBuf::from(v));
        }
        let config_dir = dirs::config_dir().context("failed to get config directory")?;
        Ok(config_dir.join("vidcache").join("config.toml"))
    }
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("vidcache")
}
fn default_port() -> u16 {
    8080
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_max_total_bytes() -> u64 {
    1024 * 1024 * 1024
}
fn default_chunk_size() -> u64 {
    CHUNK_SIZE
}
fn default_origin_timeout_secs() -> u64 {
    30
}
fn default_client_idle_timeout_secs() -> u64 {
    60
}
fn default_stats_interval_secs() -> u64 {
    30
}
fn default_log_filter() -> String {
    "vidcache_proxy=info".to_string()
}
