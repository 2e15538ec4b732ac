use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::errors::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub cache_dir: PathBuf,
    pub host: String,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir(),
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl AppConfig {
    /// Loads the config file, creating it with defaults on first run.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => Self::default_config_path(),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: AppConfig = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = AppConfig::default();
            config.save(&config_path)?;
            Ok(config)
        }
    }

    pub fn save(&self, config_path: &std::path::Path) -> Result<()> {
        if let Some(config_dir) = config_path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("music-metadata-processor")
            .join("config.json")
    }

    /// Service policy: the listener is never exposed beyond loopback. A
    /// configured non-loopback host is replaced with 127.0.0.1.
    pub fn effective_host(&self) -> String {
        let is_loopback = self
            .host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(self.host == "localhost");

        if is_loopback {
            self.host.clone()
        } else {
            log::warn!(
                "configured host {} is not loopback, binding 127.0.0.1 instead",
                self.host
            );
            "127.0.0.1".to_string()
        }
    }
}
