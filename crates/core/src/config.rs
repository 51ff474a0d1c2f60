//! Application configuration.
//!
//! Everything lives under a single app-data directory so that a user
//! install can be wiped by deleting one folder.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::jikan::JikanConfig;

/// Root configuration for the backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// App-data root. Holds the metadata cache, the transient segment
    /// cache and the per-episode download directories.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Loopback port the stream proxy binds to. `0` picks a free port.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default)]
    pub jikan: JikanConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            proxy_port: default_proxy_port(),
            jikan: JikanConfig::default(),
        }
    }
}

impl AppConfig {
    /// Transient segment cache, populated by the proxy on cache misses.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Per-episode persistent downloads.
    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    /// JSON-persisted metadata cache.
    pub fn metadata_cache_path(&self) -> PathBuf {
        self.data_dir.join("metadata_cache.json")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hikari")
}

fn default_proxy_port() -> u16 {
    34116
}
