//! Offline worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::error::{ConfigError, ConfigResult};

/// Cache generation label shipped with this build.
///
/// Bumping it is the only way to invalidate every stored entry.
pub const DEFAULT_CACHE_NAME: &str = "carniceria-cache-v1";

/// Storefront assets stored during install.
const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/index.html",
    "/login.html",
    "/register.html",
    "/offline.html",
    "/css/styles.css",
    "/js/app.js",
    "/js/auth.js",
    "/js/catalog.js",
    "/js/loyalty.js",
    "/img/rib-eye.png",
    "/img/filet_mignon.png",
    "/img/porterhouse.png",
    "/img/ney_york_string.png",
    "/img/tomahawk.png",
    "/img/bravette_steak.png",
    "/img/res.jpg",
    "/img/cerdo.jpg",
    "/img/pollo.jpg",
    "/img/meat-pattern.png",
    "/img/icon-192.png",
    "/manifest.json",
];

/// Offline worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Cache generation label
    pub cache_name: String,

    /// Origin the storefront is served from; relative paths resolve against it
    pub origin: Url,

    /// Paths fetched and stored during install
    pub precache: Vec<String>,

    /// Page returned when a document request fails offline
    pub offline_url: String,

    /// URL substring identifying backend data-query traffic
    pub api_pattern: String,

    /// Notification settings
    pub notifications: NotificationConfig,

    /// Network-first timeout in milliseconds before falling back to the cache
    pub network_timeout_ms: u64,

    /// Install attempts before the new version is given up
    pub install_attempts: u32,

    /// Total bytes all generations may hold (none = unbounded)
    pub cache_quota_bytes: Option<u64>,

    /// Where cache storage is persisted between runs (none = memory only)
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Icon shown on push notifications
    pub icon: String,

    /// Badge shown on push notifications
    pub badge: String,

    /// Target opened when a push payload carries no URL
    pub default_url: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            origin: Url::parse("http://localhost:8080/").expect("static origin is valid"),
            precache: DEFAULT_PRECACHE.iter().map(|p| p.to_string()).collect(),
            offline_url: "/offline.html".to_string(),
            api_pattern: "/rest/v1/".to_string(),
            notifications: NotificationConfig::default(),
            network_timeout_ms: 10_000,
            install_attempts: 1,
            cache_quota_bytes: None,
            snapshot_path: None,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            icon: "/img/icon-192.png".to_string(),
            badge: "/img/badge.png".to_string(),
            default_url: "/".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration for the given origin and cache label, keeping
    /// every other default
    pub fn new(origin: Url, cache_name: impl Into<String>) -> Self {
        Self {
            origin,
            cache_name: cache_name.into(),
            ..Default::default()
        }
    }

    /// Replace the install manifest
    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        debug!(path = %path.display(), cache = %config.cache_name, "Loaded worker config");
        Ok(config)
    }

    /// Load a configuration file, falling back to defaults when it does not exist
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No worker config found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Save the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Check the configuration for values the worker cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::invalid("cache_name must not be empty"));
        }
        if self.origin.cannot_be_a_base() {
            return Err(ConfigError::invalid(format!(
                "origin '{}' cannot be used as a base URL",
                self.origin
            )));
        }
        if self.api_pattern.is_empty() {
            return Err(ConfigError::invalid("api_pattern must not be empty"));
        }
        if self.network_timeout_ms == 0 {
            return Err(ConfigError::invalid("network_timeout_ms must be positive"));
        }
        for path in self.precache.iter().chain([&self.offline_url]) {
            self.resolve(path)?;
        }
        Ok(())
    }

    /// Resolve a path or absolute URL against the origin
    pub fn resolve(&self, path: &str) -> ConfigResult<Url> {
        self.origin.join(path).map_err(|source| ConfigError::Resolve {
            path: path.to_string(),
            source,
        })
    }

    /// Absolute URLs of the install manifest, in manifest order
    pub fn precache_urls(&self) -> ConfigResult<Vec<Url>> {
        self.precache.iter().map(|p| self.resolve(p)).collect()
    }

    /// Absolute URL of the offline page
    pub fn offline_page_url(&self) -> ConfigResult<Url> {
        self.resolve(&self.offline_url)
    }

    /// Network-first timeout
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}
