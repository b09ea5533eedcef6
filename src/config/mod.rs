//! Configuration types for the cache proxy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::resolve;
use crate::storage::MAX_STORE_NAME_LEN;

/// Store name of the current generation unless configured otherwise.
pub const DEFAULT_CACHE_VERSION: &str = "aset-dashboard-cache-v1";

/// Path served to navigations that fail offline.
pub const DEFAULT_FALLBACK: &str = "/dashboard";

/// What happens to a successful network response on a cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachingMode {
    /// Store 200 responses whose URL matches the allow-list.
    #[default]
    Opportunistic,
    /// Never store on a miss; only the precache manifest is cached.
    NetworkOnly,
}

/// Cache generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the current store. Changing it starts a new generation.
    pub version: String,
    /// URLs fetched and stored at install, in order.
    pub precache: Vec<String>,
    /// Path served for offline navigations.
    pub fallback: String,
    /// Miss handling policy.
    pub mode: CachingMode,
    /// URL prefixes eligible for opportunistic caching.
    pub opportunistic: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_CACHE_VERSION.to_string(),
            precache: [
                "/",
                "/dashboard",
                "/input",
                "/static/manifest.json",
                "/static/icon-192.png",
                "/static/icon-512.png",
            ]
            .map(String::from)
            .to_vec(),
            fallback: DEFAULT_FALLBACK.to_string(),
            mode: CachingMode::Opportunistic,
            opportunistic: vec!["https://cdn.jsdelivr.net/npm/chart.js".to_string()],
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the store version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Replaces the precache manifest.
    #[must_use]
    pub fn with_precache<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the offline navigation fallback path.
    #[must_use]
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// Sets the miss handling policy.
    #[must_use]
    pub const fn with_mode(mut self, mode: CachingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replaces the opportunistic allow-list.
    #[must_use]
    pub fn with_opportunistic<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.opportunistic = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if `url` falls under an allow-list entry.
    ///
    /// The entry's origin must match exactly; its path is then a prefix of
    /// the request path.
    #[must_use]
    pub fn is_allow_listed(&self, url: &Url) -> bool {
        self.opportunistic.iter().any(|prefix| {
            Url::parse(prefix).is_ok_and(|prefix| {
                prefix.origin() == url.origin() && url.path().starts_with(prefix.path())
            })
        })
    }

    /// Returns true if a successful response for `url` may be stored on a miss.
    #[must_use]
    pub fn allows_opportunistic(&self, url: &Url) -> bool {
        self.mode == CachingMode::Opportunistic && self.is_allow_listed(url)
    }
}

/// The origin server the proxy sits in front of.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the dashboard server.
    pub origin: String,
    /// Overall timeout for a single fetch. Unset means no timeout.
    pub timeout_secs: Option<u64>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            origin: "http://127.0.0.1:8000".to_string(),
            timeout_secs: None,
        }
    }
}

impl UpstreamConfig {
    /// Parses the origin URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the origin is not an http(s) URL.
    pub fn origin_url(&self) -> Result<Url> {
        let url = Url::parse(&self.origin)
            .map_err(|e| Error::InvalidUrl(format!("{}: {e}", self.origin)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::InvalidUrl(format!(
                "{}: unsupported scheme {other}",
                self.origin
            ))),
        }
    }

    /// Returns the fetch timeout, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Where stores live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// One directory per store under [`StorageConfig::dir`].
    #[default]
    Disk,
    /// Process memory; nothing survives a restart.
    Memory,
}

/// Store backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind.
    pub backend: StorageBackend,
    /// Root directory for the disk backend.
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Disk,
            dir: default_store_dir(),
        }
    }
}

/// Returns the default root directory for on-disk stores.
///
/// Uses `STATE_DIRECTORY` (set by systemd when `StateDirectory=` is configured),
/// falling back to `$XDG_DATA_HOME/dashcache` for interactive use.
#[must_use]
pub fn default_store_dir() -> PathBuf {
    if let Ok(state_dir) = std::env::var("STATE_DIRECTORY") {
        PathBuf::from(state_dir).join("stores")
    } else {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dashcache")
            .join("stores")
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Cache generation settings.
    pub cache: CacheConfig,
    /// Origin server settings.
    pub upstream: UpstreamConfig,
    /// Listener settings.
    pub server: ServerConfig,
    /// Store backend settings.
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the default config file location.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dashcache")
            .join("config.toml")
    }

    /// Loads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, writing a default template there first if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be written or the file is invalid.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("Writing default config to {}", path.display());
            Self::default().save(path)?;
        }
        Self::load(path)
    }

    /// Saves the config atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string(self).map_err(|e| Error::Config(e.to_string()))?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml_str)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Checks values that cannot be expressed in the type system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.cache.version.trim().is_empty() {
            return Err(Error::Config("cache.version must not be empty".to_string()));
        }
        if self.cache.version.len() > MAX_STORE_NAME_LEN {
            return Err(Error::Config(format!(
                "cache.version must be at most {MAX_STORE_NAME_LEN} bytes"
            )));
        }

        let origin = self
            .upstream
            .origin_url()
            .map_err(|e| Error::Config(format!("upstream.origin: {e}")))?;

        for url in self.cache.precache.iter().chain([&self.cache.fallback]) {
            resolve(&origin, url).map_err(|e| Error::Config(format!("cache: {e}")))?;
        }

        if let Some(bad) = self
            .cache
            .opportunistic
            .iter()
            .find(|prefix| Url::parse(prefix).is_err())
        {
            return Err(Error::Config(format!(
                "cache.opportunistic entries must be absolute URLs, got {bad}"
            )));
        }

        Ok(())
    }
}
