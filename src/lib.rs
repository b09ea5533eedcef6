//! dashcache - A cache-first proxy for a web dashboard.
//!
//! Requests are answered from a named, versioned store when an entry
//! exists, otherwise from the network. Navigations that fail offline get a
//! fixed fallback page. The store generation is replaced as a whole when
//! the configured version changes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dashcache::request::resolve;
//! use dashcache::{CacheConfig, CacheProxy, MemoryStorage, ProxyRequest, ReqwestNetwork};
//!
//! # async fn example() -> dashcache::Result<()> {
//! let origin = reqwest::Url::parse("http://127.0.0.1:8000")
//!     .map_err(|e| dashcache::Error::InvalidUrl(e.to_string()))?;
//! let proxy = CacheProxy::new(
//!     CacheConfig::default(),
//!     origin.clone(),
//!     Arc::new(MemoryStorage::new()),
//!     ReqwestNetwork::with_timeout(None)?,
//! )?;
//!
//! // Install and activate this generation.
//! proxy.on_init().await?;
//! proxy.on_activate().await?;
//!
//! // Answer a page load.
//! let served = proxy
//!     .on_intercept(&ProxyRequest::navigate(resolve(&origin, "/dashboard")?))
//!     .await?;
//! println!("{} ({})", served.response.status, served.source.as_str());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod format;
pub mod network;
pub mod proxy;
pub mod request;
pub mod response;
#[cfg(feature = "server")]
pub mod server;
pub mod storage;

// Re-export main types for convenience
pub use config::{AppConfig, CacheConfig, CachingMode, StorageBackend};
pub use error::{Error, Result};
pub use format::{format_bytes, format_duration};
pub use network::{Network, ReqwestNetwork};
pub use proxy::{CacheProxy, Lifecycle, ProxyStatus, Served, Source};
pub use request::{ProxyRequest, RequestKey, RequestMode};
pub use response::StoredResponse;
pub use storage::{CacheStorage, DiskStorage, MemoryStorage};
