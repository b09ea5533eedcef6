//! The cache proxy: install, activate and intercept.
//!
//! A [`CacheProxy`] owns one cache generation, named by
//! [`CacheConfig::version`]. The host drives it through three hooks:
//!
//! - [`CacheProxy::on_init`] precaches the manifest, all or nothing.
//! - [`CacheProxy::on_activate`] deletes every store of older generations.
//! - [`CacheProxy::on_intercept`] answers a request cache-first, falling back
//!   to the network and, for offline navigations, to the fallback page.
//!
//! If install fails, [`CacheProxy::resume`] points interception at the newest
//! generation already in storage, so the previous version stays in service.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::future::try_join_all;
use reqwest::Url;
use serde::Serialize;
use tokio_util::task::TaskTracker;

use crate::config::{CacheConfig, CachingMode};
use crate::error::{Error, Result};
use crate::format::format_duration;
use crate::network::Network;
use crate::request::{ProxyRequest, RequestKey, resolve};
use crate::response::StoredResponse;
use crate::storage::CacheStorage;

/// Lifecycle of one cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Constructed, install not started.
    New,
    /// Precaching the manifest.
    Installing,
    /// Manifest committed, waiting for activation.
    Installed,
    /// Controlling traffic; older generations have been deleted.
    Active,
    /// Install failed or a newer generation took over.
    Redundant,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Active => "active",
            Self::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// Where an intercepted request was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Exact key match in the current store.
    Cache,
    /// Network fetch after a miss.
    Network,
    /// Offline navigation answered with the fallback page.
    Fallback,
}

impl Source {
    /// Short tag for response headers and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "hit",
            Self::Network => "miss",
            Self::Fallback => "fallback",
        }
    }
}

/// An answered request.
#[derive(Debug, Clone)]
pub struct Served {
    /// Response to hand back to the page, unmodified.
    pub response: StoredResponse,
    /// Where it came from.
    pub source: Source,
}

impl Served {
    const fn new(response: StoredResponse, source: Source) -> Self {
        Self { response, source }
    }
}

/// Point-in-time view of a proxy, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    /// Configured generation.
    pub version: String,
    /// Lifecycle of the configured generation.
    pub state: Lifecycle,
    /// Store requests are answered from. Differs from `version` after a
    /// failed install was resumed on an older generation.
    pub serving: String,
    /// Miss handling policy.
    pub mode: CachingMode,
    /// Entries in the serving store.
    pub entries: usize,
    /// Every store present in storage.
    pub stores: Vec<String>,
    /// Background writes not yet finished.
    pub pending_writes: usize,
}

/// Cache-first proxy for one cache generation.
pub struct CacheProxy<S, N> {
    config: CacheConfig,
    origin: Url,
    fallback: RequestKey,
    storage: Arc<S>,
    network: N,
    state: Mutex<Lifecycle>,
    serving: Mutex<String>,
    writes: TaskTracker,
}

impl<S, N> CacheProxy<S, N>
where
    S: CacheStorage + 'static,
    N: Network,
{
    /// Creates a proxy for the generation described by `config`.
    ///
    /// Relative manifest entries and the fallback path resolve against `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the fallback path cannot be resolved.
    pub fn new(config: CacheConfig, origin: Url, storage: Arc<S>, network: N) -> Result<Self> {
        let fallback = RequestKey::get(&resolve(&origin, &config.fallback)?);
        let serving = Mutex::new(config.version.clone());
        Ok(Self {
            config,
            origin,
            fallback,
            storage,
            network,
            state: Mutex::new(Lifecycle::New),
            serving,
            writes: TaskTracker::new(),
        })
    }

    /// Returns the cache configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the upstream origin.
    #[must_use]
    pub const fn origin(&self) -> &Url {
        &self.origin
    }

    /// Returns the store name of this generation.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Returns the shared storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> Lifecycle {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the name of the store requests are answered from.
    #[must_use]
    pub fn serving(&self) -> String {
        self.serving.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_state(&self, next: Lifecycle) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Moves to `next` if the current state is one of `allowed`.
    fn transition(&self, allowed: &[Lifecycle], next: Lifecycle) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let current = *state;
        if !allowed.contains(&current) {
            return Err(Error::Lifecycle(format!(
                "cannot move from {current} to {next}"
            )));
        }
        *state = next;
        Ok(())
    }

    /// Installs this generation: fetches the whole manifest and commits it.
    ///
    /// Nothing is written unless every manifest URL answers with a 2xx status.
    /// On failure the generation becomes [`Lifecycle::Redundant`] and older
    /// generations are left untouched.
    ///
    /// Returns the number of entries committed.
    ///
    /// # Errors
    ///
    /// Returns the first fetch or storage error, or [`Error::Status`] for a
    /// non-success response.
    pub async fn on_init(&self) -> Result<usize> {
        self.transition(&[Lifecycle::New], Lifecycle::Installing)?;
        log::info!("Installing {}", self.config.version);
        let started = Instant::now();

        match self.precache().await {
            Ok(count) => {
                self.set_state(Lifecycle::Installed);
                log::info!(
                    "Installed {} ({count} entries in {})",
                    self.config.version,
                    format_duration(started.elapsed())
                );
                Ok(count)
            }
            Err(e) => {
                self.set_state(Lifecycle::Redundant);
                log::error!("Install of {} failed: {e}", self.config.version);
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<usize> {
        let version = self.config.version.as_str();
        self.storage.open(version).await?;

        let requests = self
            .config
            .precache
            .iter()
            .map(|url| resolve(&self.origin, url).map(ProxyRequest::get))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Caching app shell ({} URLs)", requests.len());
        let entries = try_join_all(requests.iter().map(|request| async move {
            let response = self.network.fetch(request).await?;
            if !response.is_success() {
                return Err(Error::Status {
                    url: request.url.to_string(),
                    status: response.status,
                });
            }
            Ok::<_, Error>((request.key(), response))
        }))
        .await?;

        let count = entries.len();
        self.storage.put_all(version, entries).await?;
        Ok(count)
    }

    /// Activates this generation, deleting every other store.
    ///
    /// Returns the names of the deleted stores.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lifecycle`] if the generation was never installed, or
    /// the first storage error.
    pub async fn on_activate(&self) -> Result<Vec<String>> {
        self.transition(&[Lifecycle::Installed, Lifecycle::Active], Lifecycle::Active)?;
        log::info!("Activating {}", self.config.version);

        let stale: Vec<String> = self
            .storage
            .names()
            .await?
            .into_iter()
            .filter(|name| *name != self.config.version)
            .collect();

        let deleted = try_join_all(stale.into_iter().map(|name| async move {
            log::info!("Deleting old cache: {name}");
            let existed = self.storage.delete(&name).await?;
            Ok::<_, Error>(existed.then_some(name))
        }))
        .await?;

        Ok(deleted.into_iter().flatten().collect())
    }

    /// Keeps the proxy in service after a failed install.
    ///
    /// Picks the newest non-empty store already in storage: this version's
    /// own store from an earlier run if present, otherwise the highest
    /// numbered older generation. Interception then reads and writes that
    /// store. Nothing is deleted.
    ///
    /// Returns the chosen store, or `None` if storage holds no entries at all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lifecycle`] unless install failed, or the first
    /// storage error.
    pub async fn resume(&self) -> Result<Option<String>> {
        let current = self.state();
        if current != Lifecycle::Redundant {
            return Err(Error::Lifecycle(format!("cannot resume from {current}")));
        }

        let mut candidates = Vec::new();
        for name in self.storage.names().await? {
            if self.storage.len(&name).await? > 0 {
                candidates.push(name);
            }
        }

        let chosen = if candidates.contains(&self.config.version) {
            Some(self.config.version.clone())
        } else {
            candidates
                .into_iter()
                .max_by(|a, b| generation_order(a).cmp(&generation_order(b)))
        };

        if let Some(name) = &chosen {
            log::warn!("Install of {} failed, serving {name}", self.config.version);
            *self.serving.lock().unwrap_or_else(PoisonError::into_inner) = name.clone();
        }
        Ok(chosen)
    }

    /// Answers one intercepted request.
    ///
    /// Cached entries are returned verbatim and never revalidated. On a miss
    /// the network answers; in opportunistic mode an allow-listed 200 is
    /// stored in the background without delaying the caller. If the network
    /// fails, navigations get the fallback page.
    ///
    /// # Errors
    ///
    /// Returns the network error for a failed sub-resource load, or
    /// [`Error::NoResponse`] for a failed navigation with no fallback entry.
    pub async fn on_intercept(&self, request: &ProxyRequest) -> Result<Served> {
        let store = self.serving();
        let key = request.key();

        if key.is_cacheable() {
            match self.storage.get(&store, &key).await {
                Ok(Some(hit)) => {
                    log::debug!("Cache hit: {key}");
                    return Ok(Served::new(hit, Source::Cache));
                }
                Ok(None) => {}
                Err(e) => log::warn!("Store lookup for {key} failed, using network: {e}"),
            }
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                if key.is_cacheable()
                    && response.status == 200
                    && self.config.allows_opportunistic(&request.url)
                {
                    self.store_in_background(store, key, response.clone());
                }
                Ok(Served::new(response, Source::Network))
            }
            Err(e) if request.is_navigation() => {
                if let Ok(Some(fallback)) = self.storage.get(&store, &self.fallback).await {
                    log::warn!("Offline navigation to {}, serving {}", request.url, self.fallback.url);
                    return Ok(Served::new(fallback, Source::Fallback));
                }
                log::warn!("Offline navigation to {} and no fallback cached: {e}", request.url);
                Err(Error::NoResponse {
                    url: request.url.to_string(),
                })
            }
            Err(e) => {
                log::debug!("Network fetch for {key} failed: {e}");
                Err(e)
            }
        }
    }

    fn store_in_background(&self, store: String, key: RequestKey, response: StoredResponse) {
        let storage = Arc::clone(&self.storage);
        self.writes.spawn(async move {
            let label = key.to_string();
            match storage.put(&store, key, response).await {
                Ok(()) => log::debug!("Stored {label} in {store}"),
                Err(e) => log::debug!("Opportunistic store of {label} failed: {e}"),
            }
        });
    }

    /// Waits for every background store write started so far.
    pub async fn settle(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    /// Marks this generation as replaced by a newer one.
    pub fn supersede(&self) {
        log::info!("{} superseded", self.config.version);
        self.set_state(Lifecycle::Redundant);
    }

    /// Returns a snapshot for the status endpoint.
    ///
    /// # Errors
    ///
    /// Returns the first storage error.
    pub async fn status(&self) -> Result<ProxyStatus> {
        let serving = self.serving();
        Ok(ProxyStatus {
            version: self.config.version.clone(),
            state: self.state(),
            entries: self.storage.len(&serving).await?,
            serving,
            mode: self.config.mode,
            stores: self.storage.names().await?,
            pending_writes: self.writes.len(),
        })
    }
}

/// Orders store names like `name-v2` < `name-v10` by their trailing number.
fn generation_order(name: &str) -> (&str, u64) {
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    (stem, name[stem.len()..].parse().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::storage::{DiskStorage, MemoryStorage};

    const ORIGIN: &str = "http://dash.local:8000";
    const CHART: &str = "https://cdn.jsdelivr.net/npm/chart.js";

    /// Scripted network that counts calls and can be switched offline.
    #[derive(Default)]
    struct FakeNetwork {
        responses: HashMap<String, StoredResponse>,
        offline: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeNetwork {
        fn serving(pages: &[(&str, u16, &str)]) -> Self {
            let origin = Url::parse(ORIGIN).unwrap();
            let responses = pages
                .iter()
                .map(|(url, status, body)| {
                    let url = resolve(&origin, url).unwrap().to_string();
                    (url, StoredResponse::new(*status, body.to_string()))
                })
                .collect();
            Self {
                responses,
                ..Self::default()
            }
        }

        fn go_offline(&self) {
            self.offline.store(true, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Network for Arc<FakeNetwork> {
        async fn fetch(&self, request: &ProxyRequest) -> Result<StoredResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "offline",
                )));
            }
            Ok(self
                .responses
                .get(request.url.as_str())
                .cloned()
                .unwrap_or_else(|| StoredResponse::new(404, "not found")))
        }
    }

    /// Memory storage whose `put` waits for a permit and can be told to fail.
    struct GatedStorage {
        inner: MemoryStorage,
        gate: Semaphore,
        fail_puts: bool,
    }

    impl GatedStorage {
        fn new(permits: usize, fail_puts: bool) -> Self {
            Self {
                inner: MemoryStorage::new(),
                gate: Semaphore::new(permits),
                fail_puts,
            }
        }
    }

    #[async_trait]
    impl CacheStorage for GatedStorage {
        async fn open(&self, name: &str) -> Result<()> {
            self.inner.open(name).await
        }
        async fn names(&self) -> Result<Vec<String>> {
            self.inner.names().await
        }
        async fn delete(&self, name: &str) -> Result<bool> {
            self.inner.delete(name).await
        }
        async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
            self.inner.get(name, key).await
        }
        async fn put(&self, name: &str, key: RequestKey, response: StoredResponse) -> Result<()> {
            let _permit = self.gate.acquire().await.map_err(|e| Error::Store(e.to_string()))?;
            if self.fail_puts {
                return Err(Error::Store("disk full".to_string()));
            }
            self.inner.put(name, key, response).await
        }
        async fn put_all(&self, name: &str, entries: Vec<(RequestKey, StoredResponse)>) -> Result<()> {
            self.inner.put_all(name, entries).await
        }
        async fn len(&self, name: &str) -> Result<usize> {
            self.inner.len(name).await
        }
    }

    fn dashboard() -> FakeNetwork {
        FakeNetwork::serving(&[
            ("/", 200, "root"),
            ("/dashboard", 200, "dashboard"),
            ("/input", 200, "input"),
            ("/static/manifest.json", 200, "{}"),
            ("/static/icon-192.png", 200, "png192"),
            ("/static/icon-512.png", 200, "png512"),
            ("/reports", 200, "reports"),
            ("/static/app.js", 200, "app"),
            (CHART, 200, "chart"),
        ])
    }

    fn url(path: &str) -> Url {
        resolve(&Url::parse(ORIGIN).unwrap(), path).unwrap()
    }

    fn proxy_with<S: CacheStorage + 'static>(
        config: CacheConfig,
        storage: Arc<S>,
        network: &Arc<FakeNetwork>,
    ) -> CacheProxy<S, Arc<FakeNetwork>> {
        CacheProxy::new(config, Url::parse(ORIGIN).unwrap(), storage, Arc::clone(network)).unwrap()
    }

    fn proxy(network: &Arc<FakeNetwork>) -> CacheProxy<MemoryStorage, Arc<FakeNetwork>> {
        proxy_with(CacheConfig::default(), Arc::new(MemoryStorage::new()), network)
    }

    #[tokio::test]
    async fn install_precaches_every_manifest_url() {
        let network = Arc::new(dashboard());
        let proxy = proxy(&network);

        assert_eq!(proxy.on_init().await.unwrap(), 6);
        assert_eq!(proxy.state(), Lifecycle::Installed);

        for path in &CacheConfig::default().precache {
            let hit = proxy
                .storage()
                .get(proxy.version(), &RequestKey::get(&url(path)))
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("{path} not cached"));
            assert_eq!(hit.status, 200);
        }
    }

    #[tokio::test]
    async fn install_is_all_or_nothing_on_bad_status() {
        let network = Arc::new(FakeNetwork::serving(&[
            ("/", 200, "root"),
            ("/dashboard", 500, "boom"),
        ]));
        let config = CacheConfig::default().with_precache(["/", "/dashboard"]);
        let proxy = proxy_with(config, Arc::new(MemoryStorage::new()), &network);

        let err = proxy.on_init().await.unwrap_err();
        assert!(matches!(err, Error::Status { status: 500, .. }));
        assert_eq!(proxy.state(), Lifecycle::Redundant);
        assert_eq!(proxy.storage().len(proxy.version()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn install_is_all_or_nothing_when_offline() {
        let network = Arc::new(dashboard());
        network.go_offline();
        let proxy = proxy(&network);

        assert!(proxy.on_init().await.is_err());
        assert_eq!(proxy.storage().len(proxy.version()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn install_runs_once() {
        let network = Arc::new(dashboard());
        let proxy = proxy(&network);
        proxy.on_init().await.unwrap();
        assert!(matches!(proxy.on_init().await, Err(Error::Lifecycle(_))));
    }

    #[tokio::test]
    async fn failed_install_leaves_old_generation_alone() {
        let network = Arc::new(FakeNetwork::serving(&[("/", 200, "root")]));
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put("aset-dashboard-cache-v0", RequestKey::get(&url("/")), StoredResponse::new(200, "old"))
            .await
            .unwrap();

        let proxy = proxy_with(CacheConfig::default(), Arc::clone(&storage), &network);
        assert!(proxy.on_init().await.is_err());
        assert!(matches!(proxy.on_activate().await, Err(Error::Lifecycle(_))));
        assert!(
            storage
                .names()
                .await
                .unwrap()
                .contains(&"aset-dashboard-cache-v0".to_string())
        );
    }

    #[tokio::test]
    async fn activate_deletes_every_other_store() {
        let network = Arc::new(dashboard());
        let storage = Arc::new(MemoryStorage::new());
        storage.open("aset-dashboard-cache-v0").await.unwrap();
        storage.open("something-else").await.unwrap();

        let proxy = proxy_with(CacheConfig::default(), Arc::clone(&storage), &network);
        proxy.on_init().await.unwrap();
        let mut deleted = proxy.on_activate().await.unwrap();
        deleted.sort();

        assert_eq!(deleted, vec!["aset-dashboard-cache-v0", "something-else"]);
        assert_eq!(storage.names().await.unwrap(), vec!["aset-dashboard-cache-v1"]);
        assert_eq!(proxy.state(), Lifecycle::Active);

        // Idempotent once active.
        assert!(proxy.on_activate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hit_is_served_without_network() {
        let network = Arc::new(dashboard());
        let proxy = proxy(&network);
        proxy
            .storage()
            .put(proxy.version(), RequestKey::get(&url("/reports")), StoredResponse::new(200, "stale"))
            .await
            .unwrap();

        let served = proxy.on_intercept(&ProxyRequest::get(url("/reports"))).await.unwrap();
        assert_eq!(served.source, Source::Cache);
        assert_eq!(served.response.body.as_ref(), b"stale");
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn miss_goes_to_network() {
        let network = Arc::new(dashboard());
        let proxy = proxy(&network);

        let served = proxy.on_intercept(&ProxyRequest::get(url("/static/app.js"))).await.unwrap();
        assert_eq!(served.source, Source::Network);
        assert_eq!(served.response.body.as_ref(), b"app");
        assert_eq!(network.calls(), 1);

        proxy.settle().await;
        // Not allow-listed, so nothing was stored.
        assert_eq!(proxy.storage().len(proxy.version()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_navigation_gets_fallback_page() {
        let network = Arc::new(dashboard());
        let proxy = proxy(&network);
        proxy.on_init().await.unwrap();
        proxy.on_activate().await.unwrap();
        network.go_offline();

        let served = proxy.on_intercept(&ProxyRequest::navigate(url("/reports"))).await.unwrap();
        assert_eq!(served.source, Source::Fallback);
        assert_eq!(served.response.body.as_ref(), b"dashboard");
    }

    #[tokio::test]
    async fn offline_sub_resource_fails() {
        let network = Arc::new(dashboard());
        let proxy = proxy(&network);
        proxy.on_init().await.unwrap();
        network.go_offline();

        let result = proxy.on_intercept(&ProxyRequest::get(url("/static/app.js"))).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn offline_navigation_without_fallback_fails() {
        let network = Arc::new(dashboard());
        network.go_offline();
        let proxy = proxy(&network);

        let result = proxy.on_intercept(&ProxyRequest::navigate(url("/reports"))).await;
        assert!(matches!(result, Err(Error::NoResponse { .. })));
    }

    #[tokio::test]
    async fn allow_listed_response_is_stored_after_returning() {
        let network = Arc::new(dashboard());
        let storage = Arc::new(GatedStorage::new(0, false));
        let proxy = proxy_with(CacheConfig::default(), Arc::clone(&storage), &network);
        let chart = ProxyRequest::get(Url::parse(CHART).unwrap());

        let served = proxy.on_intercept(&chart).await.unwrap();
        assert_eq!(served.source, Source::Network);
        assert_eq!(served.response.body.as_ref(), b"chart");

        // The write is still parked behind the gate.
        assert!(storage.get(proxy.version(), &chart.key()).await.unwrap().is_none());
        assert_eq!(proxy.status().await.unwrap().pending_writes, 1);

        storage.gate.add_permits(1);
        proxy.settle().await;

        let cached = storage.get(proxy.version(), &chart.key()).await.unwrap().unwrap();
        assert_eq!(cached.body.as_ref(), b"chart");

        let again = proxy.on_intercept(&chart).await.unwrap();
        assert_eq!(again.source, Source::Cache);
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn failed_background_write_is_swallowed() {
        let network = Arc::new(dashboard());
        let storage = Arc::new(GatedStorage::new(1, true));
        let proxy = proxy_with(CacheConfig::default(), Arc::clone(&storage), &network);
        let chart = ProxyRequest::get(Url::parse(CHART).unwrap());

        let served = proxy.on_intercept(&chart).await.unwrap();
        assert_eq!(served.response.status, 200);
        proxy.settle().await;
        assert!(storage.get(proxy.version(), &chart.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn network_only_mode_never_stores() {
        let network = Arc::new(dashboard());
        let config = CacheConfig::default().with_mode(CachingMode::NetworkOnly);
        let proxy = proxy_with(config, Arc::new(MemoryStorage::new()), &network);
        let chart = ProxyRequest::get(Url::parse(CHART).unwrap());

        proxy.on_intercept(&chart).await.unwrap();
        proxy.settle().await;
        assert!(proxy.storage().get(proxy.version(), &chart.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_200_allow_listed_response_is_not_stored() {
        let network = Arc::new(dashboard());
        let proxy = proxy(&network);
        let missing = ProxyRequest::get(Url::parse("https://cdn.jsdelivr.net/npm/chart.js@0/missing.js").unwrap());

        let served = proxy.on_intercept(&missing).await.unwrap();
        assert_eq!(served.response.status, 404);
        proxy.settle().await;
        assert_eq!(proxy.storage().len(proxy.version()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn post_bypasses_the_store() {
        let network = Arc::new(dashboard());
        let proxy = proxy(&network);
        let key = RequestKey::new(&reqwest::Method::POST, &url("/input"));
        proxy
            .storage()
            .put(proxy.version(), key, StoredResponse::new(200, "never served"))
            .await
            .unwrap();

        let request = ProxyRequest::new(reqwest::Method::POST, url("/input")).with_body("asset=1");
        let served = proxy.on_intercept(&request).await.unwrap();
        assert_eq!(served.source, Source::Network);
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn status_reports_generation() {
        let network = Arc::new(dashboard());
        let proxy = proxy(&network);
        proxy.on_init().await.unwrap();
        proxy.on_activate().await.unwrap();

        let status = proxy.status().await.unwrap();
        assert_eq!(status.version, "aset-dashboard-cache-v1");
        assert_eq!(status.state, Lifecycle::Active);
        assert_eq!(status.entries, 6);
        assert_eq!(status.stores, vec!["aset-dashboard-cache-v1"]);
        assert_eq!(status.serving, "aset-dashboard-cache-v1");

        proxy.supersede();
        assert_eq!(proxy.state(), Lifecycle::Redundant);
    }

    #[tokio::test]
    async fn install_over_disk_rolls_back_when_commit_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(DiskStorage::new(dir.path()));
        let network = Arc::new(dashboard());
        let proxy = proxy_with(CacheConfig::default(), Arc::clone(&storage), &network);

        // A directory sitting on the last entry's file makes its rename fail
        // after the other five are already in place.
        let blocked = storage
            .entry_path(proxy.version(), &RequestKey::get(&url("/static/icon-512.png")))
            .unwrap();
        std::fs::create_dir_all(&blocked).unwrap();
        std::fs::write(blocked.join("keep"), "x").unwrap();

        assert!(matches!(proxy.on_init().await, Err(Error::Io(_))));
        assert_eq!(proxy.state(), Lifecycle::Redundant);
        assert_eq!(storage.len(proxy.version()).await.unwrap(), 0);
        assert!(
            storage
                .get(proxy.version(), &RequestKey::get(&url("/dashboard")))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn failed_install_resumes_previous_generation() {
        let network = Arc::new(dashboard());
        network.go_offline();
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put(
                "aset-dashboard-cache-v0",
                RequestKey::get(&url("/dashboard")),
                StoredResponse::new(200, "old dashboard"),
            )
            .await
            .unwrap();

        let proxy = proxy_with(CacheConfig::default(), Arc::clone(&storage), &network);
        assert!(proxy.on_init().await.is_err());
        assert_eq!(proxy.resume().await.unwrap().as_deref(), Some("aset-dashboard-cache-v0"));
        assert_eq!(proxy.serving(), "aset-dashboard-cache-v0");

        let page = proxy.on_intercept(&ProxyRequest::navigate(url("/reports"))).await.unwrap();
        assert_eq!(page.source, Source::Fallback);
        assert_eq!(page.response.body.as_ref(), b"old dashboard");

        let hit = proxy.on_intercept(&ProxyRequest::get(url("/dashboard"))).await.unwrap();
        assert_eq!(hit.source, Source::Cache);

        // The old generation is still in effect, not replaced.
        assert!(matches!(proxy.on_activate().await, Err(Error::Lifecycle(_))));
        assert!(
            storage
                .names()
                .await
                .unwrap()
                .contains(&"aset-dashboard-cache-v0".to_string())
        );
    }

    #[tokio::test]
    async fn offline_restart_serves_generation_from_earlier_run() {
        let dir = tempfile::TempDir::new().unwrap();

        let first_network = Arc::new(dashboard());
        let first = proxy_with(CacheConfig::default(), Arc::new(DiskStorage::new(dir.path())), &first_network);
        first.on_init().await.unwrap();
        first.on_activate().await.unwrap();

        let network = Arc::new(dashboard());
        network.go_offline();
        let restarted = proxy_with(CacheConfig::default(), Arc::new(DiskStorage::new(dir.path())), &network);
        assert!(restarted.on_init().await.is_err());
        assert_eq!(restarted.resume().await.unwrap().as_deref(), Some("aset-dashboard-cache-v1"));

        let input = restarted.on_intercept(&ProxyRequest::get(url("/input"))).await.unwrap();
        assert_eq!(input.source, Source::Cache);
        assert_eq!(input.response.body.as_ref(), b"input");

        let status = restarted.status().await.unwrap();
        assert_eq!(status.state, Lifecycle::Redundant);
        assert_eq!(status.serving, "aset-dashboard-cache-v1");
        assert_eq!(status.entries, 6);
    }

    #[tokio::test]
    async fn resume_picks_highest_non_empty_generation() {
        let network = Arc::new(dashboard());
        network.go_offline();
        let storage = Arc::new(MemoryStorage::new());
        for name in ["aset-dashboard-cache-v2", "aset-dashboard-cache-v10"] {
            storage
                .put(name, RequestKey::get(&url("/")), StoredResponse::new(200, name))
                .await
                .unwrap();
        }
        storage.open("aset-dashboard-cache-v11").await.unwrap();

        let config = CacheConfig::default().with_version("aset-dashboard-cache-v12");
        let proxy = proxy_with(config, storage, &network);
        assert!(proxy.on_init().await.is_err());
        assert_eq!(proxy.resume().await.unwrap().as_deref(), Some("aset-dashboard-cache-v10"));
    }

    #[tokio::test]
    async fn resume_needs_a_failed_install_and_some_cache() {
        let network = Arc::new(dashboard());
        let proxy = proxy(&network);
        assert!(matches!(proxy.resume().await, Err(Error::Lifecycle(_))));

        network.go_offline();
        assert!(proxy.on_init().await.is_err());
        assert_eq!(proxy.resume().await.unwrap(), None);
        assert_eq!(proxy.serving(), proxy.version());
    }

    #[test]
    fn generation_order_is_numeric() {
        assert!(generation_order("cache-v2") < generation_order("cache-v10"));
        assert_eq!(generation_order("cache"), ("cache", 0));
        assert_eq!(generation_order("v1"), ("v", 1));
    }
}
