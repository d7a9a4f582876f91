//! Process-wide cache of store clients keyed by router name.
//!
//! A [`Registry`] hands out one shared client per router name. The first
//! call for a name resolves its setting, builds a client through the
//! [`ClientFactory`] and caches it; every later call gets the same
//! `Arc` back until an invalidation.
//!
//! Invalidation swaps the live maps for empty ones and parks the old
//! clients in the [`RetirementQueue`], where they stay usable for the
//! grace period before a sweep closes them.
//!
//! Creation never runs under the registry lock. Concurrent callers for the
//! same name queue on a per-name gate, so the factory runs at most once
//! per name per generation; callers for other names are not blocked. A
//! gate lives only while someone is creating or waiting on it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::{ClusterClient, RedisClient};
use crate::config::RegistryConfig;
use crate::error::{FactoryError, RegistryError, RegistryResult, SourceError};
use crate::factory::{ClientFactory, RedisClientFactory};
use crate::listener;
use crate::retirement::{RetiredClient, RetirementQueue};
use crate::setting::Setting;
use crate::source::{SettingSource, SourceProvider};

/// Snapshot of registry occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub clients: usize,
    pub clusters: usize,
    pub settings: usize,
    pub retired: usize,
    /// Bumped by every invalidation.
    pub generation: u64,
    pub source_open: bool,
    /// Router names with a creation in flight.
    pub creating: usize,
}

#[derive(Default)]
struct State {
    clients: HashMap<String, Arc<RedisClient>>,
    clusters: HashMap<String, Arc<ClusterClient>>,
    settings: HashMap<String, Arc<Setting>>,
    generation: u64,
    closed: bool,
}

type Creating<'a, T> = Pin<Box<dyn Future<Output = Result<Arc<T>, FactoryError>> + Send + 'a>>;

/// The two live maps share one create-or-reuse path.
trait HandleKind: 'static {
    type Handle: Send + Sync + 'static;
    const TAG: &'static str;

    fn check_mode(key: &str, setting: &Setting) -> RegistryResult<()>;
    fn live(state: &mut State) -> &mut HashMap<String, Arc<Self::Handle>>;
    fn create<'a>(factory: &'a dyn ClientFactory, setting: &'a Setting) -> Creating<'a, Self::Handle>;
    fn retired(handle: Arc<Self::Handle>) -> RetiredClient;
}

struct Single;
struct Cluster;

impl HandleKind for Single {
    type Handle = RedisClient;
    const TAG: &'static str = "client";

    fn check_mode(key: &str, setting: &Setting) -> RegistryResult<()> {
        if setting.mode.is_cluster() {
            return Err(RegistryError::UnsupportedMode {
                key: key.to_string(),
                mode: setting.mode,
            });
        }
        Ok(())
    }

    fn live(state: &mut State) -> &mut HashMap<String, Arc<RedisClient>> {
        &mut state.clients
    }

    fn create<'a>(factory: &'a dyn ClientFactory, setting: &'a Setting) -> Creating<'a, RedisClient> {
        factory.create(setting)
    }

    fn retired(handle: Arc<RedisClient>) -> RetiredClient {
        RetiredClient::Single(handle)
    }
}

impl HandleKind for Cluster {
    type Handle = ClusterClient;
    const TAG: &'static str = "cluster";

    fn check_mode(key: &str, setting: &Setting) -> RegistryResult<()> {
        if !setting.mode.is_cluster() {
            return Err(RegistryError::WrongMode {
                key: key.to_string(),
                mode: setting.mode,
            });
        }
        Ok(())
    }

    fn live(state: &mut State) -> &mut HashMap<String, Arc<ClusterClient>> {
        &mut state.clusters
    }

    fn create<'a>(factory: &'a dyn ClientFactory, setting: &'a Setting) -> Creating<'a, ClusterClient> {
        factory.create_cluster(setting)
    }

    fn retired(handle: Arc<ClusterClient>) -> RetiredClient {
        RetiredClient::Cluster(handle)
    }
}

pub(crate) struct Inner {
    config: RegistryConfig,
    provider: Arc<dyn SourceProvider>,
    factory: Arc<dyn ClientFactory>,
    source: OnceCell<Arc<dyn SettingSource>>,
    /// Router and `Type` of a corrupt settings document, once seen.
    invalid: OnceLock<(String, String)>,
    state: Mutex<State>,
    gates: Gates,
    retirement: Arc<RetirementQueue>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

type Gates = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Holds a router's creation gate; forgets the gate on drop once nobody
/// else is using it.
struct GateGuard<'a> {
    gates: &'a Gates,
    key: &'a str,
    gate: Arc<Mutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here.
        let unused = Arc::strong_count(&self.gate) == 2;
        if unused && gates.get(self.key).is_some_and(|g| Arc::ptr_eq(g, &self.gate)) {
            gates.remove(self.key);
        }
    }
}

/// Lazily populated client cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

/// Non-owning registry handle held by background tasks.
pub(crate) struct WeakRegistry(Weak<Inner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<Registry> {
        self.0.upgrade().map(|inner| Registry { inner })
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.inner.config)
            .field("retirement", &self.inner.retirement)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(
        config: RegistryConfig,
        provider: Arc<dyn SourceProvider>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let retirement = Arc::new(RetirementQueue::new(config.grace_period(), config.max_retired));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                provider,
                factory,
                source: OnceCell::new(),
                invalid: OnceLock::new(),
                state: Mutex::new(State::default()),
                gates: std::sync::Mutex::new(HashMap::new()),
                retirement,
                shutdown,
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registry over the configured settings file and the production
    /// client factory.
    pub fn from_config(config: RegistryConfig) -> anyhow::Result<Self> {
        let Some(provider) = config.file_provider() else {
            anyhow::bail!("settings_path is not configured");
        };
        Ok(Self::new(config, Arc::new(provider), Arc::new(RedisClientFactory::new())))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    /// Shared single-node client for `key`, created on first use.
    pub async fn get(&self, key: &str) -> RegistryResult<Arc<RedisClient>> {
        self.get_or_create::<Single>(key).await
    }

    /// Shared cluster client for `key`. Fails with
    /// [`RegistryError::WrongMode`] before any connection attempt if `key`
    /// is not a cluster router.
    pub async fn get_cluster(&self, key: &str) -> RegistryResult<Arc<ClusterClient>> {
        self.get_or_create::<Cluster>(key).await
    }

    /// The cached setting for `key`, resolving it on a miss.
    pub async fn resolve_setting(&self, key: &str) -> RegistryResult<Arc<Setting>> {
        Ok(self.resolve(key).await?.0)
    }

    /// Retire every live client and forget every cached setting. Returns
    /// the number of clients retired.
    pub async fn invalidate_all(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let retired = self.retire_live(&mut state);
        info!(retired, generation = state.generation, "invalidated all clients");
        retired
    }

    /// Create clients for `keys` up front, in order. Stops at the first
    /// failure.
    pub async fn preload<I, K>(&self, keys: I) -> RegistryResult<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        for key in keys {
            let key = key.as_ref();
            let setting = self.resolve_setting(key).await?;
            if setting.mode.is_cluster() {
                self.get_cluster(key).await?;
            } else {
                self.get(key).await?;
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> RegistryStats {
        let state = self.inner.state.lock().await;
        RegistryStats {
            clients: state.clients.len(),
            clusters: state.clusters.len(),
            settings: state.settings.len(),
            retired: self.inner.retirement.len(),
            generation: state.generation,
            source_open: self.inner.source.initialized(),
            creating: self.gates().len(),
        }
    }

    /// Close retired clients whose grace period has passed. The background
    /// sweeper does this on its own schedule.
    pub fn sweep_retired(&self) -> usize {
        self.inner.retirement.sweep()
    }

    /// Stop background tasks, retire every live client and close everything.
    /// Later calls fail with [`RegistryError::ShuttingDown`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "registry background task failed");
            }
        }

        let live = {
            let mut state = self.inner.state.lock().await;
            state.closed = true;
            self.retire_live(&mut state)
        };
        let closed = self.inner.retirement.drain();
        info!(live, closed, "registry shut down");
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn gates(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.inner.gates.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for exclusive creation rights on `key`.
    async fn enter_gate<'a>(&'a self, key: &'a str) -> GateGuard<'a> {
        let gate = self.gates().entry(key.to_string()).or_default().clone();
        let held = gate.clone().lock_owned().await;
        GateGuard {
            gates: &self.inner.gates,
            key,
            gate,
            held: Some(held),
        }
    }

    /// Move both live maps into retirement under one timestamp. Caller
    /// holds the state lock.
    fn retire_live(&self, state: &mut State) -> usize {
        let clients = std::mem::take(&mut state.clients);
        let clusters = std::mem::take(&mut state.clusters);
        state.settings.clear();
        state.generation += 1;

        let retired: Vec<(String, RetiredClient)> = clients
            .into_iter()
            .map(|(key, c)| (key, RetiredClient::Single(c)))
            .chain(clusters.into_iter().map(|(key, c)| (key, RetiredClient::Cluster(c))))
            .collect();
        let count = retired.len();
        if count > 0 {
            self.inner.retirement.retire_all(retired, Instant::now());
        }
        self.gates().retain(|_, gate| Arc::strong_count(gate) > 1);
        count
    }

    fn invalid_config(key: &str, mode: &str) -> RegistryError {
        RegistryError::InvalidConfig(SourceError::UnsupportedMode {
            key: key.to_string(),
            mode: mode.to_string(),
        })
    }

    /// Open the settings source once. An unreachable source is retried on
    /// the next call; a corrupt document is remembered and never reopened.
    async fn source(&self) -> RegistryResult<&Arc<dyn SettingSource>> {
        if let Some((key, mode)) = self.inner.invalid.get() {
            return Err(Self::invalid_config(key, mode));
        }
        self.inner
            .source
            .get_or_try_init(|| async {
                let source = self.inner.provider.open().map_err(|e| match e {
                    SourceError::UnsupportedMode { key, mode } => {
                        error!(router = %key, mode = %mode, "settings document is invalid, refusing to serve clients");
                        let err = Self::invalid_config(&key, &mode);
                        let _ = self.inner.invalid.set((key, mode));
                        err
                    }
                    other => {
                        warn!(error = %other, "settings source unavailable");
                        RegistryError::ConfigUnavailable(other)
                    }
                })?;
                self.start_background(&source);
                Ok::<_, RegistryError>(source)
            })
            .await
    }

    fn start_background(&self, source: &Arc<dyn SettingSource>) {
        let config = &self.inner.config;
        let listener = listener::spawn_invalidation_listener(
            self.downgrade(),
            source.subscribe(),
            self.inner.shutdown.subscribe(),
        );
        let sweeper = listener::spawn_sweeper(
            self.inner.retirement.clone(),
            config.sweep_interval(),
            self.inner.shutdown.subscribe(),
        );
        self.tasks().extend([listener, sweeper]);
        info!(
            grace = ?config.grace_period(),
            sweep_interval = ?config.sweep_interval(),
            "settings source opened, background tasks started"
        );
    }

    /// Resolve `key` and report the generation the setting belongs to.
    ///
    /// The generation is read before the source is consulted, so a setting
    /// resolved across an invalidation is never cached and never commits.
    async fn resolve(&self, key: &str) -> RegistryResult<(Arc<Setting>, u64)> {
        let generation = {
            let state = self.inner.state.lock().await;
            if state.closed {
                return Err(RegistryError::ShuttingDown);
            }
            if let Some(setting) = state.settings.get(key) {
                return Ok((setting.clone(), state.generation));
            }
            state.generation
        };

        let source = self.source().await?;
        let setting = source.resolve(key).map_err(|e| {
            debug!(router = key, error = %e, "setting did not resolve");
            RegistryError::UnknownKey {
                key: key.to_string(),
                source: e,
            }
        })?;

        let mut state = self.inner.state.lock().await;
        if state.generation != generation {
            return Ok((Arc::new(setting), generation));
        }
        let setting = state
            .settings
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(setting))
            .clone();
        Ok((setting, generation))
    }

    async fn get_or_create<K: HandleKind>(&self, key: &str) -> RegistryResult<Arc<K::Handle>> {
        loop {
            let (setting, generation) = self.resolve(key).await?;
            K::check_mode(key, &setting)?;

            if let Some(handle) = self.cached::<K>(key).await? {
                return Ok(handle);
            }

            let _gate = self.enter_gate(key).await;

            // Another caller may have finished while this one waited.
            {
                let mut state = self.inner.state.lock().await;
                if state.closed {
                    return Err(RegistryError::ShuttingDown);
                }
                if let Some(handle) = K::live(&mut state).get(key) {
                    return Ok(handle.clone());
                }
                if state.generation != generation {
                    continue;
                }
            }

            let handle = self.create::<K>(key, &setting).await?;

            let mut state = self.inner.state.lock().await;
            if state.closed {
                drop(state);
                self.inner.retirement.retire(key, K::retired(handle));
                return Err(RegistryError::ShuttingDown);
            }
            if state.generation == generation {
                K::live(&mut state).insert(key.to_string(), handle.clone());
                info!(router = key, kind = K::TAG, addr = setting.addr(), generation, "client created");
                return Ok(handle);
            }
            drop(state);

            debug!(router = key, kind = K::TAG, "invalidated during creation, retiring fresh client");
            self.inner.retirement.retire(key, K::retired(handle));
        }
    }

    async fn cached<K: HandleKind>(&self, key: &str) -> RegistryResult<Option<Arc<K::Handle>>> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(RegistryError::ShuttingDown);
        }
        Ok(K::live(&mut state).get(key).cloned())
    }

    /// Run the factory, bounded by `create_timeout`.
    async fn create<K: HandleKind>(&self, key: &str, setting: &Setting) -> RegistryResult<Arc<K::Handle>> {
        let failed = |reason: FactoryError| {
            warn!(router = key, kind = K::TAG, addr = setting.addr(), error = %reason, "client creation failed");
            RegistryError::ClientCreationFailed {
                key: key.to_string(),
                addr: setting.addr().to_string(),
                reason,
            }
        };

        let creating = K::create(self.inner.factory.as_ref(), setting);
        let created = match self.inner.config.create_timeout() {
            Some(limit) => match tokio::time::timeout(limit, creating).await {
                Ok(created) => created,
                Err(_) => return Err(failed(FactoryError::Timeout(limit))),
            },
            None => creating.await,
        };
        created.map_err(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::factory::client_options;
    use crate::source::TomlSettingSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::time::Duration;

    const DOC: &str = r#"
[default_redis]
RouterName = "default_redis"
Type = "master"
Url = "127.0.0.1:6379"
ReadTimeout = 0

[cache]
Type = "slaver"
Url = "10.0.0.2:6379"

[sessions]
Type = "cluster"
Url = "10.0.0.1:7000,10.0.0.2:7000"

[broken]
Type = "master"
PoolSize = "ten"
"#;

    /// Factory that counts calls and never touches the network.
    #[derive(Default)]
    struct CountingFactory {
        creates: AtomicU64,
        cluster_creates: AtomicU64,
        fail: AtomicBool,
        delay: Duration,
    }

    impl CountingFactory {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn creates(&self) -> u64 {
            self.creates.load(Ordering::SeqCst)
        }

        fn client(&self, endpoint: Endpoint, setting: &Setting) -> Result<Arc<RedisClient>, FactoryError> {
            RedisClient::open(endpoint, client_options(setting))
                .map(Arc::new)
                .map_err(|e| FactoryError::Connect(e.to_string()))
        }
    }

    #[async_trait]
    impl ClientFactory for CountingFactory {
        async fn create(&self, setting: &Setting) -> Result<Arc<RedisClient>, FactoryError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(FactoryError::Connect("connection refused".to_string()));
            }
            let endpoint = setting.endpoint().map_err(FactoryError::Connect)?;
            self.client(endpoint, setting)
        }

        async fn create_cluster(&self, setting: &Setting) -> Result<Arc<ClusterClient>, FactoryError> {
            self.cluster_creates.fetch_add(1, Ordering::SeqCst);
            let nodes = setting
                .seed_endpoints()
                .map_err(FactoryError::Connect)?
                .into_iter()
                .map(|endpoint| self.client(endpoint, setting))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(ClusterClient::new(nodes)))
        }
    }

    fn source() -> Arc<TomlSettingSource> {
        Arc::new(TomlSettingSource::from_toml_str(DOC).unwrap())
    }

    fn provider(source: Arc<TomlSettingSource>) -> Arc<dyn SourceProvider> {
        Arc::new(move || -> Result<Arc<dyn SettingSource>, SourceError> { Ok(source.clone()) })
    }

    fn registry(factory: Arc<CountingFactory>) -> (Registry, Arc<TomlSettingSource>) {
        let source = source();
        let registry = Registry::new(RegistryConfig::default(), provider(source.clone()), factory);
        (registry, source)
    }

    #[tokio::test]
    async fn same_key_returns_same_client() {
        let factory = Arc::new(CountingFactory::default());
        let (registry, _) = registry(factory.clone());

        let a = registry.get("default_redis").await.unwrap();
        let b = registry.get("default_redis").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.creates(), 1);

        let stats = registry.stats().await;
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.settings, 1);
        assert!(stats.source_open);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_clients() {
        let factory = Arc::new(CountingFactory::default());
        let (registry, _) = registry(factory.clone());

        let a = registry.get("default_redis").await.unwrap();
        let b = registry.get("cache").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.endpoint().authority(), "10.0.0.2:6379");
        assert_eq!(factory.creates(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_creates_once() {
        let factory = Arc::new(CountingFactory::with_delay(Duration::from_millis(50)));
        let (registry, _) = registry(factory.clone());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.get("default_redis").await }));
        }
        let mut clients = Vec::new();
        for handle in handles {
            clients.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(factory.creates(), 1);
        assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
    }

    #[tokio::test]
    async fn source_is_not_opened_until_first_use() {
        let opens = Arc::new(AtomicU32::new(0));
        let counter = opens.clone();
        let source = source();
        let provider: Arc<dyn SourceProvider> =
            Arc::new(move || -> Result<Arc<dyn SettingSource>, SourceError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(source.clone())
            });
        let registry = Registry::new(RegistryConfig::default(), provider, Arc::new(CountingFactory::default()));

        assert!(!registry.stats().await.source_open);
        assert_eq!(opens.load(Ordering::SeqCst), 0);

        registry.get("default_redis").await.unwrap();
        registry.get("cache").await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_source_is_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let source = source();
        let provider: Arc<dyn SourceProvider> =
            Arc::new(move || -> Result<Arc<dyn SettingSource>, SourceError> {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(SourceError::Io(std::io::Error::other("config service down")));
                }
                Ok(source.clone())
            });
        let registry = Registry::new(RegistryConfig::default(), provider, Arc::new(CountingFactory::default()));

        let err = registry.get("default_redis").await.unwrap_err();
        assert!(matches!(err, RegistryError::ConfigUnavailable(_)), "{err}");
        assert!(!registry.stats().await.source_open);

        registry.get("default_redis").await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn corrupt_settings_fail_without_reopening() {
        let opens = Arc::new(AtomicU32::new(0));
        let counter = opens.clone();
        let provider: Arc<dyn SourceProvider> =
            Arc::new(move || -> Result<Arc<dyn SettingSource>, SourceError> {
                counter.fetch_add(1, Ordering::SeqCst);
                let source = TomlSettingSource::from_toml_str("[a]\nType = \"sentinel\"\nUrl = \"h:1\"\n")?;
                Ok(Arc::new(source))
            });
        let factory = Arc::new(CountingFactory::default());
        let registry = Registry::new(RegistryConfig::default(), provider, factory.clone());

        for _ in 0..3 {
            let err = registry.get("a").await.unwrap_err();
            assert!(
                matches!(
                    err,
                    RegistryError::InvalidConfig(SourceError::UnsupportedMode { ref key, ref mode })
                        if key == "a" && mode == "sentinel"
                ),
                "{err}"
            );
        }
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(factory.creates(), 0);
        assert!(!registry.stats().await.source_open);
    }

    #[tokio::test]
    async fn unknown_key_is_an_error() {
        let factory = Arc::new(CountingFactory::default());
        let (registry, _) = registry(factory.clone());

        let err = registry.get("nope").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownKey { ref key, .. } if key == "nope"), "{err}");

        let err = registry.get("broken").await.unwrap_err();
        assert!(
            matches!(err, RegistryError::UnknownKey { source: SourceError::Decode { .. }, .. }),
            "{err}"
        );
        assert_eq!(factory.creates(), 0);
        assert_eq!(registry.stats().await.settings, 0);
    }

    #[tokio::test]
    async fn get_refuses_cluster_router() {
        let factory = Arc::new(CountingFactory::default());
        let (registry, _) = registry(factory.clone());

        let err = registry.get("sessions").await.unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedMode { ref key, .. } if key == "sessions"));
        assert_eq!(factory.creates(), 0);
    }

    #[tokio::test]
    async fn get_cluster_on_single_router_makes_no_connection() {
        let factory = Arc::new(CountingFactory::default());
        let (registry, _) = registry(factory.clone());

        let err = registry.get_cluster("default_redis").await.unwrap_err();
        assert!(matches!(err, RegistryError::WrongMode { ref key, mode } if key == "default_redis" && mode == crate::setting::ConnectionMode::Master));
        assert_eq!(factory.creates(), 0);
        assert_eq!(factory.cluster_creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cluster_clients_are_cached_separately() {
        let factory = Arc::new(CountingFactory::default());
        let (registry, _) = registry(factory.clone());

        let a = registry.get_cluster("sessions").await.unwrap();
        let b = registry.get_cluster("sessions").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.nodes().len(), 2);
        assert_eq!(factory.cluster_creates.load(Ordering::SeqCst), 1);

        let stats = registry.stats().await;
        assert_eq!((stats.clients, stats.clusters), (0, 1));
    }

    #[tokio::test]
    async fn production_factory_reports_cluster_unimplemented() {
        let source = source();
        let registry = Registry::new(
            RegistryConfig::default(),
            provider(source),
            Arc::new(RedisClientFactory::new()),
        );
        let err = registry.get_cluster("sessions").await.unwrap_err();
        assert!(
            matches!(
                err,
                RegistryError::ClientCreationFailed { reason: FactoryError::Unimplemented(_), .. }
            ),
            "{err}"
        );
        assert_eq!(registry.stats().await.clusters, 0);
    }

    #[tokio::test]
    async fn creation_failure_is_not_cached() {
        let factory = Arc::new(CountingFactory::default());
        factory.fail.store(true, Ordering::SeqCst);
        let (registry, _) = registry(factory.clone());

        let err = registry.get("default_redis").await.unwrap_err();
        match err {
            RegistryError::ClientCreationFailed { key, addr, reason } => {
                assert_eq!(key, "default_redis");
                assert_eq!(addr, "127.0.0.1:6379");
                assert!(matches!(reason, FactoryError::Connect(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.stats().await.clients, 0);

        factory.fail.store(false, Ordering::SeqCst);
        registry.get("default_redis").await.unwrap();
        assert_eq!(factory.creates(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn creation_gates_are_released() {
        let factory = Arc::new(CountingFactory::with_delay(Duration::from_millis(20)));
        let (registry, _) = registry(factory.clone());

        let mut handles = Vec::new();
        for key in ["default_redis", "cache", "default_redis", "cache"] {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.get(key).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(registry.stats().await.creating, 0);

        factory.fail.store(true, Ordering::SeqCst);
        for round in 0..50 {
            registry.invalidate_all().await;
            assert!(registry.get("default_redis").await.is_err(), "round {round}");
        }
        assert_eq!(registry.stats().await.creating, 0);
    }

    #[tokio::test]
    async fn slow_creation_times_out() {
        let factory = Arc::new(CountingFactory::with_delay(Duration::from_millis(1500)));
        let config = RegistryConfig {
            create_timeout_secs: 1,
            ..RegistryConfig::default()
        };
        let registry = Registry::new(config, provider(source()), factory);

        let err = registry.get("default_redis").await.unwrap_err();
        assert!(
            matches!(err, RegistryError::ClientCreationFailed { reason: FactoryError::Timeout(_), .. }),
            "{err}"
        );
        let stats = registry.stats().await;
        assert_eq!((stats.clients, stats.creating), (0, 0));
    }

    #[tokio::test]
    async fn invalidation_retires_without_closing() {
        let factory = Arc::new(CountingFactory::default());
        let (registry, _) = registry(factory.clone());

        let old = registry.get("default_redis").await.unwrap();
        let old_cluster = registry.get_cluster("sessions").await.unwrap();
        assert_eq!(registry.invalidate_all().await, 2);

        let stats = registry.stats().await;
        assert_eq!((stats.clients, stats.clusters, stats.settings), (0, 0, 0));
        assert_eq!(stats.retired, 2);
        assert_eq!(stats.generation, 1);

        // Inside the grace period nothing is closed, and the old handle still
        // works for whoever holds it.
        assert_eq!(registry.sweep_retired(), 0);
        assert!(!old.is_closed());
        assert!(!old_cluster.is_closed());

        let new = registry.get("default_redis").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(factory.creates(), 2);
    }

    #[tokio::test]
    async fn retired_clients_close_after_grace() {
        let config = RegistryConfig {
            grace_period_secs: 0,
            ..RegistryConfig::default()
        };
        let registry = Registry::new(config, provider(source()), Arc::new(CountingFactory::default()));

        let old = registry.get("default_redis").await.unwrap();
        registry.invalidate_all().await;
        assert_eq!(registry.sweep_retired(), 1);
        assert!(old.is_closed());
        assert_eq!(registry.stats().await.retired, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalidation_during_creation_is_not_lost() {
        let factory = Arc::new(CountingFactory::with_delay(Duration::from_millis(200)));
        let (registry, _) = registry(factory.clone());

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get("default_redis").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.invalidate_all().await;

        let client = pending.await.unwrap().unwrap();
        assert_eq!(factory.creates(), 2, "client built before the invalidation is discarded");

        let stats = registry.stats().await;
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.retired, 1);
        let cached = registry.get("default_redis").await.unwrap();
        assert!(Arc::ptr_eq(&client, &cached));
    }

    #[tokio::test]
    async fn source_change_invalidates() {
        let factory = Arc::new(CountingFactory::default());
        let (registry, source) = registry(factory.clone());

        let old = registry.get("default_redis").await.unwrap();
        source
            .reload_from_str("[default_redis]\nType = \"master\"\nUrl = \"10.9.9.9:6379\"\n")
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.stats().await.generation == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener invalidates the registry");

        let new = registry.get("default_redis").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.endpoint().authority(), "10.9.9.9:6379");
        assert!(!old.is_closed());
    }

    #[tokio::test]
    async fn quiet_source_never_invalidates() {
        let (registry, _) = registry(Arc::new(CountingFactory::default()));
        let a = registry.get("default_redis").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b = registry.get("default_redis").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.stats().await.generation, 0);
    }

    #[tokio::test]
    async fn preload_dispatches_on_mode() {
        let factory = Arc::new(CountingFactory::default());
        let (registry, _) = registry(factory.clone());

        registry.preload(["default_redis", "cache", "sessions"]).await.unwrap();
        let stats = registry.stats().await;
        assert_eq!((stats.clients, stats.clusters), (2, 1));

        let err = registry.preload(["cache", "nope"]).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownKey { .. }));
        assert_eq!(factory.creates(), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let factory = Arc::new(CountingFactory::default());
        let (registry, _) = registry(factory.clone());

        let retired = registry.get("default_redis").await.unwrap();
        registry.invalidate_all().await;
        let live = registry.get("default_redis").await.unwrap();
        let cluster = registry.get_cluster("sessions").await.unwrap();

        registry.shutdown().await;
        assert!(retired.is_closed());
        assert!(live.is_closed());
        assert!(cluster.is_closed());
        assert_eq!(registry.stats().await.retired, 0);

        assert!(matches!(registry.get("default_redis").await, Err(RegistryError::ShuttingDown)));
        assert!(matches!(registry.get_cluster("sessions").await, Err(RegistryError::ShuttingDown)));
    }

    #[tokio::test]
    async fn from_config_requires_settings_path() {
        assert!(Registry::from_config(RegistryConfig::default()).is_err());

        let config = RegistryConfig {
            settings_path: Some("/definitely/not/here.toml".into()),
            ..RegistryConfig::default()
        };
        let registry = Registry::from_config(config).unwrap();
        let err = registry.get("default_redis").await.unwrap_err();
        assert!(matches!(err, RegistryError::ConfigUnavailable(SourceError::Io(_))));
    }
}
