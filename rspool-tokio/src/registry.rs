//! The pool registry: one entry per upstream address, created on demand as
//! addresses are observed: the seed configuration, cluster-topology
//! replies, and `MOVED`/`ASK` redirections. Each entry owns a connection
//! pool, a local endpoint, a per-upstream cache and (when caching is
//! configured) an invalidator. Entries live until shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use rspool_core::cache::Cache;
use rspool_core::config::UpstreamConfig;
use rspool_core::conn::{ConnectionManager, NO_TRACKING_TARGET};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EndpointOptions;
use crate::invalidator::{self, InvalidatorHandle};
use crate::listener::{self, endpoint_name, Endpoint};
use crate::session::SessionContext;
use crate::{Pool, TokioConnection};

/// How long in-flight client sessions get to drain on shutdown before the
/// caller is expected to kill them.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to create connection pool: {0}")]
    Pool(String),
    #[error("failed to warm connection pool: {0}")]
    Warm(String),
    #[error("failed to bind local endpoint {path}: {source}")]
    Bind {
        path: String,
        source: std::io::Error,
    },
    #[error("proxy is shutting down")]
    ShuttingDown,
}

/// One registered upstream.
pub struct Upstream {
    pub config: Arc<UpstreamConfig>,
    pub pool: Pool,
    pub cache: Option<Arc<Cache>>,
    /// The address clients dial: the socket path, or the bound TCP address.
    pub endpoint: String,
    invalidator: Option<InvalidatorHandle>,
    listener: Option<JoinHandle<()>>,
}

/// Address-keyed registry of upstreams for one proxy.
pub struct Registry {
    seed: UpstreamConfig,
    options: EndpointOptions,
    inner: Mutex<HashMap<String, Upstream>>,
    quit: broadcast::Sender<()>,
    kill: broadcast::Sender<()>,
    drain_tx: Mutex<Option<mpsc::Sender<()>>>,
    drain_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutting_down: AtomicBool,
    /// Self-handle for the session contexts spawned per listener.
    weak: Weak<Registry>,
}

impl Registry {
    pub fn new(seed: UpstreamConfig, options: EndpointOptions) -> Arc<Registry> {
        let (quit, _) = broadcast::channel(1);
        let (kill, _) = broadcast::channel(1);
        let (drain_tx, drain_rx) = mpsc::channel(1);
        Arc::new_cyclic(|weak| Registry {
            seed,
            options,
            inner: Mutex::new(HashMap::new()),
            quit,
            kill,
            drain_tx: Mutex::new(Some(drain_tx)),
            drain_rx: Mutex::new(Some(drain_rx)),
            shutting_down: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    pub fn seed_address(&self) -> &str {
        &self.seed.address
    }

    /// Register a discovered address. Registration is idempotent and its
    /// failures are logged, never propagated: discovery is opportunistic.
    pub async fn register(&self, address: &str) {
        if let Err(err) = self.ensure(address).await {
            warn!(address, error = %err, "failed to register upstream");
        }
    }

    /// Register an address, propagating setup failures. Used for the seed
    /// upstream, where failure is fatal.
    pub async fn ensure(&self, address: &str) -> Result<(), SetupError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut entries = self.inner.lock().await;
        if entries.contains_key(address) {
            return Ok(());
        }
        let upstream = self.create(address).await?;
        info!(
            address,
            endpoint = %upstream.endpoint,
            label = %upstream.config.label,
            "registered upstream"
        );
        entries.insert(address.to_string(), upstream);
        Ok(())
    }

    async fn create(&self, address: &str) -> Result<Upstream, SetupError> {
        let config = Arc::new(self.seed.for_peer(address));

        let (cache, invalidator, tracking_target) = if config.caching_enabled() {
            let cache = Arc::new(Cache::new(config.cache_size_bytes, config.cache_ttl));
            let handle = invalidator::spawn(config.clone(), cache.clone());
            let target = handle.target();
            (Some(cache), Some(handle), target)
        } else {
            (None, None, Arc::new(AtomicI64::new(NO_TRACKING_TARGET)))
        };

        let manager =
            ConnectionManager::<TokioConnection>::new((*config).clone(), tracking_target.clone());
        let pool = Pool::builder(manager)
            .max_size(config.max_pool_size)
            .build()
            .map_err(|err| SetupError::Pool(format!("{:?}", err)))?;

        // Dial up to the configured lower bound so a dead upstream is
        // caught at registration time rather than on first client traffic.
        let mut warm = Vec::with_capacity(config.min_pool_size);
        for _ in 0..config.min_pool_size {
            let conn = pool
                .get()
                .await
                .map_err(|err| SetupError::Warm(format!("{:?}", err)))?;
            warm.push(conn);
        }
        drop(warm);

        let name = endpoint_name(&self.options, address, config.database);
        let (endpoint, bound) =
            Endpoint::bind(&self.options, &name)
                .await
                .map_err(|source| SetupError::Bind {
                    path: name.clone(),
                    source,
                })?;

        let drain = match self.drain_tx.lock().await.clone() {
            Some(drain) => drain,
            // Shutdown raced this registration.
            None => return Err(SetupError::ShuttingDown),
        };
        let registry = match self.weak.upgrade() {
            Some(registry) => registry,
            None => return Err(SetupError::ShuttingDown),
        };
        let ctx = SessionContext {
            config: config.clone(),
            pool: pool.clone(),
            cache: cache.clone(),
            tracking_target,
            registry,
            drain,
        };
        let listener = listener::spawn_serve(
            endpoint,
            ctx,
            self.quit.subscribe(),
            self.kill.clone(),
        );

        Ok(Upstream {
            config,
            pool,
            cache,
            endpoint: bound,
            invalidator,
            listener: Some(listener),
        })
    }

    /// All registered upstream addresses.
    pub async fn addresses(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    /// The client-facing endpoint for an upstream address, if registered.
    pub async fn endpoint_of(&self, address: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .get(address)
            .map(|upstream| upstream.endpoint.clone())
    }

    /// The cache for an upstream address, if registered with caching.
    pub async fn cache_of(&self, address: &str) -> Option<Arc<Cache>> {
        self.inner
            .lock()
            .await
            .get(address)
            .and_then(|upstream| upstream.cache.clone())
    }

    /// Wait until `shutdown` has been called.
    pub async fn quit_signalled(&self) {
        let mut quit = self.quit.subscribe();
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let _ = quit.recv().await;
    }

    /// Stop accepting clients, stop every invalidator, close every pool,
    /// and wait up to [`DRAIN_TIMEOUT`] for in-flight sessions to finish.
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.quit.send(());

        let mut listeners = Vec::new();
        {
            let mut entries = self.inner.lock().await;
            for upstream in entries.values_mut() {
                if let Some(handle) = upstream.invalidator.take() {
                    handle.shutdown().await;
                }
                if let Some(listener) = upstream.listener.take() {
                    listeners.push(listener);
                }
                upstream.pool.close();
            }
        }
        join_all(listeners).await;

        // Sessions hold clones of the drain sender; dropping ours makes the
        // receiver close once the last session ends.
        let rx = {
            self.drain_tx.lock().await.take();
            self.drain_rx.lock().await.take()
        };
        if let Some(mut rx) = rx {
            if tokio::time::timeout(DRAIN_TIMEOUT, rx.recv()).await.is_err() {
                warn!("sessions still in flight after drain timeout");
            }
        }
    }

    /// Force in-flight sessions to drop at their next suspension point.
    pub fn kill(&self) {
        let _ = self.kill.send(());
    }
}
