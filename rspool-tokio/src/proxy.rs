//! The per-upstream supervisor: owns the registry and its shutdown/kill
//! channels, seeds the first registration, and keeps the main loop alive
//! across panics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rspool_core::config::UpstreamConfig;
use thiserror::Error;
use tokio::time::sleep;
use tracing::error;

use crate::config::EndpointOptions;
use crate::registry::{Registry, SetupError};

/// Pause between a supervisor panic and the respawned loop.
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to start proxy for {address}: {source}")]
    Startup {
        address: String,
        source: SetupError,
    },
}

/// One proxy: a registry of upstreams seeded with a single configured
/// address, growing as the cluster is discovered.
pub struct Proxy {
    seed: UpstreamConfig,
    registry: Arc<Registry>,
    quit_sent: AtomicBool,
    kill_sent: AtomicBool,
}

impl Proxy {
    pub fn new(seed: UpstreamConfig, options: EndpointOptions) -> Arc<Proxy> {
        let registry = Registry::new(seed.clone(), options);
        Arc::new(Proxy {
            seed,
            registry,
            quit_sent: AtomicBool::new(false),
            kill_sent: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run until shutdown. A failure to bind the seed endpoint or reach the
    /// seed upstream is fatal and returned; a panic inside the main loop is
    /// logged and the loop is respawned after [`RESTART_DELAY`].
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        loop {
            let proxy = self.clone();
            let main_loop = tokio::spawn(async move { proxy.serve().await });
            match main_loop.await {
                Ok(result) => return result,
                Err(err) if err.is_panic() => {
                    error!(
                        upstream = %self.seed.address,
                        "proxy main loop panicked, restarting"
                    );
                    sleep(RESTART_DELAY).await;
                }
                Err(_) => return Ok(()),
            }
        }
    }

    async fn serve(self: Arc<Self>) -> Result<(), ProxyError> {
        self.registry
            .ensure(&self.seed.address)
            .await
            .map_err(|source| ProxyError::Startup {
                address: self.seed.address.clone(),
                source,
            })?;
        self.registry.quit_signalled().await;
        Ok(())
    }

    /// Stop accepting clients, stop invalidators, and drain in-flight
    /// sessions. Idempotent.
    pub async fn shutdown(&self) {
        if !self.quit_sent.swap(true, Ordering::AcqRel) {
            self.registry.shutdown().await;
        }
    }

    /// `shutdown`, then force any session still in flight to drop.
    /// Idempotent.
    pub async fn kill(&self) {
        self.shutdown().await;
        if !self.kill_sent.swap(true, Ordering::AcqRel) {
            self.registry.kill();
        }
    }
}
