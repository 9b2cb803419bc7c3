//! The invalidator: one long-lived upstream connection per cached upstream,
//! existing solely to receive key-invalidation pushes and apply them to the
//! cache. Pooled connections subscribe their tracking redirects against the
//! identifier published here; whenever this connection is lost, nothing in
//! the cache can be trusted, so the cache is cleared wholesale and a fresh
//! identifier is published after reconnecting.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rspool_core::cache::Cache;
use rspool_core::config::UpstreamConfig;
use rspool_core::conn::{Connection, Error, NO_TRACKING_TARGET};
use rspool_core::protocol::{Message, INVALIDATION_CHANNEL};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at};
use tracing::{debug, info, warn};

use crate::TokioConnection;

/// Liveness probe interval.
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Two consecutive missed heartbeats mark the connection dead.
const DEAD_AFTER: Duration = Duration::from_secs(10);

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long shutdown waits for the task to observe the signal before it is
/// aborted outright (it may be mid-dial against a dead upstream).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Owner's handle to a running invalidator task.
pub struct InvalidatorHandle {
    target: Arc<AtomicI64>,
    quit: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl InvalidatorHandle {
    /// The shared cell holding the invalidator's current server-assigned
    /// connection identifier ([`NO_TRACKING_TARGET`] while disconnected).
    pub fn target(&self) -> Arc<AtomicI64> {
        self.target.clone()
    }

    pub fn current_id(&self) -> i64 {
        self.target.load(Ordering::Acquire)
    }

    pub async fn shutdown(self) {
        let _ = self.quit.send(true);
        let mut task = self.task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

/// Start the invalidator for one upstream.
pub fn spawn(config: Arc<UpstreamConfig>, cache: Arc<Cache>) -> InvalidatorHandle {
    let target = Arc::new(AtomicI64::new(NO_TRACKING_TARGET));
    let (quit_tx, quit_rx) = watch::channel(false);
    let worker = Invalidator {
        config,
        cache,
        target: target.clone(),
    };
    let task = tokio::spawn(worker.run(quit_rx));
    InvalidatorHandle {
        target,
        quit: quit_tx,
        task,
    }
}

struct Invalidator {
    config: Arc<UpstreamConfig>,
    cache: Arc<Cache>,
    target: Arc<AtomicI64>,
}

impl Invalidator {
    async fn run(self, mut quit: watch::Receiver<bool>) {
        loop {
            let outcome = self.connect_and_stream(&mut quit).await;
            self.target.store(NO_TRACKING_TARGET, Ordering::Release);
            // Without a live invalidation channel no entry can be trusted.
            self.cache.clear();
            match outcome {
                Ok(()) => return,
                Err(err) => {
                    warn!(
                        upstream = %self.config.address,
                        error = %err,
                        "invalidator connection lost"
                    );
                }
            }
            tokio::select! {
                _ = quit.changed() => {
                    if *quit.borrow() {
                        return;
                    }
                }
                _ = sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn connect_and_stream(&self, quit: &mut watch::Receiver<bool>) -> Result<(), Error> {
        let mut conn = TokioConnection::connect(&self.config.address, &self.config).await?;

        let id = match conn
            .round_trip(&Message::command(&[b"CLIENT", b"ID"]))
            .await?
        {
            Message::Integer(id) => id,
            other => {
                return Err(Error::Handshake(format!(
                    "unexpected CLIENT ID reply: {:?}",
                    other
                )))
            }
        };
        let reply = conn
            .round_trip(&Message::command(&[b"SUBSCRIBE", INVALIDATION_CHANNEL]))
            .await?;
        if let Message::Error(text) = reply {
            return Err(Error::Handshake(text));
        }
        // New pooled connections redirect their tracking here from now on;
        // existing ones repair themselves on their next use.
        self.target.store(id, Ordering::Release);
        info!(upstream = %self.config.address, id, "invalidator subscribed");

        let mut last_pong = Instant::now();
        let mut next_ping = Instant::now() + PING_INTERVAL;
        loop {
            let now = Instant::now();
            if now >= next_ping {
                conn.write_message(&Message::command(&[b"PING"])).await?;
                next_ping = now + PING_INTERVAL;
            }
            if last_pong.elapsed() >= DEAD_AFTER {
                return Err(Error::Timeout("heartbeat"));
            }
            tokio::select! {
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        return Ok(());
                    }
                }
                result = timeout_at(next_ping.into(), conn.read_message()) => match result {
                    // Deadline reached: loop around and send the next ping.
                    Err(_) => {}
                    Ok(Ok(frame)) => self.handle(frame, &mut last_pong),
                    // An idle read window; liveness is judged by the
                    // heartbeat, not by read timeouts.
                    Ok(Err(Error::Timeout(_))) => {}
                    Ok(Err(err)) => return Err(err),
                }
            }
        }
    }

    fn handle(&self, frame: Message, last_pong: &mut Instant) {
        let items = match frame.elements() {
            Some(items) => items,
            None => {
                if let Message::Simple(text) = &frame {
                    if text.eq_ignore_ascii_case("PONG") {
                        *last_pong = Instant::now();
                    }
                }
                return;
            }
        };
        let kind = match items.first().and_then(Message::as_bulk) {
            Some(kind) => kind.to_ascii_lowercase(),
            None => return,
        };
        match &kind[..] {
            // On a subscribed connection PING answers arrive as pubsub-style
            // frames in RESP2.
            b"pong" => *last_pong = Instant::now(),
            b"message" => {
                let on_channel = items
                    .get(1)
                    .and_then(Message::as_bulk)
                    .map(|channel| &channel[..] == INVALIDATION_CHANNEL)
                    .unwrap_or(false);
                if on_channel {
                    if let Some(payload) = items.get(2) {
                        self.invalidate(payload);
                    }
                }
            }
            // RESP3 servers push invalidations directly.
            b"invalidate" => {
                if let Some(payload) = items.get(1) {
                    self.invalidate(payload);
                }
            }
            b"subscribe" | b"unsubscribe" => {}
            other => {
                debug!(kind = %String::from_utf8_lossy(other), "ignoring push frame");
            }
        }
    }

    fn invalidate(&self, payload: &Message) {
        match payload {
            Message::Bulk(key) => {
                debug!(key = %String::from_utf8_lossy(key), "invalidating");
                self.cache.delete(key);
            }
            Message::Array(keys) | Message::Push(keys) => {
                for key in keys {
                    if let Some(key) = key.as_bulk() {
                        debug!(key = %String::from_utf8_lossy(key), "invalidating");
                        self.cache.delete(key);
                    }
                }
            }
            // A null payload signals a whole-database flush.
            Message::Null => self.cache.clear(),
            _ => {}
        }
    }
}
