//! This module implements the upstream-connection plumbing shared by every
//! runtime: the `Connection` trait a runtime implements over its own
//! sockets, the handshake applied to each new pooled connection, and the
//! deadpool manager that ties the two together.

use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{Manager, RecycleError, RecycleResult};
pub use deadpool::managed::{Object, PoolError};

use crate::config::UpstreamConfig;
use crate::protocol::{Message, ProtocolError};

/// How long a dial may take before the connection attempt is abandoned.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Published tracking target when no invalidator connection is live.
pub const NO_TRACKING_TARGET: i64 = -1;

/// An error on an upstream connection.
#[derive(Debug)]
pub enum Error {
    /// An error communicating over the wire.
    Io(std::io::Error),
    /// A malformed RESP frame.
    Protocol(ProtocolError),
    /// A configured deadline expired; the label names the operation.
    Timeout(&'static str),
    /// The upstream rejected a handshake command.
    Handshake(String),
    /// The peer closed the connection.
    Closed,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Error::Io(err) => write!(f, "IoError: {}", err),
            Error::Protocol(err) => write!(f, "ProtocolError: {}", err),
            Error::Timeout(op) => write!(f, "Timeout: {}", op),
            Error::Handshake(reply) => write!(f, "HandshakeError: {}", reply),
            Error::Closed => write!(f, "connection closed by peer"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

/// A connection is an async RESP channel to one upstream, which requires a
/// concrete implementation using an underlying runtime (e.g. tokio).
#[async_trait]
pub trait Connection: Sized + Send + Sync + 'static {
    /// Dial the upstream. Implementations apply [`CONNECT_TIMEOUT`] and the
    /// per-I/O deadlines from `config` to everything that follows.
    async fn connect(address: &str, config: &UpstreamConfig) -> Result<Self, Error>;

    /// Read the next complete frame.
    async fn read_message(&mut self) -> Result<Message, Error>;

    /// Write a batch of frames as one buffered write.
    async fn write_messages(&mut self, batch: &[Message]) -> Result<(), Error>;

    /// The tracking-redirect target this connection last subscribed with,
    /// or [`NO_TRACKING_TARGET`].
    fn tracking_id(&self) -> i64;

    fn set_tracking_id(&mut self, id: i64);

    /// Write a single frame. It is most likely unnecessary to implement
    /// this yourself.
    async fn write_message(&mut self, message: &Message) -> Result<(), Error> {
        self.write_messages(std::slice::from_ref(message)).await
    }

    /// Write one frame and read one reply.
    async fn round_trip(&mut self, message: &Message) -> Result<Message, Error> {
        self.write_message(message).await?;
        self.read_message().await
    }
}

/// The broadcast-tracking subscription command, redirecting invalidation
/// pushes for the given prefixes to the connection identified by `target`.
pub fn tracking_command(prefixes: &[String], target: i64) -> Message {
    let target = target.to_string();
    let mut parts: Vec<&[u8]> = vec![
        b"CLIENT",
        b"TRACKING",
        b"on",
        b"REDIRECT",
        target.as_bytes(),
        b"BCAST",
    ];
    for prefix in prefixes {
        parts.push(b"PREFIX");
        parts.push(prefix.as_bytes());
    }
    Message::command(&parts)
}

/// Subscribe `conn` to broadcast tracking against the invalidator identified
/// by `target`, recording the target on the connection on success.
pub async fn subscribe_tracking<C: Connection>(
    conn: &mut C,
    config: &UpstreamConfig,
    target: i64,
) -> Result<(), Error> {
    let reply = conn
        .round_trip(&tracking_command(&config.cache_prefixes, target))
        .await?;
    if let Message::Error(text) = reply {
        return Err(Error::Handshake(text));
    }
    conn.set_tracking_id(target);
    Ok(())
}

/// The handshake applied to every new pooled connection, in order: select
/// the configured database, enter read-only mode, subscribe to invalidation
/// tracking. Each step short-circuits on error and the connection is
/// discarded by the caller.
pub async fn initialize<C: Connection>(
    conn: &mut C,
    config: &UpstreamConfig,
    tracking_target: i64,
) -> Result<(), Error> {
    if config.database >= 0 {
        let database = config.database.to_string();
        let reply = conn
            .round_trip(&Message::command(&[b"SELECT", database.as_bytes()]))
            .await?;
        if let Message::Error(text) = reply {
            return Err(Error::Handshake(text));
        }
    }
    if config.readonly {
        let reply = conn.round_trip(&Message::command(&[b"READONLY"])).await?;
        if let Message::Error(text) = reply {
            return Err(Error::Handshake(text));
        }
    }
    if config.caching_enabled() && tracking_target != NO_TRACKING_TARGET {
        subscribe_tracking(conn, config, tracking_target).await?;
    }
    Ok(())
}

/// Creates and recycles pooled connections for one upstream. The tracking
/// target is shared with the upstream's invalidator, which republishes its
/// connection identifier on every reconnect.
pub struct ConnectionManager<C: Connection> {
    config: UpstreamConfig,
    tracking_target: Arc<AtomicI64>,
    _conn: PhantomData<fn() -> C>,
}

impl<C: Connection> ConnectionManager<C> {
    pub fn new(config: UpstreamConfig, tracking_target: Arc<AtomicI64>) -> Self {
        ConnectionManager {
            config,
            tracking_target,
            _conn: PhantomData,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }
}

#[async_trait]
impl<C: Connection> Manager for ConnectionManager<C> {
    type Type = C;
    type Error = Error;

    async fn create(&self) -> Result<C, Error> {
        let mut conn = C::connect(&self.config.address, &self.config).await?;
        let target = self.tracking_target.load(Ordering::Acquire);
        initialize(&mut conn, &self.config, target).await?;
        Ok(conn)
    }

    async fn recycle(&self, conn: &mut C) -> RecycleResult<Error> {
        let reply = conn
            .round_trip(&Message::command(&[b"PING"]))
            .await
            .map_err(RecycleError::Backend)?;
        match reply {
            Message::Simple(ref pong) if pong.eq_ignore_ascii_case("PONG") => Ok(()),
            other => Err(RecycleError::Message(format!(
                "unexpected ping reply: {:?}",
                other
            ))),
        }
    }
}

/// A connection pool for one upstream. Using a pool is recommended for best
/// performance since it eliminates the overhead of constantly recreating
/// connections, while also bounding the total number open at a time.
pub type Pool<C> = deadpool::managed::Pool<ConnectionManager<C>>;
