//! Local endpoints: one listening socket per upstream, accepting client
//! connections and spawning a session task for each.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::{EndpointOptions, Network};
use crate::session::{self, SessionContext};

/// Anything a client session can be served over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type ClientStream = Box<dyn Stream>;

/// The local endpoint name for an upstream: `<prefix><host>-<port>[-<db>]<suffix>`.
pub fn endpoint_name(options: &EndpointOptions, address: &str, database: i64) -> String {
    let host = address.replace(':', "-");
    if database >= 0 {
        format!("{}{}-{}{}", options.prefix, host, database, options.suffix)
    } else {
        format!("{}{}{}", options.prefix, host, options.suffix)
    }
}

/// A bound local endpoint.
pub enum Endpoint {
    Unix(UnixListener, String),
    Tcp(TcpListener),
}

impl Endpoint {
    /// Bind the endpoint for `name` according to the configured network
    /// family. Returns the endpoint and the address clients actually dial:
    /// the socket path, or the bound loopback address for TCP.
    pub async fn bind(options: &EndpointOptions, name: &str) -> io::Result<(Endpoint, String)> {
        match options.network {
            Network::Unix => {
                if options.unlink {
                    let _ = std::fs::remove_file(name);
                }
                let listener = UnixListener::bind(name)?;
                Ok((Endpoint::Unix(listener, name.to_string()), name.to_string()))
            }
            Network::Tcp => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let bound = listener.local_addr()?.to_string();
                Ok((Endpoint::Tcp(listener), bound))
            }
        }
    }

    async fn accept(&self) -> io::Result<ClientStream> {
        match self {
            Endpoint::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Endpoint::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Spawn [`serve`] as its own task. Spawning from within this module (rather
/// than at the call site) keeps rustc from having to resolve `serve`'s
/// opaque return type's auto traits from within its own defining scope.
pub fn spawn_serve(
    endpoint: Endpoint,
    ctx: SessionContext,
    quit: broadcast::Receiver<()>,
    kill: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(serve(endpoint, ctx, quit, kill))
}

/// Accept clients until the quit signal fires. Each accepted connection is
/// served by its own task; sessions observe the kill signal so `kill` can
/// drop in-flight connections after a drain timeout.
async fn serve(
    endpoint: Endpoint,
    ctx: SessionContext,
    mut quit: broadcast::Receiver<()>,
    kill: broadcast::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = quit.recv() => break,
            accepted = endpoint.accept() => match accepted {
                Ok(stream) => {
                    debug!(upstream = %ctx.config.address, "client connected");
                    tokio::spawn(session::run(stream, ctx.clone(), kill.subscribe()));
                }
                Err(err) => {
                    warn!(upstream = %ctx.config.address, error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    if let Endpoint::Unix(_, path) = &endpoint {
        let _ = std::fs::remove_file(path);
    }
}
