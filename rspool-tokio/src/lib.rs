//! The tokio proxy service for rspool: the concrete upstream connection,
//! the per-upstream registry of pools and local endpoints, the invalidator
//! task keeping the cache coherent, and the per-client interceptor.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use rspool_core::config::UpstreamConfig;
use rspool_core::conn::{Connection, Error as CoreError, CONNECT_TIMEOUT, NO_TRACKING_TARGET};
use rspool_core::protocol::Message;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub mod config;
pub mod invalidator;
pub mod listener;
pub mod proxy;
pub mod registry;
pub mod session;

/// A pool of connections to one upstream using tokio for async I/O.
pub type Pool = rspool_core::conn::Pool<TokioConnection>;

/// A TokioConnection uses the tokio runtime to form TCP connections to the
/// upstream, applying the configured per-I/O deadlines.
#[derive(Debug)]
pub struct TokioConnection {
    stream: TcpStream,
    buffer: BytesMut,
    read_timeout: Duration,
    write_timeout: Duration,
    tracking_id: i64,
}

#[async_trait]
impl Connection for TokioConnection {
    async fn connect(address: &str, config: &UpstreamConfig) -> Result<Self, CoreError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| CoreError::Timeout("connect"))??;
        stream.set_nodelay(true)?;
        Ok(TokioConnection {
            stream,
            buffer: BytesMut::with_capacity(4 * 1024),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            tracking_id: NO_TRACKING_TARGET,
        })
    }

    async fn read_message(&mut self) -> Result<Message, CoreError> {
        loop {
            if let Some((message, used)) = Message::parse(&self.buffer)? {
                self.buffer.advance(used);
                return Ok(message);
            }
            let read = timeout(self.read_timeout, self.stream.read_buf(&mut self.buffer))
                .await
                .map_err(|_| CoreError::Timeout("read"))??;
            if read == 0 {
                return Err(CoreError::Closed);
            }
        }
    }

    async fn write_messages(&mut self, batch: &[Message]) -> Result<(), CoreError> {
        let mut buf = BytesMut::new();
        for message in batch {
            message.encode(&mut buf);
        }
        timeout(self.write_timeout, self.stream.write_all(&buf))
            .await
            .map_err(|_| CoreError::Timeout("write"))??;
        Ok(())
    }

    fn tracking_id(&self) -> i64 {
        self.tracking_id
    }

    fn set_tracking_id(&mut self, id: i64) {
        self.tracking_id = id;
    }
}
