//! Per-client sessions: the command-interception path. Each accepted client
//! connection is read as a stream of RESP commands, optionally bracketed
//! into pipelined batches by the sentinel keys. Cacheable reads are served
//! from the cache when every key hits; everything else rides a pooled
//! upstream connection, with topology replies and redirection errors
//! observed on the way back.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use rspool_core::cache::Cache;
use rspool_core::command::{self, CommandKind};
use rspool_core::config::UpstreamConfig;
use rspool_core::conn::{subscribe_tracking, Connection, Error, Object, NO_TRACKING_TARGET};
use rspool_core::protocol::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::listener::ClientStream;
use crate::registry::Registry;
use crate::Pool;

/// Everything a session needs, cloned per accepted client.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<UpstreamConfig>,
    pub pool: Pool,
    pub cache: Option<Arc<Cache>>,
    /// The invalidator's current connection identifier.
    pub tracking_target: Arc<AtomicI64>,
    pub registry: Arc<Registry>,
    /// Held for the session's lifetime; the registry's shutdown path waits
    /// for every clone to drop before declaring the proxy drained.
    pub drain: mpsc::Sender<()>,
}

/// Serve one client connection until it disconnects, errors, or the kill
/// signal fires.
pub async fn run(stream: ClientStream, ctx: SessionContext, mut kill: broadcast::Receiver<()>) {
    let mut client = ClientConn::new(stream);
    loop {
        let message = tokio::select! {
            _ = kill.recv() => return,
            read = client.read_message() => match read {
                Ok(Some(message)) => message,
                Ok(None) => return,
                Err(err) => {
                    debug!(error = %err, "client protocol error");
                    let reply = Message::Error(format!("ERR rspool: protocol error: {}", err));
                    let _ = client.write_all(&[reply]).await;
                    return;
                }
            }
        };

        let replies = if command::classify(&message) == CommandKind::PipelineBegin {
            match read_batch(&mut client, &mut kill, message).await {
                Some(batch) => process_batch(&ctx, batch, true).await,
                None => return,
            }
        } else {
            process_batch(&ctx, vec![message], false).await
        };

        if client.write_all(&replies).await.is_err() {
            return;
        }
    }
}

/// Collect commands up to and including the end sentinel. The begin
/// sentinel has already been read by the caller.
async fn read_batch(
    client: &mut ClientConn,
    kill: &mut broadcast::Receiver<()>,
    begin: Message,
) -> Option<Vec<Message>> {
    let mut batch = vec![begin];
    loop {
        let message = tokio::select! {
            _ = kill.recv() => return None,
            read = client.read_message() => match read {
                Ok(Some(message)) => message,
                // A batch cut short by disconnect or garbage is dropped
                // whole; none of it has been forwarded yet.
                Ok(None) => return None,
                Err(err) => {
                    debug!(error = %err, "client protocol error inside batch");
                    return None;
                }
            }
        };
        let done = command::classify(&message) == CommandKind::PipelineEnd;
        batch.push(message);
        if done {
            return Some(batch);
        }
    }
}

/// One command to forward upstream, remembering where its reply goes and
/// which cache keys the reply fills.
struct Forward {
    index: usize,
    message: Message,
    keys: Vec<Bytes>,
    kind: CommandKind,
}

/// Process one batch (or a single bare command): classify, serve from the
/// cache where possible, forward the rest over a single pool checkout, and
/// return replies in request order.
async fn process_batch(ctx: &SessionContext, commands: Vec<Message>, in_batch: bool) -> Vec<Message> {
    let mut replies: Vec<Option<Message>> = (0..commands.len()).map(|_| None).collect();
    let mut forwards: Vec<Forward> = Vec::new();

    for (index, message) in commands.into_iter().enumerate() {
        let mut kind = command::classify(&message);
        match kind {
            CommandKind::PipelineBegin | CommandKind::PipelineEnd => {
                replies[index] = Some(Message::Null);
                continue;
            }
            CommandKind::Disallowed => {
                replies[index] = Some(Message::Error(format!(
                    "ERR rspool: command {} is not allowed through the proxy",
                    command::name(&message)
                )));
                continue;
            }
            CommandKind::Transaction if !in_batch => {
                replies[index] = Some(Message::Error(format!(
                    "ERR rspool: {} is only allowed inside a pipelined batch",
                    command::name(&message)
                )));
                continue;
            }
            CommandKind::CacheableRead => {
                let keys = command::cacheable_keys(&message);
                if keys.is_empty() {
                    // Malformed read; let the upstream produce the error.
                    kind = CommandKind::Other;
                } else {
                    if let Some(cache) = &ctx.cache {
                        if let Some(values) = cache.get_all(&keys) {
                            replies[index] = Some(assemble_cached(&message, values));
                            continue;
                        }
                    }
                    forwards.push(Forward {
                        index,
                        message,
                        keys,
                        kind,
                    });
                    continue;
                }
            }
            _ => {}
        }
        forwards.push(Forward {
            index,
            message,
            keys: Vec::new(),
            kind,
        });
    }

    if !forwards.is_empty() {
        forward(ctx, &mut replies, forwards).await;
    }

    replies
        .into_iter()
        .map(|reply| reply.unwrap_or_else(|| Message::Error("ERR rspool: internal error".into())))
        .collect()
}

/// A full cache hit: a bare `GET` answers with its single value, `MGET`
/// with the positional array.
fn assemble_cached(message: &Message, mut values: Vec<Message>) -> Message {
    let is_mget = message
        .elements()
        .and_then(|items| items.first())
        .and_then(Message::as_bulk)
        .map(|name| name.eq_ignore_ascii_case(b"MGET"))
        .unwrap_or(false);
    if is_mget {
        Message::Array(values)
    } else {
        values.remove(0)
    }
}

/// Forward the residual batch over one pooled connection, filling reply
/// slots in order and observing topology and redirection on the way back.
async fn forward(ctx: &SessionContext, replies: &mut Vec<Option<Message>>, forwards: Vec<Forward>) {
    let mut conn = match ctx.pool.get().await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(upstream = %ctx.config.address, error = ?err, "pool checkout failed");
            fill_errors(replies, &forwards, 0, "upstream unavailable");
            return;
        }
    };

    // Repair path for invalidator reconnects: if the published identifier
    // has moved since this connection subscribed, re-subscribe before
    // forwarding anything.
    let target = ctx.tracking_target.load(Ordering::Acquire);
    if ctx.config.caching_enabled()
        && target != NO_TRACKING_TARGET
        && conn.tracking_id() != target
    {
        if let Err(err) = subscribe_tracking(&mut *conn, &ctx.config, target).await {
            warn!(upstream = %ctx.config.address, error = %err, "tracking re-subscription failed");
            fill_errors(replies, &forwards, 0, "upstream unavailable");
            let _ = Object::take(conn);
            return;
        }
    }

    let batch: Vec<Message> = forwards.iter().map(|f| f.message.clone()).collect();
    if let Err(err) = conn.write_messages(&batch).await {
        warn!(upstream = %ctx.config.address, error = %err, "upstream write failed");
        fill_errors(replies, &forwards, 0, "upstream write failed");
        let _ = Object::take(conn);
        return;
    }

    for (position, fwd) in forwards.iter().enumerate() {
        let reply = match conn.read_message().await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(upstream = %ctx.config.address, error = %err, "upstream read failed");
                fill_errors(replies, &forwards, position, "upstream read failed");
                let _ = Object::take(conn);
                return;
            }
        };
        observe(ctx, fwd, &reply).await;
        replies[fwd.index] = Some(reply);
    }
}

/// Answer every not-yet-answered forward from `position` on with an error.
fn fill_errors(replies: &mut Vec<Option<Message>>, forwards: &[Forward], position: usize, what: &str) {
    for fwd in &forwards[position..] {
        replies[fwd.index] = Some(Message::Error(format!("ERR rspool: {}", what)));
    }
}

/// Side effects of a reply on shared state: register redirected and
/// discovered addresses, fill the cache for cacheable reads. The reply
/// itself always goes back to the client unchanged.
async fn observe(ctx: &SessionContext, fwd: &Forward, reply: &Message) {
    if let Message::Error(text) = reply {
        if let Some(address) = command::redirect_address(text) {
            ctx.registry.register(&address).await;
        }
        return;
    }
    match fwd.kind {
        CommandKind::TopologySlots => {
            for address in command::slot_addresses(reply) {
                ctx.registry.register(&address).await;
            }
        }
        CommandKind::TopologyNodes => {
            let text = reply
                .as_bulk()
                .and_then(|bulk| std::str::from_utf8(bulk).ok());
            if let Some(text) = text {
                for address in command::node_addresses(text) {
                    ctx.registry.register(&address).await;
                }
            }
        }
        CommandKind::CacheableRead => {
            if let Some(cache) = &ctx.cache {
                cache.set(&fwd.keys, reply);
            }
        }
        _ => {}
    }
}

/// A buffered RESP reader/writer over the client-facing stream. Unlike
/// upstream connections, client reads have no deadline: an idle client is
/// allowed to sit.
struct ClientConn {
    stream: ClientStream,
    buffer: BytesMut,
}

impl ClientConn {
    fn new(stream: ClientStream) -> ClientConn {
        ClientConn {
            stream,
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Read the next command; `Ok(None)` is a clean disconnect.
    async fn read_message(&mut self) -> Result<Option<Message>, Error> {
        loop {
            if let Some((message, used)) = Message::parse(&self.buffer)? {
                self.buffer.advance(used);
                return Ok(Some(message));
            }
            let read = self.stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Closed);
            }
        }
    }

    async fn write_all(&mut self, replies: &[Message]) -> Result<(), Error> {
        let mut buf = BytesMut::new();
        for reply in replies {
            reply.encode(&mut buf);
        }
        self.stream.write_all(&buf).await?;
        Ok(())
    }
}
