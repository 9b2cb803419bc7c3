//! Test support: a scripted in-process upstream speaking just enough RESP
//! to stand in for the real server, and a raw client for talking to the
//! proxy's local endpoints.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use rspool_core::config::UpstreamConfig;
use rspool_core::protocol::{Message, INVALIDATION_CHANNEL};
use rspool_tokio::config::{EndpointOptions, Network};
use rspool_tokio::proxy::Proxy;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::broadcast;

pub const POLL_INTERVAL: Duration = Duration::from_millis(25);
pub const POLL_TRIES: usize = 200;

/// A fake upstream server. Commands get default replies (values come from
/// an in-memory map) unless a scripted reply has been queued for the
/// command name. Every received command is recorded along with the id of
/// the connection it arrived on.
pub struct FakeUpstream {
    pub address: String,
    state: Arc<State>,
}

struct State {
    received: Mutex<Vec<(usize, Message)>>,
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    scripted: Mutex<HashMap<String, Vec<Message>>>,
    next_client_id: AtomicI64,
    next_conn_id: AtomicUsize,
    /// Fires to close every subscriber connection.
    kick: broadcast::Sender<()>,
    /// Frames delivered to every subscriber connection.
    push: broadcast::Sender<Message>,
}

impl FakeUpstream {
    pub async fn start() -> FakeUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (kick, _) = broadcast::channel(4);
        let (push, _) = broadcast::channel(16);
        let state = Arc::new(State {
            received: Mutex::new(Vec::new()),
            data: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            next_client_id: AtomicI64::new(7),
            next_conn_id: AtomicUsize::new(0),
            kick,
            push,
        });
        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(serve_conn(stream, accept_state.clone()));
                    }
                    Err(_) => return,
                }
            }
        });
        FakeUpstream { address, state }
    }

    pub fn set_value(&self, key: &[u8], value: &[u8]) {
        self.state
            .data
            .lock()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
    }

    /// Queue a one-shot reply for the next command with this name.
    pub fn script(&self, command: &str, reply: Message) {
        self.state
            .scripted
            .lock()
            .unwrap()
            .entry(command.to_ascii_uppercase())
            .or_insert_with(Vec::new)
            .push(reply);
    }

    pub fn received(&self) -> Vec<(usize, Message)> {
        self.state.received.lock().unwrap().clone()
    }

    /// How many received commands have this name.
    pub fn count(&self, command: &str) -> usize {
        let want = command.to_ascii_uppercase();
        self.received()
            .iter()
            .filter(|(_, message)| command_name(message).as_deref() == Some(want.as_str()))
            .count()
    }

    /// How many received commands have this name and subcommand.
    pub fn count_sub(&self, command: &str, sub: &str) -> usize {
        let want = command.to_ascii_uppercase();
        let want_sub = sub.to_ascii_uppercase();
        self.received()
            .iter()
            .filter(|(_, message)| {
                command_name(message).as_deref() == Some(want.as_str())
                    && argument(message, 1)
                        .map(|arg| arg.eq_ignore_ascii_case(want_sub.as_bytes()))
                        .unwrap_or(false)
            })
            .count()
    }

    /// Deliver an invalidation push naming `keys` to every subscriber.
    pub fn push_invalidation(&self, keys: &[&[u8]]) {
        let payload = Message::Array(
            keys.iter()
                .map(|key| Message::bulk(key.to_vec()))
                .collect(),
        );
        let frame = Message::Array(vec![
            Message::bulk(&b"message"[..]),
            Message::bulk(INVALIDATION_CHANNEL),
            payload,
        ]);
        let _ = self.state.push.send(frame);
    }

    /// Hard-close every subscriber connection.
    pub fn kick_subscribers(&self) {
        let _ = self.state.kick.send(());
    }
}

async fn serve_conn(stream: TcpStream, state: Arc<State>) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = BytesMut::new();
    let mut push_rx = state.push.subscribe();
    let mut kick_rx = state.kick.subscribe();
    let mut subscribed = false;
    loop {
        tokio::select! {
            pushed = push_rx.recv() => {
                if subscribed {
                    match pushed {
                        Ok(frame) => {
                            if writer.write_all(&frame.to_bytes()).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => {}
                    }
                }
            }
            _ = kick_rx.recv() => {
                if subscribed {
                    return;
                }
            }
            read = reader.read_buf(&mut buffer) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                if drain_commands(conn_id, &state, &mut buffer, &mut writer, &mut subscribed)
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

async fn drain_commands(
    conn_id: usize,
    state: &Arc<State>,
    buffer: &mut BytesMut,
    writer: &mut OwnedWriteHalf,
    subscribed: &mut bool,
) -> std::io::Result<()> {
    while let Some((message, used)) = Message::parse(buffer).expect("fake upstream got bad frame") {
        buffer.advance(used);
        state
            .received
            .lock()
            .unwrap()
            .push((conn_id, message.clone()));
        let name = command_name(&message).unwrap_or_default();
        if name == "SUBSCRIBE" {
            *subscribed = true;
        }
        if let Some(reply) = state.reply_for(&name, &message) {
            writer.write_all(&reply.to_bytes()).await?;
        }
    }
    Ok(())
}

impl State {
    fn reply_for(&self, name: &str, message: &Message) -> Option<Message> {
        if let Some(queue) = self.scripted.lock().unwrap().get_mut(name) {
            if !queue.is_empty() {
                return Some(queue.remove(0));
            }
        }
        let reply = match name {
            "PING" => Message::Simple("PONG".into()),
            "SELECT" | "READONLY" | "SET" | "MULTI" => {
                if name == "SET" {
                    if let (Some(key), Some(value)) = (argument(message, 1), argument(message, 2)) {
                        self.data.lock().unwrap().insert(key, value);
                    }
                }
                Message::Simple("OK".into())
            }
            "EXEC" => Message::Array(Vec::new()),
            "CLIENT" => match argument(message, 1) {
                Some(sub) if sub.eq_ignore_ascii_case(b"ID") => {
                    Message::Integer(self.next_client_id.fetch_add(1, Ordering::SeqCst))
                }
                _ => Message::Simple("OK".into()),
            },
            "SUBSCRIBE" => Message::Array(vec![
                Message::bulk(&b"subscribe"[..]),
                Message::bulk(argument(message, 1).unwrap_or_default()),
                Message::Integer(1),
            ]),
            "GET" => match argument(message, 1) {
                Some(key) => self.lookup(&key),
                None => Message::Error("ERR wrong number of arguments".into()),
            },
            "MGET" => {
                let items = message.elements().unwrap_or(&[]);
                Message::Array(
                    items[1..]
                        .iter()
                        .map(|item| match item.as_bulk() {
                            Some(key) => self.lookup(key),
                            None => Message::Null,
                        })
                        .collect(),
                )
            }
            _ => Message::Error(format!("ERR unknown command '{}'", name)),
        };
        Some(reply)
    }

    fn lookup(&self, key: &[u8]) -> Message {
        match self.data.lock().unwrap().get(key) {
            Some(value) => Message::bulk(value.clone()),
            None => Message::Null,
        }
    }
}

fn command_name(message: &Message) -> Option<String> {
    message
        .elements()
        .and_then(|items| items.first())
        .and_then(Message::as_bulk)
        .and_then(|name| std::str::from_utf8(name).ok())
        .map(|name| name.to_ascii_uppercase())
}

fn argument(message: &Message, index: usize) -> Option<Vec<u8>> {
    message
        .elements()
        .and_then(|items| items.get(index))
        .and_then(Message::as_bulk)
        .map(|bulk| bulk.to_vec())
}

/// A raw RESP client for talking to the proxy's local endpoint.
pub struct RespClient<S> {
    stream: S,
    buffer: BytesMut,
}

impl RespClient<TcpStream> {
    pub async fn connect_tcp(address: &str) -> RespClient<TcpStream> {
        let stream = TcpStream::connect(address).await.unwrap();
        RespClient {
            stream,
            buffer: BytesMut::new(),
        }
    }
}

impl RespClient<UnixStream> {
    pub async fn connect_unix(path: &str) -> RespClient<UnixStream> {
        let stream = UnixStream::connect(path).await.unwrap();
        RespClient {
            stream,
            buffer: BytesMut::new(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> RespClient<S> {
    pub async fn send(&mut self, parts: &[&[u8]]) {
        self.send_messages(&[Message::command(parts)]).await;
    }

    pub async fn send_messages(&mut self, messages: &[Message]) {
        let mut buf = BytesMut::new();
        for message in messages {
            message.encode(&mut buf);
        }
        self.stream.write_all(&buf).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some((message, used)) = Message::parse(&self.buffer).unwrap() {
                    self.buffer.advance(used);
                    return message;
                }
                let read = self.stream.read_buf(&mut self.buffer).await.unwrap();
                if read == 0 {
                    panic!("endpoint closed while waiting for a reply");
                }
            }
        })
        .await
        .expect("timed out waiting for a reply")
    }
}

/// Start a proxy for `url` with TCP local endpoints and wait for the seed
/// endpoint to come up.
pub async fn start_proxy(url: &str) -> (Arc<Proxy>, String) {
    start_proxy_with(url, EndpointOptions {
        network: Network::Tcp,
        ..EndpointOptions::default()
    })
    .await
}

pub async fn start_proxy_with(url: &str, options: EndpointOptions) -> (Arc<Proxy>, String) {
    let seed = UpstreamConfig::from_url(url).unwrap();
    let address = seed.address.clone();
    let proxy = Proxy::new(seed, options);
    let runner = proxy.clone();
    tokio::spawn(async move {
        if let Err(err) = runner.run().await {
            panic!("proxy failed: {}", err);
        }
    });
    for _ in 0..POLL_TRIES {
        if let Some(endpoint) = proxy.registry().endpoint_of(&address).await {
            return (proxy, endpoint);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("proxy endpoint for {} never came up", address);
}

/// A `CLUSTER SLOTS` reply covering the whole keyspace, one node per
/// address.
pub fn slots_reply(addresses: &[&str]) -> Message {
    let nodes: Vec<Message> = addresses
        .iter()
        .map(|address| {
            let mut parts = address.rsplitn(2, ':');
            let port: i64 = parts.next().unwrap().parse().unwrap();
            let host = parts.next().unwrap();
            Message::Array(vec![
                Message::bulk(host.as_bytes().to_vec()),
                Message::Integer(port),
                Message::bulk(&b"test-node-id"[..]),
            ])
        })
        .collect();
    let mut range = vec![Message::Integer(0), Message::Integer(16383)];
    range.extend(nodes);
    Message::Array(vec![Message::Array(range)])
}
