//! Classification of client commands and extraction of the proxy-relevant
//! details: cacheable keys, pipeline sentinels, disallowed commands, and the
//! addresses carried by redirection errors and cluster-topology replies.

use bytes::Bytes;

use crate::protocol::{Message, PIPELINE_BEGIN_KEY, PIPELINE_END_KEY};

/// Commands that must never reach the upstream through the proxy: blocking
/// reads, subscriptions, and connection-state commands the proxy owns.
const DISALLOWED: &[&str] = &["BLPOP", "BRPOPLPUSH", "SUBSCRIBE", "WAIT", "SELECT", "AUTH"];

/// Commands that are only valid inside a pipelined batch, where the whole
/// batch is guaranteed to ride one upstream connection.
const TRANSACTIONAL: &[&str] = &["MULTI", "EXEC", "DISCARD", "WATCH", "UNWATCH"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `GET`/`MGET`: consults and fills the cache.
    CacheableRead,
    /// `GET` of the fixed begin-sentinel key.
    PipelineBegin,
    /// `GET` of the fixed end-sentinel key.
    PipelineEnd,
    /// Transactional command; rejected outside a batch.
    Transaction,
    /// `CLUSTER SLOTS`: the reply carries node addresses to register.
    TopologySlots,
    /// `CLUSTER NODES`: the reply is a text form carrying node addresses.
    TopologyNodes,
    /// Rejected with a synthetic error, never forwarded.
    Disallowed,
    /// Everything else is forwarded untouched.
    Other,
}

pub fn classify(message: &Message) -> CommandKind {
    let items = match message.elements() {
        Some(items) => items,
        None => return CommandKind::Other,
    };
    let name = match items.first().and_then(Message::as_bulk) {
        Some(name) => name.to_ascii_uppercase(),
        None => return CommandKind::Other,
    };
    let sub = items.get(1).and_then(Message::as_bulk);

    match &name[..] {
        b"GET" => match items.get(1).and_then(Message::as_bulk) {
            Some(key) if &key[..] == PIPELINE_BEGIN_KEY => CommandKind::PipelineBegin,
            Some(key) if &key[..] == PIPELINE_END_KEY => CommandKind::PipelineEnd,
            _ => CommandKind::CacheableRead,
        },
        b"MGET" => CommandKind::CacheableRead,
        b"CLIENT" => match sub {
            Some(sub) if sub.eq_ignore_ascii_case(b"TRACKING") => CommandKind::Disallowed,
            _ => CommandKind::Other,
        },
        b"CLUSTER" => match sub {
            Some(sub) if sub.eq_ignore_ascii_case(b"SLOTS") => CommandKind::TopologySlots,
            Some(sub) if sub.eq_ignore_ascii_case(b"NODES") => CommandKind::TopologyNodes,
            _ => CommandKind::Other,
        },
        _ => {
            if let Ok(name) = std::str::from_utf8(&name) {
                if DISALLOWED.contains(&name) {
                    return CommandKind::Disallowed;
                }
                if TRANSACTIONAL.contains(&name) {
                    return CommandKind::Transaction;
                }
            }
            CommandKind::Other
        }
    }
}

/// The uppercased command name, for log and error text.
pub fn name(message: &Message) -> String {
    message
        .elements()
        .and_then(|items| items.first())
        .and_then(Message::as_bulk)
        .and_then(|name| std::str::from_utf8(name).ok())
        .map(|name| name.to_ascii_uppercase())
        .unwrap_or_else(|| "(unknown)".to_string())
}

/// The keys of a cacheable read, in request order: one for `GET`, all
/// arguments for `MGET`. Empty for anything else.
pub fn cacheable_keys(message: &Message) -> Vec<Bytes> {
    let items = match message.elements() {
        Some(items) => items,
        None => return Vec::new(),
    };
    let name = match items.first().and_then(Message::as_bulk) {
        Some(name) => name.to_ascii_uppercase(),
        None => return Vec::new(),
    };
    match &name[..] {
        b"GET" | b"MGET" => items[1..]
            .iter()
            .filter_map(Message::as_bulk)
            .cloned()
            .collect(),
        _ => Vec::new(),
    }
}

/// The address named by a `MOVED`/`ASK` redirection error, if `text` is one.
pub fn redirect_address(text: &str) -> Option<String> {
    let mut fields = text.split_whitespace();
    match fields.next() {
        Some("MOVED") | Some("ASK") => {}
        _ => return None,
    }
    let _slot = fields.next()?;
    fields.next().map(|address| address.to_string())
}

/// Every node address in a `CLUSTER SLOTS` reply: each slot range lists its
/// master and replicas as `[ip, port, ...]` arrays from the third element on.
pub fn slot_addresses(reply: &Message) -> Vec<String> {
    let mut addresses = Vec::new();
    let ranges = match reply.elements() {
        Some(ranges) => ranges,
        None => return addresses,
    };
    for range in ranges {
        let fields = match range.elements() {
            Some(fields) => fields,
            None => continue,
        };
        for node in fields.iter().skip(2) {
            let node = match node.elements() {
                Some(node) => node,
                None => continue,
            };
            let host = node
                .first()
                .and_then(Message::as_bulk)
                .and_then(|host| std::str::from_utf8(host).ok());
            let port = match node.get(1) {
                Some(Message::Integer(port)) => Some(*port),
                _ => None,
            };
            if let (Some(host), Some(port)) = (host, port) {
                addresses.push(format!("{}:{}", host, port));
            }
        }
    }
    addresses
}

/// Every node address in the `CLUSTER NODES` text form: the second
/// whitespace-delimited field of each line, up to the `@` separator.
pub fn node_addresses(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|field| field.split('@').next())
        .filter(|address| !address.is_empty())
        .map(|address| address.to_string())
        .collect()
}
