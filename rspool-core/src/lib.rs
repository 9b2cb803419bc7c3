//! This crate provides the runtime-agnostic core of rspool, a caching
//! connection proxy for RESP key-value servers. It contains the wire codec,
//! the invalidation-coherent response cache, command classification, and the
//! pooled-connection plumbing. A concrete runtime (see `rspool-tokio`)
//! supplies the actual socket implementation of [`conn::Connection`].

pub mod cache;
pub mod command;
pub mod config;
pub mod conn;
pub mod protocol;
