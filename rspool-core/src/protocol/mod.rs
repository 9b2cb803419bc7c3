mod error;
mod message;

pub use error::ProtocolError;
pub use message::Message;

pub(crate) const CRLF: &[u8] = b"\r\n";

/// Largest bulk string the codec will accept, matching the upstream's own
/// 512MB proto limit.
pub(crate) const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest element count for an array or push frame, matching the
/// upstream's multibulk limit.
pub(crate) const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Fixed key whose `GET` opens a pipelined batch. Part of the wire contract
/// with patched clients; the token never collides with a real key.
pub const PIPELINE_BEGIN_KEY: &[u8] = b"\x7f!>pipeline<!begin";

/// Fixed key whose `GET` closes a pipelined batch.
pub const PIPELINE_END_KEY: &[u8] = b"\x7f!>pipeline<!end";

/// Channel the upstream broadcasts key-invalidation events on.
pub const INVALIDATION_CHANNEL: &[u8] = b"__redis__:invalidate";
