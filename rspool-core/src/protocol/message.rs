use bytes::{BufMut, Bytes, BytesMut};

use super::{ProtocolError, CRLF, MAX_ARRAY_LEN, MAX_BULK_LEN};

/// A single RESP frame. Requests, replies and server pushes all share this
/// representation; the proxy mostly moves frames around without looking
/// inside them, so bulk payloads stay as cheap `Bytes` handles.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR something\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$5\r\nhello\r\n`
    Bulk(Bytes),
    /// `$-1\r\n` (also produced for `*-1\r\n` and the RESP3 `_\r\n`)
    Null,
    /// `*2\r\n...`
    Array(Vec<Message>),
    /// `>3\r\n...`, the RESP3 out-of-band push frame.
    Push(Vec<Message>),
}

impl Message {
    /// Build a bulk string frame from anything byte-like.
    pub fn bulk(data: impl Into<Bytes>) -> Message {
        Message::Bulk(data.into())
    }

    /// Build a client command: an array of bulk strings.
    pub fn command(parts: &[&[u8]]) -> Message {
        Message::Array(
            parts
                .iter()
                .map(|p| Message::Bulk(Bytes::copy_from_slice(p)))
                .collect(),
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Message::Error(_))
    }

    /// The payload of a bulk string frame, if this is one.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Message::Bulk(data) => Some(data),
            _ => None,
        }
    }

    /// The elements of an array or push frame, if this is one.
    pub fn elements(&self) -> Option<&[Message]> {
        match self {
            Message::Array(items) | Message::Push(items) => Some(items),
            _ => None,
        }
    }

    /// Append the encoded form of this frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Message::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            Message::Error(s) => {
                buf.put_u8(b'-');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            Message::Integer(n) => {
                buf.put_u8(b':');
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            Message::Bulk(data) => {
                buf.put_u8(b'$');
                buf.put_slice(data.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            Message::Null => buf.put_slice(b"$-1\r\n"),
            Message::Array(items) => {
                buf.put_u8(b'*');
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for item in items {
                    item.encode(buf);
                }
            }
            Message::Push(items) => {
                buf.put_u8(b'>');
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }

    /// The encoded form of this frame as a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Try to parse one frame from the front of `src`. Returns the frame and
    /// the number of bytes it occupied, or `Ok(None)` when `src` holds only
    /// an incomplete prefix and the caller should read more input.
    pub fn parse(src: &[u8]) -> Result<Option<(Message, usize)>, ProtocolError> {
        parse_at(src, 0)
    }
}

fn parse_at(src: &[u8], pos: usize) -> Result<Option<(Message, usize)>, ProtocolError> {
    let type_byte = match src.get(pos) {
        Some(b) => *b,
        None => return Ok(None),
    };
    let (line, body) = match read_line(src, pos + 1) {
        Some(found) => found,
        None => return Ok(None),
    };

    match type_byte {
        b'+' => Ok(Some((Message::Simple(read_str(line)?), body))),
        b'-' => Ok(Some((Message::Error(read_str(line)?), body))),
        b':' => Ok(Some((Message::Integer(read_int(line)?), body))),
        b'$' => {
            let len = read_int(line)?;
            if len == -1 {
                return Ok(Some((Message::Null, body)));
            }
            if len < 0 || len as usize > MAX_BULK_LEN {
                return Err(ProtocolError::LengthOutOfRange(len));
            }
            let len = len as usize;
            // payload plus its trailing CRLF
            if src.len() < body + len + 2 {
                return Ok(None);
            }
            let data = Bytes::copy_from_slice(&src[body..body + len]);
            Ok(Some((Message::Bulk(data), body + len + 2)))
        }
        b'*' | b'>' => {
            let len = read_int(line)?;
            if len == -1 && type_byte == b'*' {
                return Ok(Some((Message::Null, body)));
            }
            if len < 0 || len as usize > MAX_ARRAY_LEN {
                return Err(ProtocolError::LengthOutOfRange(len));
            }
            // Capacity is bounded separately: the length field is not yet
            // backed by received bytes.
            let mut items = Vec::with_capacity((len as usize).min(64));
            let mut pos = body;
            for _ in 0..len {
                match parse_at(src, pos)? {
                    Some((item, next)) => {
                        items.push(item);
                        pos = next;
                    }
                    None => return Ok(None),
                }
            }
            let message = if type_byte == b'*' {
                Message::Array(items)
            } else {
                Message::Push(items)
            };
            Ok(Some((message, pos)))
        }
        b'_' => Ok(Some((Message::Null, body))),
        other => Err(ProtocolError::InvalidTypeByte(other)),
    }
}

/// Find the line starting at `pos`; returns the line contents and the offset
/// just past its CRLF.
fn read_line(src: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rel = src[pos..].windows(2).position(|w| w == CRLF)?;
    Some((&src[pos..pos + rel], pos + rel + 2))
}

fn read_str(line: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(line)
        .map(|s| s.to_string())
        .map_err(|_| ProtocolError::InvalidUtf8)
}

fn read_int(line: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ProtocolError::InvalidInteger)
}
