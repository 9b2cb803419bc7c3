use std::fmt::{Display, Formatter, Result as FmtResult};

#[derive(Debug, PartialEq)]
pub enum ProtocolError {
    /// The first byte of a frame is not a known RESP type marker.
    InvalidTypeByte(u8),
    /// An integer or length field did not parse as a decimal number.
    InvalidInteger,
    /// A simple string or error frame was not valid UTF-8.
    InvalidUtf8,
    /// A bulk string or array declared a length over the protocol limit.
    LengthOutOfRange(i64),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ProtocolError::InvalidTypeByte(b) => write!(f, "invalid type byte: 0x{:02x}", b),
            ProtocolError::InvalidInteger => write!(f, "invalid integer field"),
            ProtocolError::InvalidUtf8 => write!(f, "invalid utf-8 in string frame"),
            ProtocolError::LengthOutOfRange(n) => write!(f, "length out of range: {}", n),
        }
    }
}

impl std::error::Error for ProtocolError {}
