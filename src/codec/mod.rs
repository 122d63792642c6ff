//! Length-prefixed binary frames exchanged over the broker.
//!
//! Two frame kinds share one layout discipline: a small header followed by
//! a 4-byte big-endian body length and a UTF-8 body.
//!
//! ```text
//! EventFrame:    [name_len: u8][name: name_len bytes][body_len: i32 BE][body]
//! ResponseFrame: [success: u8 ][body_len: i32 BE][body]
//! ```
//!
//! Decoding is strict: the declared lengths must consume the buffer exactly.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum encoded length of an event name, in bytes.
pub const MAX_EVENT_NAME_LEN: usize = u8::MAX as usize;

/// Smallest buffer either frame kind can occupy.
pub const MIN_FRAME_LEN: usize = 5;

const BODY_LEN_SIZE: usize = 4;

const SUCCESS_FLAG: u8 = 1;
const FAILURE_FLAG: u8 = 0;

/// Errors raised when an outbound frame cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("event name is {len} bytes, maximum is {MAX_EVENT_NAME_LEN}")]
    EventNameTooLong { len: usize },

    #[error("body is {len} bytes, which does not fit a 32-bit length prefix")]
    BodyTooLong { len: usize },
}

/// Errors raised when inbound bytes do not form a valid frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame is {len} bytes, minimum is {MIN_FRAME_LEN}")]
    TooShort { len: usize },

    #[error("event name declares {declared} bytes but only {remaining} remain")]
    NameOverrun { declared: usize, remaining: usize },

    #[error("body length prefix missing, only {remaining} bytes remain")]
    MissingBodyLength { remaining: usize },

    #[error("negative body length {declared}")]
    NegativeLength { declared: i32 },

    #[error("body declares {declared} bytes but only {remaining} remain")]
    BodyOverrun { declared: usize, remaining: usize },

    #[error("{count} unexpected bytes after the body")]
    TrailingBytes { count: usize },

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

/// Decoded event frame: an event type name plus its JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    pub event_name: String,
    /// JSON body; empty when the sender supplied none.
    pub body: String,
}

/// Decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub success: bool,
    /// Response payload on success, error message on failure.
    pub body: String,
}

/// Encode an event frame.
///
/// An empty body is written as a zero length with no body bytes.
pub fn encode_event(event_name: &str, body: &str) -> Result<Bytes, EncodeError> {
    let name = event_name.as_bytes();
    if name.len() > MAX_EVENT_NAME_LEN {
        return Err(EncodeError::EventNameTooLong { len: name.len() });
    }
    let body_len = body_length(body)?;

    let mut buf = BytesMut::with_capacity(1 + name.len() + BODY_LEN_SIZE + body.len());
    buf.put_u8(name.len() as u8);
    buf.put_slice(name);
    buf.put_i32(body_len);
    buf.put_slice(body.as_bytes());
    Ok(buf.freeze())
}

/// Decode an event frame.
pub fn decode_event(data: &[u8]) -> Result<EventFrame, FrameError> {
    if data.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: data.len() });
    }
    let mut buf = data;

    let name_len = buf.get_u8() as usize;
    if buf.remaining() < name_len {
        return Err(FrameError::NameOverrun {
            declared: name_len,
            remaining: buf.remaining(),
        });
    }
    let event_name = utf8(&buf[..name_len], "event name")?;
    buf.advance(name_len);

    let body = read_body(&mut buf)?;
    Ok(EventFrame { event_name, body })
}

/// Encode a response frame.
pub fn encode_response(success: bool, body: &str) -> Result<Bytes, EncodeError> {
    let body_len = body_length(body)?;

    let mut buf = BytesMut::with_capacity(1 + BODY_LEN_SIZE + body.len());
    buf.put_u8(if success { SUCCESS_FLAG } else { FAILURE_FLAG });
    buf.put_i32(body_len);
    buf.put_slice(body.as_bytes());
    Ok(buf.freeze())
}

/// Decode a response frame.
///
/// Any non-zero flag byte other than 1 is treated as failure.
pub fn decode_response(data: &[u8]) -> Result<ResponseFrame, FrameError> {
    if data.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: data.len() });
    }
    let mut buf = data;

    let success = buf.get_u8() == SUCCESS_FLAG;
    let body = read_body(&mut buf)?;
    Ok(ResponseFrame { success, body })
}

fn body_length(body: &str) -> Result<i32, EncodeError> {
    i32::try_from(body.len()).map_err(|_| EncodeError::BodyTooLong { len: body.len() })
}

/// Read `[len: i32 BE][body]` and require the buffer to end there.
fn read_body(buf: &mut &[u8]) -> Result<String, FrameError> {
    if buf.remaining() < BODY_LEN_SIZE {
        return Err(FrameError::MissingBodyLength {
            remaining: buf.remaining(),
        });
    }
    let declared = buf.get_i32();
    let body_len =
        usize::try_from(declared).map_err(|_| FrameError::NegativeLength { declared })?;

    if buf.remaining() < body_len {
        return Err(FrameError::BodyOverrun {
            declared: body_len,
            remaining: buf.remaining(),
        });
    }
    let body = utf8(&buf[..body_len], "body")?;
    buf.advance(body_len);

    if buf.has_remaining() {
        return Err(FrameError::TrailingBytes {
            count: buf.remaining(),
        });
    }
    Ok(body)
}

fn utf8(bytes: &[u8], field: &'static str) -> Result<String, FrameError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| FrameError::InvalidUtf8 { field })
}

#[cfg(test)]
mod tests;
