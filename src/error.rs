//! Error types for the BLIP and WebSocket layers.

use thiserror::Error;

/// A violation of the BLIP or WebSocket wire protocol by the peer.
///
/// Any of these is fatal to the connection: the offending frame's message is
/// failed, a CLOSE with status 1002 goes out, and the close status is
/// surfaced through [`Connection::closed`](crate::Connection::closed).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame ended in the middle of a varint or before a required field.
    #[error("frame too small")]
    FrameTooSmall,

    /// The flag byte carries a message type outside the defined set.
    #[error("invalid frame type")]
    InvalidFrameType,

    /// A property block did not end with a NUL byte.
    #[error("message properties not null-terminated")]
    PropertiesNotTerminated,

    /// MORE-COMING cleared before the property block was complete.
    #[error("message ends before end of properties")]
    PropertiesIncomplete,

    /// A compressed body failed to inflate.
    #[error("invalid gzipped data")]
    InvalidGzip,

    /// An ACK arrived for a message number never sent in that direction.
    #[error("ack for unknown message")]
    OrphanAck,

    /// A response arrived for a request that was never sent.
    #[error("response to unknown request")]
    OrphanResponse,

    /// A WebSocket frame declared a payload larger than the 1 MiB limit.
    #[error("oversize websocket payload")]
    OversizePayload,

    /// A WebSocket frame violated RFC 6455 framing rules.
    #[error("malformed websocket frame")]
    BadWebSocketFrame,

    /// A TEXT message carried invalid UTF-8.
    #[error("invalid utf-8 in text message")]
    InvalidUtf8,

    /// Reassembled fragments exceeded the capacity declared by the first one.
    #[error("message reassembly overflow")]
    MessageOverflow,
}

/// Errors surfaced to callers submitting messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The connection is closed or closing; the message was not sent.
    ///
    /// Returned synchronously by [`send`](crate::Connection::send) after
    /// [`close`](crate::Connection::close), and asynchronously through a
    /// pending [`ResponseFuture`](crate::ResponseFuture) when the connection
    /// goes down before the response arrives.
    #[error("connection closed")]
    Closed,

    /// The serialized payload exceeds the protocol's size cap.
    #[error("message payload too large")]
    TooLarge,
}

/// An application-level error carried by an ERROR-type response.
///
/// The peer delivers these as a normal completed response; awaiting a
/// [`ResponseFuture`](crate::ResponseFuture) yields the message, and
/// [`MessageIn::error`](crate::MessageIn::error) decodes it into this form.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{domain} error {code}: {message}")]
pub struct MessageError {
    /// Namespace of the error code, e.g. `"BLIP"` or `"HTTP"`.
    pub domain: String,
    /// Numeric code within the domain.
    pub code: i64,
    /// Human-readable description, sent as the response body.
    pub message: String,
}

impl MessageError {
    pub fn new(domain: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            message: message.into(),
        }
    }

    /// The error a connection answers with when no handler matches a request.
    pub(crate) fn not_handled() -> Self {
        Self::new("BLIP", 404, "no handler for message")
    }
}
