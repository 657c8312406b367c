use std::io::Write;

use flate2::{Compression, write::GzEncoder};

use super::ProgressCallback;
use crate::{
    buffers::{Chunk, writer::Writer},
    codec::{BlipCodec, WCodec},
    error::{MessageError, SendError},
    protocol::{FrameFlags, MAX_PAYLOAD_SIZE, MessageType, flag},
};

/// Well-known property strings replaced by a single token byte on the wire.
///
/// The table is part of the protocol; both peers must use the same one or
/// property names come out garbled. Token byte = index + 1.
const SPECIAL_PROPERTIES: &[&str] = &[
    "Profile",
    "Error-Code",
    "Error-Domain",
    "Content-Type",
    "application/json",
    "application/octet-stream",
    "text/plain; charset=UTF-8",
    "text/xml",
    "Accept",
    "Cache-Control",
    "must-revalidate",
    "If-Match",
    "If-None-Match",
    "Location",
];

/// Returns the wire token for a property string, or 0 if it has none.
pub(crate) fn tokenize_property(name: &str) -> u8 {
    match SPECIAL_PROPERTIES.iter().position(|p| *p == name) {
        Some(i) => (i + 1) as u8,
        None => 0,
    }
}

/// Resolves a wire token byte back to its property string.
pub(crate) fn property_for_token(token: u8) -> Option<&'static str> {
    SPECIAL_PROPERTIES.get(token.checked_sub(1)? as usize).copied()
}

/// Assembles an outgoing message: type, flags, properties and body.
///
/// # Examples
///
/// ```
/// use blipwire::MessageBuilder;
///
/// let request = MessageBuilder::request()
///     .profile("echo")
///     .property("Content-Type", "application/octet-stream")
///     .urgent(true)
///     .body(b"payload".to_vec());
/// ```
pub struct MessageBuilder {
    message_type: MessageType,
    properties: Vec<(String, String)>,
    body: Vec<u8>,
    urgent: bool,
    no_reply: bool,
    compressed: bool,
    pub(crate) on_progress: Option<ProgressCallback>,
}

impl MessageBuilder {
    fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            properties: Vec::new(),
            body: Vec::new(),
            urgent: false,
            no_reply: false,
            compressed: false,
            on_progress: None,
        }
    }

    /// Starts a request message.
    pub fn request() -> Self {
        Self::new(MessageType::Request)
    }

    /// Starts a response message.
    pub fn response() -> Self {
        Self::new(MessageType::Response)
    }

    /// Sets the `Profile` property, naming the handler this request
    /// dispatches to.
    #[must_use]
    pub fn profile(self, profile: &str) -> Self {
        self.property("Profile", profile)
    }

    /// Appends a property. Property strings must not contain NUL bytes.
    #[must_use]
    pub fn property(mut self, name: &str, value: &str) -> Self {
        debug_assert!(!name.is_empty());
        debug_assert!(!name.contains('\0') && !value.contains('\0'));
        self.properties.push((name.to_string(), value.to_string()));
        self
    }

    /// Sets the message body.
    #[must_use]
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Marks the message for high-priority scheduling.
    #[must_use]
    pub fn urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    /// Declares that no reply is wanted.
    #[must_use]
    pub fn no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = no_reply;
        self
    }

    /// Gzip-compresses the body on the wire.
    #[must_use]
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Installs a progress callback.
    #[must_use]
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Turns this message into an ERROR response carrying `err`.
    #[must_use]
    pub fn make_error(mut self, err: MessageError) -> Self {
        self.message_type = MessageType::Error;
        self.body = err.message.into_bytes();
        self.property("Error-Domain", &err.domain)
            .property("Error-Code", &err.code.to_string())
    }

    /// Promotes a request builder to a response; ERROR stays ERROR.
    pub(crate) fn into_response(mut self) -> Self {
        if self.message_type == MessageType::Request {
            self.message_type = MessageType::Response;
        }
        self
    }

    pub(crate) fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub(crate) fn expects_reply(&self) -> bool {
        self.message_type == MessageType::Request && !self.no_reply
    }

    pub(crate) fn frame_flags(&self) -> FrameFlags {
        let mut flags = FrameFlags::new(self.message_type);
        if self.urgent {
            flags = flags.with(flag::URGENT);
        }
        if self.no_reply {
            flags = flags.with(flag::NO_REPLY);
        }
        if self.compressed {
            flags = flags.with(flag::COMPRESSED);
        }
        flags
    }

    /// Serializes the wire payload: varint properties size, the NUL-separated
    /// property block, then the (possibly compressed) body.
    pub(crate) fn serialize(&self) -> Result<Chunk, SendError> {
        let codec = BlipCodec::new();

        let mut properties: Vec<u8> = Vec::new();
        for (name, value) in &self.properties {
            for part in [name.as_str(), value.as_str()] {
                match tokenize_property(part) {
                    0 => properties.extend_from_slice(part.as_bytes()),
                    token => properties.push(token),
                }
                properties.push(0);
            }
        }

        let mut payload: Vec<u8> = Vec::with_capacity(properties.len() + self.body.len() + 4);
        // Vec<u8> writes are infallible.
        codec.write(&mut payload, properties.len()).unwrap();
        payload.write_exact(&properties).unwrap();

        if self.compressed {
            let mut encoder = GzEncoder::new(payload, Compression::default());
            encoder.write_all(&self.body).map_err(|_| SendError::TooLarge)?;
            payload = encoder.finish().map_err(|_| SendError::TooLarge)?;
        } else {
            payload.extend_from_slice(&self.body);
        }

        if payload.len() as u64 > MAX_PAYLOAD_SIZE {
            return Err(SendError::TooLarge);
        }
        Ok(Chunk::from(payload))
    }
}
