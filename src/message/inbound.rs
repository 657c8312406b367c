use std::{
    io::Write,
    mem,
    sync::{Arc, Mutex},
};

use flate2::write::GzDecoder;

use super::{MessageOut, ProgressCallback, ProgressState, send_progress};
use crate::{
    buffers::{Chunk, ChunkWriter},
    codec::{BlipCodec, RCodec},
    connection::Connection,
    error::{MessageError, ProtocolError},
    protocol::{ACK_THRESHOLD, FrameFlags, MessageNo, MessageSize, MessageType, flag},
};

/// What a frame did to the message it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiveState {
    /// Plain mid-message frame.
    Other,
    /// This frame completed the property block.
    Beginning,
    /// This frame completed the message.
    End,
}

/// Result of feeding one frame to a message: the transition it caused, plus
/// an ACK for the connection to enqueue if the byte threshold was crossed.
#[derive(Debug)]
pub(crate) struct ReceiveOutcome {
    pub(crate) state: ReceiveState,
    pub(crate) ack: Option<MessageOut>,
}

/// Streaming gzip inflater for compressed message bodies.
struct Decompressor(GzDecoder<Vec<u8>>);

impl Decompressor {
    fn new() -> Self {
        Self(GzDecoder::new(Vec::new()))
    }

    /// Feeds compressed bytes in and drains whatever inflated output they
    /// produced.
    fn push(&mut self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        self.0.write_all(data)?;
        self.0.flush()?;
        Ok(mem::take(self.0.get_mut()))
    }

    /// Ends the stream, failing on truncated or corrupt input.
    fn finish(self) -> std::io::Result<Vec<u8>> {
        self.0.finish()
    }
}

/// An incoming message being reassembled from frames.
///
/// The connection feeds frames in through [`received_frame`]; application
/// threads may concurrently inspect properties mid-stream, which is what the
/// internal mutex is for. The message transitions `receiving` →
/// `beginning` (properties complete) → `end` exactly once.
///
/// [`received_frame`]: MessageIn::received_frame
pub struct MessageIn {
    number: MessageNo,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for MessageIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageIn")
            .field("number", &self.number)
            .finish_non_exhaustive()
    }
}

struct Inner {
    flags: FrameFlags,
    started: bool,
    properties_size: u32,
    properties: Option<Chunk>,
    acc: ChunkWriter,
    body: Option<Chunk>,
    unacked_bytes: MessageSize,
    complete: bool,
    decompressor: Option<Decompressor>,
    outgoing_size: MessageSize,
    on_progress: Option<ProgressCallback>,
}

impl MessageIn {
    fn new(
        number: MessageNo,
        flags: FrameFlags,
        on_progress: Option<ProgressCallback>,
        outgoing_size: MessageSize,
    ) -> Self {
        Self {
            number,
            inner: Mutex::new(Inner {
                flags,
                started: false,
                properties_size: 0,
                properties: None,
                acc: ChunkWriter::new(),
                body: None,
                unacked_bytes: 0,
                complete: false,
                decompressor: None,
                outgoing_size,
                on_progress,
            }),
        }
    }

    /// A message created on arrival of the first frame with an unseen number.
    pub(crate) fn incoming(number: MessageNo) -> Self {
        Self::new(number, FrameFlags::new(MessageType::Request), None, 0)
    }

    /// The placeholder registered for an outbound request's response. Flags
    /// are provisional until the first frame arrives.
    pub(crate) fn placeholder(
        number: MessageNo,
        on_progress: Option<ProgressCallback>,
        outgoing_size: MessageSize,
    ) -> Self {
        Self::new(
            number,
            FrameFlags::new(MessageType::Response),
            on_progress,
            outgoing_size,
        )
    }

    /// The message number shared by both halves of the exchange.
    pub fn number(&self) -> MessageNo {
        self.number
    }

    pub fn message_type(&self) -> MessageType {
        self.inner
            .lock()
            .unwrap()
            .flags
            .message_type()
            .unwrap_or(MessageType::Request)
    }

    /// True once the peer has asked for no reply.
    pub fn no_reply(&self) -> bool {
        self.inner.lock().unwrap().flags.no_reply()
    }

    /// True once the final frame has been received.
    pub fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().complete
    }

    /// Replaces the progress callback installed at creation.
    pub fn set_progress_callback(&self, callback: Option<ProgressCallback>) {
        self.inner.lock().unwrap().on_progress = callback;
    }

    /// Feeds one frame into the message.
    ///
    /// Returns the state transition this frame caused and, when the 50 kB
    /// threshold was crossed, the ACK message the connection must enqueue.
    pub(crate) fn received_frame(
        self: &Arc<Self>,
        frame: Chunk,
        frame_flags: FrameFlags,
    ) -> Result<ReceiveOutcome, ProtocolError> {
        let mut state = ReceiveState::Other;
        let mut ack = None;
        let (callback, outgoing_size, bytes_received, have_properties) = {
            let mut inner = self.inner.lock().unwrap();
            let mut frame = frame;
            let mut bytes_received = frame.len() as MessageSize;

            if inner.started {
                bytes_received += inner.acc.bytes_written() as MessageSize;
            } else {
                // First frame: the flags become authoritative and the payload
                // leads with the properties size.
                inner.started = true;
                inner.flags = frame_flags.without(flag::MORE_COMING);
                tracing::debug!(
                    message = %self.number,
                    message_type = inner.flags.message_type().map(MessageType::name),
                    flags = inner.flags.bits(),
                    "receiving message"
                );
                let codec = BlipCodec::new();
                inner.properties_size = codec
                    .read(&mut frame)
                    .map_err(|_| ProtocolError::FrameTooSmall)?;
            }

            if inner.properties.is_none()
                && inner.acc.bytes_written() + frame.len() >= inner.properties_size as usize
            {
                // The property block completes within this frame.
                let remaining = inner.properties_size as usize - inner.acc.bytes_written();
                inner.acc.write(&frame.as_slice()[..remaining]);
                let properties = inner.acc.snapshot();
                if let Some(last) = properties.as_slice().last()
                    && *last != 0
                {
                    return Err(ProtocolError::PropertiesNotTerminated);
                }
                inner.properties = Some(properties);
                // In bounds: remaining <= frame.len() by the branch condition.
                frame = frame.view(remaining..).unwrap();
                state = ReceiveState::Beginning;
            }

            inner.unacked_bytes += frame.len() as MessageSize;
            if inner.unacked_bytes >= ACK_THRESHOLD {
                let message_type = inner
                    .flags
                    .message_type()
                    .ok_or(ProtocolError::InvalidFrameType)?;
                ack = Some(MessageOut::ack(
                    self.number,
                    message_type.ack_type(),
                    bytes_received,
                ));
                inner.unacked_bytes = 0;
            }

            if inner.properties.is_some() && inner.flags.compressed() {
                let inflater = inner.decompressor.get_or_insert_with(Decompressor::new);
                let output = inflater
                    .push(frame.as_slice())
                    .map_err(|_| ProtocolError::InvalidGzip)?;
                if output.is_empty() && !frame.is_empty() {
                    return Err(ProtocolError::InvalidGzip);
                }
                inner.acc.write(&output);
            } else {
                // Body bytes, or the leading part of a still-incomplete
                // property block.
                inner.acc.write(frame.as_slice());
            }

            if !frame_flags.more_coming() {
                if inner.properties.is_none() {
                    return Err(ProtocolError::PropertiesIncomplete);
                }
                if let Some(inflater) = inner.decompressor.take() {
                    let output = inflater.finish().map_err(|_| ProtocolError::InvalidGzip)?;
                    inner.acc.write(&output);
                }
                inner.body = Some(inner.acc.snapshot());
                inner.complete = true;
                tracing::debug!(message = %self.number, "finished receiving message");
                state = ReceiveState::End;
            }

            (
                inner.on_progress.clone(),
                inner.outgoing_size,
                bytes_received,
                inner.properties.is_some(),
            )
        };
        // Mutex is released; progress may re-enter accessors.

        send_progress(
            &callback,
            if state == ReceiveState::End {
                ProgressState::Complete
            } else {
                ProgressState::ReceivingReply
            },
            outgoing_size,
            bytes_received,
            have_properties.then_some(self),
        );
        Ok(ReceiveOutcome { state, ack })
    }

    /// Reports a terminal error to the progress callback, used when the
    /// connection dies while a reply is still owed.
    pub(crate) fn fail(&self) {
        let (callback, outgoing_size, bytes_received) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.on_progress.clone(),
                inner.outgoing_size,
                inner.acc.bytes_written() as MessageSize,
            )
        };
        send_progress(
            &callback,
            ProgressState::Error,
            outgoing_size,
            bytes_received,
            None,
        );
    }

    /// Looks up a property by name; the first match on the wire wins.
    ///
    /// Tokenised names and values are resolved through the shared table, so
    /// callers always see the full strings.
    pub fn property(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let properties = inner.properties.as_ref()?;
        let bytes = properties.as_slice();

        let token = super::builder::tokenize_property(name);
        let target: &[u8] = if token != 0 {
            core::slice::from_ref(&token)
        } else {
            name.as_bytes()
        };

        let mut pos = 0;
        while pos < bytes.len() {
            let key_len = bytes[pos..].iter().position(|b| *b == 0)?;
            let key = &bytes[pos..pos + key_len];
            let value_start = pos + key_len + 1;
            if value_start >= bytes.len() {
                break; // illegal: missing value
            }
            let value_len = bytes[value_start..].iter().position(|b| *b == 0)?;
            let value = &bytes[value_start..value_start + value_len];
            if key == target {
                return Some(detokenize(value));
            }
            pos = value_start + value_len + 1;
        }
        None
    }

    /// Parses a property as a decimal integer; missing or unparseable values
    /// yield `default`.
    pub fn int_property(&self, name: &str, default: i64) -> i64 {
        match self.property(name) {
            Some(value) => value.parse().unwrap_or(default),
            None => default,
        }
    }

    /// Interprets a property as a boolean: `"true"`/`"YES"` and
    /// `"false"`/`"NO"` case-insensitively, any other value by its integer
    /// parse.
    pub fn bool_property(&self, name: &str, default: bool) -> bool {
        match self.property(name) {
            Some(value)
                if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") =>
            {
                true
            }
            Some(value)
                if value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("no") =>
            {
                false
            }
            _ => self.int_property(name, default as i64) != 0,
        }
    }

    /// The request-dispatch property.
    pub fn profile(&self) -> Option<String> {
        self.property("Profile")
    }

    /// The completed body, if the message has finished.
    pub fn body(&self) -> Option<Chunk> {
        self.inner.lock().unwrap().body.clone()
    }

    /// Takes the body out of the message. On a still-streaming message this
    /// drains whatever has accumulated so far.
    pub fn extract_body(&self) -> Option<Chunk> {
        let mut inner = self.inner.lock().unwrap();
        match inner.body.take() {
            Some(body) => Some(body),
            None if inner.acc.bytes_written() > 0 => Some(inner.acc.snapshot()),
            None => None,
        }
    }

    /// Decodes an ERROR-type response into its domain, code and message.
    pub fn error(&self) -> Option<MessageError> {
        if self.message_type() != MessageType::Error {
            return None;
        }
        Some(MessageError {
            domain: self.property("Error-Domain").unwrap_or_default(),
            code: self.int_property("Error-Code", 0),
            message: self
                .body()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default(),
        })
    }

    /// Sends `builder` as the reply to this message. A builder still typed as
    /// a request is promoted to a response. No-op if the peer asked for no
    /// reply.
    pub fn respond(&self, conn: &Connection, builder: crate::MessageBuilder) {
        if self.no_reply() {
            tracing::debug!(message = %self.number, "ignoring attempt to respond to a no-reply message");
            return;
        }
        if let Err(err) = conn.send_response(self.number, builder.into_response()) {
            tracing::debug!(message = %self.number, %err, "response dropped");
        }
    }

    /// Replies with an ERROR-type response.
    pub fn respond_with_error(&self, conn: &Connection, err: MessageError) {
        if !self.no_reply() {
            self.respond(conn, crate::MessageBuilder::response().make_error(err));
        }
    }

    /// Replies with the standard 404 "no handler" error.
    pub fn not_handled(&self, conn: &Connection) {
        self.respond_with_error(conn, MessageError::not_handled());
    }
}

fn detokenize(value: &[u8]) -> String {
    if let [token] = value
        && let Some(name) = super::builder::property_for_token(*token)
    {
        return name.to_string();
    }
    String::from_utf8_lossy(value).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageBuilder;

    /// Serializes a builder and feeds it to `msg` in frames of `frame_size`.
    fn deliver(
        msg: &Arc<MessageIn>,
        builder: MessageBuilder,
        frame_size: usize,
    ) -> Result<Vec<MessageOut>, ProtocolError> {
        let flags = builder.frame_flags();
        let payload = builder.serialize().unwrap();
        let mut acks = vec![];
        let mut sent = 0;
        while sent < payload.len() || sent == 0 {
            let size = frame_size.min(payload.len() - sent);
            let frame = payload.view(sent..sent + size).unwrap();
            sent += size;
            let frame_flags = if sent < payload.len() {
                flags.with(flag::MORE_COMING)
            } else {
                flags
            };
            let outcome = msg.received_frame(frame, frame_flags)?;
            if let Some(ack) = outcome.ack {
                acks.push(ack);
            }
            if sent == payload.len() {
                assert_eq!(outcome.state, ReceiveState::End);
                break;
            }
        }
        Ok(acks)
    }

    #[test]
    fn single_frame_message() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        let acks = deliver(
            &msg,
            MessageBuilder::request().profile("echo").body(b"hi".to_vec()),
            4096,
        )
        .unwrap();
        assert!(acks.is_empty());
        assert!(msg.is_complete());
        assert_eq!(msg.profile().as_deref(), Some("echo"));
        assert_eq!(msg.body().unwrap().as_slice(), b"hi");
        assert_eq!(msg.message_type(), MessageType::Request);
    }

    #[test]
    fn multi_frame_reassembly() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        let body: Vec<u8> = (0..30_000u32).map(|i| i as u8).collect();
        deliver(
            &msg,
            MessageBuilder::request().profile("blob").body(body.clone()),
            4096,
        )
        .unwrap();
        assert_eq!(msg.body().unwrap().as_slice(), &body[..]);
    }

    #[test]
    fn properties_split_across_frames() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        let long_value = "v".repeat(300);
        deliver(
            &msg,
            MessageBuilder::request()
                .property("X-Long", &long_value)
                .property("X-After", "yes")
                .body(b"tail".to_vec()),
            64,
        )
        .unwrap();
        assert_eq!(msg.property("X-Long").unwrap(), long_value);
        assert_eq!(msg.property("X-After").as_deref(), Some("yes"));
        assert_eq!(msg.body().unwrap().as_slice(), b"tail");
    }

    #[test]
    fn acks_every_50k() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        let acks = deliver(
            &msg,
            MessageBuilder::request().body(vec![0u8; 120_000]),
            4096,
        )
        .unwrap();
        assert_eq!(acks.len(), 2);
        for ack in &acks {
            assert_eq!(ack.message_type(), Some(MessageType::AckRequest));
            assert!(ack.urgent() && ack.no_reply());
            assert_eq!(ack.number(), MessageNo::FIRST);
        }
    }

    #[test]
    fn no_acks_below_threshold() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        let acks = deliver(&msg, MessageBuilder::request().body(vec![0u8; 49_000]), 4096).unwrap();
        assert!(acks.is_empty());
    }

    #[test]
    fn response_placeholder_acks_response_type() {
        let msg = Arc::new(MessageIn::placeholder(MessageNo::FIRST, None, 0));
        let acks = deliver(
            &msg,
            MessageBuilder::response().body(vec![0u8; 60_000]),
            4096,
        )
        .unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].message_type(), Some(MessageType::AckResponse));
    }

    #[test]
    fn compressed_body_round_trip() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        let body = vec![b'a'; 10_000];
        deliver(
            &msg,
            MessageBuilder::request().compressed(true).body(body.clone()),
            4096,
        )
        .unwrap();
        assert!(msg.is_complete());
        assert_eq!(msg.body().unwrap().as_slice(), &body[..]);
    }

    #[test]
    fn truncated_gzip_fails() {
        let builder = MessageBuilder::request().compressed(true).body(vec![b'a'; 10_000]);
        let flags = builder.frame_flags();
        let payload = builder.serialize().unwrap();
        let truncated = payload.view(..payload.len() - 1).unwrap();

        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        let err = msg.received_frame(truncated, flags).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidGzip);
    }

    #[test]
    fn garbage_gzip_fails() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        // properties size 0, then bytes that are not a gzip stream
        let mut wire = vec![0u8];
        wire.extend_from_slice(&[0x55; 64]);
        let flags = FrameFlags::new(MessageType::Request).with(flag::COMPRESSED);
        let err = msg.received_frame(Chunk::from(wire), flags).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidGzip);
    }

    #[test]
    fn missing_nul_terminator_fails() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        // properties size 4, properties "abcd" with no trailing NUL
        let wire = vec![4u8, b'a', b'b', b'c', b'd'];
        let err = msg
            .received_frame(Chunk::from(wire), FrameFlags::new(MessageType::Request))
            .unwrap_err();
        assert_eq!(err, ProtocolError::PropertiesNotTerminated);
    }

    #[test]
    fn end_before_properties_fails() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        // declares 100 bytes of properties but the message ends after 3
        let wire = vec![100u8, 1, 2, 3];
        let err = msg
            .received_frame(Chunk::from(wire), FrameFlags::new(MessageType::Request))
            .unwrap_err();
        assert_eq!(err, ProtocolError::PropertiesIncomplete);
    }

    #[test]
    fn empty_first_frame_fails() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        let err = msg
            .received_frame(Chunk::empty(), FrameFlags::new(MessageType::Request).with(flag::MORE_COMING))
            .unwrap_err();
        assert_eq!(err, ProtocolError::FrameTooSmall);
    }

    #[test]
    fn property_lookup_rules() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        deliver(
            &msg,
            MessageBuilder::request()
                .profile("first")
                .property("Count", "42")
                .property("Flag", "YES")
                .property("Off", "no")
                .property("Content-Type", "application/json")
                .profile("second"),
            4096,
        )
        .unwrap();

        // First match on the wire wins.
        assert_eq!(msg.profile().as_deref(), Some("first"));
        assert_eq!(msg.int_property("Count", 0), 42);
        assert_eq!(msg.int_property("Missing", 7), 7);
        assert_eq!(msg.int_property("Flag", -1), -1); // non-numeric
        assert!(msg.bool_property("Flag", false));
        assert!(!msg.bool_property("Off", true));
        assert!(msg.bool_property("Count", false)); // 42 != 0
        assert!(msg.bool_property("Missing", true));
        // Tokenised value resolves back to its string.
        assert_eq!(
            msg.property("Content-Type").as_deref(),
            Some("application/json")
        );
        assert_eq!(msg.property("Nope"), None);
    }

    #[test]
    fn completed_properties_end_with_nul() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        deliver(
            &msg,
            MessageBuilder::request().profile("p").property("a", "b"),
            4096,
        )
        .unwrap();
        let inner = msg.inner.lock().unwrap();
        let props = inner.properties.as_ref().unwrap();
        assert_eq!(*props.as_slice().last().unwrap(), 0);
    }

    #[test]
    fn error_decoding() {
        let msg = Arc::new(MessageIn::placeholder(MessageNo::FIRST, None, 0));
        deliver(
            &msg,
            MessageBuilder::response().make_error(MessageError::new("BLIP", 404, "nope")),
            4096,
        )
        .unwrap();
        assert_eq!(msg.message_type(), MessageType::Error);
        let err = msg.error().unwrap();
        assert_eq!(err.domain, "BLIP");
        assert_eq!(err.code, 404);
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn extract_body_drains() {
        let msg = Arc::new(MessageIn::incoming(MessageNo::FIRST));
        deliver(&msg, MessageBuilder::request().body(b"abc".to_vec()), 4096).unwrap();
        assert_eq!(msg.extract_body().unwrap().as_slice(), b"abc");
        assert!(msg.extract_body().is_none());
    }

    #[test]
    fn progress_reports_reply_once_properties_arrive() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let with_reply = Arc::new(AtomicUsize::new(0));
        let seen = with_reply.clone();
        let msg = Arc::new(MessageIn::placeholder(
            MessageNo::FIRST,
            Some(Arc::new(move |_, reply| {
                if reply.is_some() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })),
            0,
        ));
        deliver(
            &msg,
            MessageBuilder::response().body(vec![0u8; 10_000]),
            4096,
        )
        .unwrap();
        // Properties fit in the first frame, so every frame reports the
        // message as inspectable.
        assert_eq!(with_reply.load(Ordering::SeqCst), 3);
    }
}
