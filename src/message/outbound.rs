use std::sync::Arc;

use super::{MessageIn, ProgressCallback, ProgressState, send_progress};
use crate::{
    buffers::Chunk,
    codec::{BlipCodec, WCodec},
    protocol::{FrameFlags, MessageNo, MessageSize, MessageType, UNACKED_WINDOW, flag},
};

/// An outgoing message being sliced into frames.
///
/// The payload is immutable once built; `bytes_sent` walks forward through
/// it and `unacked_bytes` tracks how far ahead of the peer's acknowledgements
/// the send has run. `unacked_bytes <= bytes_sent <= payload.len()` holds at
/// all times.
pub(crate) struct MessageOut {
    number: MessageNo,
    flags: FrameFlags,
    payload: Chunk,
    bytes_sent: usize,
    unacked_bytes: usize,
    on_progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for MessageOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageOut")
            .field("number", &self.number)
            .field("flags", &self.flags)
            .field("bytes_sent", &self.bytes_sent)
            .field("unacked_bytes", &self.unacked_bytes)
            .finish_non_exhaustive()
    }
}

impl MessageOut {
    pub(crate) fn new(
        number: MessageNo,
        flags: FrameFlags,
        payload: Chunk,
        on_progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            number,
            flags,
            payload,
            bytes_sent: 0,
            unacked_bytes: 0,
            on_progress,
        }
    }

    /// Builds the dedicated ACK message acknowledging `bytes_received` bytes
    /// of message `number`: urgent, no-reply, payload a single varint.
    pub(crate) fn ack(number: MessageNo, ack_type: MessageType, bytes_received: MessageSize) -> Self {
        let codec = BlipCodec::new();
        let mut payload: Vec<u8> = Vec::with_capacity(10);
        // Vec<u8> writes are infallible.
        codec.write(&mut payload, bytes_received).unwrap();
        Self::new(
            number,
            FrameFlags::new(ack_type).with(flag::URGENT | flag::NO_REPLY),
            Chunk::from(payload),
            None,
        )
    }

    pub(crate) fn number(&self) -> MessageNo {
        self.number
    }

    pub(crate) fn message_type(&self) -> Option<MessageType> {
        self.flags.message_type()
    }

    pub(crate) fn urgent(&self) -> bool {
        self.flags.urgent()
    }

    pub(crate) fn no_reply(&self) -> bool {
        self.flags.no_reply()
    }

    pub(crate) fn expects_reply(&self) -> bool {
        self.flags.message_type() == Some(MessageType::Request) && !self.no_reply()
    }

    /// True once every payload byte has been handed to the wire.
    pub(crate) fn finished(&self) -> bool {
        self.bytes_sent == self.payload.len()
    }

    /// A message with a full unacked window is ineligible for scheduling
    /// until an ACK shrinks it.
    pub(crate) fn eligible(&self) -> bool {
        (self.unacked_bytes as MessageSize) < UNACKED_WINDOW
    }

    /// Yields the next frame of at most `max_size` bytes, advancing the send
    /// position, and the flags to put on the wire for it.
    pub(crate) fn next_frame_to_send(&mut self, max_size: usize) -> (Chunk, FrameFlags) {
        let size = max_size.min(self.payload.len() - self.bytes_sent);
        // In bounds: size is clamped to the unsent remainder.
        let frame = self
            .payload
            .view(self.bytes_sent..self.bytes_sent + size)
            .unwrap();
        self.bytes_sent += size;
        self.unacked_bytes += size;

        let mut flags = self.flags;
        let state = if self.bytes_sent < self.payload.len() {
            flags = flags.with(flag::MORE_COMING);
            ProgressState::Sending
        } else if self.no_reply() {
            ProgressState::Complete
        } else {
            ProgressState::AwaitingReply
        };
        send_progress(&self.on_progress, state, self.bytes_sent as MessageSize, 0, None);
        (frame, flags)
    }

    /// Applies a peer acknowledgement of `byte_count` total received bytes.
    /// Counts ahead of what was sent are logged and ignored.
    pub(crate) fn received_ack(&mut self, byte_count: MessageSize) {
        if byte_count <= self.bytes_sent as MessageSize {
            self.unacked_bytes = self
                .unacked_bytes
                .min(self.bytes_sent - byte_count as usize);
        } else {
            tracing::debug!(message = %self.number, byte_count, "ignoring ack ahead of send position");
        }
    }

    /// Creates the placeholder inbound message that will reassemble the
    /// response, registered with the connection before the first frame goes
    /// out. `None` for non-requests and no-reply requests.
    pub(crate) fn create_response(&self) -> Option<Arc<MessageIn>> {
        if !self.expects_reply() {
            return None;
        }
        // The placeholder's flags are updated when the first response frame
        // arrives; the type may turn into ERROR.
        Some(Arc::new(MessageIn::placeholder(
            self.number,
            self.on_progress.clone(),
            self.payload.len() as MessageSize,
        )))
    }

    /// Reports a terminal error to the progress callback, used when the
    /// connection dies with this message still in flight.
    pub(crate) fn fail(&self) {
        send_progress(
            &self.on_progress,
            ProgressState::Error,
            self.bytes_sent as MessageSize,
            0,
            None,
        );
    }
}
