use core::fmt;

/// Size of message payloads and progress byte counts.
pub type MessageSize = u64;

/// Maximum payload bytes carried by a single BLIP frame.
pub(crate) const FRAME_SIZE: usize = 4096;

/// Inbound bytes consumed per message before an ACK is emitted.
pub(crate) const ACK_THRESHOLD: MessageSize = 50_000;

/// Outbound unacknowledged-byte window per message; a message at or over the
/// window is ineligible for scheduling until an ACK shrinks it.
pub(crate) const UNACKED_WINDOW: MessageSize = 128 * 1024;

/// Largest serialized message payload (the properties-size prefix is a u32
/// varint and the original wire format caps payloads alongside it).
pub(crate) const MAX_PAYLOAD_SIZE: u64 = u32::MAX as u64;

/// Identifier of a logical message, unique per direction per connection.
///
/// Numbers start at 1 and increase monotonically; a request and its response
/// share the same number. The value is 63-bit on the wire and wraparound is
/// unreachable within a connection's lifetime.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageNo(u64);

impl MessageNo {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    /// First valid message number of a direction.
    pub(crate) const FIRST: MessageNo = MessageNo(1);

    /// Returns the raw value.
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Returns the next message number in the sequence.
    pub(crate) const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MessageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Frame flag bits above the message-type field.
pub(crate) mod flag {
    /// Mask of the message-type bits.
    pub(crate) const TYPE_MASK: u8 = 0x07;

    /// Body (not the properties length prefix) is gzip-compressed.
    pub(crate) const COMPRESSED: u8 = 0x08;

    /// Scheduled at higher priority.
    pub(crate) const URGENT: u8 = 0x10;

    /// Sender does not want a reply.
    pub(crate) const NO_REPLY: u8 = 0x20;

    /// Another frame of this message follows.
    pub(crate) const MORE_COMING: u8 = 0x40;
}

/// Type of a BLIP message, carried in the low bits of the frame flags.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Error = 2,
    AckRequest = 4,
    AckResponse = 5,
}

impl MessageType {
    pub(crate) fn from_bits(bits: u8) -> Option<Self> {
        match bits & flag::TYPE_MASK {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Error),
            4 => Some(Self::AckRequest),
            5 => Some(Self::AckResponse),
            _ => None,
        }
    }

    /// True for the flow-control acknowledgement types.
    pub(crate) fn is_ack(self) -> bool {
        matches!(self, Self::AckRequest | Self::AckResponse)
    }

    /// True for messages that travel in the responding direction of a pair.
    pub(crate) fn is_response(self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }

    /// The ACK type acknowledging a message of this type.
    pub(crate) fn ack_type(self) -> Self {
        if self.is_response() {
            Self::AckResponse
        } else {
            Self::AckRequest
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Request => "REQ",
            Self::Response => "RES",
            Self::Error => "ERR",
            Self::AckRequest => "ACKREQ",
            Self::AckResponse => "ACKRES",
        }
    }
}

/// The one-byte flag field of a BLIP frame: message type plus modifier bits.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub(crate) const fn new(message_type: MessageType) -> Self {
        Self(message_type as u8)
    }

    pub(crate) const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub(crate) const fn bits(self) -> u8 {
        self.0
    }

    pub(crate) const fn with(self, bits: u8) -> Self {
        Self(self.0 | bits)
    }

    pub(crate) const fn without(self, bits: u8) -> Self {
        Self(self.0 & !bits)
    }

    pub(crate) const fn contains(self, bits: u8) -> bool {
        self.0 & bits != 0
    }

    pub(crate) fn message_type(self) -> Option<MessageType> {
        MessageType::from_bits(self.0)
    }

    pub(crate) const fn compressed(self) -> bool {
        self.contains(flag::COMPRESSED)
    }

    pub(crate) const fn urgent(self) -> bool {
        self.contains(flag::URGENT)
    }

    pub(crate) const fn no_reply(self) -> bool {
        self.contains(flag::NO_REPLY)
    }

    pub(crate) const fn more_coming(self) -> bool {
        self.contains(flag::MORE_COMING)
    }
}

impl fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameFlags({:02x})", self.0)
    }
}

/// Decoded header of a BLIP frame: message number plus the flag byte.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub(crate) number: MessageNo,
    pub(crate) flags: FrameFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_no_sequence() {
        let n = MessageNo::FIRST;
        assert_eq!(n.get(), 1);
        assert_eq!(n.next().get(), 2);
        assert_eq!(format!("{n}"), "#1");
    }

    #[test]
    fn flag_packing() {
        let flags = FrameFlags::new(MessageType::Request)
            .with(flag::URGENT | flag::NO_REPLY | flag::MORE_COMING);
        assert_eq!(flags.bits(), 0x70);
        assert!(flags.urgent());
        assert!(flags.no_reply());
        assert!(flags.more_coming());
        assert!(!flags.compressed());
        assert_eq!(flags.message_type(), Some(MessageType::Request));

        let cleared = flags.without(flag::MORE_COMING);
        assert!(!cleared.more_coming());
        assert_eq!(cleared.message_type(), Some(MessageType::Request));
    }

    #[test]
    fn message_type_bits() {
        for (bits, t) in [
            (0u8, MessageType::Request),
            (1, MessageType::Response),
            (2, MessageType::Error),
            (4, MessageType::AckRequest),
            (5, MessageType::AckResponse),
        ] {
            assert_eq!(MessageType::from_bits(bits), Some(t));
            assert_eq!(t as u8, bits);
        }
        assert_eq!(MessageType::from_bits(3), None);
        assert_eq!(MessageType::from_bits(6), None);
        assert_eq!(MessageType::from_bits(7), None);
        // Modifier bits do not disturb the type field.
        assert_eq!(
            MessageType::from_bits(flag::URGENT | 1),
            Some(MessageType::Response)
        );
    }

    #[test]
    fn ack_types() {
        assert_eq!(MessageType::Request.ack_type(), MessageType::AckRequest);
        assert_eq!(MessageType::Response.ack_type(), MessageType::AckResponse);
        assert_eq!(MessageType::Error.ack_type(), MessageType::AckResponse);
        assert!(MessageType::AckRequest.is_ack());
        assert!(MessageType::AckResponse.is_ack());
        assert!(!MessageType::Request.is_ack());
    }
}
