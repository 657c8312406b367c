//! Transport-agnostic client-side WebSocket engine.
//!
//! The engine knows how to encode and decode RFC 6455 frames and to run the
//! closing handshake; it does not own a socket. Bytes move through a
//! [`Transport`] capability object, and decoded events are reported to an
//! [`EngineDelegate`]. All engine state lives under one mutex, which is
//! always released before a delegate or transport call.

pub(crate) mod frame;

use std::{
    mem,
    sync::{Mutex, OnceLock},
};

use crate::{buffers::Chunk, error::ProtocolError};

use frame::{Fragment, FrameParser, opcode};
pub use frame::status;

/// Largest WebSocket message the engine will accept.
pub(crate) const MAX_MESSAGE_LENGTH: u64 = 1 << 20;

/// Buffered-bytes level above which `send` stops reporting writeability.
pub(crate) const SEND_BUFFER_SIZE: usize = 64 * 1024;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed at the WebSocket layer; `code` is a WebSocket status code.
    WebSocket,
    /// Closed by the transport; `code` is a POSIX errno.
    Posix,
}

/// The outward-facing record describing why the connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub reason: CloseReason,
    pub code: i32,
    pub message: String,
}

/// The byte-moving capabilities the engine is constructed over.
pub trait Transport: Send + Sync + 'static {
    /// Hands a fully framed message to the transport for writing.
    fn send_bytes(&self, frame: Chunk);
    /// Reports that the engine has consumed `byte_count` inbound bytes.
    fn receive_complete(&self, byte_count: usize);
    /// Requests the transport to close the underlying socket.
    fn close_socket(&self);
}

/// Receiver of decoded engine events.
pub trait EngineDelegate: Send + Sync + 'static {
    /// A complete TEXT or BINARY message arrived.
    fn on_message(&self, message: Chunk, binary: bool);
    /// The buffered-bytes level dropped back below the send buffer size.
    fn on_writeable(&self);
    /// The socket closed; fired exactly once.
    fn on_close(&self, status: CloseStatus);
}

struct MessageBuffer {
    data: Vec<u8>,
    capacity: usize,
}

struct EngineState {
    parser: FrameParser,
    message: Option<MessageBuffer>,
    message_opcode: u8,
    control: Vec<u8>,
    buffered_bytes: usize,
    bytes_sent: u64,
    bytes_received: u64,
    close_sent: bool,
    close_received: bool,
    close_message: Option<Vec<u8>>,
    socket_closed: bool,
}

/// Work recorded under the state mutex and performed after releasing it.
enum Action {
    Deliver(Vec<u8>, bool),
    SendPong(Vec<u8>),
    EchoClose(Vec<u8>),
    RequestClose,
}

pub struct WebSocketEngine {
    state: Mutex<EngineState>,
    transport: Box<dyn Transport>,
    delegate: OnceLock<Box<dyn EngineDelegate>>,
}

impl WebSocketEngine {
    pub fn new(transport: impl Transport) -> Self {
        Self {
            state: Mutex::new(EngineState {
                parser: FrameParser::new(MAX_MESSAGE_LENGTH),
                message: None,
                message_opcode: 0,
                control: Vec::new(),
                buffered_bytes: 0,
                bytes_sent: 0,
                bytes_received: 0,
                close_sent: false,
                close_received: false,
                close_message: None,
                socket_closed: false,
            }),
            transport: Box::new(transport),
            delegate: OnceLock::new(),
        }
    }

    /// Installs the delegate. Must be called before any bytes are fed in;
    /// events raised without a delegate are dropped.
    pub fn set_delegate(&self, delegate: impl EngineDelegate) {
        if self.delegate.set(Box::new(delegate)).is_err() {
            tracing::warn!("websocket delegate already installed");
        }
    }

    fn with_delegate(&self, f: impl FnOnce(&dyn EngineDelegate)) {
        match self.delegate.get() {
            Some(delegate) => f(delegate.as_ref()),
            None => tracing::debug!("websocket event dropped: no delegate"),
        }
    }

    /// Frames and sends a TEXT or BINARY message.
    ///
    /// Returns `false` when the caller has lost its back-pressure guarantee:
    /// either the buffered-bytes level exceeds [`SEND_BUFFER_SIZE`] (the
    /// message is still sent, and `on_writeable` fires when the level
    /// recovers) or a close is already in flight (the message is dropped).
    pub fn send(&self, message: &[u8], binary: bool) -> bool {
        self.send_op(message, if binary { opcode::BINARY } else { opcode::TEXT })
    }

    fn send_op(&self, message: &[u8], op: u8) -> bool {
        let (wire, writeable) = {
            let mut state = self.state.lock().unwrap();
            if state.close_sent && op != opcode::CLOSE {
                return false;
            }
            let mask: [u8; 4] = rand::random();
            let wire = frame::format_message(message, op, mask);
            state.buffered_bytes += wire.len();
            let writeable = state.buffered_bytes <= SEND_BUFFER_SIZE;
            (wire, writeable)
        };
        self.transport.send_bytes(Chunk::from(wire));
        writeable
    }

    /// Initiates (or completes) the closing handshake.
    ///
    /// Idempotent: a second call, or a call after the peer's CLOSE was
    /// received, is a no-op.
    pub fn close(&self, code: u16, message: &str) {
        let payload = {
            let mut state = self.state.lock().unwrap();
            if state.close_sent || state.close_received {
                return;
            }
            state.close_sent = true;
            let payload = frame::format_close_payload(code, message.as_bytes());
            state.close_message = Some(payload.clone());
            payload
        };
        tracing::debug!(code, message, "requesting close");
        self.send_op(&payload, opcode::CLOSE);
    }

    /// Feeds raw transport bytes into the frame decoder.
    ///
    /// The buffer is unmasked in place when the peer masks. An error means
    /// the stream is unrecoverable; the caller must close the connection
    /// with [`status::PROTOCOL_ERROR`].
    pub fn on_receive(&self, data: &mut [u8]) -> Result<(), ProtocolError> {
        let mut actions: Vec<Action> = Vec::new();
        let result = {
            let mut state = self.state.lock().unwrap();
            state.bytes_received += data.len() as u64;
            let mut parser = mem::take(&mut state.parser);
            let result = parser.consume(data, &mut |fragment| {
                Self::handle_fragment(&mut state, fragment, &mut actions)
            });
            state.parser = parser;
            result
        };

        for action in actions {
            match action {
                Action::Deliver(message, binary) => {
                    self.with_delegate(|d| d.on_message(Chunk::from(message), binary));
                }
                Action::SendPong(payload) => {
                    self.send_op(&payload, opcode::PONG);
                }
                Action::EchoClose(payload) => {
                    self.state.lock().unwrap().close_sent = true;
                    self.send_op(&payload, opcode::CLOSE);
                }
                Action::RequestClose => {
                    tracing::debug!("close confirmed by peer; disconnecting socket");
                    self.transport.close_socket();
                }
            }
        }
        self.transport.receive_complete(data.len());
        result
    }

    fn handle_fragment(
        state: &mut EngineState,
        fragment: Fragment<'_>,
        actions: &mut Vec<Action>,
    ) -> Result<(), ProtocolError> {
        if fragment.opcode & 0x8 != 0 {
            // Control frame; may interleave with a data message.
            state.control.extend_from_slice(fragment.data);
            if fragment.remaining == 0 {
                let payload = mem::take(&mut state.control);
                match fragment.opcode {
                    opcode::CLOSE => Self::received_close(state, payload, actions)?,
                    opcode::PING => actions.push(Action::SendPong(payload)),
                    opcode::PONG => {}
                    _ => return Err(ProtocolError::BadWebSocketFrame),
                }
            }
            return Ok(());
        }

        if state.message.is_none() {
            let capacity = fragment.data.len() + fragment.remaining as usize;
            state.message_opcode = fragment.opcode;
            state.message = Some(MessageBuffer {
                data: Vec::with_capacity(capacity),
                capacity,
            });
        }
        let Some(buffer) = state.message.as_mut() else {
            return Err(ProtocolError::BadWebSocketFrame);
        };
        if buffer.data.len() + fragment.data.len() > buffer.capacity {
            return Err(ProtocolError::MessageOverflow);
        }
        buffer.data.extend_from_slice(fragment.data);

        if fragment.fin && fragment.remaining == 0 {
            // Ownership of the buffer moves into the delivery.
            let message = state.message.take().map(|b| b.data).unwrap_or_default();
            match state.message_opcode {
                opcode::TEXT => {
                    if std::str::from_utf8(&message).is_err() {
                        return Err(ProtocolError::InvalidUtf8);
                    }
                    actions.push(Action::Deliver(message, false));
                }
                opcode::BINARY => actions.push(Action::Deliver(message, true)),
                _ => return Err(ProtocolError::BadWebSocketFrame),
            }
        }
        Ok(())
    }

    fn received_close(
        state: &mut EngineState,
        payload: Vec<u8>,
        actions: &mut Vec<Action>,
    ) -> Result<(), ProtocolError> {
        if state.close_received {
            return Err(ProtocolError::BadWebSocketFrame);
        }
        state.close_received = true;
        if state.close_sent {
            // We initiated; the peer has confirmed.
            actions.push(Action::RequestClose);
        } else {
            // Peer is initiating. Remember its payload and echo it.
            let (code, message) = frame::parse_close_payload(&payload);
            tracing::debug!(
                code,
                message = %String::from_utf8_lossy(message),
                "peer requested close; echoing"
            );
            state.close_message = Some(payload.clone());
            actions.push(Action::EchoClose(payload));
        }
        Ok(())
    }

    /// Reports that the transport finished writing `size` bytes.
    pub fn on_write_complete(&self, size: usize) {
        let (notify, disconnect) = {
            let mut state = self.state.lock().unwrap();
            state.bytes_sent += size as u64;
            let mut notify = state.buffered_bytes > SEND_BUFFER_SIZE;
            state.buffered_bytes = state.buffered_bytes.saturating_sub(size);
            if state.buffered_bytes > SEND_BUFFER_SIZE {
                notify = false;
            }
            let disconnect =
                state.close_sent && state.close_received && state.buffered_bytes == 0;
            (notify, disconnect)
        };

        if disconnect {
            tracing::debug!("close handshake flushed; disconnecting socket");
            self.transport.close_socket();
        } else if notify {
            self.with_delegate(|d| d.on_writeable());
        }
    }

    /// Reports that the underlying socket closed; `err_no` is zero for a
    /// clean shutdown. Computes the [`CloseStatus`] and fires `on_close`
    /// exactly once.
    pub fn on_socket_close(&self, err_no: i32) {
        let status = {
            let mut state = self.state.lock().unwrap();
            if state.socket_closed {
                return;
            }
            state.socket_closed = true;

            if !(state.close_sent && state.close_received) && err_no == 0 {
                tracing::debug!("unexpected socket disconnect");
            }
            tracing::debug!(
                bytes_sent = state.bytes_sent,
                bytes_received = state.bytes_received,
                err_no,
                "socket closed"
            );

            if err_no == 0 {
                let (code, message) = if !state.close_sent || !state.close_received {
                    (status::ABNORMAL, String::new())
                } else {
                    match state.close_message.take() {
                        None => (status::NORMAL, String::new()),
                        Some(payload) => {
                            let (code, message) = frame::parse_close_payload(&payload);
                            let code = if code == 0 {
                                status::STATUS_CODE_EXPECTED
                            } else {
                                code
                            };
                            (code, String::from_utf8_lossy(message).into_owned())
                        }
                    }
                };
                CloseStatus {
                    reason: CloseReason::WebSocket,
                    code: code as i32,
                    message,
                }
            } else {
                CloseStatus {
                    reason: CloseReason::Posix,
                    code: err_no,
                    message: String::new(),
                }
            }
        };
        self.with_delegate(|d| d.on_close(status));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Chunk>>,
        closed_socket: Mutex<bool>,
        messages: Mutex<Vec<(Vec<u8>, bool)>>,
        writeable: Mutex<usize>,
        close_status: Mutex<Option<CloseStatus>>,
    }

    impl Transport for Arc<Recorder> {
        fn send_bytes(&self, frame: Chunk) {
            self.sent.lock().unwrap().push(frame);
        }
        fn receive_complete(&self, _byte_count: usize) {}
        fn close_socket(&self) {
            *self.closed_socket.lock().unwrap() = true;
        }
    }

    impl EngineDelegate for Arc<Recorder> {
        fn on_message(&self, message: Chunk, binary: bool) {
            self.messages.lock().unwrap().push((message.to_vec(), binary));
        }
        fn on_writeable(&self) {
            *self.writeable.lock().unwrap() += 1;
        }
        fn on_close(&self, status: CloseStatus) {
            *self.close_status.lock().unwrap() = Some(status);
        }
    }

    fn engine() -> (WebSocketEngine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let engine = WebSocketEngine::new(recorder.clone());
        engine.set_delegate(recorder.clone());
        (engine, recorder)
    }

    fn unframe(wire: &[u8]) -> (u8, Vec<u8>) {
        // Client frames from this engine: FIN + opcode, masked 7-bit length.
        let op = wire[0] & 0x0f;
        let len = (wire[1] & 0x7f) as usize;
        assert!(len < 126, "test helper only handles short frames");
        let mask = &wire[2..6];
        let payload = wire[6..6 + len]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i & 3])
            .collect();
        (op, payload)
    }

    #[test]
    fn send_frames_and_masks() {
        let (engine, recorder) = engine();
        assert!(engine.send(b"hello", true));
        let sent = recorder.sent.lock().unwrap();
        let (op, payload) = unframe(&sent[0]);
        assert_eq!(op, opcode::BINARY);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn receive_binary_message() {
        let (engine, recorder) = engine();
        let mut wire = vec![0x80 | opcode::BINARY, 3, 1, 2, 3];
        engine.on_receive(&mut wire).unwrap();
        let messages = recorder.messages.lock().unwrap();
        assert_eq!(messages.as_slice(), &[(vec![1, 2, 3], true)]);
    }

    #[test]
    fn invalid_utf8_text_is_protocol_error() {
        let (engine, recorder) = engine();
        let mut wire = vec![0x80 | opcode::TEXT, 2, 0xff, 0xfe];
        assert_eq!(
            engine.on_receive(&mut wire).unwrap_err(),
            ProtocolError::InvalidUtf8
        );
        assert!(recorder.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn ping_is_echoed_as_pong() {
        let (engine, recorder) = engine();
        let mut wire = vec![0x80 | opcode::PING, 4];
        wire.extend_from_slice(b"ab\x00c");
        engine.on_receive(&mut wire).unwrap();
        let sent = recorder.sent.lock().unwrap();
        let (op, payload) = unframe(&sent[0]);
        assert_eq!(op, opcode::PONG);
        assert_eq!(payload, b"ab\x00c");
    }

    #[test]
    fn close_is_idempotent() {
        let (engine, recorder) = engine();
        engine.close(status::NORMAL, "bye");
        engine.close(status::NORMAL, "bye again");
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1, "exactly one CLOSE frame");
        let (op, payload) = unframe(&sent[0]);
        assert_eq!(op, opcode::CLOSE);
        let (code, message) = frame::parse_close_payload(&payload);
        assert_eq!(code, status::NORMAL);
        assert_eq!(message, b"bye");
    }

    #[test]
    fn close_handshake_as_initiator() {
        let (engine, recorder) = engine();
        engine.close(status::NORMAL, "bye");
        let close_len = recorder.sent.lock().unwrap()[0].len();
        engine.on_write_complete(close_len);
        assert!(!*recorder.closed_socket.lock().unwrap());

        // Peer echoes our close.
        let mut echo = vec![0x80 | opcode::CLOSE, 5];
        echo.extend_from_slice(&frame::format_close_payload(status::NORMAL, b"bye"));
        engine.on_receive(&mut echo).unwrap();
        assert!(*recorder.closed_socket.lock().unwrap());

        engine.on_socket_close(0);
        let status = recorder.close_status.lock().unwrap().clone().unwrap();
        assert_eq!(status.reason, CloseReason::WebSocket);
        assert_eq!(status.code, status::NORMAL as i32);
        assert_eq!(status.message, "bye");
    }

    #[test]
    fn close_handshake_as_receiver() {
        let (engine, recorder) = engine();
        let mut wire = vec![0x80 | opcode::CLOSE, 6];
        wire.extend_from_slice(&frame::format_close_payload(status::GOING_AWAY, b"nite"));
        engine.on_receive(&mut wire).unwrap();

        // We echoed the peer's payload.
        let (op, payload) = unframe(&recorder.sent.lock().unwrap()[0]);
        assert_eq!(op, opcode::CLOSE);
        let (code, message) = frame::parse_close_payload(&payload);
        assert_eq!(code, status::GOING_AWAY);
        assert_eq!(message, b"nite");

        engine.on_socket_close(0);
        let status = recorder.close_status.lock().unwrap().clone().unwrap();
        assert_eq!(status.reason, CloseReason::WebSocket);
        assert_eq!(status.code, status::GOING_AWAY as i32);
        assert_eq!(status.message, "nite");
    }

    #[test]
    fn abnormal_disconnect() {
        let (engine, recorder) = engine();
        engine.on_socket_close(0);
        let status = recorder.close_status.lock().unwrap().clone().unwrap();
        assert_eq!(status.reason, CloseReason::WebSocket);
        assert_eq!(status.code, status::ABNORMAL as i32);
    }

    #[test]
    fn posix_disconnect() {
        let (engine, recorder) = engine();
        engine.on_socket_close(104);
        let status = recorder.close_status.lock().unwrap().clone().unwrap();
        assert_eq!(status.reason, CloseReason::Posix);
        assert_eq!(status.code, 104);
    }

    #[test]
    fn socket_close_fires_once() {
        let (engine, recorder) = engine();
        engine.on_socket_close(104);
        *recorder.close_status.lock().unwrap() = None;
        engine.on_socket_close(0);
        assert!(recorder.close_status.lock().unwrap().is_none());
    }

    #[test]
    fn send_after_close_is_dropped() {
        let (engine, recorder) = engine();
        engine.close(status::NORMAL, "");
        assert!(!engine.send(b"late", true));
        assert_eq!(recorder.sent.lock().unwrap().len(), 1); // only the CLOSE
    }

    #[test]
    fn writeable_notification_on_recovery() {
        let (engine, recorder) = engine();
        let big = vec![0u8; SEND_BUFFER_SIZE];
        assert!(!engine.send(&big, true), "exceeds the send buffer");
        let buffered: usize = recorder.sent.lock().unwrap().iter().map(|c| c.len()).sum();
        engine.on_write_complete(buffered);
        assert_eq!(*recorder.writeable.lock().unwrap(), 1);
        // Already below the limit: no further notification.
        assert!(engine.send(b"x", true));
        engine.on_write_complete(recorder.sent.lock().unwrap()[1].len());
        assert_eq!(*recorder.writeable.lock().unwrap(), 1);
    }
}
