//! The BLIP connection multiplexer.
//!
//! A connection owns a WebSocket engine over some byte stream and multiplexes
//! any number of request/response exchanges across it. Internally it is an
//! actor: one tokio task owns every queue, map and counter, and everything
//! else talks to it through a mailbox. Two further tasks move bytes: a reader
//! feeding the engine and a writer draining the frame channel into the
//! socket.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    mem,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    buffers::Chunk,
    codec::{BlipCodec, RCodec, WCodec},
    error::{MessageError, ProtocolError, SendError},
    message::{
        MessageBuilder, MessageIn, MessageOut, ProgressState, ReceiveState, send_progress,
    },
    protocol::{FRAME_SIZE, FrameHeader, MessageNo, MessageType},
    sync::{Batcher, Channel},
    websocket::{
        CloseReason, CloseStatus, EngineDelegate, Transport, WebSocketEngine, status,
    },
};

/// How long inbound frames may sit in the batcher before the actor is woken.
const FRAME_BATCH_LATENCY: Duration = Duration::from_millis(1);

/// Batched inbound frames that force an immediate actor wakeup.
const FRAME_BATCH_CAPACITY: usize = 64;

/// Read buffer handed to the socket.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Handler invoked for completed inbound requests, keyed by their `Profile`
/// property.
pub type Handler = Arc<dyn Fn(Request) + Send + Sync>;

type ReplyResult = Result<Arc<MessageIn>, SendError>;

/// A completed inbound request handed to a handler, with the connection to
/// answer on.
pub struct Request {
    message: Arc<MessageIn>,
    conn: Connection,
}

impl Request {
    /// The received message.
    pub fn message(&self) -> &Arc<MessageIn> {
        &self.message
    }

    /// The connection the request arrived on.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Sends `builder` back as this request's response.
    pub fn respond(&self, builder: MessageBuilder) {
        self.message.respond(&self.conn, builder);
    }

    /// Answers with an ERROR-type response.
    pub fn respond_with_error(&self, err: MessageError) {
        self.message.respond_with_error(&self.conn, err);
    }

    /// Answers with the standard 404 error.
    pub fn not_handled(&self) {
        self.message.not_handled(&self.conn);
    }
}

/// Resolves with the peer's response to a sent request.
pub struct ResponseFuture(oneshot::Receiver<ReplyResult>);

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture").finish_non_exhaustive()
    }
}

impl Future for ResponseFuture {
    type Output = ReplyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SendError::Closed)))
    }
}

/// Cheaply cloneable handle submitting work to a connection actor.
#[derive(Clone)]
pub struct Connection {
    tx: mpsc::UnboundedSender<Input>,
    closed: Arc<AtomicBool>,
    close_status: watch::Receiver<Option<CloseStatus>>,
}

impl Connection {
    /// Submits a request message. Non-blocking: the message is queued and
    /// framed by the connection actor.
    ///
    /// Returns `Some` future resolving with the peer's response, or `None`
    /// for no-reply messages. Submitting a non-request this way is local
    /// misuse: it is logged and ignored.
    pub fn send(&self, builder: MessageBuilder) -> Result<Option<ResponseFuture>, SendError> {
        if builder.message_type() != MessageType::Request {
            tracing::warn!("Connection::send expects a request; use respond() for responses");
            return Ok(None);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        let (reply, future) = if builder.expects_reply() {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(ResponseFuture(rx)))
        } else {
            (None, None)
        };
        self.tx
            .send(Input::Send {
                builder,
                number: None,
                reply,
            })
            .map_err(|_| SendError::Closed)?;
        Ok(future)
    }

    /// Sends a response bearing the number of the request it answers.
    pub(crate) fn send_response(
        &self,
        number: MessageNo,
        builder: MessageBuilder,
    ) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.tx
            .send(Input::Send {
                builder,
                number: Some(number),
                reply: None,
            })
            .map_err(|_| SendError::Closed)
    }

    /// Initiates a graceful shutdown: a CLOSE goes out, the peer's echo is
    /// awaited, then the transport is closed. Subsequent sends fail.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), SendError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SendError::Closed);
        }
        self.tx
            .send(Input::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| SendError::Closed)
    }

    /// True once the connection no longer accepts messages.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has fully shut down, with the reason.
    pub async fn closed(&self) -> CloseStatus {
        let mut rx = self.close_status.clone();
        loop {
            {
                let value = rx.borrow_and_update();
                if let Some(status) = value.as_ref() {
                    return status.clone();
                }
            }
            if rx.changed().await.is_err() {
                // Actor died without reporting; synthesize an abnormal close.
                return CloseStatus {
                    reason: CloseReason::WebSocket,
                    code: status::ABNORMAL as i32,
                    message: String::new(),
                };
            }
        }
    }
}

/// Background tasks of one connection.
pub struct ConnectionTask {
    actor: JoinHandle<()>,
    token: CancellationToken,
}

impl ConnectionTask {
    /// Tears the connection down and returns a handle to await the actor's
    /// exit. In-flight messages fail with a terminal progress state.
    pub fn stop(self) -> JoinHandle<()> {
        self.token.cancel();
        self.actor
    }
}

/// Starts building a connection over `io`.
pub fn connect<S>(io: S) -> ConnectionBuilder<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    ConnectionBuilder {
        io,
        handlers: HashMap::new(),
        default_handler: None,
        frame_size: FRAME_SIZE,
    }
}

/// Builder for a [`Connection`] and its background tasks.
pub struct ConnectionBuilder<S> {
    io: S,
    handlers: HashMap<String, Handler>,
    default_handler: Option<Handler>,
    frame_size: usize,
}

impl<S> ConnectionBuilder<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Registers a handler for requests bearing `Profile: <profile>`.
    #[must_use]
    pub fn on_request(
        mut self,
        profile: &str,
        handler: impl Fn(Request) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(profile.to_string(), Arc::new(handler));
        self
    }

    /// Registers the fallback handler for requests with no matching profile.
    /// Without one, unmatched requests are answered with a 404 error.
    #[must_use]
    pub fn on_default(mut self, handler: impl Fn(Request) + Send + Sync + 'static) -> Self {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    /// Caps the payload bytes per BLIP frame. Values above the protocol
    /// default are clamped.
    #[must_use]
    pub fn frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size.clamp(1, FRAME_SIZE);
        self
    }

    /// Spawns the connection: the actor plus its socket reader and writer.
    pub fn build(self) -> (Connection, ConnectionTask) {
        let Self {
            io,
            handlers,
            default_handler,
            frame_size,
        } = self;

        let token = CancellationToken::new();
        let outbox = Arc::new(Channel::new());
        let engine = Arc::new(WebSocketEngine::new(TokioTransport {
            outbox: outbox.clone(),
            token: token.clone(),
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        let frames = Batcher::new(FRAME_BATCH_LATENCY, FRAME_BATCH_CAPACITY, {
            let tx = tx.clone();
            move || {
                let _ = tx.send(Input::Frames);
            }
        });
        engine.set_delegate(ActorDelegate {
            tx: tx.clone(),
            frames: frames.clone(),
        });

        let (closed_tx, closed_rx) = watch::channel(None);
        let closed_flag = Arc::new(AtomicBool::new(false));
        let handle = Connection {
            tx,
            closed: closed_flag.clone(),
            close_status: closed_rx,
        };

        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(write_task(
            outbox.clone(),
            write_half,
            engine.clone(),
            token.clone(),
        ));
        tokio::spawn(read_task(
            read_half,
            engine.clone(),
            token.clone(),
            outbox.clone(),
        ));

        let actor = Actor {
            engine,
            rx,
            frames,
            handle: handle.clone(),
            handlers,
            default_handler,
            frame_size,
            writeable: true,
            closing: false,
            next_number: MessageNo::FIRST,
            last_inbound: MessageNo::new(0),
            urgent: VecDeque::new(),
            normal: VecDeque::new(),
            incoming: HashMap::new(),
            pending: HashMap::new(),
            closed_tx,
            closed_flag,
            token: token.clone(),
            outbox,
        };
        let actor_handle = tokio::spawn(actor.run());

        (
            handle,
            ConnectionTask {
                actor: actor_handle,
                token,
            },
        )
    }
}

/// The engine's view of the socket: frames out through the channel, close by
/// stopping both IO tasks.
struct TokioTransport {
    outbox: Arc<Channel<Chunk>>,
    token: CancellationToken,
}

impl Transport for TokioTransport {
    fn send_bytes(&self, frame: Chunk) {
        self.outbox.push(frame);
    }

    fn receive_complete(&self, _byte_count: usize) {
        // Reads are not paced; the per-message ack window is the flow control.
    }

    fn close_socket(&self) {
        // The writer drains the outbox before the halves drop.
        self.outbox.close();
        self.token.cancel();
    }
}

/// Forwards engine events into the actor mailbox.
struct ActorDelegate {
    tx: mpsc::UnboundedSender<Input>,
    frames: Batcher<Chunk>,
}

impl EngineDelegate for ActorDelegate {
    fn on_message(&self, message: Chunk, binary: bool) {
        if binary {
            self.frames.push(message);
        } else {
            tracing::debug!("ignoring text message on BLIP connection");
        }
    }

    fn on_writeable(&self) {
        let _ = self.tx.send(Input::Writeable);
    }

    fn on_close(&self, status: CloseStatus) {
        let _ = self.tx.send(Input::SocketClosed(status));
    }
}

async fn write_task<S>(
    outbox: Arc<Channel<Chunk>>,
    mut writer: WriteHalf<S>,
    engine: Arc<WebSocketEngine>,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    while let Some(frame) = outbox.pop().await {
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => engine.on_write_complete(frame.len()),
            Err(err) => {
                tracing::debug!(%err, "socket write failed");
                token.cancel();
                outbox.close();
                engine.on_socket_close(err.raw_os_error().unwrap_or(0));
                return;
            }
        }
    }
}

async fn read_task<S>(
    mut reader: ReadHalf<S>,
    engine: Arc<WebSocketEngine>,
    token: CancellationToken,
    outbox: Arc<Channel<Chunk>>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let err_no = loop {
        tokio::select! {
            _ = token.cancelled() => break 0,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break 0,
                Ok(n) => {
                    if let Err(err) = engine.on_receive(&mut buf[..n]) {
                        tracing::warn!(%err, "websocket protocol error; disconnecting");
                        // Tell the peer, flush, then force the disconnect:
                        // the byte stream is no longer trustworthy.
                        engine.close(status::PROTOCOL_ERROR, &err.to_string());
                        token.cancel();
                        outbox.close();
                        break 0;
                    }
                }
                Err(err) => break err.raw_os_error().unwrap_or(0),
            },
        }
    };
    engine.on_socket_close(err_no);
}

enum Input {
    Send {
        builder: MessageBuilder,
        number: Option<MessageNo>,
        reply: Option<oneshot::Sender<ReplyResult>>,
    },
    Close {
        code: u16,
        reason: String,
    },
    Frames,
    Writeable,
    SocketClosed(CloseStatus),
}

struct PendingResponse {
    message: Arc<MessageIn>,
    reply: Option<oneshot::Sender<ReplyResult>>,
}

struct Actor {
    engine: Arc<WebSocketEngine>,
    rx: mpsc::UnboundedReceiver<Input>,
    frames: Batcher<Chunk>,
    handle: Connection,
    handlers: HashMap<String, Handler>,
    default_handler: Option<Handler>,
    frame_size: usize,
    writeable: bool,
    closing: bool,
    /// Next outbound message number to assign.
    next_number: MessageNo,
    /// Highest inbound request number seen, for orphan-ACK detection.
    last_inbound: MessageNo,
    urgent: VecDeque<MessageOut>,
    normal: VecDeque<MessageOut>,
    /// In-progress inbound requests by number.
    incoming: HashMap<MessageNo, Arc<MessageIn>>,
    /// Responses awaited for outbound requests, registered before the
    /// request's first frame reaches the wire.
    pending: HashMap<MessageNo, PendingResponse>,
    closed_tx: watch::Sender<Option<CloseStatus>>,
    closed_flag: Arc<AtomicBool>,
    token: CancellationToken,
    outbox: Arc<Channel<Chunk>>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            // Drain the mailbox first so inbound routing and acks are never
            // starved by a long send queue.
            loop {
                match self.rx.try_recv() {
                    Ok(input) => {
                        if self.handle_input(input) {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }

            if self.writeable && self.send_next_frame() {
                continue;
            }

            match self.rx.recv().await {
                Some(input) => {
                    if self.handle_input(input) {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    /// Returns true when the actor is done.
    fn handle_input(&mut self, input: Input) -> bool {
        match input {
            Input::Send {
                builder,
                number,
                reply,
            } => {
                self.submit(builder, number, reply);
                false
            }
            Input::Frames => {
                for frame in self.frames.pop() {
                    if let Err(err) = self.received_frame(frame) {
                        tracing::warn!(%err, "protocol error; closing connection");
                        self.closed_flag.store(true, Ordering::Release);
                        self.closing = true;
                        self.engine.close(status::PROTOCOL_ERROR, &err.to_string());
                        break;
                    }
                }
                false
            }
            Input::Writeable => {
                self.writeable = true;
                false
            }
            Input::Close { code, reason } => {
                self.closing = true;
                self.engine.close(code, &reason);
                false
            }
            Input::SocketClosed(status) => {
                self.cleanup(status);
                true
            }
        }
    }

    fn submit(
        &mut self,
        builder: MessageBuilder,
        number: Option<MessageNo>,
        reply: Option<oneshot::Sender<ReplyResult>>,
    ) {
        if self.closing {
            if let Some(reply) = reply {
                let _ = reply.send(Err(SendError::Closed));
            }
            return;
        }
        let flags = builder.frame_flags();
        let payload = match builder.serialize() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%err, "dropping unserializable message");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
                return;
            }
        };
        let callback = builder.on_progress;
        let number = number.unwrap_or_else(|| {
            let n = self.next_number;
            self.next_number = n.next();
            n
        });
        let message = MessageOut::new(number, flags, payload, callback.clone());
        send_progress(&callback, ProgressState::Queued, 0, 0, None);

        // Register the response placeholder before any frame can go out.
        if let Some(placeholder) = message.create_response() {
            self.pending.insert(
                number,
                PendingResponse {
                    message: placeholder,
                    reply,
                },
            );
        }
        tracing::debug!(
            message = %number,
            message_type = ?flags.message_type(),
            urgent = message.urgent(),
            "queued outbound message"
        );
        if message.urgent() {
            self.urgent.push_back(message);
        } else {
            self.normal.push_back(message);
        }
    }

    /// Emits at most one frame: urgent queue first, round-robin within a
    /// queue, messages with a full unacked window skipped.
    fn send_next_frame(&mut self) -> bool {
        let use_urgent = self.urgent.iter().any(|m| m.eligible());
        let mut message = {
            let queue = if use_urgent {
                &mut self.urgent
            } else {
                &mut self.normal
            };
            let Some(index) = queue.iter().position(|m| m.eligible()) else {
                return false;
            };
            match queue.remove(index) {
                Some(message) => message,
                None => return false,
            }
        };

        let (frame, flags) = message.next_frame_to_send(self.frame_size);
        let codec = BlipCodec::new();
        let header = FrameHeader {
            number: message.number(),
            flags,
        };
        let mut wire: Vec<u8> = Vec::with_capacity(frame.len() + 11);
        // Vec<u8> writes are infallible.
        codec.write(&mut wire, &header).unwrap();
        wire.extend_from_slice(frame.as_slice());
        self.writeable = self.engine.send(&wire, true);

        if message.finished() {
            // Requests expecting a reply were moved to `pending` at submit;
            // everything else is done now.
            tracing::trace!(message = %message.number(), "message fully sent");
        } else {
            let queue = if use_urgent {
                &mut self.urgent
            } else {
                &mut self.normal
            };
            queue.push_back(message);
        }
        true
    }

    fn received_frame(&mut self, frame: Chunk) -> Result<(), ProtocolError> {
        let codec = BlipCodec::new();
        let mut frame = frame;
        let header: FrameHeader = codec
            .read(&mut frame)
            .map_err(|_| ProtocolError::FrameTooSmall)?;
        let message_type = header
            .flags
            .message_type()
            .ok_or(ProtocolError::InvalidFrameType)?;

        if message_type.is_ack() {
            let byte_count: u64 = codec
                .read(&mut frame)
                .map_err(|_| ProtocolError::FrameTooSmall)?;
            return self.received_ack(header.number, message_type, byte_count);
        }

        if message_type.is_response() {
            let message = self
                .pending
                .get(&header.number)
                .map(|p| p.message.clone())
                .ok_or(ProtocolError::OrphanResponse)?;
            let outcome = message.received_frame(frame, header.flags)?;
            if let Some(ack) = outcome.ack {
                self.urgent.push_back(ack);
            }
            if outcome.state == ReceiveState::End
                && let Some(pending) = self.pending.remove(&header.number)
                && let Some(reply) = pending.reply
            {
                let _ = reply.send(Ok(message));
            }
        } else {
            self.last_inbound = self.last_inbound.max(header.number);
            let message = self
                .incoming
                .entry(header.number)
                .or_insert_with(|| Arc::new(MessageIn::incoming(header.number)))
                .clone();
            let outcome = message.received_frame(frame, header.flags)?;
            if let Some(ack) = outcome.ack {
                self.urgent.push_back(ack);
            }
            if outcome.state == ReceiveState::End {
                self.incoming.remove(&header.number);
                self.dispatch(message);
            }
        }
        Ok(())
    }

    fn received_ack(
        &mut self,
        number: MessageNo,
        ack_type: MessageType,
        byte_count: u64,
    ) -> Result<(), ProtocolError> {
        let acks_request = ack_type == MessageType::AckRequest;
        for message in self.urgent.iter_mut().chain(self.normal.iter_mut()) {
            let matches = message.number() == number
                && message.message_type().is_some_and(|t| {
                    if acks_request {
                        t == MessageType::Request
                    } else {
                        t.is_response()
                    }
                });
            if matches {
                message.received_ack(byte_count);
                return Ok(());
            }
        }
        // Not in flight. Acks racing a just-finished send are normal; acks
        // for numbers never used in that direction are not.
        let known = if acks_request {
            number < self.next_number
        } else {
            number <= self.last_inbound
        };
        if known {
            tracing::trace!(message = %number, "ack for finished message ignored");
            Ok(())
        } else {
            Err(ProtocolError::OrphanAck)
        }
    }

    fn dispatch(&mut self, message: Arc<MessageIn>) {
        let profile = message.profile();
        let handler = profile
            .as_deref()
            .and_then(|p| self.handlers.get(p))
            .or(self.default_handler.as_ref())
            .cloned();
        tracing::debug!(
            message = %message.number(),
            profile = profile.as_deref().unwrap_or(""),
            matched = handler.is_some(),
            "dispatching request"
        );
        match handler {
            Some(handler) => {
                let request = Request {
                    message,
                    conn: self.handle.clone(),
                };
                // Handler panics must not leave the actor.
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(request))) {
                    tracing::error!(?panic, "request handler panicked");
                }
            }
            None => message.not_handled(&self.handle),
        }
    }

    fn cleanup(&mut self, status: CloseStatus) {
        tracing::info!(?status, "connection closed");
        self.closed_flag.store(true, Ordering::Release);
        self.closing = true;

        // Terminal progress for everything still in flight, once per message.
        let queued: Vec<MessageNo> = self
            .urgent
            .iter()
            .chain(self.normal.iter())
            .filter(|m| m.expects_reply())
            .map(|m| m.number())
            .collect();
        for message in self.urgent.drain(..).chain(self.normal.drain(..)) {
            message.fail();
        }
        for (number, pending) in mem::take(&mut self.pending) {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(SendError::Closed));
            }
            if !queued.contains(&number) {
                pending.message.fail();
            }
        }
        self.incoming.clear();

        let _ = self.closed_tx.send(Some(status));
        self.token.cancel();
        self.outbox.close();
    }
}
