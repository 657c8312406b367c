pub(crate) mod builder;
pub(crate) mod inbound;
pub(crate) mod outbound;

pub use builder::MessageBuilder;
pub use inbound::MessageIn;
pub(crate) use inbound::ReceiveState;
pub(crate) use outbound::MessageOut;

use std::sync::Arc;

use crate::protocol::MessageSize;

/// Where a message stands in its lifecycle, as reported to progress
/// callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// Accepted by the connection, not yet on the wire.
    Queued,
    /// Frames are going out; more remain.
    Sending,
    /// Fully sent; a reply is expected.
    AwaitingReply,
    /// Frames of the reply are arriving.
    ReceivingReply,
    /// Terminal: sent (and, where expected, answered).
    Complete,
    /// Terminal: the connection closed before completion.
    Error,
}

/// A progress report for one message.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub state: ProgressState,
    pub bytes_sent: MessageSize,
    pub bytes_received: MessageSize,
}

/// Callback observing a message's progress. The second argument carries the
/// inbound message once its properties are readable, so a handler may start
/// inspecting them before the body finishes.
pub type ProgressCallback = Arc<dyn Fn(Progress, Option<&Arc<MessageIn>>) + Send + Sync>;

pub(crate) fn send_progress(
    callback: &Option<ProgressCallback>,
    state: ProgressState,
    bytes_sent: MessageSize,
    bytes_received: MessageSize,
    reply: Option<&Arc<MessageIn>>,
) {
    if let Some(callback) = callback {
        callback(
            Progress {
                state,
                bytes_sent,
                bytes_received,
            },
            reply,
        );
    }
}
