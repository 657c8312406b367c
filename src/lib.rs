//! Blipwire: a bidirectional binary messaging protocol ("BLIP") multiplexed
//! over client-side WebSocket framing.
//!
//! BLIP runs many logical request/response exchanges over one reliable,
//! ordered transport. Messages are sliced into frames of at most 4 KiB,
//! interleaved fairly across in-flight messages, and flow-controlled per
//! message through explicit acknowledgements, so one large transfer never
//! blocks an urgent one behind it.
//!
//! # Overview
//!
//! ```text
//!  APPLICATION                        caller code  :
//! ┌───────────────┐ send()   ┌─────────────────┐   :
//! │ MessageBuilder│ ───────▶ │ Connection actor│   :
//! └───────────────┘          │  urgent ░░      │   :
//!      handlers ◀─────────── │  normal ░░░░░   │   :
//!                 dispatch   └───────┬─────────┘   :
//!                                    ▼ frames ≤4KiB:
//!                            ┌─────────────────┐   :
//!                            │ WebSocket engine│   :
//!                            └───────┬─────────┘   :
//!                                    ▼ bytes       :
//!                                 transport        :
//! ```
//!
//! A message is properties (a tokenised, NUL-separated block) plus a body,
//! optionally gzip-compressed. Requests dispatch to handlers by their
//! `Profile` property; responses resolve the future returned by
//! [`Connection::send`]. Every 50 kB received of one message, a dedicated
//! urgent ACK message flows back, and a sender stops scheduling a message
//! once 128 KiB are in flight unacknowledged.
//!
//! # Quick start
//!
//! ```no_run
//! use blipwire::MessageBuilder;
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Any AsyncRead + AsyncWrite transport works; BLIP assumes the
//!     // WebSocket upgrade already happened.
//!     let stream = TcpStream::connect("127.0.0.1:4984").await?;
//!
//!     let (conn, _task) = blipwire::connect(stream)
//!         .on_request("echo", |req| {
//!             let body = req.message().body().map(|b| b.to_vec()).unwrap_or_default();
//!             req.respond(MessageBuilder::response().body(body));
//!         })
//!         .build();
//!
//!     let response = conn
//!         .send(MessageBuilder::request().profile("greet").body(b"hi".to_vec()))?
//!         .expect("replies expected")
//!         .await?;
//!     println!("reply: {:?}", response.body());
//!
//!     conn.close(1000, "done")?;
//!     Ok(())
//! }
//! ```
mod buffers;
mod codec;
mod connection;
mod error;
mod message;
mod protocol;
mod sync;
pub mod websocket;

pub use buffers::{Chunk, DynBuf};
pub use connection::{
    Connection, ConnectionBuilder, ConnectionTask, Handler, Request, ResponseFuture, connect,
};
pub use error::{MessageError, ProtocolError, SendError};
pub use message::{MessageBuilder, MessageIn, Progress, ProgressCallback, ProgressState};
pub use protocol::{MessageNo, MessageSize, MessageType};
pub use websocket::{CloseReason, CloseStatus};
