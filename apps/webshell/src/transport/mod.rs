use crate::session::Session;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod address;
pub mod decode;
pub mod guard;
pub mod mock;
pub mod websocket;

pub use guard::{ChannelPhase, OpenGuard};

/// RFC 6455 normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported locally when the peer vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound payload, forwarded to the socket verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Terminal input goes out as a text frame when it is valid UTF-8, which
    /// is what the dashboard's own terminal page sends.
    pub fn from_input(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Payload::Text(text),
            Err(err) => Payload::Binary(err.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a channel reports to its consumer once open.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Decoded terminal output, in arrival order.
    Data(String),
    /// The peer closed the socket. `code` is `None` when no status was sent.
    Closed { code: Option<u16>, reason: String },
    /// The socket failed after the handshake.
    Failed(ChannelError),
}

impl ChannelEvent {
    pub fn is_normal_close(&self) -> bool {
        matches!(self, ChannelEvent::Closed { code: Some(NORMAL_CLOSURE), .. })
    }
}

/// The single registered consumer of a channel's events.
pub type Consumer = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connection timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("websocket connection failed: {0}")]
    Handshake(String),
    #[error("websocket error: {0}")]
    Socket(String),
    #[error("connection lost (code {code}){}", if reason.is_empty() { String::new() } else { format!(": {reason}") })]
    AbnormalClose { code: u16, reason: String },
    #[error("channel closed before the handshake completed")]
    Cancelled,
    #[error("channel was already opened")]
    AlreadyOpened,
    #[error("invalid terminal address: {0}")]
    InvalidAddress(String),
}

/// One duplex byte stream bound to one session.
///
/// A channel is single use: `open` may be called once, `close` any number of
/// times. Closing settles an in-flight `open` with `ChannelError::Cancelled`.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn open(&self, session: &Session) -> Result<(), ChannelError>;

    /// Dropped silently unless the channel is open.
    fn send(&self, payload: Payload);

    fn close(&self, code: u16);

    fn is_open(&self) -> bool;
}

/// Mints a fresh channel wired to `consumer`.
pub trait ChannelFactory: Send + Sync {
    fn create(&self, consumer: Consumer) -> Arc<dyn TransportChannel>;
}
