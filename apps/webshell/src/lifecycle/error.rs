use crate::session::NegotiationError;
use crate::transport::ChannelError;
use std::sync::Arc;
use thiserror::Error;

/// Outcome of a `connect()`/`reconnect()` call. Cloneable so every joined
/// caller gets the same answer.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("please log in to use WebShell")]
    AuthRequired,
    #[error(transparent)]
    Negotiation(Arc<NegotiationError>),
    #[error(transparent)]
    Channel(Arc<ChannelError>),
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("connection controller has shut down")]
    Closed,
}

impl ConnectError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConnectError::Cancelled)
    }
}
