use crate::auth::StoreError;
use crate::config::ConfigError;
use crate::lifecycle::ConnectError;
use crate::session::NegotiationError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("local store: {0}")]
    Store(#[from] StoreError),
    #[error("session negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("{0}")]
    Connect(#[from] ConnectError),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("http client setup failed: {0}")]
    Http(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid output: {0}")]
    Output(#[from] serde_json::Error),
}
