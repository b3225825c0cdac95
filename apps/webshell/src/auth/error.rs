use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to determine home directory")]
    NoHomeDirectory,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Toml(String),
    #[error("entry '{key}' holds a {found}, expected a string")]
    InvalidEntry { key: String, found: &'static str },
}

impl From<toml::de::Error> for StoreError {
    fn from(value: toml::de::Error) -> Self {
        StoreError::Toml(value.to_string())
    }
}

impl From<toml::ser::Error> for StoreError {
    fn from(value: toml::ser::Error) -> Self {
        StoreError::Toml(value.to_string())
    }
}
