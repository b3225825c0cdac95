pub mod app;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod session;
pub mod telemetry;
pub mod terminal;
pub mod transport;
