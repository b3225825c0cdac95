//! Connection lifecycle: a pure state machine plus the task that runs it
//! against a negotiator, a channel factory and a terminal surface.

pub mod controller;
pub mod error;
pub mod machine;
pub mod state;

pub use controller::{Controller, ControllerConfig, ControllerHandle, Wiring};
pub use error::ConnectError;
pub use machine::{Effect, Event, Machine, MachineConfig};
pub use state::{ConnectionState, Indicator, MAX_RETRIES, Notice, NoticeLevel, Status};
