use crate::lifecycle::ConnectionState;
use crate::session::Session;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub mod input;
pub mod line_mode;
pub mod memory;
pub mod plain;
pub mod tty;

pub use memory::{MemorySurface, MemorySurfaceHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCommand {
    Connect,
    Disconnect,
    Reconnect,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// Bytes for the remote shell.
    Data(Vec<u8>),
    /// Ctrl+C.
    Interrupt,
    /// Ctrl+L: clears the local view only.
    ClearView,
    Command(LocalCommand),
}

impl InputEvent {
    /// Bytes this event puts on the wire, if any.
    pub fn forwarded_bytes(&self) -> Option<Vec<u8>> {
        match self {
            InputEvent::Data(bytes) => Some(bytes.clone()),
            InputEvent::Interrupt => Some(vec![input::INTERRUPT_BYTE]),
            InputEvent::ClearView | InputEvent::Command(_) => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InitializationError {
    #[error("terminal surface is not ready yet")]
    NotReady,
    #[error("terminal surface unavailable: {0}")]
    Failed(String),
}

pub trait TerminalSurface: Send {
    fn kind(&self) -> &'static str;

    fn write(&mut self, text: &str);

    fn clear(&mut self);

    fn dispose(&mut self);

    /// The input stream; handed out once.
    fn take_input(&mut self) -> Option<mpsc::UnboundedReceiver<InputEvent>>;

    fn on_state(&mut self, _state: ConnectionState) {}
}

pub trait SurfaceFactory: Send {
    fn create(&mut self) -> Result<Box<dyn TerminalSurface>, InitializationError>;
}

impl<F> SurfaceFactory for F
where
    F: FnMut() -> Result<Box<dyn TerminalSurface>, InitializationError> + Send,
{
    fn create(&mut self) -> Result<Box<dyn TerminalSurface>, InitializationError> {
        self()
    }
}

/// Retry schedule for factories that report `NotReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitRetry {
    pub delay: Duration,
    pub attempts: u32,
}

impl Default for InitRetry {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(100),
            attempts: 20,
        }
    }
}

/// Owns the one surface of a controller, created on first need and disposed
/// exactly once.
pub struct TerminalAdapter {
    factory: Box<dyn SurfaceFactory>,
    fallback: Option<Box<dyn SurfaceFactory>>,
    retry: InitRetry,
    surface: Option<Box<dyn TerminalSurface>>,
    attempted: bool,
    disposed: bool,
}

impl TerminalAdapter {
    pub fn new(factory: impl SurfaceFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            fallback: None,
            retry: InitRetry::default(),
            surface: None,
            attempted: false,
            disposed: false,
        }
    }

    pub fn with_fallback(mut self, fallback: impl SurfaceFactory + 'static) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    pub fn with_retry(mut self, retry: InitRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn surface_kind(&self) -> Option<&'static str> {
        self.surface.as_ref().map(|surface| surface.kind())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Creates the surface. On failure the fallback, if any, is installed
    /// and the primary error is still returned so the caller can report it.
    /// Later calls are no-ops.
    pub async fn initialize(&mut self) -> Result<(), InitializationError> {
        if self.attempted || self.disposed {
            return Ok(());
        }
        self.attempted = true;

        let mut tries = 0;
        let outcome = loop {
            tries += 1;
            match self.factory.create() {
                Ok(surface) => break Ok(surface),
                Err(InitializationError::NotReady) if tries < self.retry.attempts => {
                    trace!(target: "webshell::terminal", tries, "surface not ready, retrying");
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(err) => break Err(err),
            }
        };

        match outcome {
            Ok(surface) => {
                debug!(target: "webshell::terminal", kind = surface.kind(), "terminal surface ready");
                self.surface = Some(surface);
                Ok(())
            }
            Err(err) => {
                warn!(target: "webshell::terminal", error = %err, tries, "terminal surface failed");
                if let Some(fallback) = self.fallback.as_mut() {
                    match fallback.create() {
                        Ok(surface) => {
                            debug!(target: "webshell::terminal", kind = surface.kind(), "using fallback surface");
                            self.surface = Some(surface);
                        }
                        Err(fallback_err) => {
                            warn!(target: "webshell::terminal", error = %fallback_err, "fallback surface failed");
                        }
                    }
                }
                Err(err)
            }
        }
    }

    pub fn take_input(&mut self) -> Option<mpsc::UnboundedReceiver<InputEvent>> {
        self.surface.as_mut()?.take_input()
    }

    pub fn write(&mut self, text: &str) {
        if let Some(surface) = self.surface.as_mut() {
            surface.write(text);
        }
    }

    pub fn clear(&mut self) {
        if let Some(surface) = self.surface.as_mut() {
            surface.clear();
        }
    }

    pub fn on_state(&mut self, state: ConnectionState) {
        if let Some(surface) = self.surface.as_mut() {
            surface.on_state(state);
        }
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(mut surface) = self.surface.take() {
            surface.dispose();
        }
    }
}

impl Drop for TerminalAdapter {
    fn drop(&mut self) {
        self.dispose();
    }
}

pub fn connected_banner(session: &Session) -> String {
    format!(
        "\x1b[32mConnected to {} (session {})\x1b[0m\r\n",
        session.display_name(),
        session.short_id()
    )
}

pub fn status_banner(message: &str) -> String {
    format!("\r\n\x1b[33m*** {message} ***\x1b[0m\r\n")
}
