use super::{InputEvent, TerminalSurface};
use crate::lifecycle::ConnectionState;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Screen {
    content: String,
    writes: Vec<String>,
    clears: usize,
    disposals: usize,
    states: Vec<ConnectionState>,
}

/// Surface that records everything in memory; the paired handle inspects it
/// and injects input.
pub struct MemorySurface {
    screen: Arc<Mutex<Screen>>,
    input: Option<mpsc::UnboundedReceiver<InputEvent>>,
}

#[derive(Clone)]
pub struct MemorySurfaceHandle {
    screen: Arc<Mutex<Screen>>,
    tx: mpsc::UnboundedSender<InputEvent>,
}

impl MemorySurface {
    pub fn new() -> (Self, MemorySurfaceHandle) {
        let screen = Arc::new(Mutex::new(Screen::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                screen: screen.clone(),
                input: Some(rx),
            },
            MemorySurfaceHandle { screen, tx },
        )
    }
}

impl TerminalSurface for MemorySurface {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn write(&mut self, text: &str) {
        let mut screen = self.screen.lock();
        screen.content.push_str(text);
        screen.writes.push(text.to_string());
    }

    fn clear(&mut self) {
        let mut screen = self.screen.lock();
        screen.content.clear();
        screen.clears += 1;
    }

    fn dispose(&mut self) {
        self.screen.lock().disposals += 1;
    }

    fn take_input(&mut self) -> Option<mpsc::UnboundedReceiver<InputEvent>> {
        self.input.take()
    }

    fn on_state(&mut self, state: ConnectionState) {
        self.screen.lock().states.push(state);
    }
}

impl MemorySurfaceHandle {
    /// Everything written since the last clear.
    pub fn content(&self) -> String {
        self.screen.lock().content.clone()
    }

    /// Every write ever made, clears included.
    pub fn writes(&self) -> Vec<String> {
        self.screen.lock().writes.clone()
    }

    pub fn clears(&self) -> usize {
        self.screen.lock().clears
    }

    pub fn disposals(&self) -> usize {
        self.screen.lock().disposals
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        self.screen.lock().states.clone()
    }

    pub fn type_input(&self, event: InputEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}
