use super::input::{KeyOutcome, Shortcuts};
use super::tty::{RawModeGuard, spawn_key_reader};
use super::{InitializationError, InputEvent, TerminalSurface};
use crate::lifecycle::ConnectionState;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use parking_lot::Mutex;
use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Unchanged,
    Redraw,
    /// A finished command, already terminated with `\r`.
    Submit(String),
}

/// Local line editor for surfaces without full emulation.
///
/// History is kept oldest first; ↑ walks back from the newest entry and ↓
/// past the newest clears the line.
#[derive(Debug, Default)]
pub struct LineEditor {
    buffer: String,
    cursor: usize,
    history: Vec<String>,
    index: Option<usize>,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&self) -> &str {
        &self.buffer
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// `connected` gates Enter: while offline the line stays in the editor.
    pub fn handle(&mut self, key: &KeyEvent, connected: bool) -> Edit {
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            return Edit::Unchanged;
        }
        match key.code {
            KeyCode::Enter => self.submit(connected),
            KeyCode::Char(c) => {
                self.buffer.insert(self.cursor, c);
                self.cursor += c.len_utf8();
                Edit::Redraw
            }
            KeyCode::Backspace => match self.prev_boundary() {
                Some(at) => {
                    self.buffer.remove(at);
                    self.cursor = at;
                    Edit::Redraw
                }
                None => Edit::Unchanged,
            },
            KeyCode::Delete if self.cursor < self.buffer.len() => {
                self.buffer.remove(self.cursor);
                Edit::Redraw
            }
            KeyCode::Left => match self.prev_boundary() {
                Some(at) => {
                    self.cursor = at;
                    Edit::Redraw
                }
                None => Edit::Unchanged,
            },
            KeyCode::Right => match self.buffer[self.cursor..].chars().next() {
                Some(c) => {
                    self.cursor += c.len_utf8();
                    Edit::Redraw
                }
                None => Edit::Unchanged,
            },
            KeyCode::Home => {
                self.cursor = 0;
                Edit::Redraw
            }
            KeyCode::End => {
                self.cursor = self.buffer.len();
                Edit::Redraw
            }
            KeyCode::Esc => {
                self.set_line(String::new());
                self.index = None;
                Edit::Redraw
            }
            KeyCode::Up => self.older(),
            KeyCode::Down => self.newer(),
            _ => Edit::Unchanged,
        }
    }

    /// Escape sequence that repaints the edit line in place.
    pub fn render(&self) -> String {
        let mut out = format!("\r\x1b[2K{}", self.buffer);
        let tail = self.buffer[self.cursor..].chars().count();
        if tail > 0 {
            out.push_str(&format!("\x1b[{tail}D"));
        }
        out
    }

    fn submit(&mut self, connected: bool) -> Edit {
        let trimmed = self.buffer.trim();
        if trimmed.is_empty() || !connected {
            return Edit::Unchanged;
        }
        if self.history.len() >= HISTORY_LIMIT {
            let excess = self.history.len() + 1 - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
        self.history.push(trimmed.to_string());
        self.index = None;
        let line = std::mem::take(&mut self.buffer);
        self.cursor = 0;
        Edit::Submit(format!("{line}\r"))
    }

    fn older(&mut self) -> Edit {
        if self.history.is_empty() {
            return Edit::Unchanged;
        }
        let index = match self.index {
            None => self.history.len() - 1,
            Some(index) => index.saturating_sub(1),
        };
        self.index = Some(index);
        self.set_line(self.history[index].clone());
        Edit::Redraw
    }

    fn newer(&mut self) -> Edit {
        let Some(index) = self.index else {
            return Edit::Unchanged;
        };
        if index + 1 >= self.history.len() {
            self.index = None;
            self.set_line(String::new());
        } else {
            self.index = Some(index + 1);
            self.set_line(self.history[index + 1].clone());
        }
        Edit::Redraw
    }

    fn set_line(&mut self, line: String) {
        self.buffer = line;
        self.cursor = self.buffer.len();
    }

    fn prev_boundary(&self) -> Option<usize> {
        self.buffer[..self.cursor]
            .char_indices()
            .next_back()
            .map(|(at, _)| at)
    }
}

/// Routes one key through the shortcuts and the editor.
fn line_key(
    shortcuts: &mut Shortcuts,
    editor: &mut LineEditor,
    key: &KeyEvent,
    connected: bool,
) -> (Option<InputEvent>, Option<String>) {
    match shortcuts.intercept(key) {
        KeyOutcome::Event(event) => (Some(event), None),
        KeyOutcome::Consumed => (None, None),
        KeyOutcome::Pass => match editor.handle(key, connected) {
            Edit::Unchanged => (None, None),
            Edit::Redraw => (None, Some(editor.render())),
            Edit::Submit(line) => (
                Some(InputEvent::Data(line.into_bytes())),
                Some(editor.render()),
            ),
        },
    }
}

struct Shared {
    editor: LineEditor,
    shortcuts: Shortcuts,
}

/// Tty surface with a local edit line under the remote output.
pub struct LineSurface {
    shared: Arc<Mutex<Shared>>,
    connected: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    input: Option<mpsc::UnboundedReceiver<InputEvent>>,
    reader: Option<std::thread::JoinHandle<()>>,
    raw: Option<RawModeGuard>,
}

impl LineSurface {
    pub fn create() -> Result<Self, InitializationError> {
        if !io::stdin().is_terminal() {
            return Err(InitializationError::Failed("stdin is not a terminal".into()));
        }
        let raw = RawModeGuard::enable()?;
        let shared = Arc::new(Mutex::new(Shared {
            editor: LineEditor::new(),
            shortcuts: Shortcuts::new(),
        }));
        let connected = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = {
            let shared = shared.clone();
            let connected = connected.clone();
            spawn_key_reader(stop.clone(), tx, move |key| {
                let mut shared = shared.lock();
                let Shared { editor, shortcuts } = &mut *shared;
                let (event, echo) =
                    line_key(shortcuts, editor, &key, connected.load(Ordering::Acquire));
                if let Some(echo) = echo {
                    let mut stdout = io::stdout().lock();
                    let _ = stdout.write_all(echo.as_bytes());
                    let _ = stdout.flush();
                }
                event
            })
        }
        .map_err(|err| InitializationError::Failed(err.to_string()))?;

        Ok(Self {
            shared,
            connected,
            stop,
            input: Some(rx),
            reader: Some(reader),
            raw: Some(raw),
        })
    }
}

impl TerminalSurface for LineSurface {
    fn kind(&self) -> &'static str {
        "line"
    }

    fn write(&mut self, text: &str) {
        let shared = self.shared.lock();
        let mut stdout = io::stdout().lock();
        // Lift the edit line, print output, put the line back.
        let _ = stdout.write_all(b"\r\x1b[2K");
        let _ = stdout.write_all(text.as_bytes());
        if !text.ends_with('\n') && !text.is_empty() {
            let _ = stdout.write_all(b"\r\n");
        }
        let _ = stdout.write_all(shared.editor.render().as_bytes());
        let _ = stdout.flush();
    }

    fn clear(&mut self) {
        let shared = self.shared.lock();
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(b"\x1b[2J\x1b[H");
        let _ = stdout.write_all(shared.editor.render().as_bytes());
        let _ = stdout.flush();
    }

    fn dispose(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.raw.take();
        debug!(target: "webshell::terminal", "line surface disposed");
    }

    fn take_input(&mut self) -> Option<mpsc::UnboundedReceiver<InputEvent>> {
        self.input.take()
    }

    fn on_state(&mut self, state: ConnectionState) {
        self.connected
            .store(state == ConnectionState::Connected, Ordering::Release);
    }
}

impl Drop for LineSurface {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn type_line(editor: &mut LineEditor, text: &str) {
        for c in text.chars() {
            editor.handle(&key(KeyCode::Char(c)), true);
        }
    }

    #[test]
    fn enter_sends_line_with_carriage_return() {
        let mut editor = LineEditor::new();
        type_line(&mut editor, "ls -la");
        assert_eq!(
            editor.handle(&key(KeyCode::Enter), true),
            Edit::Submit("ls -la\r".into())
        );
        assert_eq!(editor.line(), "");
        assert_eq!(editor.history(), &["ls -la".to_string()]);
    }

    #[test]
    fn blank_or_offline_lines_are_not_sent() {
        let mut editor = LineEditor::new();
        type_line(&mut editor, "   ");
        assert_eq!(editor.handle(&key(KeyCode::Enter), true), Edit::Unchanged);
        assert!(editor.history().is_empty());

        let mut editor = LineEditor::new();
        type_line(&mut editor, "uptime");
        assert_eq!(editor.handle(&key(KeyCode::Enter), false), Edit::Unchanged);
        assert_eq!(editor.line(), "uptime");
    }

    #[test]
    fn history_is_capped_at_fifty_entries() {
        let mut editor = LineEditor::new();
        for i in 0..60 {
            type_line(&mut editor, &format!("cmd{i}"));
            editor.handle(&key(KeyCode::Enter), true);
        }
        assert_eq!(editor.history().len(), HISTORY_LIMIT);
        assert_eq!(editor.history().first().map(String::as_str), Some("cmd10"));
        assert_eq!(editor.history().last().map(String::as_str), Some("cmd59"));
    }

    #[test]
    fn arrows_walk_history() {
        let mut editor = LineEditor::new();
        for cmd in ["one", "two", "three"] {
            type_line(&mut editor, cmd);
            editor.handle(&key(KeyCode::Enter), true);
        }
        editor.handle(&key(KeyCode::Up), true);
        assert_eq!(editor.line(), "three");
        editor.handle(&key(KeyCode::Up), true);
        editor.handle(&key(KeyCode::Up), true);
        editor.handle(&key(KeyCode::Up), true);
        assert_eq!(editor.line(), "one");
        editor.handle(&key(KeyCode::Down), true);
        assert_eq!(editor.line(), "two");
        editor.handle(&key(KeyCode::Down), true);
        editor.handle(&key(KeyCode::Down), true);
        assert_eq!(editor.line(), "");
        assert_eq!(editor.handle(&key(KeyCode::Down), true), Edit::Unchanged);
    }

    #[test]
    fn editing_respects_multibyte_characters() {
        let mut editor = LineEditor::new();
        type_line(&mut editor, "aé");
        editor.handle(&key(KeyCode::Left), true);
        type_line(&mut editor, "x");
        assert_eq!(editor.line(), "axé");
        editor.handle(&key(KeyCode::End), true);
        editor.handle(&key(KeyCode::Backspace), true);
        assert_eq!(editor.line(), "ax");
        assert_eq!(editor.render(), "\r\x1b[2Kax");
        editor.handle(&key(KeyCode::Home), true);
        assert_eq!(editor.render(), "\r\x1b[2Kax\x1b[2D");
    }

    #[test]
    fn shortcuts_take_precedence_over_editing() {
        let mut shortcuts = Shortcuts::new();
        let mut editor = LineEditor::new();
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        let (event, echo) = line_key(&mut shortcuts, &mut editor, &ctrl_c, true);
        assert_eq!(event, Some(InputEvent::Interrupt));
        assert!(echo.is_none());

        type_line(&mut editor, "df");
        let (event, echo) = line_key(&mut shortcuts, &mut editor, &key(KeyCode::Enter), true);
        assert_eq!(event, Some(InputEvent::Data(b"df\r".to_vec())));
        assert_eq!(echo.as_deref(), Some("\r\x1b[2K"));
    }
}
