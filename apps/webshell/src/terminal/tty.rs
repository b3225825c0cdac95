use super::input::KeyTranslator;
use super::{InitializationError, InputEvent, TerminalSurface};
use crate::lifecycle::ConnectionState;
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyEvent, KeyEventKind};
use crossterm::{execute, queue};
use crossterm::terminal::{Clear, ClearType, SetTitle, disable_raw_mode, enable_raw_mode};
use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct RawModeGuard(());

impl RawModeGuard {
    pub fn enable() -> Result<Self, InitializationError> {
        enable_raw_mode().map_err(|err| {
            InitializationError::Failed(format!("failed to enable raw mode: {err}"))
        })?;
        Ok(Self(()))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Reads crossterm events on a dedicated thread until `stop` is raised or
/// the receiver goes away. Key presses go through `on_key`; pastes are
/// forwarded as data.
pub fn spawn_key_reader<F>(
    stop: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<InputEvent>,
    mut on_key: F,
) -> io::Result<thread::JoinHandle<()>>
where
    F: FnMut(KeyEvent) -> Option<InputEvent> + Send + 'static,
{
    thread::Builder::new()
        .name("webshell-input".into())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                match event::poll(POLL_INTERVAL) {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(err) => {
                        warn!(target: "webshell::terminal", error = %err, "input poll failed");
                        break;
                    }
                }
                let event = match event::read() {
                    Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => on_key(key),
                    Ok(Event::Paste(text)) => Some(InputEvent::Data(text.into_bytes())),
                    Ok(_) => None,
                    Err(err) => {
                        warn!(target: "webshell::terminal", error = %err, "input read failed");
                        break;
                    }
                };
                if let Some(event) = event {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            debug!(target: "webshell::terminal", "input reader stopped");
        })
}

enum Output {
    Text(String),
    Clear,
    Title(String),
}

/// Owns a blocking writer on its own thread so a slow terminal never stalls
/// the caller. Dropping the queue lets the thread drain and exit.
pub struct OutputWriter {
    queue: Option<mpsc::UnboundedSender<Output>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl OutputWriter {
    pub fn spawn<W>(mut sink: W) -> io::Result<Self>
    where
        W: Write + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Output>();
        let thread = thread::Builder::new()
            .name("webshell-output".into())
            .spawn(move || {
                while let Some(output) = rx.blocking_recv() {
                    let result = match output {
                        Output::Text(text) => sink.write_all(text.as_bytes()),
                        Output::Clear => queue!(sink, Clear(ClearType::All), MoveTo(0, 0)),
                        Output::Title(title) => queue!(sink, SetTitle(title)),
                    };
                    // Flush once per burst instead of once per frame.
                    let result = result.and_then(|()| {
                        if rx.is_empty() {
                            sink.flush()
                        } else {
                            Ok(())
                        }
                    });
                    if let Err(err) = result {
                        warn!(target: "webshell::terminal", error = %err, "terminal write failed");
                        break;
                    }
                }
                debug!(target: "webshell::terminal", "output writer stopped");
            })?;
        Ok(Self {
            queue: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn text(&self, text: &str) {
        self.push(Output::Text(text.to_string()));
    }

    pub fn clear(&self) {
        self.push(Output::Clear);
    }

    pub fn title(&self, title: String) {
        self.push(Output::Title(title));
    }

    fn push(&self, output: Output) {
        if let Some(queue) = &self.queue {
            let _ = queue.send(output);
        }
    }

    /// Waits for queued output to reach the sink.
    pub fn finish(&mut self) {
        self.queue.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The local terminal in raw mode; remote output is written as-is so the
/// host terminal does the emulation.
pub struct TtySurface {
    stop: Arc<AtomicBool>,
    input: Option<mpsc::UnboundedReceiver<InputEvent>>,
    reader: Option<thread::JoinHandle<()>>,
    output: OutputWriter,
    raw: Option<RawModeGuard>,
    title: String,
}

impl TtySurface {
    pub fn create(title: impl Into<String>) -> Result<Self, InitializationError> {
        if !io::stdin().is_terminal() || !io::stdout().is_terminal() {
            return Err(InitializationError::Failed(
                "stdin/stdout are not a terminal".into(),
            ));
        }
        let raw = RawModeGuard::enable()?;
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut translator = KeyTranslator::new();
        let output = OutputWriter::spawn(io::stdout())
            .map_err(|err| InitializationError::Failed(err.to_string()))?;
        let reader = spawn_key_reader(stop.clone(), tx, move |key| translator.translate(key))
            .map_err(|err| InitializationError::Failed(err.to_string()))?;
        Ok(Self {
            stop,
            input: Some(rx),
            reader: Some(reader),
            output,
            raw: Some(raw),
            title: title.into(),
        })
    }
}

impl TerminalSurface for TtySurface {
    fn kind(&self) -> &'static str {
        "tty"
    }

    fn write(&mut self, text: &str) {
        self.output.text(text);
    }

    fn clear(&mut self) {
        self.output.clear();
    }

    fn dispose(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.output.finish();
        self.raw.take();
        let _ = execute!(io::stdout(), SetTitle(""));
        debug!(target: "webshell::terminal", "tty surface disposed");
    }

    fn take_input(&mut self) -> Option<mpsc::UnboundedReceiver<InputEvent>> {
        self.input.take()
    }

    fn on_state(&mut self, state: ConnectionState) {
        self.output
            .title(format!("{} [{}]", self.title, state.label()));
    }
}

impl Drop for TtySurface {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
