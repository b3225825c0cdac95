use super::{InputEvent, TerminalSurface};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Plain-text fallback: escape sequences are stripped from output and stdin
/// is read line by line, each line sent with a trailing `\r`.
pub struct PlainSurface {
    stop: Arc<AtomicBool>,
    input: Option<mpsc::UnboundedReceiver<InputEvent>>,
}

impl PlainSurface {
    pub fn create() -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let flag = stop.clone();
        // stdin reads cannot be interrupted, so the thread is left detached.
        thread::Builder::new()
            .name("webshell-stdin".into())
            .spawn(move || {
                let stdin = io::stdin();
                for line in stdin.lock().lines() {
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    let line = match line {
                        Ok(line) => line,
                        Err(err) => {
                            warn!(target: "webshell::terminal", error = %err, "stdin read failed");
                            break;
                        }
                    };
                    if tx.send(InputEvent::Data(format!("{line}\r").into_bytes())).is_err() {
                        break;
                    }
                }
                debug!(target: "webshell::terminal", "stdin reader finished");
            })?;
        Ok(Self {
            stop,
            input: Some(rx),
        })
    }
}

impl TerminalSurface for PlainSurface {
    fn kind(&self) -> &'static str {
        "plain"
    }

    fn write(&mut self, text: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(strip_ansi(text).as_bytes());
        let _ = stdout.flush();
    }

    fn clear(&mut self) {
        let _ = io::stdout().lock().write_all(b"\n");
    }

    fn dispose(&mut self) {
        self.stop.store(true, Ordering::Release);
    }

    fn take_input(&mut self) -> Option<mpsc::UnboundedReceiver<InputEvent>> {
        self.input.take()
    }
}

/// Drops CSI, OSC and two-byte escape sequences and bare carriage returns
/// that precede a newline.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.next() {
                Some('[') => {
                    for c in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            },
            '\r' if chars.peek() == Some(&'\n') => {}
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_colour_and_cursor_sequences() {
        assert_eq!(strip_ansi("\x1b[32mok\x1b[0m\r\n"), "ok\n");
        assert_eq!(strip_ansi("\x1b[2J\x1b[Hprompt$ "), "prompt$ ");
    }

    #[test]
    fn strips_title_sequences() {
        assert_eq!(strip_ansi("\x1b]0;user@host\x07$ "), "$ ");
        assert_eq!(strip_ansi("\x1b]2;t\x1b\\x"), "x");
    }

    #[test]
    fn keeps_plain_text_and_lone_carriage_returns() {
        assert_eq!(strip_ansi("progress 10%\rprogress 20%"), "progress 10%\rprogress 20%");
        assert_eq!(strip_ansi("中文"), "中文");
    }
}
