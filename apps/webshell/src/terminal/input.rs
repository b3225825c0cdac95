use super::{InputEvent, LocalCommand};
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// Byte sent for a literal `Ctrl+]` (group separator).
pub const PREFIX_BYTE: u8 = 0x1d;
pub const INTERRUPT_BYTE: u8 = 0x03;

/// What the shortcut layer decided about a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    Event(InputEvent),
    /// Swallowed locally (chord prefix, unknown chord key, key release).
    Consumed,
    /// Not a shortcut; the surface handles it.
    Pass,
}

/// Local shortcuts shared by every keyboard-driven surface: Ctrl+C, Ctrl+L
/// and the `Ctrl+]` prefix chord.
#[derive(Debug, Default)]
pub struct Shortcuts {
    armed: bool,
}

impl Shortcuts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn intercept(&mut self, key: &KeyEvent) -> KeyOutcome {
        if key.kind == KeyEventKind::Release {
            return KeyOutcome::Consumed;
        }
        if self.armed {
            self.armed = false;
            if is_prefix(key) {
                return KeyOutcome::Event(InputEvent::Data(vec![PREFIX_BYTE]));
            }
            let command = match key.code {
                KeyCode::Char(c) => match c.to_ascii_lowercase() {
                    'c' => Some(LocalCommand::Connect),
                    'r' => Some(LocalCommand::Reconnect),
                    'd' => Some(LocalCommand::Disconnect),
                    'q' => Some(LocalCommand::Quit),
                    _ => None,
                },
                _ => None,
            };
            return match command {
                Some(command) => KeyOutcome::Event(InputEvent::Command(command)),
                None => KeyOutcome::Consumed,
            };
        }
        if is_prefix(key) {
            self.armed = true;
            return KeyOutcome::Consumed;
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('c') | KeyCode::Char('C') => {
                    return KeyOutcome::Event(InputEvent::Interrupt);
                }
                KeyCode::Char('l') | KeyCode::Char('L') => {
                    return KeyOutcome::Event(InputEvent::ClearView);
                }
                _ => {}
            }
        }
        KeyOutcome::Pass
    }
}

// Some terminals report Ctrl+] as Ctrl+5.
fn is_prefix(key: &KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char(']') | KeyCode::Char('5'))
}

/// Raw-mode key translation: shortcuts first, then the xterm byte encoding.
#[derive(Debug, Default)]
pub struct KeyTranslator {
    shortcuts: Shortcuts,
}

impl KeyTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, key: KeyEvent) -> Option<InputEvent> {
        match self.shortcuts.intercept(&key) {
            KeyOutcome::Event(event) => Some(event),
            KeyOutcome::Consumed => None,
            KeyOutcome::Pass => encode_key_event(key).map(InputEvent::Data),
        }
    }
}

pub fn encode_key_event(key: KeyEvent) -> Option<Vec<u8>> {
    match key.code {
        KeyCode::Char(c) => {
            let mut bytes = Vec::new();
            if key.modifiers.contains(KeyModifiers::ALT) {
                bytes.push(0x1b);
            }
            if key.modifiers.contains(KeyModifiers::CONTROL) {
                bytes.push(control_byte(c)?);
            } else {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            Some(bytes)
        }
        KeyCode::Enter => Some(vec![b'\r']),
        KeyCode::Tab => Some(vec![b'\t']),
        KeyCode::BackTab => Some(b"\x1b[Z".to_vec()),
        KeyCode::Backspace => Some(vec![0x7f]),
        KeyCode::Esc => Some(vec![0x1b]),
        KeyCode::Up => Some(b"\x1b[A".to_vec()),
        KeyCode::Down => Some(b"\x1b[B".to_vec()),
        KeyCode::Right => Some(b"\x1b[C".to_vec()),
        KeyCode::Left => Some(b"\x1b[D".to_vec()),
        KeyCode::Home => Some(b"\x1b[H".to_vec()),
        KeyCode::End => Some(b"\x1b[F".to_vec()),
        KeyCode::PageUp => Some(b"\x1b[5~".to_vec()),
        KeyCode::PageDown => Some(b"\x1b[6~".to_vec()),
        KeyCode::Delete => Some(b"\x1b[3~".to_vec()),
        KeyCode::Insert => Some(b"\x1b[2~".to_vec()),
        KeyCode::F(n) => function_key(n),
        _ => None,
    }
}

fn control_byte(c: char) -> Option<u8> {
    let lower = c.to_ascii_lowercase();
    if lower.is_ascii_lowercase() {
        return Some((lower as u8 - b'a') + 1);
    }
    match c {
        ' ' | '@' | '2' => Some(0x00),
        '[' | '3' => Some(0x1b),
        '\\' | '4' => Some(0x1c),
        ']' | '5' => Some(0x1d),
        '^' | '6' => Some(0x1e),
        '_' | '7' | '/' => Some(0x1f),
        _ => None,
    }
}

fn function_key(n: u8) -> Option<Vec<u8>> {
    let seq: &[u8] = match n {
        1 => b"\x1bOP",
        2 => b"\x1bOQ",
        3 => b"\x1bOR",
        4 => b"\x1bOS",
        5 => b"\x1b[15~",
        6 => b"\x1b[17~",
        7 => b"\x1b[18~",
        8 => b"\x1b[19~",
        9 => b"\x1b[20~",
        10 => b"\x1b[21~",
        11 => b"\x1b[23~",
        12 => b"\x1b[24~",
        _ => return None,
    };
    Some(seq.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    fn ctrl(c: char) -> KeyEvent {
        key(KeyCode::Char(c), KeyModifiers::CONTROL)
    }

    fn plain(c: char) -> KeyEvent {
        key(KeyCode::Char(c), KeyModifiers::NONE)
    }

    #[test]
    fn encodes_printable_and_navigation_keys() {
        assert_eq!(encode_key_event(plain('a')), Some(b"a".to_vec()));
        assert_eq!(encode_key_event(plain('é')), Some("é".as_bytes().to_vec()));
        assert_eq!(
            encode_key_event(key(KeyCode::Char('x'), KeyModifiers::ALT)),
            Some(b"\x1bx".to_vec())
        );
        assert_eq!(
            encode_key_event(key(KeyCode::Enter, KeyModifiers::NONE)),
            Some(b"\r".to_vec())
        );
        assert_eq!(
            encode_key_event(key(KeyCode::Up, KeyModifiers::NONE)),
            Some(b"\x1b[A".to_vec())
        );
        assert_eq!(
            encode_key_event(key(KeyCode::F(5), KeyModifiers::NONE)),
            Some(b"\x1b[15~".to_vec())
        );
        assert_eq!(encode_key_event(ctrl('d')), Some(vec![0x04]));
        assert_eq!(encode_key_event(ctrl('[')), Some(vec![0x1b]));
        assert_eq!(encode_key_event(ctrl('!')), None);
    }

    #[test]
    fn ctrl_c_and_ctrl_l_are_local_shortcuts() {
        let mut translator = KeyTranslator::new();
        assert_eq!(translator.translate(ctrl('c')), Some(InputEvent::Interrupt));
        assert_eq!(translator.translate(ctrl('l')), Some(InputEvent::ClearView));
        assert_eq!(
            InputEvent::Interrupt.forwarded_bytes(),
            Some(vec![INTERRUPT_BYTE])
        );
    }

    #[test]
    fn prefix_chord_issues_local_commands() {
        let mut translator = KeyTranslator::new();
        let cases = [
            ('c', LocalCommand::Connect),
            ('r', LocalCommand::Reconnect),
            ('d', LocalCommand::Disconnect),
            ('q', LocalCommand::Quit),
        ];
        for (c, command) in cases {
            assert_eq!(translator.translate(ctrl(']')), None);
            assert_eq!(
                translator.translate(plain(c)),
                Some(InputEvent::Command(command))
            );
        }
    }

    #[test]
    fn double_prefix_sends_literal_byte() {
        let mut translator = KeyTranslator::new();
        assert_eq!(translator.translate(ctrl(']')), None);
        assert_eq!(
            translator.translate(ctrl(']')),
            Some(InputEvent::Data(vec![PREFIX_BYTE]))
        );
        assert_eq!(translator.translate(plain('d')), Some(InputEvent::Data(b"d".to_vec())));
    }

    #[test]
    fn unknown_chord_key_is_swallowed_and_disarms() {
        let mut translator = KeyTranslator::new();
        translator.translate(ctrl(']'));
        assert_eq!(translator.translate(plain('x')), None);
        assert_eq!(translator.translate(plain('x')), Some(InputEvent::Data(b"x".to_vec())));
    }

    #[test]
    fn releases_are_ignored() {
        let mut shortcuts = Shortcuts::new();
        let mut release = plain('a');
        release.kind = KeyEventKind::Release;
        assert_eq!(shortcuts.intercept(&release), KeyOutcome::Consumed);
        assert!(!shortcuts.is_armed());
    }
}
