//! Raw mode, terminal size and key translation for the attach loop.

use anyhow::{Context, Result};
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;

/// Restores cooked mode on drop.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Current terminal size as (columns, rows); (80, 24) when unknown.
pub fn size() -> (u16, u16) {
    terminal::size().unwrap_or((80, 24))
}

/// What the attach loop does with one terminal event.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Bytes(Vec<u8>),
    Resize(u16, u16),
    Detach,
}

pub fn classify(event: Event) -> Option<Input> {
    match event {
        Event::Key(key) if key.kind != KeyEventKind::Release => {
            if is_detach(&key) {
                Some(Input::Detach)
            } else {
                key_to_bytes(&key).map(Input::Bytes)
            }
        }
        Event::Paste(text) => Some(Input::Bytes(text.into_bytes())),
        Event::Resize(cols, rows) => Some(Input::Resize(cols, rows)),
        _ => None,
    }
}

/// Whether `event` is the detach chord (Ctrl+]).
pub fn is_detach(event: &KeyEvent) -> bool {
    event.modifiers.contains(KeyModifiers::CONTROL) && event.code == KeyCode::Char(']')
}

/// C0 control byte for Ctrl+`c`, following the xterm conventions for the
/// punctuation and digit aliases.
fn control_byte(c: char) -> Option<u8> {
    match c {
        'a'..='z' => Some(c as u8 - b'a' + 1),
        'A'..='Z' => Some(c as u8 - b'A' + 1),
        ' ' | '@' | '2' => Some(0x00),
        '[' | '3' => Some(0x1b),
        '\\' | '4' => Some(0x1c),
        ']' | '5' => Some(0x1d),
        '^' | '6' => Some(0x1e),
        '_' | '7' | '/' => Some(0x1f),
        '8' | '?' => Some(0x7f),
        _ => None,
    }
}

/// Bytes a PTY expects for `event`, if it produces any.
pub fn key_to_bytes(event: &KeyEvent) -> Option<Vec<u8>> {
    let seq: &[u8] = match event.code {
        KeyCode::Char(c) => {
            if event.modifiers.contains(KeyModifiers::CONTROL) {
                if let Some(byte) = control_byte(c) {
                    return Some(vec![byte]);
                }
            }
            let mut buf = [0u8; 4];
            let mut out = Vec::with_capacity(5);
            if event.modifiers.contains(KeyModifiers::ALT) {
                out.push(0x1b);
            }
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            return Some(out);
        }
        KeyCode::Enter => b"\r",
        KeyCode::Backspace => b"\x7f",
        KeyCode::Tab => b"\t",
        KeyCode::BackTab => b"\x1b[Z",
        KeyCode::Esc => b"\x1b",
        KeyCode::Up => b"\x1b[A",
        KeyCode::Down => b"\x1b[B",
        KeyCode::Right => b"\x1b[C",
        KeyCode::Left => b"\x1b[D",
        KeyCode::Home => b"\x1b[H",
        KeyCode::End => b"\x1b[F",
        KeyCode::PageUp => b"\x1b[5~",
        KeyCode::PageDown => b"\x1b[6~",
        KeyCode::Insert => b"\x1b[2~",
        KeyCode::Delete => b"\x1b[3~",
        KeyCode::F(n) => match n {
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
        },
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

    #[test]
    fn control_letters_map_to_c0() {
        assert_eq!(
            key_to_bytes(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(vec![0x03])
        );
        assert_eq!(
            key_to_bytes(&key(KeyCode::Char('A'), KeyModifiers::CONTROL)),
            Some(vec![0x01])
        );
    }

    #[test]
    fn control_punctuation_maps_to_c0() {
        let ctrl = |c| key_to_bytes(&key(KeyCode::Char(c), KeyModifiers::CONTROL));
        assert_eq!(ctrl(' '), Some(vec![0x00]));
        assert_eq!(ctrl('@'), Some(vec![0x00]));
        assert_eq!(ctrl('['), Some(vec![0x1b]));
        assert_eq!(ctrl('\\'), Some(vec![0x1c]));
        assert_eq!(ctrl(']'), Some(vec![0x1d]));
        assert_eq!(ctrl('_'), Some(vec![0x1f]));
        assert_eq!(ctrl('/'), Some(vec![0x1f]));
        // No control form: the plain character goes through.
        assert_eq!(ctrl('.'), Some(b".".to_vec()));
    }

    #[test]
    fn printable_and_special_keys() {
        assert_eq!(
            key_to_bytes(&key(KeyCode::Char('é'), KeyModifiers::NONE)),
            Some("é".as_bytes().to_vec())
        );
        assert_eq!(
            key_to_bytes(&key(KeyCode::Char('x'), KeyModifiers::ALT)),
            Some(b"\x1bx".to_vec())
        );
        assert_eq!(key_to_bytes(&key(KeyCode::Enter, KeyModifiers::NONE)), Some(b"\r".to_vec()));
        assert_eq!(key_to_bytes(&key(KeyCode::Up, KeyModifiers::NONE)), Some(b"\x1b[A".to_vec()));
        assert_eq!(key_to_bytes(&key(KeyCode::F(13), KeyModifiers::NONE)), None);
    }

    #[test]
    fn detach_chord() {
        assert!(is_detach(&key(KeyCode::Char(']'), KeyModifiers::CONTROL)));
        assert!(!is_detach(&key(KeyCode::Char(']'), KeyModifiers::NONE)));
    }

    #[test]
    fn events_classify_for_the_attach_loop() {
        let ctrl_bracket = key(KeyCode::Char(']'), KeyModifiers::CONTROL);
        assert_eq!(classify(Event::Key(ctrl_bracket)), Some(Input::Detach));
        assert_eq!(
            classify(Event::Key(key(KeyCode::Enter, KeyModifiers::NONE))),
            Some(Input::Bytes(b"\r".to_vec()))
        );
        let mut release = key(KeyCode::Char('a'), KeyModifiers::NONE);
        release.kind = KeyEventKind::Release;
        assert_eq!(classify(Event::Key(release)), None);
        assert_eq!(
            classify(Event::Paste("ls -la".into())),
            Some(Input::Bytes(b"ls -la".to_vec()))
        );
        assert_eq!(classify(Event::Resize(120, 40)), Some(Input::Resize(120, 40)));
        assert_eq!(classify(Event::FocusGained), None);
    }

    #[test]
    fn size_is_nonzero() {
        let (cols, rows) = size();
        assert!(cols > 0 && rows > 0);
    }
}
