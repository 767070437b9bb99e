use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use log::debug;

use crate::controller::{ControlEvent, KeyCmd};

/// Restores the terminal no matter how the session ends.
pub struct RawModeGuard;

impl RawModeGuard {
    pub fn enable() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Single-character command mapping. Raw mode swallows ctrl-c, so it has to
/// be caught here as a quit request.
fn key_to_cmd(key: &KeyEvent) -> Option<KeyCmd> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(KeyCmd::Quit),
        KeyCode::Char(c) => match c.to_ascii_lowercase() {
            'p' => Some(KeyCmd::ShowPayload),
            'g' => Some(KeyCmd::ShowParameters),
            's' => Some(KeyCmd::SlowDown),
            'f' => Some(KeyCmd::SpeedUp),
            'q' => Some(KeyCmd::Quit),
            _ => None,
        },
        KeyCode::Esc => Some(KeyCmd::Quit),
        _ => None,
    }
}

/// Polls the keyboard and forwards recognized keys as control events.
/// Enabling raw mode is the caller's job (see `RawModeGuard`).
pub fn spawn_keyboard(events: Sender<ControlEvent>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            match event::poll(Duration::from_millis(100)) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!("keyboard poll failed: {}", e);
                    return;
                }
            }
            let key = match event::read() {
                Ok(Event::Key(key)) => key,
                Ok(_) => continue,
                Err(e) => {
                    debug!("keyboard read failed: {}", e);
                    return;
                }
            };
            if let Some(cmd) = key_to_cmd(&key) {
                if events.send(ControlEvent::Key(cmd)).is_err() {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(c: char) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), KeyModifiers::NONE)
    }

    #[test]
    fn letters_map_to_commands_case_insensitively() {
        assert_eq!(key_to_cmd(&press('p')), Some(KeyCmd::ShowPayload));
        assert_eq!(key_to_cmd(&press('G')), Some(KeyCmd::ShowParameters));
        assert_eq!(key_to_cmd(&press('s')), Some(KeyCmd::SlowDown));
        assert_eq!(key_to_cmd(&press('F')), Some(KeyCmd::SpeedUp));
        assert_eq!(key_to_cmd(&press('q')), Some(KeyCmd::Quit));
        assert_eq!(key_to_cmd(&press('x')), None);
    }

    #[test]
    fn ctrl_c_and_escape_quit() {
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(key_to_cmd(&ctrl_c), Some(KeyCmd::Quit));
        let esc = KeyEvent::new(KeyCode::Esc, KeyModifiers::NONE);
        assert_eq!(key_to_cmd(&esc), Some(KeyCmd::Quit));
    }

    #[test]
    fn releases_are_ignored() {
        let release = KeyEvent::new_with_kind(
            KeyCode::Char('q'),
            KeyModifiers::NONE,
            KeyEventKind::Release,
        );
        assert_eq!(key_to_cmd(&release), None);
    }
}
