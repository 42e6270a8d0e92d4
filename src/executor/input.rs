//! Primitive input operations: the unit the executor performs and the device gate serializes.

use serde::{Deserialize, Serialize};

pub use crate::agent_engine::state::MouseButton;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    Control,
    Shift,
    Alt,
    Meta,
    Enter,
    Tab,
    Escape,
    Backspace,
    Delete,
    Space,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    F(u8),
    Char(char),
}

impl Key {
    /// Parse a key name as models tend to write it (`ctrl`, `Cmd`, `enter`, `f5`, `a`).
    pub fn parse(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        let key = match lower.as_str() {
            "ctrl" | "control" | "ctl" => Self::Control,
            "shift" => Self::Shift,
            "alt" | "option" | "opt" => Self::Alt,
            "meta" | "cmd" | "command" | "win" | "windows" | "super" => Self::Meta,
            "enter" | "return" => Self::Enter,
            "tab" => Self::Tab,
            "esc" | "escape" => Self::Escape,
            "backspace" => Self::Backspace,
            "delete" | "del" => Self::Delete,
            "space" | "spacebar" => Self::Space,
            "up" | "arrowup" => Self::Up,
            "down" | "arrowdown" => Self::Down,
            "left" | "arrowleft" => Self::Left,
            "right" | "arrowright" => Self::Right,
            "home" => Self::Home,
            "end" => Self::End,
            "pageup" | "pgup" => Self::PageUp,
            "pagedown" | "pgdn" => Self::PageDown,
            other => {
                if let Some(n) = other.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
                    if (1..=12).contains(&n) {
                        return Some(Self::F(n));
                    }
                    return None;
                }
                let mut chars = name.trim().chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if !c.is_whitespace() => Self::Char(c.to_ascii_lowercase()),
                    _ => return None,
                }
            }
        };
        Some(key)
    }
}

/// One primitive input event. Coordinates are absolute desktop pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InputOp {
    MoveTo { x: i32, y: i32 },
    ButtonDown { button: MouseButton },
    ButtonUp { button: MouseButton },
    KeyDown { key: Key },
    KeyUp { key: Key },
    Text { text: String },
    /// Positive `dy` scrolls down, positive `dx` scrolls right.
    Scroll { dx: i32, dy: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_key_names() {
        assert_eq!(Key::parse("Ctrl"), Some(Key::Control));
        assert_eq!(Key::parse("cmd"), Some(Key::Meta));
        assert_eq!(Key::parse("Return"), Some(Key::Enter));
        assert_eq!(Key::parse("F5"), Some(Key::F(5)));
        assert_eq!(Key::parse("S"), Some(Key::Char('s')));
        assert_eq!(Key::parse("f42"), None);
        assert_eq!(Key::parse("hyper"), None);
        assert_eq!(Key::parse(""), None);
    }
}
