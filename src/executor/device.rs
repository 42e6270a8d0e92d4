use async_trait::async_trait;
use enigo::{Axis, Button, Coordinate, Direction, Enigo, Keyboard, Mouse, Settings};
use tokio::sync::{mpsc, oneshot};

use crate::errors::{DeskPilotError, DeskResult, ExecutionError};
use crate::executor::input::{InputOp, Key, MouseButton};

/// Performs primitive input operations on a physical device.
///
/// Implementations report every device-level failure; they are never called
/// concurrently for the same device because the scheduler's gate serializes access.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, op: &InputOp) -> Result<(), ExecutionError>;
}

type Command = (InputOp, oneshot::Sender<Result<(), ExecutionError>>);

/// OS input through enigo. The `Enigo` handle lives on one dedicated thread
/// and operations are sent to it over a channel.
pub struct EnigoExecutor {
    tx: mpsc::UnboundedSender<Command>,
}

impl EnigoExecutor {
    pub fn spawn() -> DeskResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("deskpilot-input".into())
            .spawn(move || device_thread(rx))
            .map_err(DeskPilotError::Io)?;
        Ok(Self { tx })
    }
}

#[async_trait]
impl ActionExecutor for EnigoExecutor {
    async fn execute(&self, op: &InputOp) -> Result<(), ExecutionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((op.clone(), reply_tx))
            .map_err(|_| ExecutionError::device("input thread has stopped"))?;
        reply_rx
            .await
            .map_err(|_| ExecutionError::device("input thread dropped the request"))?
    }
}

fn device_thread(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut enigo = match Enigo::new(&Settings::default()) {
        Ok(enigo) => Ok(enigo),
        Err(e) => {
            tracing::error!(error = %e, "failed to open input device");
            Err(e.to_string())
        }
    };
    while let Some((op, reply)) = rx.blocking_recv() {
        let result = match enigo.as_mut() {
            Ok(enigo) => apply(enigo, &op),
            Err(reason) => Err(ExecutionError::device(format!("input device unavailable: {reason}"))),
        };
        if let Err(e) = &result {
            tracing::warn!(?op, error = %e, "input operation failed");
        }
        let _ = reply.send(result);
    }
    tracing::debug!("input thread exiting");
}

fn apply(enigo: &mut Enigo, op: &InputOp) -> Result<(), ExecutionError> {
    let res = match op {
        InputOp::MoveTo { x, y } => enigo.move_mouse(*x, *y, Coordinate::Abs),
        InputOp::ButtonDown { button } => enigo.button(to_button(*button), Direction::Press),
        InputOp::ButtonUp { button } => enigo.button(to_button(*button), Direction::Release),
        InputOp::KeyDown { key } => enigo.key(to_key(*key), Direction::Press),
        InputOp::KeyUp { key } => enigo.key(to_key(*key), Direction::Release),
        InputOp::Text { text } => enigo.text(text),
        InputOp::Scroll { dx, dy } => {
            let vertical = if *dy != 0 { enigo.scroll(*dy, Axis::Vertical) } else { Ok(()) };
            vertical.and_then(|_| if *dx != 0 { enigo.scroll(*dx, Axis::Horizontal) } else { Ok(()) })
        }
    };
    res.map_err(|e| ExecutionError::device(e.to_string()))
}

fn to_button(button: MouseButton) -> Button {
    match button {
        MouseButton::Left => Button::Left,
        MouseButton::Right => Button::Right,
        MouseButton::Middle => Button::Middle,
    }
}

fn to_key(key: Key) -> enigo::Key {
    use enigo::Key as K;
    match key {
        Key::Control => K::Control,
        Key::Shift => K::Shift,
        Key::Alt => K::Alt,
        Key::Meta => K::Meta,
        Key::Enter => K::Return,
        Key::Tab => K::Tab,
        Key::Escape => K::Escape,
        Key::Backspace => K::Backspace,
        Key::Delete => K::Delete,
        Key::Space => K::Space,
        Key::Up => K::UpArrow,
        Key::Down => K::DownArrow,
        Key::Left => K::LeftArrow,
        Key::Right => K::RightArrow,
        Key::Home => K::Home,
        Key::End => K::End,
        Key::PageUp => K::PageUp,
        Key::PageDown => K::PageDown,
        Key::F(n) => match n {
            1 => K::F1,
            2 => K::F2,
            3 => K::F3,
            4 => K::F4,
            5 => K::F5,
            6 => K::F6,
            7 => K::F7,
            8 => K::F8,
            9 => K::F9,
            10 => K::F10,
            11 => K::F11,
            _ => K::F12,
        },
        Key::Char(c) => K::Unicode(c),
    }
}
