use crate::agent_engine::state::{Action, ScrollDirection};
use crate::errors::{DeskPilotError, DeskResult};
use crate::executor::input::{InputOp, Key};
use crate::perception::types::ScreenBounds;

const MAX_CLICKS: u32 = 3;
const MAX_SCROLL_CLICKS: u32 = 50;

/// Map an action to the primitive operations that perform it.
///
/// Pure and deterministic. Coordinates are frame-relative and must lie inside
/// `bounds`; the bounds origin is added so the executor receives desktop pixels.
/// `Wait` and `WaitFor` produce no operations: the loop waits itself.
pub fn translate(action: &Action, bounds: &ScreenBounds) -> DeskResult<Vec<InputOp>> {
    let ops = match action {
        Action::Click { x, y, button, clicks } => {
            if *clicks == 0 || *clicks > MAX_CLICKS {
                return Err(invalid(format!("click count {clicks} outside 1..={MAX_CLICKS}")));
            }
            let (x, y) = to_desktop(*x, *y, bounds)?;
            let mut ops = vec![InputOp::MoveTo { x, y }];
            for _ in 0..*clicks {
                ops.push(InputOp::ButtonDown { button: *button });
                ops.push(InputOp::ButtonUp { button: *button });
            }
            ops
        }
        Action::Drag { x1, y1, x2, y2 } => {
            let (ax, ay) = to_desktop(*x1, *y1, bounds)?;
            let (bx, by) = to_desktop(*x2, *y2, bounds)?;
            let button = crate::executor::input::MouseButton::Left;
            vec![
                InputOp::MoveTo { x: ax, y: ay },
                InputOp::ButtonDown { button },
                InputOp::MoveTo { x: bx, y: by },
                InputOp::ButtonUp { button },
            ]
        }
        Action::TypeText { text } => {
            if text.is_empty() {
                return Err(invalid("type_text with empty text".into()));
            }
            vec![InputOp::Text { text: text.clone() }]
        }
        Action::HotKey { keys } => {
            let keys = parse_chord(keys)?;
            let mut ops: Vec<InputOp> = keys.iter().map(|k| InputOp::KeyDown { key: *k }).collect();
            ops.extend(keys.iter().rev().map(|k| InputOp::KeyUp { key: *k }));
            ops
        }
        Action::Scroll { direction, clicks } => {
            if *clicks == 0 || *clicks > MAX_SCROLL_CLICKS {
                return Err(invalid(format!("scroll amount {clicks} outside 1..={MAX_SCROLL_CLICKS}")));
            }
            let n = *clicks as i32;
            let (dx, dy) = match direction {
                ScrollDirection::Up => (0, -n),
                ScrollDirection::Down => (0, n),
                ScrollDirection::Left => (-n, 0),
                ScrollDirection::Right => (n, 0),
            };
            vec![InputOp::Scroll { dx, dy }]
        }
        Action::Wait { .. } | Action::WaitFor { .. } => Vec::new(),
        Action::Done { .. } | Action::Fail { .. } => {
            return Err(invalid(format!("{} is not an input action", action.name())));
        }
    };
    Ok(ops)
}

fn to_desktop(x: i32, y: i32, bounds: &ScreenBounds) -> DeskResult<(i32, i32)> {
    if !bounds.contains(x, y) {
        return Err(invalid(format!(
            "({x},{y}) is outside the {}x{} screen",
            bounds.width, bounds.height
        )));
    }
    Ok((bounds.origin_x + x, bounds.origin_y + y))
}

/// Flatten `["ctrl+shift", "s"]` style lists into distinct keys, in order.
fn parse_chord(keys: &[String]) -> DeskResult<Vec<Key>> {
    let mut out: Vec<Key> = Vec::new();
    for name in keys.iter().flat_map(|k| k.split('+')) {
        if name.trim().is_empty() {
            continue;
        }
        let key = Key::parse(name).ok_or_else(|| invalid(format!("unknown key '{}'", name.trim())))?;
        if !out.contains(&key) {
            out.push(key);
        }
    }
    if out.is_empty() {
        return Err(invalid("hotkey without keys".into()));
    }
    Ok(out)
}

fn invalid(detail: String) -> DeskPilotError {
    DeskPilotError::InvalidAction(detail)
}
