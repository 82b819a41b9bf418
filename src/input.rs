//! User actions and the keys bound to them.

use std::collections::{HashMap, HashSet};

use case_insensitive_hashmap::CaseInsensitiveHashMap;
use strum::{EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::hunting::Target;

/// Something the user can ask for. The snake_case names are the keys of the `keys` config table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    Reload,
    ToggleHunting,
    NextPixelShader,
    PrevPixelShader,
    MarkPixelShader,
    NextVertexShader,
    PrevVertexShader,
    MarkVertexShader,
    NextIndexBuffer,
    PrevIndexBuffer,
    MarkIndexBuffer,
    NextVertexBuffer,
    PrevVertexBuffer,
    MarkVertexBuffer,
    NextRenderTarget,
    PrevRenderTarget,
    MarkRenderTarget,
}

/// Which way a hunting action moves, or whether it marks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HuntStep {
    Next,
    Prev,
    Mark,
}

impl Action {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn default_key(self) -> &'static str {
        match self {
            Action::Reload => "F10",
            Action::ToggleHunting => "NUMPAD0",
            Action::PrevPixelShader => "NUMPAD1",
            Action::NextPixelShader => "NUMPAD2",
            Action::MarkPixelShader => "NUMPAD3",
            Action::PrevVertexShader => "NUMPAD4",
            Action::NextVertexShader => "NUMPAD5",
            Action::MarkVertexShader => "NUMPAD6",
            Action::PrevIndexBuffer => "NUMPAD7",
            Action::NextIndexBuffer => "NUMPAD8",
            Action::MarkIndexBuffer => "NUMPAD9",
            Action::PrevVertexBuffer => "DIVIDE",
            Action::NextVertexBuffer => "MULTIPLY",
            Action::MarkVertexBuffer => "SUBTRACT",
            Action::PrevRenderTarget => "INSERT",
            Action::NextRenderTarget => "HOME",
            Action::MarkRenderTarget => "PAGEUP",
        }
    }

    /// Splits a hunting action into its target and step.
    pub fn hunt(self) -> Option<(Target, HuntStep)> {
        use HuntStep::*;
        use Target::*;

        Some(match self {
            Action::NextPixelShader => (PixelShader, Next),
            Action::PrevPixelShader => (PixelShader, Prev),
            Action::MarkPixelShader => (PixelShader, Mark),
            Action::NextVertexShader => (VertexShader, Next),
            Action::PrevVertexShader => (VertexShader, Prev),
            Action::MarkVertexShader => (VertexShader, Mark),
            Action::NextIndexBuffer => (IndexBuffer, Next),
            Action::PrevIndexBuffer => (IndexBuffer, Prev),
            Action::MarkIndexBuffer => (IndexBuffer, Mark),
            Action::NextVertexBuffer => (VertexBuffer, Next),
            Action::PrevVertexBuffer => (VertexBuffer, Prev),
            Action::MarkVertexBuffer => (VertexBuffer, Mark),
            Action::NextRenderTarget => (RenderTarget, Next),
            Action::PrevRenderTarget => (RenderTarget, Prev),
            Action::MarkRenderTarget => (RenderTarget, Mark),
            Action::Reload | Action::ToggleHunting => return None,
        })
    }
}

/// Reports whether a named key is held down. The names are whatever the config uses.
pub trait InputSource: Send + Sync {
    fn is_down(&self, key: &str) -> bool;
}

/// Turns key state into one event per key press.
pub struct ActionTrigger {
    bindings: Vec<(Action, String)>,
    held: HashSet<Action>,
}

impl ActionTrigger {
    /// Builds the bindings from the `keys` config table. Action names are matched without
    /// regard to case, and unknown names are logged and ignored.
    pub fn new(keys: &HashMap<String, String>) -> ActionTrigger {
        let actions = CaseInsensitiveHashMap::from_iter(Action::iter().map(|action| (action.name().to_string(), action)));

        let mut chosen: HashMap<Action, String> =
            Action::iter().map(|action| (action, action.default_key().to_string())).collect();

        for (name, key) in keys {
            match actions.get(name.as_str()) {
                Some(action) => {
                    chosen.insert(*action, key.trim().to_string());
                }

                None => log::warn!("Unknown action '{}' in key bindings", name),
            }
        }

        let bindings = Action::iter()
            .filter_map(|action| {
                let key = chosen.remove(&action)?;

                if key.is_empty() {
                    log::info!("Action {} is unbound", action.name());
                    None
                } else {
                    Some((action, key))
                }
            })
            .collect();

        ActionTrigger {
            bindings,
            held: HashSet::new(),
        }
    }

    pub fn key_for(&self, action: Action) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(bound, _)| *bound == action)
            .map(|(_, key)| key.as_str())
    }

    /// Returns the actions whose key went down since the last poll.
    pub fn poll(&mut self, input: &dyn InputSource) -> Vec<Action> {
        let mut fired = vec![];

        for (action, key) in &self.bindings {
            if input.is_down(key) {
                if self.held.insert(*action) {
                    fired.push(*action);
                }
            } else {
                self.held.remove(action);
            }
        }

        fired
    }
}

/// Translates a key name ("F10", "NUMPAD3", "VK_HOME", "0x2d", "K") to a virtual key code.
pub fn virtual_key(name: &str) -> Option<i32> {
    let name = name.trim().to_ascii_uppercase();
    let name = name.strip_prefix("VK_").unwrap_or(&name);

    if let Some(hex) = name.strip_prefix("0X") {
        return i32::from_str_radix(hex, 16).ok();
    }

    let mut chars = name.chars();

    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_uppercase() || c.is_ascii_digit() {
            return Some(c as i32);
        }
    }

    if let Some(number) = name.strip_prefix("NUMPAD").and_then(|n| n.parse::<i32>().ok()) {
        return (0..=9).contains(&number).then(|| 0x60 + number);
    }

    if let Some(number) = name.strip_prefix('F').and_then(|n| n.parse::<i32>().ok()) {
        return (1..=24).contains(&number).then(|| 0x70 + number - 1);
    }

    Some(match name {
        "BACK" | "BACKSPACE" => 0x08,
        "TAB" => 0x09,
        "RETURN" | "ENTER" => 0x0d,
        "SHIFT" => 0x10,
        "CONTROL" | "CTRL" => 0x11,
        "MENU" | "ALT" => 0x12,
        "PAUSE" => 0x13,
        "CAPITAL" | "CAPSLOCK" => 0x14,
        "ESCAPE" | "ESC" => 0x1b,
        "SPACE" => 0x20,
        "PRIOR" | "PAGEUP" => 0x21,
        "NEXT" | "PAGEDOWN" => 0x22,
        "END" => 0x23,
        "HOME" => 0x24,
        "LEFT" => 0x25,
        "UP" => 0x26,
        "RIGHT" => 0x27,
        "DOWN" => 0x28,
        "INSERT" => 0x2d,
        "DELETE" => 0x2e,
        "MULTIPLY" => 0x6a,
        "ADD" => 0x6b,
        "SUBTRACT" => 0x6d,
        "DECIMAL" => 0x6e,
        "DIVIDE" => 0x6f,
        _ => return None,
    })
}

/// Reads the keyboard with `GetAsyncKeyState`.
#[cfg(windows)]
pub struct Keyboard {
    codes: std::sync::Mutex<CaseInsensitiveHashMap<Option<i32>>>,
}

#[cfg(windows)]
impl Keyboard {
    pub fn new() -> Keyboard {
        Keyboard {
            codes: std::sync::Mutex::new(CaseInsensitiveHashMap::new()),
        }
    }

    fn code(&self, key: &str) -> Option<i32> {
        let mut codes = self.codes.lock().ok()?;

        if let Some(code) = codes.get(key) {
            return *code;
        }

        let code = virtual_key(key);

        if code.is_none() {
            log::warn!("Unknown key name '{}'", key);
        }

        codes.insert(key.to_string(), code);
        code
    }
}

#[cfg(windows)]
impl InputSource for Keyboard {
    fn is_down(&self, key: &str) -> bool {
        match self.code(key) {
            // The high bit is set while the key is held.
            Some(code) => unsafe { winapi::um::winuser::GetAsyncKeyState(code) as u16 & 0x8000 != 0 },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::testing::MockInput;

    #[test]
    fn action_names() {
        assert_eq!(Action::NextPixelShader.name(), "next_pixel_shader");
        assert_eq!(Action::from_str("mark_render_target").unwrap(), Action::MarkRenderTarget);
        assert_eq!(Action::Reload.hunt(), None);
        assert_eq!(Action::PrevIndexBuffer.hunt(), Some((Target::IndexBuffer, HuntStep::Prev)));

        // Every hunting target has all three steps.
        assert_eq!(Action::iter().filter(|action| action.hunt().is_some()).count(), 15);
    }

    #[test]
    fn bindings_come_from_config() {
        let keys = HashMap::from_iter([
            ("RELOAD".to_string(), "F5".to_string()),
            ("toggle_hunting".to_string(), "".to_string()),
            ("fly".to_string(), "F1".to_string()),
        ]);

        let trigger = ActionTrigger::new(&keys);
        assert_eq!(trigger.key_for(Action::Reload), Some("F5"));
        assert_eq!(trigger.key_for(Action::ToggleHunting), None);
        assert_eq!(trigger.key_for(Action::MarkPixelShader), Some("NUMPAD3"));
    }

    #[test]
    fn fires_once_per_press() {
        let input = MockInput::default();
        let mut trigger = ActionTrigger::new(&HashMap::new());

        assert!(trigger.poll(&input).is_empty());

        input.press("F10");
        assert_eq!(trigger.poll(&input), vec![Action::Reload]);
        assert!(trigger.poll(&input).is_empty());

        input.release("F10");
        assert!(trigger.poll(&input).is_empty());

        input.press("F10");
        input.press("NUMPAD2");
        assert_eq!(trigger.poll(&input), vec![Action::Reload, Action::NextPixelShader]);
    }

    #[test]
    fn key_names() {
        assert_eq!(virtual_key("F10"), Some(0x79));
        assert_eq!(virtual_key("numpad3"), Some(0x63));
        assert_eq!(virtual_key("VK_HOME"), Some(0x24));
        assert_eq!(virtual_key("0x2d"), Some(0x2d));
        assert_eq!(virtual_key("k"), Some(0x4b));
        assert_eq!(virtual_key("7"), Some(0x37));
        assert_eq!(virtual_key("F25"), None);
        assert_eq!(virtual_key("NUMPAD10"), None);
        assert_eq!(virtual_key("hyper"), None);
    }
}
