//! Key-assignment state machine.
//!
//! Turns successive button masks from the input interface into actions. Only
//! the bits that changed between two masks produce actions. Keys held down by
//! macros are tracked so the next release lets go of all of them at once, in
//! ascending order.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::{ButtonDef, ButtonRole};
use crate::error::Result;
use crate::macros::{KeyPress, MacroLibrary, MacroStep};
use crate::store::{self, ProfileStore, KEY_ASSIGNMENTS_DIR};

/// Assignment action type codes.
pub mod action_type {
    pub const KEY: u8 = 1;
    pub const DPI_UP: u8 = 2;
    pub const KEY_ALT: u8 = 3;
    pub const DPI_DOWN: u8 = 4;
    pub const SNIPER: u8 = 8;
    pub const MOUSE_BUTTON: u8 = 9;
    pub const MACRO: u8 = 10;
    pub const PROFILE_SWITCH: u8 = 11;
}

/// Mouse button codes passed to the synthesizer.
pub mod button_code {
    pub const LEFT: u16 = 1;
    pub const RIGHT: u16 = 2;
    pub const MIDDLE: u16 = 3;
    pub const BACK: u16 = 4;
    pub const FORWARD: u16 = 5;
}

/// What one button does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyAssignment {
    pub name: String,
    /// Leave the button to the device firmware.
    pub default: bool,
    pub action_type: u8,
    pub action_command: u16,
    pub action_hold: bool,
    /// Fire on release instead of press.
    pub on_release: bool,
    pub is_macro: bool,
    pub button_index: u8,
    pub profile_switch: bool,
}

impl Default for KeyAssignment {
    fn default() -> Self {
        Self {
            name: String::new(),
            default: true,
            action_type: 0,
            action_command: 0,
            action_hold: false,
            on_release: false,
            is_macro: false,
            button_index: 0,
            profile_switch: false,
        }
    }
}

/// Assignments keyed by single-bit button mask.
pub type KeyAssignments = BTreeMap<u32, KeyAssignment>;

/// Factory assignments for a product's buttons.
pub fn default_assignments(buttons: &[ButtonDef]) -> KeyAssignments {
    buttons
        .iter()
        .enumerate()
        .map(|(i, b)| {
            let (action_type, action_command) = match b.role {
                ButtonRole::Left => (action_type::MOUSE_BUTTON, button_code::LEFT),
                ButtonRole::Right => (action_type::MOUSE_BUTTON, button_code::RIGHT),
                ButtonRole::Middle => (action_type::MOUSE_BUTTON, button_code::MIDDLE),
                ButtonRole::Back => (action_type::MOUSE_BUTTON, button_code::BACK),
                ButtonRole::Forward => (action_type::MOUSE_BUTTON, button_code::FORWARD),
                ButtonRole::DpiUp => (action_type::DPI_UP, 0),
                ButtonRole::DpiDown => (action_type::DPI_DOWN, 0),
                ButtonRole::Sniper => (action_type::SNIPER, 0),
                ButtonRole::ProfileSwitch => (action_type::PROFILE_SWITCH, 0),
            };
            let entry = KeyAssignment {
                name: b.name.to_string(),
                default: true,
                action_type,
                action_command,
                button_index: i as u8,
                profile_switch: b.role == ButtonRole::ProfileSwitch,
                ..KeyAssignment::default()
            };
            (b.mask, entry)
        })
        .collect()
}

/// Load assignments stored under `hash`, or the factory set.
pub fn load_assignments(
    store: &dyn ProfileStore,
    hash: &str,
    buttons: &[ButtonDef],
) -> Result<KeyAssignments> {
    if hash.is_empty() {
        return Ok(default_assignments(buttons));
    }
    let key = store::key(KEY_ASSIGNMENTS_DIR, hash);
    match store::load_json::<KeyAssignments>(store, &key)? {
        Some(entries) => Ok(entries),
        None => {
            let entries = default_assignments(buttons);
            store::save_json(store, &key, &entries)?;
            Ok(entries)
        }
    }
}

pub fn save_assignments(store: &dyn ProfileStore, hash: &str, entries: &KeyAssignments) -> Result<()> {
    store::save_json(store, &store::key(KEY_ASSIGNMENTS_DIR, hash), entries)
}

/// Result of a mask change, executed by the device driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Key { code: u16, press: KeyPress },
    Button { code: u16, press: KeyPress },
    Text(String),
    Delay(std::time::Duration),
    DpiUp,
    DpiDown,
    SniperOn,
    SniperOff,
    RotateProfile,
}

/// Something a macro left held down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Held {
    Key(u16),
    Button(u16),
}

/// Mask-driven state machine for one device.
#[derive(Debug, Clone)]
pub struct KeyAssigner {
    entries: KeyAssignments,
    roles: BTreeMap<u32, ButtonRole>,
    modifier_index: u32,
    held: BTreeSet<Held>,
}

impl KeyAssigner {
    pub fn new(buttons: &[ButtonDef], mut entries: KeyAssignments) -> Self {
        let roles: BTreeMap<u32, ButtonRole> = buttons.iter().map(|b| (b.mask, b.role)).collect();
        for (mask, role) in &roles {
            if *role != ButtonRole::Left {
                continue;
            }
            if let Some(entry) = entries.get_mut(mask) {
                if !entry.default {
                    warn!(mask = format_args!("0x{:X}", mask), "left button must stay default, restoring");
                    entry.default = true;
                }
            }
        }
        Self {
            entries,
            roles,
            modifier_index: 0,
            held: BTreeSet::new(),
        }
    }

    pub fn entries(&self) -> &KeyAssignments {
        &self.entries
    }

    /// Mask observed last.
    pub fn modifier_index(&self) -> u32 {
        self.modifier_index
    }

    /// Replace one assignment. The left button cannot be reassigned.
    pub fn set(&mut self, mask: u32, mut entry: KeyAssignment) {
        if self.roles.get(&mask) == Some(&ButtonRole::Left) && !entry.default {
            warn!(mask = format_args!("0x{:X}", mask), "left button must stay default, restoring");
            entry.default = true;
        }
        self.entries.insert(mask, entry);
    }

    /// Feed a new button mask and collect the resulting actions.
    pub fn handle(&mut self, mask: u32, macros: &MacroLibrary) -> Vec<Action> {
        let diff = mask ^ self.modifier_index;
        let pressed = diff & mask;
        self.modifier_index = mask;

        let mut actions = Vec::new();
        for bit in (0..32).map(|i| 1u32 << i).filter(|b| diff & b != 0) {
            let Some(entry) = self.entries.get(&bit).cloned() else {
                continue;
            };
            let is_press = (pressed & bit != 0) != entry.on_release;
            if is_press {
                self.press(bit, &entry, macros, &mut actions);
            } else {
                self.release(&entry, &mut actions);
            }
        }
        actions
    }

    fn press(&mut self, bit: u32, entry: &KeyAssignment, macros: &MacroLibrary, out: &mut Vec<Action>) {
        if entry.default {
            if entry.profile_switch {
                out.push(Action::RotateProfile);
                return;
            }
            match self.roles.get(&bit) {
                Some(ButtonRole::DpiUp) => out.push(Action::DpiUp),
                Some(ButtonRole::DpiDown) => out.push(Action::DpiDown),
                _ => {}
            }
            return;
        }
        let press = if entry.action_hold {
            KeyPress::Hold
        } else {
            KeyPress::Tap
        };
        match entry.action_type {
            action_type::KEY | action_type::KEY_ALT => out.push(Action::Key {
                code: entry.action_command,
                press,
            }),
            action_type::DPI_UP => out.push(Action::DpiUp),
            action_type::DPI_DOWN => out.push(Action::DpiDown),
            action_type::SNIPER => out.push(Action::SniperOn),
            action_type::MOUSE_BUTTON => out.push(Action::Button {
                code: entry.action_command,
                press,
            }),
            action_type::MACRO => self.play_macro(entry.action_command, macros, out),
            action_type::PROFILE_SWITCH => out.push(Action::RotateProfile),
            other => debug!(action_type = other, "unassigned action type"),
        }
    }

    fn play_macro(&mut self, id: u16, macros: &MacroLibrary, out: &mut Vec<Action>) {
        let Some(m) = macros.get(id) else {
            warn!(id, "macro not found");
            return;
        };
        for step in m.steps() {
            match step {
                MacroStep::Key { code, hold: true } => {
                    self.held.insert(Held::Key(code));
                    out.push(Action::Key { code, press: KeyPress::Hold });
                }
                MacroStep::Key { code, hold: false } => {
                    out.push(Action::Key { code, press: KeyPress::Tap });
                }
                MacroStep::Button { code, hold: true } => {
                    self.held.insert(Held::Button(code));
                    out.push(Action::Button { code, press: KeyPress::Hold });
                }
                MacroStep::Button { code, hold: false } => {
                    out.push(Action::Button { code, press: KeyPress::Tap });
                }
                MacroStep::Delay(d) => out.push(Action::Delay(d)),
                MacroStep::Text(t) => out.push(Action::Text(t)),
            }
        }
    }

    fn release(&mut self, entry: &KeyAssignment, out: &mut Vec<Action>) {
        if !entry.default {
            match entry.action_type {
                action_type::SNIPER => out.push(Action::SniperOff),
                action_type::KEY | action_type::KEY_ALT if entry.action_hold => out.push(Action::Key {
                    code: entry.action_command,
                    press: KeyPress::Release,
                }),
                action_type::MOUSE_BUTTON if entry.action_hold => out.push(Action::Button {
                    code: entry.action_command,
                    press: KeyPress::Release,
                }),
                _ => {}
            }
        }
        for held in std::mem::take(&mut self.held) {
            out.push(match held {
                Held::Key(code) => Action::Key { code, press: KeyPress::Release },
                Held::Button(code) => Action::Button { code, press: KeyPress::Release },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{descriptor, pids, VENDOR_ID};
    use crate::macros::{action_type as macro_type, Macro, MacroAction};
    use crate::store::MemoryStore;

    fn buttons() -> &'static [ButtonDef] {
        descriptor(VENDOR_ID, pids::KATAR_PRO_XT).unwrap().buttons
    }

    fn assigner() -> KeyAssigner {
        KeyAssigner::new(buttons(), default_assignments(buttons()))
    }

    fn custom(action_type: u8, command: u16, hold: bool) -> KeyAssignment {
        KeyAssignment {
            default: false,
            action_type,
            action_command: command,
            action_hold: hold,
            ..KeyAssignment::default()
        }
    }

    #[test]
    fn default_profile_switch_rotates() {
        let mut ka = assigner();
        let none = MacroLibrary::default();
        assert_eq!(ka.handle(0x80, &none), vec![Action::RotateProfile]);
        assert!(ka.handle(0x00, &none).is_empty());
        assert_eq!(ka.modifier_index(), 0);
    }

    #[test]
    fn default_dpi_buttons_step() {
        let mut ka = assigner();
        let none = MacroLibrary::default();
        assert_eq!(ka.handle(0x20, &none), vec![Action::DpiUp]);
        assert!(ka.handle(0x00, &none).is_empty());
        assert_eq!(ka.handle(0x40, &none), vec![Action::DpiDown]);
        // Native buttons produce nothing.
        assert!(ka.handle(0x42, &none).is_empty());
    }

    #[test]
    fn held_key_released_on_button_release() {
        let mut ka = assigner();
        ka.set(0x08, custom(action_type::KEY, 30, true));
        let none = MacroLibrary::default();
        assert_eq!(ka.handle(0x08, &none), vec![Action::Key { code: 30, press: KeyPress::Hold }]);
        assert_eq!(ka.handle(0x00, &none), vec![Action::Key { code: 30, press: KeyPress::Release }]);
    }

    #[test]
    fn on_release_swaps_edges() {
        let mut ka = assigner();
        ka.set(
            0x10,
            KeyAssignment {
                on_release: true,
                ..custom(action_type::KEY, 44, false)
            },
        );
        let none = MacroLibrary::default();
        assert!(ka.handle(0x10, &none).is_empty());
        assert_eq!(ka.handle(0x00, &none), vec![Action::Key { code: 44, press: KeyPress::Tap }]);
    }

    #[test]
    fn unchanged_bits_do_not_matter() {
        let none = MacroLibrary::default();
        let mut a = assigner();
        a.set(0x08, custom(action_type::KEY, 30, false));
        let mut b = a.clone();
        a.handle(0x00, &none);
        b.handle(0x02, &none);
        assert_eq!(a.handle(0x08, &none), b.handle(0x0A, &none));
    }

    #[test]
    fn sniper_is_momentary() {
        let mut ka = assigner();
        ka.set(0x10, custom(action_type::SNIPER, 0, false));
        let none = MacroLibrary::default();
        assert_eq!(ka.handle(0x10, &none), vec![Action::SniperOn]);
        assert_eq!(ka.handle(0x00, &none), vec![Action::SniperOff]);
    }

    #[test]
    fn macro_holds_released_in_ascending_order() {
        let mut lib = MacroLibrary::default();
        let mut m = Macro::default();
        for (i, code) in [50u16, 20, 35].iter().enumerate() {
            m.actions.insert(
                i as u32,
                MacroAction {
                    action_type: macro_type::KEY,
                    action_command: *code,
                    hold: true,
                    ..MacroAction::default()
                },
            );
        }
        m.actions.insert(
            9,
            MacroAction {
                action_type: macro_type::TEXT,
                text: "gg".into(),
                ..MacroAction::default()
            },
        );
        lib.macros.insert(7, m);

        let mut ka = assigner();
        ka.set(0x08, custom(action_type::MACRO, 7, false));
        let pressed = ka.handle(0x08, &lib);
        assert_eq!(pressed.len(), 4);
        assert_eq!(pressed[3], Action::Text("gg".into()));

        let released = ka.handle(0x00, &lib);
        let codes: Vec<u16> = released
            .iter()
            .map(|a| match a {
                Action::Key { code, press: KeyPress::Release } => *code,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(codes, vec![20, 35, 50]);
        assert!(ka.handle(0x08, &MacroLibrary::default()).is_empty());
    }

    #[test]
    fn left_button_forced_default() {
        let mut entries = default_assignments(buttons());
        entries.get_mut(&0x01).unwrap().default = false;
        let mut ka = KeyAssigner::new(buttons(), entries);
        assert!(ka.entries()[&0x01].default);
        ka.set(0x01, custom(action_type::KEY, 1, false));
        assert!(ka.entries()[&0x01].default);
        assert!(ka.handle(0x01, &MacroLibrary::default()).is_empty());
    }

    #[test]
    fn assignments_persist_by_hash() {
        let store = MemoryStore::new();
        let loaded = load_assignments(&store, "SER", buttons()).unwrap();
        assert_eq!(loaded.len(), buttons().len());
        assert!(store.load("key-assignments/SER.json").unwrap().is_some());
        let mut changed = loaded.clone();
        changed.get_mut(&0x08).unwrap().default = false;
        save_assignments(&store, "SER", &changed).unwrap();
        assert_eq!(load_assignments(&store, "SER", buttons()).unwrap(), changed);
    }
}
