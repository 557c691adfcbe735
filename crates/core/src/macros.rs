//! Macro library and the input synthesis interface.
//!
//! A macro is an ordered list of typed actions. [`Macro::steps`] expands it
//! lazily, so repeat counts never materialize the full sequence.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::store::{self, ProfileStore, MACROS_KEY};

/// Macro action type codes.
pub mod action_type {
    pub const KEY: u8 = 1;
    pub const MOUSE_BUTTON: u8 = 3;
    pub const DELAY: u8 = 5;
    pub const TEXT: u8 = 6;
}

/// Key or button transition requested from the synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPress {
    /// Press and release.
    Tap,
    /// Press and keep down.
    Hold,
    /// Release a held key.
    Release,
}

/// Keyboard and mouse emulation.
pub trait InputSynth: Send + Sync {
    fn send_key(&self, code: u16, press: KeyPress);
    fn send_button(&self, code: u16, press: KeyPress);
    fn send_text(&self, text: &str);
}

/// Synthesizer that only logs; used when no emulation backend is present.
#[derive(Debug, Default)]
pub struct LogSynth;

impl InputSynth for LogSynth {
    fn send_key(&self, code: u16, press: KeyPress) {
        info!(code, ?press, "synthesized key");
    }

    fn send_button(&self, code: u16, press: KeyPress) {
        info!(code, ?press, "synthesized mouse button");
    }

    fn send_text(&self, text: &str) {
        info!(chars = text.chars().count(), "synthesized text");
    }
}

/// One synthesized event, as recorded by [`RecordingSynth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthEvent {
    Key(u16, KeyPress),
    Button(u16, KeyPress),
    Text(String),
}

/// Synthesizer that records events in order; used for previews and tests.
#[derive(Debug, Default)]
pub struct RecordingSynth {
    events: Mutex<Vec<SynthEvent>>,
}

impl RecordingSynth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SynthEvent> {
        self.events.lock().clone()
    }
}

impl InputSynth for RecordingSynth {
    fn send_key(&self, code: u16, press: KeyPress) {
        self.events.lock().push(SynthEvent::Key(code, press));
    }

    fn send_button(&self, code: u16, press: KeyPress) {
        self.events.lock().push(SynthEvent::Button(code, press));
    }

    fn send_text(&self, text: &str) {
        self.events.lock().push(SynthEvent::Text(text.to_string()));
    }
}

/// Upper bound on the extra repetitions of one action.
pub const MAX_REPEATS: u32 = 1000;

/// One stored macro action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MacroAction {
    pub action_type: u8,
    pub action_command: u16,
    pub hold: bool,
    pub delay_ms: u64,
    /// Extra repetitions after the first run, at most [`MAX_REPEATS`].
    pub repeat_count: u32,
    pub repeat_delay_ms: u64,
    pub text: String,
}

impl Default for MacroAction {
    fn default() -> Self {
        Self {
            action_type: action_type::KEY,
            action_command: 0,
            hold: false,
            delay_ms: 0,
            repeat_count: 0,
            repeat_delay_ms: 0,
            text: String::new(),
        }
    }
}

/// Expanded macro step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroStep {
    Key { code: u16, hold: bool },
    Button { code: u16, hold: bool },
    Delay(Duration),
    Text(String),
}

impl MacroAction {
    fn step(&self) -> Option<MacroStep> {
        match self.action_type {
            action_type::KEY => Some(MacroStep::Key {
                code: self.action_command,
                hold: self.hold,
            }),
            action_type::MOUSE_BUTTON => Some(MacroStep::Button {
                code: self.action_command,
                hold: self.hold,
            }),
            action_type::DELAY => Some(MacroStep::Delay(Duration::from_millis(self.delay_ms))),
            action_type::TEXT => Some(MacroStep::Text(self.text.clone())),
            other => {
                debug!(action_type = other, "skipping unknown macro action");
                None
            }
        }
    }

    /// This action's steps including repeats and the delays between them.
    fn expand(&self) -> impl Iterator<Item = MacroStep> + '_ {
        let repeat_delay = Duration::from_millis(self.repeat_delay_ms);
        (0..=self.repeat_count.min(MAX_REPEATS)).flat_map(move |i| {
            let gap = (i > 0 && !repeat_delay.is_zero()).then_some(MacroStep::Delay(repeat_delay));
            gap.into_iter().chain(self.step())
        })
    }
}

/// A named macro.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Macro {
    pub name: String,
    /// Ordered by key.
    pub actions: BTreeMap<u32, MacroAction>,
}

impl Macro {
    /// Lazily expanded steps.
    pub fn steps(&self) -> impl Iterator<Item = MacroStep> + '_ {
        self.actions.values().flat_map(|a| a.expand())
    }
}

/// Every macro, keyed by id; stored as `macros.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacroLibrary {
    pub macros: BTreeMap<u16, Macro>,
}

impl MacroLibrary {
    pub fn load(store: &dyn ProfileStore) -> Result<Self> {
        Ok(store::load_json(store, MACROS_KEY)?.unwrap_or_default())
    }

    pub fn save(&self, store: &dyn ProfileStore) -> Result<()> {
        store::save_json(store, MACROS_KEY, self)
    }

    pub fn get(&self, id: u16) -> Option<&Macro> {
        self.macros.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn action(action_type: u8) -> MacroAction {
        MacroAction {
            action_type,
            ..MacroAction::default()
        }
    }

    #[test]
    fn steps_expand_repeats_with_gaps() {
        let mut m = Macro::default();
        m.actions.insert(
            0,
            MacroAction {
                action_command: 30,
                repeat_count: 2,
                repeat_delay_ms: 10,
                ..action(action_type::KEY)
            },
        );
        m.actions.insert(
            1,
            MacroAction {
                text: "hi".into(),
                ..action(action_type::TEXT)
            },
        );
        let steps: Vec<MacroStep> = m.steps().collect();
        let key = MacroStep::Key { code: 30, hold: false };
        let gap = MacroStep::Delay(Duration::from_millis(10));
        assert_eq!(
            steps,
            vec![key.clone(), gap.clone(), key.clone(), gap, key, MacroStep::Text("hi".into())]
        );
    }

    #[test]
    fn unknown_actions_are_skipped() {
        let mut m = Macro::default();
        m.actions.insert(0, action(42));
        m.actions.insert(1, MacroAction { delay_ms: 5, ..action(action_type::DELAY) });
        let steps: Vec<MacroStep> = m.steps().collect();
        assert_eq!(steps, vec![MacroStep::Delay(Duration::from_millis(5))]);
    }

    #[test]
    fn steps_are_lazy() {
        let mut m = Macro::default();
        m.actions.insert(
            0,
            MacroAction {
                repeat_count: u32::MAX,
                ..action(action_type::KEY)
            },
        );
        assert_eq!(m.steps().take(3).count(), 3);
    }

    #[test]
    fn repeats_are_capped() {
        let mut m = Macro::default();
        m.actions.insert(
            0,
            MacroAction {
                repeat_count: u32::MAX,
                ..action(action_type::KEY)
            },
        );
        assert_eq!(m.steps().count(), MAX_REPEATS as usize + 1);
    }

    #[test]
    fn library_persists() {
        let store = MemoryStore::new();
        assert!(MacroLibrary::load(&store).unwrap().macros.is_empty());
        let mut lib = MacroLibrary::default();
        lib.macros.insert(3, Macro { name: "m".into(), ..Macro::default() });
        lib.save(&store).unwrap();
        assert_eq!(MacroLibrary::load(&store).unwrap(), lib);
    }
}
