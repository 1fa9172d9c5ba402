use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::sensors::{InputVerdict, Sensor, SensorInput, SensorSignal};
use crate::violation::{CandidateViolation, SensorKind, ViolationKind};

/// A key press with its modifiers. `meta` (Cmd on macOS) is treated as Ctrl.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyChord {
    pub key: String,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub meta: bool,
}

impl KeyChord {
    pub fn key(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Self::default()
        }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    pub fn alt(mut self) -> Self {
        self.alt = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    fn normalized_key(&self) -> String {
        self.key.trim().to_ascii_uppercase()
    }
}

struct ForbiddenChord {
    key: &'static str,
    ctrl: bool,
    shift: bool,
    alt: bool,
    /// Bare keys are forbidden whatever the modifiers.
    bare: bool,
    description: &'static str,
}

const fn bare(key: &'static str, description: &'static str) -> ForbiddenChord {
    ForbiddenChord {
        key,
        ctrl: false,
        shift: false,
        alt: false,
        bare: true,
        description,
    }
}

const fn chord(
    key: &'static str,
    ctrl: bool,
    shift: bool,
    alt: bool,
    description: &'static str,
) -> ForbiddenChord {
    ForbiddenChord {
        key,
        ctrl,
        shift,
        alt,
        bare: false,
        description,
    }
}

const FORBIDDEN_CHORDS: &[ForbiddenChord] = &[
    bare("F12", "F12 (developer tools)"),
    chord("I", true, true, false, "Ctrl+Shift+I (developer tools)"),
    chord("J", true, true, false, "Ctrl+Shift+J (console)"),
    chord("C", true, true, false, "Ctrl+Shift+C (element inspector)"),
    chord("U", true, false, false, "Ctrl+U (view source)"),
    bare("F5", "F5 (refresh)"),
    chord("R", true, false, false, "Ctrl+R (refresh)"),
    chord("R", true, true, false, "Ctrl+Shift+R (hard refresh)"),
    chord("T", true, false, false, "Ctrl+T (new tab)"),
    chord("N", true, false, false, "Ctrl+N (new window)"),
    chord("N", true, true, false, "Ctrl+Shift+N (incognito window)"),
    chord("W", true, false, false, "Ctrl+W (close tab)"),
    chord("C", true, false, false, "Ctrl+C (copy)"),
    chord("V", true, false, false, "Ctrl+V (paste)"),
    chord("X", true, false, false, "Ctrl+X (cut)"),
    chord("A", true, false, false, "Ctrl+A (select all)"),
    chord("P", true, false, false, "Ctrl+P (print)"),
    bare("ESCAPE", "Escape"),
    chord("TAB", false, false, true, "Alt+Tab (switch application)"),
    bare("F11", "F11 (toggle fullscreen)"),
];

/// Returns the deny-list description for a forbidden chord.
pub fn forbidden_description(chord: &KeyChord) -> Option<&'static str> {
    let key = chord.normalized_key();
    let ctrl = chord.ctrl || chord.meta;
    FORBIDDEN_CHORDS
        .iter()
        .find(|f| {
            f.key == key
                && (f.bare || (f.ctrl == ctrl && f.shift == chord.shift && f.alt == chord.alt))
        })
        .map(|f| f.description)
}

#[derive(Debug, Default)]
pub struct KeyCombinationSensor {
    active: bool,
    blocked: u64,
}

impl KeyCombinationSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocked(&self) -> u64 {
        self.blocked
    }
}

impl Sensor for KeyCombinationSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::KeyCombination
    }

    fn start(&mut self, _now_ms: u64) -> Result<()> {
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn observe(
        &mut self,
        input: &SensorInput,
        _now_ms: u64,
        emit: &mut dyn FnMut(SensorSignal),
    ) -> InputVerdict {
        let SensorInput::KeyDown { chord } = input else {
            return InputVerdict::Allow;
        };
        match forbidden_description(chord) {
            Some(description) => {
                self.blocked += 1;
                emit(SensorSignal::Violation(
                    CandidateViolation::new(
                        ViolationKind::ForbiddenKeyCombination,
                        SensorKind::KeyCombination,
                    )
                    .with_detail("combination", description),
                ));
                InputVerdict::Block
            }
            None => InputVerdict::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_list_matches_expected_chords() {
        assert!(forbidden_description(&KeyChord::key("F12")).is_some());
        assert!(forbidden_description(&KeyChord::key("F12").shift()).is_some());
        assert!(forbidden_description(&KeyChord::key("i").ctrl().shift()).is_some());
        assert!(forbidden_description(&KeyChord::key("c").meta()).is_some());
        assert!(forbidden_description(&KeyChord::key("Tab").alt()).is_some());
        assert!(forbidden_description(&KeyChord::key("Escape")).is_some());
        assert_eq!(
            forbidden_description(&KeyChord::key("r").ctrl().shift()),
            Some("Ctrl+Shift+R (hard refresh)")
        );

        assert!(forbidden_description(&KeyChord::key("a")).is_none());
        assert!(forbidden_description(&KeyChord::key("Tab")).is_none());
        assert!(forbidden_description(&KeyChord::key("i").ctrl()).is_none());
        assert!(forbidden_description(&KeyChord::key("Enter").ctrl()).is_none());
    }

    #[test]
    fn forbidden_chord_is_blocked_and_reported() {
        let mut sensor = KeyCombinationSensor::new();
        sensor.start(0).unwrap();
        let mut signals = Vec::new();
        let verdict = sensor.observe(
            &SensorInput::KeyDown {
                chord: KeyChord::key("v").ctrl(),
            },
            0,
            &mut |s| signals.push(s),
        );
        assert_eq!(verdict, InputVerdict::Block);
        match &signals[..] {
            [SensorSignal::Violation(c)] => {
                assert_eq!(c.kind, ViolationKind::ForbiddenKeyCombination);
                assert_eq!(
                    c.details.get("combination").map(String::as_str),
                    Some("Ctrl+V (paste)")
                );
            }
            other => panic!("unexpected signals {:?}", other),
        }

        let verdict = sensor.observe(
            &SensorInput::KeyDown {
                chord: KeyChord::key("b"),
            },
            0,
            &mut |s| signals.push(s),
        );
        assert_eq!(verdict, InputVerdict::Allow);
        assert_eq!(sensor.blocked(), 1);
    }
}
