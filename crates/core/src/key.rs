use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KeyParseError;

const PITCH_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// A key as the analysis reports it: a pitch class and a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MusicalKey {
    pitch: u8,
    minor: bool,
}

impl MusicalKey {
    /// `pitch` is taken modulo 12, with 0 = C.
    pub fn new(pitch: u8, minor: bool) -> Self {
        Self {
            pitch: pitch % 12,
            minor,
        }
    }

    pub fn pitch(&self) -> u8 {
        self.pitch
    }

    pub fn is_minor(&self) -> bool {
        self.minor
    }

    pub fn transpose(self, semitones: i32) -> Self {
        let pitch = (self.pitch as i32 + semitones).rem_euclid(12) as u8;
        Self { pitch, ..self }
    }

    /// The other eleven keys in the same mode, starting one semitone up.
    pub fn rotation(self) -> Vec<MusicalKey> {
        (1..12).map(|step| self.transpose(step)).collect()
    }

    /// Shortest shift from `self` to `target`, in `-5..=6`.
    pub fn shift_to(self, target: MusicalKey) -> i32 {
        let d = (target.pitch as i32 - self.pitch as i32).rem_euclid(12);
        if d > 6 { d - 12 } else { d }
    }
}

impl fmt::Display for MusicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            PITCH_NAMES[self.pitch as usize],
            if self.minor { "m" } else { "" }
        )
    }
}

impl FromStr for MusicalKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(KeyParseError::Empty);
        }
        let (name, minor) = match s.strip_suffix('m') {
            Some(name) => (name, true),
            None => (s, false),
        };
        let pitch = PITCH_NAMES
            .iter()
            .position(|p| p.eq_ignore_ascii_case(name))
            .ok_or_else(|| KeyParseError::Unknown(s.to_string()))?;
        Ok(Self::new(pitch as u8, minor))
    }
}

impl TryFrom<String> for MusicalKey {
    type Error = KeyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MusicalKey> for String {
    fn from(key: MusicalKey) -> Self {
        key.to_string()
    }
}

/// Key and tempo shown for the loaded song, with the values from analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct SongInfo {
    pub key: Option<MusicalKey>,
    pub bpm: Option<f64>,
    pub original_key: Option<MusicalKey>,
    pub original_bpm: Option<f64>,
}

impl SongInfo {
    pub fn new(key: Option<MusicalKey>, bpm: Option<f64>) -> Self {
        Self {
            key,
            bpm,
            original_key: key,
            original_bpm: bpm,
        }
    }

    /// True once key or tempo differ from analysis; the reset control
    /// is shown only then.
    pub fn is_modified(&self) -> bool {
        self.key != self.original_key || whole_bpm(self.bpm) != whole_bpm(self.original_bpm)
    }

    pub fn apply(&mut self, change: &KeyChange) {
        if let Some(key) = change.new_key {
            self.key = Some(key);
        }
        if let Some(bpm) = change.new_bpm {
            self.bpm = Some(bpm);
        }
    }

    pub fn restore(&mut self) {
        self.key = self.original_key;
        self.bpm = self.original_bpm;
    }
}

fn whole_bpm(bpm: Option<f64>) -> Option<i64> {
    bpm.map(|b| b.trunc() as i64)
}

/// What a transposition produced besides new audio.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KeyChange {
    pub new_key: Option<MusicalKey>,
    pub new_bpm: Option<f64>,
}

/// Parse the tempo field and return the change to request from the
/// transposition service, `None` when the text is not a number or the tempo
/// did not change.
pub fn bpm_delta(input: &str, current: f64) -> Option<i32> {
    let requested = input.trim().parse::<f64>().ok()?;
    if !requested.is_finite() || !current.is_finite() {
        return None;
    }
    let delta = requested.trunc() as i64 - current.trunc() as i64;
    if delta == 0 {
        return None;
    }
    i32::try_from(delta).ok()
}
