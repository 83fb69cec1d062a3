//! Payloads exchanged with the analysis and transposition service.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use stemsync_transport::{StemName, StemSet, StemSetError};

use crate::key::{KeyChange, MusicalKey, SongInfo};

/// Body of `/change_key` and `/change_bpm`. `value` is semitones or BPM
/// respectively.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub value: i32,
    pub current_key: String,
    #[serde(rename = "currentBPM")]
    pub current_bpm: i64,
    pub song_id: String,
    pub current_audio_stems: StemSet,
}

/// Body of `/reset`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    pub song_id: String,
}

/// What the service returns after a key, tempo or reset operation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChangeResponse {
    #[serde(default)]
    pub soprano: Option<String>,
    #[serde(default)]
    pub alto: Option<String>,
    #[serde(default)]
    pub tenor: Option<String>,
    #[serde(default, alias = "instrumentals")]
    pub instrumental: Option<String>,
    #[serde(default)]
    pub new_key: Option<String>,
    #[serde(default)]
    pub new_bpm: Option<f64>,
}

impl ChangeResponse {
    /// Stem set with locators made absolute against `base_url`. A response
    /// without any stem gives the empty set.
    pub fn stem_set(&self, base_url: &str) -> Result<StemSet, StemSetError> {
        let stems: Vec<(StemName, String)> = [
            (StemName::Soprano, &self.soprano),
            (StemName::Alto, &self.alto),
            (StemName::Tenor, &self.tenor),
            (StemName::Instrumentals, &self.instrumental),
        ]
        .into_iter()
        .filter_map(|(stem, locator)| {
            let locator = locator.as_deref()?.trim();
            (!locator.is_empty()).then(|| (stem, resolve_locator(base_url, locator)))
        })
        .collect();

        if stems.is_empty() {
            return Ok(StemSet::empty());
        }
        StemSet::new(stems)
    }

    pub fn key_change(&self) -> KeyChange {
        let new_key = self.new_key.as_deref().and_then(|k| match k.parse::<MusicalKey>() {
            Ok(key) => Some(key),
            Err(e) => {
                log::warn!("ignoring key from service: {e}");
                None
            }
        });
        KeyChange {
            new_key,
            new_bpm: self.new_bpm.filter(|b| b.is_finite() && *b > 0.0),
        }
    }
}

/// Join a locator returned by the service onto its base URL. Locators that
/// already carry a scheme pass through.
pub fn resolve_locator(base_url: &str, locator: &str) -> String {
    if locator.contains("://") {
        return locator.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        locator.trim_start_matches(['/', '\\'])
    )
}

/// One analysed song.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalysisManifest {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub bpm: Option<f64>,
    #[serde(default)]
    pub lyrics: String,
    #[serde(default)]
    pub stems: StemSet,
}

impl AnalysisManifest {
    /// Read a manifest file. Relative file locators are taken relative to the
    /// manifest's directory.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let manifest: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        manifest.rebased(dir).map_err(Into::into)
    }

    fn rebased(mut self, dir: &Path) -> Result<Self, StemSetError> {
        if self.stems.is_empty() {
            return Ok(self);
        }
        let stems: Vec<(StemName, String)> = self
            .stems
            .iter()
            .map(|(stem, locator)| {
                let relative = !locator.contains("://") && Path::new(locator).is_relative();
                let locator = if relative {
                    dir.join(locator).to_string_lossy().into_owned()
                } else {
                    locator.to_string()
                };
                (stem, locator)
            })
            .collect();
        self.stems = StemSet::new(stems)?;
        Ok(self)
    }

    pub fn song_info(&self) -> SongInfo {
        let key = self.key.as_deref().and_then(|k| match k.parse::<MusicalKey>() {
            Ok(key) => Some(key),
            Err(e) => {
                log::warn!("{}: {e}", self.id);
                None
            }
        });
        SongInfo::new(key, self.bpm)
    }
}
