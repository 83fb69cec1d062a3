use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical stem produced by the separation backend.
///
/// The declaration order is the display and iteration order everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StemName {
    Soprano,
    Alto,
    Tenor,
    #[serde(alias = "instrumental")]
    Instrumentals,
}

impl StemName {
    pub const ALL: [StemName; 4] = [
        StemName::Soprano,
        StemName::Alto,
        StemName::Tenor,
        StemName::Instrumentals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StemName::Soprano => "soprano",
            StemName::Alto => "alto",
            StemName::Tenor => "tenor",
            StemName::Instrumentals => "instrumentals",
        }
    }

    /// Capitalized label for selectors and sliders.
    pub fn label(&self) -> &'static str {
        match self {
            StemName::Soprano => "Soprano",
            StemName::Alto => "Alto",
            StemName::Tenor => "Tenor",
            StemName::Instrumentals => "Instrumentals",
        }
    }
}

impl fmt::Display for StemName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stem name '{0}'")]
pub struct UnknownStem(pub String);

impl FromStr for StemName {
    type Err = UnknownStem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "soprano" | "vocal" | "vocals" => Ok(StemName::Soprano),
            "alto" => Ok(StemName::Alto),
            "tenor" => Ok(StemName::Tenor),
            "instrumentals" | "instrumental" => Ok(StemName::Instrumentals),
            _ => Err(UnknownStem(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StemSetError {
    #[error("stem set has neither a soprano nor an instrumentals stem")]
    MissingPrimaryStem,
}

/// One playable version of a song: stem name to resource locator.
///
/// A `StemSet` never changes after construction. Transposing, retiming or
/// resetting a song yields a new one. Empty locators are dropped on the way
/// in, so an absent stem is simply not in the map.
///
/// ```
/// use stemsync_transport::{StemName, StemSet};
///
/// let set = StemSet::new([
///     (StemName::Soprano, "a.mp3"),
///     (StemName::Alto, ""),
///     (StemName::Instrumentals, "b.mp3"),
/// ])
/// .unwrap();
/// assert_eq!(set.len(), 2);
/// assert!(set.is_solo());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<StemName, Option<String>>",
    into = "BTreeMap<StemName, String>"
)]
pub struct StemSet {
    locators: BTreeMap<StemName, String>,
}

impl StemSet {
    /// Build a stem set, dropping blank locators.
    ///
    /// Fails unless soprano or instrumentals is present.
    pub fn new<I, S>(stems: I) -> Result<Self, StemSetError>
    where
        I: IntoIterator<Item = (StemName, S)>,
        S: Into<String>,
    {
        let locators: BTreeMap<StemName, String> = stems
            .into_iter()
            .map(|(name, locator)| (name, locator.into().trim().to_string()))
            .filter(|(_, locator)| !locator.is_empty())
            .collect();

        if !locators.contains_key(&StemName::Soprano)
            && !locators.contains_key(&StemName::Instrumentals)
        {
            return Err(StemSetError::MissingPrimaryStem);
        }

        Ok(Self { locators })
    }

    /// The empty set: no sinks, no duration. Used when a collaborator hands
    /// over nothing usable.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, stem: StemName) -> Option<&str> {
        self.locators.get(&stem).map(String::as_str)
    }

    pub fn contains(&self, stem: StemName) -> bool {
        self.locators.contains_key(&stem)
    }

    pub fn iter(&self) -> impl Iterator<Item = (StemName, &str)> + '_ {
        self.locators.iter().map(|(name, url)| (*name, url.as_str()))
    }

    pub fn stems(&self) -> impl Iterator<Item = StemName> + '_ {
        self.locators.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.locators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }

    /// True for two-stem separations (no alto, no tenor).
    pub fn is_solo(&self) -> bool {
        !self.contains(StemName::Alto) && !self.contains(StemName::Tenor)
    }
}

impl TryFrom<BTreeMap<StemName, Option<String>>> for StemSet {
    type Error = StemSetError;

    /// Backend payloads use `null` or `""` for stems a solo separation lacks.
    /// A payload with nothing at all maps to the empty set.
    fn try_from(map: BTreeMap<StemName, Option<String>>) -> Result<Self, Self::Error> {
        let present: Vec<(StemName, String)> = map
            .into_iter()
            .filter_map(|(name, locator)| locator.map(|l| (name, l)))
            .filter(|(_, locator)| !locator.trim().is_empty())
            .collect();
        if present.is_empty() {
            return Ok(Self::empty());
        }
        Self::new(present)
    }
}

impl From<StemSet> for BTreeMap<StemName, String> {
    fn from(set: StemSet) -> Self {
        set.locators
    }
}
