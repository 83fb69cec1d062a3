use std::fmt;

/// Observable transport snapshot. Only the transport writes it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportState {
    pub position_secs: f64,
    pub is_playing: bool,
    pub duration_secs: f64,
}

impl TransportState {
    /// Position as a fraction of the duration, 0.0 while the duration is unknown.
    pub fn progress(&self) -> f64 {
        if self.duration_secs <= 0.0 {
            return 0.0;
        }
        (self.position_secs / self.duration_secs).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackPhase {
    /// No sink has reported a duration yet.
    #[default]
    Idle,
    Paused,
    Playing,
}

impl PlaybackPhase {
    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackPhase::Playing)
    }
}

/// Tag for one version of the sink set.
///
/// Every swap takes the next generation, and every sink event carries the
/// generation of the sink that emitted it, so late events from a replaced
/// set can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}
