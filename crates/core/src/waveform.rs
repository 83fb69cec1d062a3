use std::sync::Arc;

use stemsync_transport::{AudioSink, StemName, TransportState, WaveformData};

use crate::transport::Transport;

/// What the waveform canvas draws.
#[derive(Debug, Clone, PartialEq)]
pub enum WaveformTrace {
    Peaks(Arc<WaveformData>),
    /// Flat line: the selected stem is absent, still loading, or failed.
    Placeholder,
}

/// Scrub surface for one stem.
///
/// Position flows one way into the cursor. Only [`WaveformView::on_user_scrub`]
/// seeks.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformView {
    selected: StemName,
    cursor_secs: f64,
}

impl WaveformView {
    pub fn new() -> Self {
        Self {
            selected: StemName::Soprano,
            cursor_secs: 0.0,
        }
    }

    pub fn selected(&self) -> StemName {
        self.selected
    }

    pub fn cursor_secs(&self) -> f64 {
        self.cursor_secs
    }

    pub fn select_stem(&mut self, stem: StemName) {
        self.selected = stem;
    }

    /// Move the cursor to the transport position.
    pub fn sync(&mut self, state: &TransportState) {
        self.cursor_secs = state.position_secs;
    }

    /// Cursor as a fraction of the selected stem's duration.
    pub fn cursor_fraction<S: AudioSink>(&self, transport: &Transport<S>) -> f64 {
        let duration = self.duration(transport);
        if duration <= 0.0 {
            return 0.0;
        }
        (self.cursor_secs / duration).clamp(0.0, 1.0)
    }

    pub fn trace<S: AudioSink>(&self, transport: &Transport<S>) -> WaveformTrace {
        match transport.sink(self.selected).and_then(|s| s.waveform()) {
            Some(peaks) => WaveformTrace::Peaks(peaks),
            None => WaveformTrace::Placeholder,
        }
    }

    /// Min/max pairs for `width` columns; all zeros for the placeholder.
    pub fn columns<S: AudioSink>(&self, transport: &Transport<S>, width: usize) -> Vec<(f32, f32)> {
        match self.trace(transport) {
            WaveformTrace::Peaks(peaks) => peaks.columns(width),
            WaveformTrace::Placeholder => vec![(0.0, 0.0); width],
        }
    }

    /// Seek to `fraction` of the selected stem. Falls back to the transport
    /// duration when that stem has none. Returns the seek target.
    pub fn on_user_scrub<S: AudioSink>(
        &mut self,
        fraction: f64,
        transport: &mut Transport<S>,
    ) -> Option<f64> {
        if fraction.is_nan() {
            return None;
        }
        let duration = self.duration(transport);
        if duration <= 0.0 {
            return None;
        }
        let target = fraction.clamp(0.0, 1.0) * duration;
        transport.seek(target);
        self.sync(&transport.state());
        Some(target)
    }

    fn duration<S: AudioSink>(&self, transport: &Transport<S>) -> f64 {
        transport
            .sink(self.selected)
            .and_then(|s| s.duration())
            .filter(|d| *d > 0.0)
            .unwrap_or(transport.state().duration_secs)
    }
}

impl Default for WaveformView {
    fn default() -> Self {
        Self::new()
    }
}
