//! One play-head over every live sink.
//!
//! Bindings are keyed by stem name. The first binding in stem order is the
//! lead: its time updates drive the reported position.

use std::collections::BTreeMap;

use stemsync_transport::{AudioSink, Generation, PlaybackPhase, StemName, TransportState};

use crate::error::PlayError;

pub struct Transport<S> {
    bindings: BTreeMap<StemName, S>,
    generation: Generation,
    state: TransportState,
    phase: PlaybackPhase,
    duration_tolerance: f64,
    duration_mismatch: Option<f64>,
}

impl<S: AudioSink> Transport<S> {
    pub fn new(duration_tolerance: f64) -> Self {
        Self {
            bindings: BTreeMap::new(),
            generation: Generation::default(),
            state: TransportState::default(),
            phase: PlaybackPhase::Idle,
            duration_tolerance,
            duration_mismatch: None,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    /// Generation of the installed bindings.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn stems(&self) -> impl Iterator<Item = StemName> + '_ {
        self.bindings.keys().copied()
    }

    pub fn sink(&self, stem: StemName) -> Option<&S> {
        self.bindings.get(&stem)
    }

    /// Spread between the shortest and longest stem, when it exceeds the
    /// tolerance.
    pub fn duration_mismatch(&self) -> Option<f64> {
        self.duration_mismatch
    }

    /// Replace every binding. Old sinks are dropped, which releases them.
    ///
    /// The position is kept, playback stops; the caller decides whether to
    /// resume.
    pub fn install(&mut self, generation: Generation, bindings: BTreeMap<StemName, S>) {
        for sink in self.bindings.values_mut() {
            sink.pause();
        }
        self.bindings = bindings;
        self.generation = generation;
        self.state.is_playing = false;
        self.refresh_duration();
    }

    /// Start every sink, or none.
    ///
    /// Sinks are aligned to the transport position first. If any sink refuses,
    /// the ones already started are paused again and the first error is
    /// returned. Playing from the very end restarts from zero.
    pub fn play(&mut self) -> Result<(), PlayError> {
        if self.bindings.is_empty() {
            self.state.is_playing = false;
            return Err(PlayError::NoSinks);
        }
        if self.phase.is_playing() {
            return Ok(());
        }

        if self.state.duration_secs > 0.0 && self.state.position_secs >= self.state.duration_secs
        {
            self.state.position_secs = 0.0;
        }
        let position = self.state.position_secs;
        for sink in self.bindings.values_mut() {
            sink.set_position(position);
        }

        let mut failure = None;
        for (stem, sink) in self.bindings.iter_mut() {
            if let Err(e) = sink.play() {
                log::warn!("{stem} failed to start: {e}");
                failure.get_or_insert(e);
            }
        }

        if let Some(e) = failure {
            self.stop_all();
            return Err(e.into());
        }

        self.state.is_playing = true;
        self.phase = PlaybackPhase::Playing;
        Ok(())
    }

    /// Stop every sink. The position settles on where the lead stopped.
    pub fn pause(&mut self) {
        if self.phase.is_playing() {
            if let Some(lead) = self.lead().and_then(|stem| self.bindings.get(&stem)) {
                self.state.position_secs = lead.position().min(self.state.duration_secs);
            }
        }
        self.stop_all();
    }

    /// Move every sink to `seconds`, clamped to the duration.
    ///
    /// Does nothing until a duration is known. The reported position changes
    /// at once, without waiting for the sinks.
    pub fn seek(&mut self, seconds: f64) {
        if self.state.duration_secs <= 0.0 || seconds.is_nan() {
            return;
        }
        let seconds = seconds.clamp(0.0, self.state.duration_secs);
        for sink in self.bindings.values_mut() {
            sink.set_position(seconds);
        }
        self.state.position_secs = seconds;
    }

    /// Set the gain of the live sink for `stem`. Returns false when there is
    /// none.
    pub fn apply_gain(&mut self, stem: StemName, gain: f32) -> bool {
        match self.bindings.get_mut(&stem) {
            Some(sink) => {
                sink.set_volume(gain);
                true
            }
            None => false,
        }
    }

    pub fn on_ready(&mut self, stem: StemName, duration_secs: f64) {
        log::debug!("{stem} ready, {duration_secs:.3}s");
        self.refresh_duration();
    }

    pub fn on_time_update(&mut self, stem: StemName, position_secs: f64) {
        if !self.phase.is_playing() || self.lead() != Some(stem) {
            return;
        }
        self.state.position_secs = position_secs.clamp(0.0, self.state.duration_secs);
    }

    /// The first stem to end ends playback for all.
    pub fn on_ended(&mut self, stem: StemName) {
        if let Some(sink) = self.bindings.get(&stem) {
            self.state.position_secs = sink.position().min(self.state.duration_secs);
        }
        log::debug!("{stem} ended at {:.3}s", self.state.position_secs);
        self.stop_all();
    }

    /// A live sink lost its resource; it is dropped and the rest carry on.
    pub fn on_failed(&mut self, stem: StemName, reason: &str) {
        if self.bindings.remove(&stem).is_some() {
            log::warn!("{stem} dropped from playback: {reason}");
        }
        self.refresh_duration();
        if self.bindings.is_empty() {
            self.stop_all();
        }
    }

    /// Largest position difference between two bound sinks.
    pub fn drift(&self) -> f64 {
        let mut positions = self.bindings.values().map(|s| s.position());
        let Some(first) = positions.next() else {
            return 0.0;
        };
        let (min, max) = positions.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p)));
        max - min
    }

    /// Realign every sink to the lead when they drifted further than
    /// `epsilon` apart. Returns true if a correction was made.
    pub fn resync_if_drifted(&mut self, epsilon: f64) -> bool {
        let drift = self.drift();
        if drift <= epsilon {
            return false;
        }
        let Some(lead) = self.lead().and_then(|stem| self.bindings.get(&stem)) else {
            return false;
        };
        let position = lead.position();
        log::debug!("sinks drifted {drift:.3}s apart, realigning at {position:.3}s");
        for sink in self.bindings.values_mut() {
            sink.set_position(position);
        }
        true
    }

    fn lead(&self) -> Option<StemName> {
        self.bindings.keys().next().copied()
    }

    fn stop_all(&mut self) {
        for sink in self.bindings.values_mut() {
            sink.pause();
        }
        self.state.is_playing = false;
        self.phase = if self.state.duration_secs > 0.0 {
            PlaybackPhase::Paused
        } else {
            PlaybackPhase::Idle
        };
    }

    fn refresh_duration(&mut self) {
        let durations: Vec<f64> = self.bindings.values().filter_map(|s| s.duration()).collect();
        let max = durations.iter().copied().fold(0.0, f64::max);
        let min = durations.iter().copied().fold(f64::INFINITY, f64::min);

        self.duration_mismatch = None;
        if durations.len() > 1 && max - min > self.duration_tolerance {
            log::error!(
                "stem durations diverge by {:.3}s ({min:.3}s to {max:.3}s)",
                max - min
            );
            self.duration_mismatch = Some(max - min);
        }

        self.state.duration_secs = max;
        self.state.position_secs = self.state.position_secs.min(max);
        if !self.state.is_playing {
            self.phase = if max > 0.0 {
                PlaybackPhase::Paused
            } else {
                PlaybackPhase::Idle
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stemsync_transport::{ReadyState, SinkError, WaveformData};

    #[derive(Debug)]
    struct FakeSink {
        stem: StemName,
        duration: f64,
        position: f64,
        playing: bool,
        volume: f32,
        refuse: bool,
    }

    impl FakeSink {
        fn new(stem: StemName, duration: f64) -> Self {
            Self {
                stem,
                duration,
                position: 0.0,
                playing: false,
                volume: 1.0,
                refuse: false,
            }
        }
    }

    impl AudioSink for FakeSink {
        fn stem(&self) -> StemName {
            self.stem
        }
        fn generation(&self) -> Generation {
            Generation(1)
        }
        fn ready_state(&self) -> ReadyState {
            ReadyState::Ready
        }
        fn duration(&self) -> Option<f64> {
            Some(self.duration)
        }
        fn position(&self) -> f64 {
            self.position
        }
        fn is_playing(&self) -> bool {
            self.playing
        }
        fn volume(&self) -> f32 {
            self.volume
        }
        fn play(&mut self) -> Result<(), SinkError> {
            if self.refuse {
                return Err(SinkError::Rejected {
                    stem: self.stem,
                    reason: "blocked".to_string(),
                });
            }
            self.playing = true;
            Ok(())
        }
        fn pause(&mut self) {
            self.playing = false;
        }
        fn set_position(&mut self, seconds: f64) {
            self.position = seconds.clamp(0.0, self.duration);
        }
        fn set_volume(&mut self, gain: f32) {
            self.volume = gain;
        }
        fn waveform(&self) -> Option<Arc<WaveformData>> {
            None
        }
    }

    fn transport(sinks: Vec<FakeSink>) -> Transport<FakeSink> {
        let mut transport = Transport::new(0.1);
        transport.install(
            Generation(1),
            sinks.into_iter().map(|s| (s.stem, s)).collect(),
        );
        transport
    }

    fn duet() -> Transport<FakeSink> {
        transport(vec![
            FakeSink::new(StemName::Soprano, 180.0),
            FakeSink::new(StemName::Instrumentals, 180.0),
        ])
    }

    #[test]
    fn test_empty_transport_is_idle() {
        let mut t: Transport<FakeSink> = Transport::new(0.1);
        assert_eq!(t.phase(), PlaybackPhase::Idle);
        assert_eq!(t.play(), Err(PlayError::NoSinks));
        assert!(!t.state().is_playing);

        t.seek(10.0);
        assert_eq!(t.state().position_secs, 0.0);
    }

    #[test]
    fn test_install_sets_duration_and_phase() {
        let t = duet();
        assert_eq!(t.state().duration_secs, 180.0);
        assert_eq!(t.phase(), PlaybackPhase::Paused);
        assert_eq!(t.generation(), Generation(1));
    }

    #[test]
    fn test_seek_clamps() {
        let mut t = duet();
        t.seek(200.0);
        assert_eq!(t.state().position_secs, 180.0);
        t.seek(-5.0);
        assert_eq!(t.state().position_secs, 0.0);
        t.seek(42.5);
        assert_eq!(t.state().position_secs, 42.5);
        assert!(t.bindings.values().all(|s| s.position == 42.5));
    }

    #[test]
    fn test_play_aligns_and_starts_all() {
        let mut t = duet();
        t.bindings.get_mut(&StemName::Instrumentals).unwrap().position = 7.0;
        t.play().unwrap();
        assert!(t.state().is_playing);
        assert_eq!(t.phase(), PlaybackPhase::Playing);
        assert!(t.bindings.values().all(|s| s.playing && s.position == 0.0));
    }

    #[test]
    fn test_play_is_all_or_nothing() {
        let mut t = duet();
        t.bindings.get_mut(&StemName::Instrumentals).unwrap().refuse = true;

        let err = t.play().unwrap_err();
        assert!(matches!(err, PlayError::Sink(SinkError::Rejected { .. })));
        assert!(!t.state().is_playing);
        assert_eq!(t.phase(), PlaybackPhase::Paused);
        assert!(t.bindings.values().all(|s| !s.playing));
    }

    #[test]
    fn test_play_while_playing_does_not_realign() {
        let mut t = duet();
        t.play().unwrap();
        t.bindings.get_mut(&StemName::Soprano).unwrap().position = 3.0;
        t.play().unwrap();
        assert_eq!(t.bindings[&StemName::Soprano].position, 3.0);
    }

    #[test]
    fn test_play_from_end_restarts() {
        let mut t = duet();
        t.seek(180.0);
        t.play().unwrap();
        assert_eq!(t.state().position_secs, 0.0);
    }

    #[test]
    fn test_only_lead_updates_position() {
        let mut t = duet();
        t.play().unwrap();
        t.on_time_update(StemName::Instrumentals, 9.0);
        assert_eq!(t.state().position_secs, 0.0);
        t.on_time_update(StemName::Soprano, 10.0);
        assert_eq!(t.state().position_secs, 10.0);
    }

    #[test]
    fn test_time_update_ignored_while_paused() {
        let mut t = duet();
        t.seek(30.0);
        t.on_time_update(StemName::Soprano, 12.0);
        assert_eq!(t.state().position_secs, 30.0);
    }

    #[test]
    fn test_first_end_pauses_everything() {
        let mut t = duet();
        t.play().unwrap();
        t.bindings.values_mut().for_each(|s| s.position = 180.0);
        t.on_ended(StemName::Instrumentals);
        assert!(!t.state().is_playing);
        assert_eq!(t.state().position_secs, 180.0);
        assert!(t.bindings.values().all(|s| !s.playing));
    }

    #[test]
    fn test_failed_sink_is_removed() {
        let mut t = transport(vec![
            FakeSink::new(StemName::Soprano, 180.0),
            FakeSink::new(StemName::Alto, 200.0),
        ]);
        assert_eq!(t.state().duration_secs, 200.0);
        t.on_failed(StemName::Alto, "decode error");
        assert_eq!(t.stems().collect::<Vec<_>>(), vec![StemName::Soprano]);
        assert_eq!(t.state().duration_secs, 180.0);
    }

    #[test]
    fn test_pause_settles_on_lead_position() {
        let mut t = duet();
        t.play().unwrap();
        t.bindings.values_mut().for_each(|s| s.position = 12.5);
        t.pause();
        assert_eq!(t.state().position_secs, 12.5);
        assert_eq!(t.phase(), PlaybackPhase::Paused);
    }

    #[test]
    fn test_losing_every_sink_stops_playback() {
        let mut t = transport(vec![FakeSink::new(StemName::Soprano, 180.0)]);
        t.play().unwrap();
        t.on_failed(StemName::Soprano, "gone");
        assert!(t.is_empty());
        assert!(!t.state().is_playing);
        assert_eq!(t.phase(), PlaybackPhase::Idle);
    }

    #[test]
    fn test_duration_divergence_is_flagged() {
        let t = transport(vec![
            FakeSink::new(StemName::Soprano, 180.0),
            FakeSink::new(StemName::Instrumentals, 150.0),
        ]);
        assert_eq!(t.state().duration_secs, 180.0);
        assert_eq!(t.duration_mismatch(), Some(30.0));

        let close = transport(vec![
            FakeSink::new(StemName::Soprano, 180.0),
            FakeSink::new(StemName::Instrumentals, 180.05),
        ]);
        assert_eq!(close.duration_mismatch(), None);
    }

    #[test]
    fn test_resync_realigns_to_lead() {
        let mut t = duet();
        t.play().unwrap();
        t.bindings.get_mut(&StemName::Soprano).unwrap().position = 20.0;
        t.bindings.get_mut(&StemName::Instrumentals).unwrap().position = 20.2;

        assert!(!t.resync_if_drifted(0.5));
        assert!(t.resync_if_drifted(0.05));
        assert_eq!(t.drift(), 0.0);
        assert_eq!(t.bindings[&StemName::Instrumentals].position, 20.0);
    }

    #[test]
    fn test_apply_gain() {
        let mut t = duet();
        assert!(t.apply_gain(StemName::Soprano, 0.3));
        assert_eq!(t.bindings[&StemName::Soprano].volume, 0.3);
        assert!(!t.apply_gain(StemName::Alto, 0.3));
    }
}
