use std::collections::BTreeMap;

use stemsync_transport::{AudioSink, StemName};

use crate::error::VolumeError;
use crate::transport::Transport;

/// Per-stem gain, kept for every stem whether or not it is currently bound.
///
/// Entries outlive source swaps: a stem that disappears keeps its gain and
/// gets it back when it reappears.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMixer {
    gains: BTreeMap<StemName, f32>,
}

impl VolumeMixer {
    pub fn new(default_volume: f32) -> Self {
        let default_volume = if default_volume.is_finite() {
            default_volume.clamp(0.0, 1.0)
        } else {
            0.5
        };
        Self {
            gains: StemName::ALL.iter().map(|s| (*s, default_volume)).collect(),
        }
    }

    pub fn volume(&self, stem: StemName) -> f32 {
        self.gains.get(&stem).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (StemName, f32)> + '_ {
        self.gains.iter().map(|(stem, gain)| (*stem, *gain))
    }

    /// Store `value` (clamped to `[0, 1]`) and apply it to the live sink for
    /// `stem`, if there is one.
    pub fn set_volume<S: AudioSink>(
        &mut self,
        stem: StemName,
        value: f32,
        transport: &mut Transport<S>,
    ) -> Result<(), VolumeError> {
        if !value.is_finite() {
            return Err(VolumeError::NotFinite { stem, value });
        }
        let value = value.clamp(0.0, 1.0);
        self.gains.insert(stem, value);
        if !transport.apply_gain(stem, value) {
            log::debug!("{stem} has no live sink, volume {value:.2} stored");
        }
        Ok(())
    }

    /// Push every stored gain to the given sinks.
    pub fn apply_all<'a, S: AudioSink + 'a>(&self, sinks: impl IntoIterator<Item = &'a mut S>) {
        for sink in sinks {
            sink.set_volume(self.volume(sink.stem()));
        }
    }
}

impl Default for VolumeMixer {
    fn default() -> Self {
        Self::new(0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stemsync_engine::{ClockBackend, ClockSink, ProbedResource};
    use stemsync_transport::{Generation, SinkBackend, SinkRequest};

    fn live_soprano(backend: &mut ClockBackend) -> Transport<ClockSink> {
        let sink = backend.open(SinkRequest {
            generation: Generation(1),
            stem: StemName::Soprano,
            locator: "s.wav".to_string(),
        });
        let mut transport = Transport::new(0.1);
        transport.install(Generation(1), [(StemName::Soprano, sink)].into_iter().collect());
        transport
    }

    #[test]
    fn test_defaults() {
        let mixer = VolumeMixer::default();
        for stem in StemName::ALL {
            assert_eq!(mixer.volume(stem), 0.5);
        }
        assert_eq!(VolumeMixer::new(3.0).volume(StemName::Alto), 1.0);
    }

    #[test]
    fn test_set_volume_applies_to_live_sink() {
        let mut backend = ClockBackend::new(|_| Ok(ProbedResource::silent(10.0)));
        let mut transport = live_soprano(&mut backend);
        let mut mixer = VolumeMixer::default();

        mixer
            .set_volume(StemName::Soprano, 0.8, &mut transport)
            .unwrap();
        assert_eq!(mixer.volume(StemName::Soprano), 0.8);
        assert_eq!(
            transport.sink(StemName::Soprano).map(|s| s.volume()),
            Some(0.8)
        );
    }

    #[test]
    fn test_set_volume_without_sink_is_stored() {
        let mut backend = ClockBackend::new(|_| Ok(ProbedResource::silent(10.0)));
        let mut transport = live_soprano(&mut backend);
        let mut mixer = VolumeMixer::default();

        mixer.set_volume(StemName::Alto, 0.3, &mut transport).unwrap();
        assert_eq!(mixer.volume(StemName::Alto), 0.3);
        assert_eq!(
            transport.sink(StemName::Soprano).map(|s| s.volume()),
            Some(1.0)
        );
    }

    #[test]
    fn test_out_of_range_is_clamped() {
        let mut backend = ClockBackend::new(|_| Ok(ProbedResource::silent(10.0)));
        let mut transport = live_soprano(&mut backend);
        let mut mixer = VolumeMixer::default();

        mixer.set_volume(StemName::Tenor, 1.7, &mut transport).unwrap();
        assert_eq!(mixer.volume(StemName::Tenor), 1.0);
        mixer.set_volume(StemName::Tenor, -0.2, &mut transport).unwrap();
        assert_eq!(mixer.volume(StemName::Tenor), 0.0);
    }

    #[test]
    fn test_nan_is_rejected() {
        let mut backend = ClockBackend::new(|_| Ok(ProbedResource::silent(10.0)));
        let mut transport = live_soprano(&mut backend);
        let mut mixer = VolumeMixer::default();

        let err = mixer
            .set_volume(StemName::Soprano, f32::NAN, &mut transport)
            .unwrap_err();
        assert!(matches!(err, VolumeError::NotFinite { .. }));
        assert_eq!(mixer.volume(StemName::Soprano), 0.5);
    }
}
