use stemsync_transport::{
    AudioSink, Generation, PlaybackPhase, SinkBackend, SinkEvent, SinkEventKind, StemName,
    StemSet, TransportState,
};

use crate::collab::AnalysisManifest;
use crate::config::PlayerConfig;
use crate::error::{PlayError, VolumeError};
use crate::key::{KeyChange, SongInfo};
use crate::mixer::VolumeMixer;
use crate::swap::SourceSwapController;
use crate::time::format_time;
use crate::transport::Transport;
use crate::waveform::WaveformView;

/// A playback session over one song.
///
/// Everything runs on the owner's thread. Call [`Player::pump`] from the UI
/// loop to take in sink events.
pub struct Player<B: SinkBackend> {
    backend: B,
    config: PlayerConfig,
    transport: Transport<B::Sink>,
    swaps: SourceSwapController<B::Sink>,
    mixer: VolumeMixer,
    waveform: WaveformView,
    song: Option<SongInfo>,
    events: Vec<SinkEvent>,
}

impl<B: SinkBackend> Player<B> {
    pub fn new(backend: B, config: PlayerConfig) -> Self {
        Self {
            backend,
            transport: Transport::new(config.duration_tolerance_secs),
            swaps: SourceSwapController::new(),
            mixer: VolumeMixer::new(config.default_volume),
            waveform: WaveformView::new(),
            song: None,
            events: Vec::new(),
            config,
        }
    }

    /// Start a session on an analysed song.
    pub fn load_analysis(&mut self, manifest: &AnalysisManifest) -> Generation {
        log::info!(
            "loading '{}' ({} stems)",
            if manifest.title.is_empty() { &manifest.id } else { &manifest.title },
            manifest.stems.len()
        );
        self.song = Some(manifest.song_info());
        self.load(manifest.stems.clone())
    }

    /// Start a session on `stem_set`, which becomes the reset target.
    ///
    /// Volumes and the selected waveform go back to their defaults.
    pub fn load(&mut self, stem_set: StemSet) -> Generation {
        self.transport.pause();
        self.transport.seek(0.0);
        self.mixer = VolumeMixer::new(self.config.default_volume);
        self.waveform = WaveformView::new();
        let generation = self.swaps.begin(&mut self.backend, stem_set);
        self.settle();
        generation
    }

    pub fn play(&mut self) -> Result<(), PlayError> {
        let result = self.transport.play();
        if let Err(e) = &result {
            log::warn!("play failed: {e}");
        }
        result
    }

    pub fn pause(&mut self) {
        self.transport.pause();
        self.waveform.sync(&self.transport.state());
    }

    pub fn toggle(&mut self) -> Result<(), PlayError> {
        if self.transport.state().is_playing {
            self.pause();
            Ok(())
        } else {
            self.play()
        }
    }

    pub fn seek(&mut self, seconds: f64) {
        self.transport.seek(seconds);
        self.waveform.sync(&self.transport.state());
    }

    pub fn on_volume_change(&mut self, stem: StemName, value: f32) -> Result<(), VolumeError> {
        self.mixer.set_volume(stem, value, &mut self.transport)
    }

    /// Swap to the stems a transposition produced.
    pub fn on_key_change(&mut self, stem_set: StemSet, change: KeyChange) -> Generation {
        if let Some(song) = self.song.as_mut() {
            song.apply(&change);
        }
        let generation = self.swaps.request(&mut self.backend, stem_set);
        self.settle();
        generation
    }

    /// Return to the stems, key and tempo from analysis. `None` when already
    /// there.
    pub fn reset(&mut self) -> Option<Generation> {
        if let Some(song) = self.song.as_mut() {
            song.restore();
        }
        let generation = self.swaps.reset(&mut self.backend)?;
        self.settle();
        Some(generation)
    }

    pub fn select_stem(&mut self, stem: StemName) {
        self.waveform.select_stem(stem);
    }

    pub fn scrub(&mut self, fraction: f64) -> Option<f64> {
        self.waveform.on_user_scrub(fraction, &mut self.transport)
    }

    /// Take in every queued sink event. Returns how many were applied; stale
    /// ones are dropped without effect.
    pub fn pump(&mut self) -> usize {
        self.events.clear();
        self.backend.drain_events(&mut self.events);

        let live = self.transport.generation();
        let pending = self.swaps.pending_generation();
        let mut applied = 0;

        for event in self.events.drain(..) {
            if event.generation == live && !self.transport.is_empty() {
                match &event.kind {
                    SinkEventKind::Ready { duration_secs } => {
                        self.transport.on_ready(event.stem, *duration_secs)
                    }
                    SinkEventKind::Failed { reason } => {
                        self.transport.on_failed(event.stem, reason)
                    }
                    SinkEventKind::TimeUpdate { position_secs } => {
                        self.transport.on_time_update(event.stem, *position_secs)
                    }
                    SinkEventKind::Ended => self.transport.on_ended(event.stem),
                }
                applied += 1;
            } else if Some(event.generation) == pending {
                self.swaps.on_event(&event);
                applied += 1;
            } else {
                log::debug!(
                    "dropping {:?} from stale {} for {}",
                    event.kind,
                    event.generation,
                    event.stem
                );
            }
        }

        self.settle();
        if self.transport.phase() == PlaybackPhase::Playing {
            self.transport
                .resync_if_drifted(self.config.sync_epsilon_secs);
        }
        self.waveform.sync(&self.transport.state());
        applied
    }

    fn settle(&mut self) {
        if self.swaps.settle(&mut self.transport, &self.mixer).is_some() {
            self.waveform.sync(&self.transport.state());
        }
    }

    pub fn state(&self) -> TransportState {
        self.transport.state()
    }

    /// `m:ss / m:ss`
    pub fn readout(&self) -> String {
        let state = self.transport.state();
        format!(
            "{} / {}",
            format_time(state.position_secs),
            format_time(state.duration_secs)
        )
    }

    pub fn transport(&self) -> &Transport<B::Sink> {
        &self.transport
    }

    pub fn swaps(&self) -> &SourceSwapController<B::Sink> {
        &self.swaps
    }

    pub fn mixer(&self) -> &VolumeMixer {
        &self.mixer
    }

    pub fn waveform(&self) -> &WaveformView {
        &self.waveform
    }

    pub fn waveform_columns(&self, width: usize) -> Vec<(f32, f32)> {
        self.waveform.columns(&self.transport, width)
    }

    pub fn song(&self) -> Option<&SongInfo> {
        self.song.as_ref()
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Stems playback is on, or heading to once a swap commits.
    pub fn stem_set(&self) -> &StemSet {
        self.swaps.latest()
    }

    pub fn is_loading(&self) -> bool {
        self.swaps.is_swapping()
    }

    /// Positions of the live sinks, in stem order.
    pub fn sink_positions(&self) -> Vec<(StemName, f64)> {
        self.transport
            .stems()
            .filter_map(|stem| Some((stem, self.transport.sink(stem)?.position())))
            .collect()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}
