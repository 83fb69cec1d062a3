//! Source swaps.
//!
//! A swap opens sinks for the new stem set in the background while the live
//! sinks keep playing. Once every new sink has loaded or failed, the swap
//! commits: the live sinks are dropped and the new ones take over at the
//! live position, volume and play state. A newer request supersedes a swap
//! still loading; its sinks are dropped and never commit.

use std::collections::BTreeMap;

use stemsync_transport::{
    AudioSink, Generation, ReadyState, SinkBackend, SinkEvent, SinkEventKind, SinkRequest,
    StemName, StemSet,
};

use crate::mixer::VolumeMixer;
use crate::transport::Transport;

struct PendingSwap<S> {
    generation: Generation,
    stem_set: StemSet,
    sinks: BTreeMap<StemName, S>,
}

impl<S: AudioSink> PendingSwap<S> {
    fn is_settled(&self) -> bool {
        self.sinks
            .values()
            .all(|s| s.ready_state() != ReadyState::Loading)
    }
}

pub struct SourceSwapController<S> {
    original: Option<StemSet>,
    current: StemSet,
    pending: Option<PendingSwap<S>>,
    last_issued: Generation,
}

impl<S: AudioSink> SourceSwapController<S> {
    pub fn new() -> Self {
        Self {
            original: None,
            current: StemSet::empty(),
            pending: None,
            last_issued: Generation::default(),
        }
    }

    /// Stem set of the live sinks.
    pub fn current(&self) -> &StemSet {
        &self.current
    }

    /// Stem set captured at the first analysis, the target of [`Self::reset`].
    pub fn original(&self) -> Option<&StemSet> {
        self.original.as_ref()
    }

    pub fn pending_generation(&self) -> Option<Generation> {
        self.pending.as_ref().map(|p| p.generation)
    }

    pub fn is_swapping(&self) -> bool {
        self.pending.is_some()
    }

    /// The stem set playback will end up on: the pending one, else the live one.
    pub fn latest(&self) -> &StemSet {
        self.pending
            .as_ref()
            .map(|p| &p.stem_set)
            .unwrap_or(&self.current)
    }

    /// Start a new session. `stem_set` becomes the reset target.
    pub fn begin<B>(&mut self, backend: &mut B, stem_set: StemSet) -> Generation
    where
        B: SinkBackend<Sink = S>,
    {
        self.original = Some(stem_set.clone());
        self.request(backend, stem_set)
    }

    /// Open sinks for `stem_set` under a fresh generation.
    pub fn request<B>(&mut self, backend: &mut B, stem_set: StemSet) -> Generation
    where
        B: SinkBackend<Sink = S>,
    {
        self.last_issued = self.last_issued.next();
        let generation = self.last_issued;

        if let Some(stale) = self.pending.take() {
            log::debug!("{} superseded by {generation}", stale.generation);
        }
        if stem_set.is_empty() {
            log::warn!("{generation}: stem set is empty, nothing will play");
        }

        let sinks = stem_set
            .iter()
            .map(|(stem, locator)| {
                let sink = backend.open(SinkRequest {
                    generation,
                    stem,
                    locator: locator.to_string(),
                });
                (stem, sink)
            })
            .collect();

        self.pending = Some(PendingSwap {
            generation,
            stem_set,
            sinks,
        });
        generation
    }

    /// Swap back to the original stem set.
    ///
    /// Returns `None` when there is no original yet, or when playback is
    /// already on (or heading to) it.
    pub fn reset<B>(&mut self, backend: &mut B) -> Option<Generation>
    where
        B: SinkBackend<Sink = S>,
    {
        let original = self.original.clone()?;
        if *self.latest() == original {
            log::debug!("reset: already on the original stems");
            return None;
        }
        Some(self.request(backend, original))
    }

    /// Handle an event from a sink of the pending swap.
    pub fn on_event(&mut self, event: &SinkEvent) {
        let Some(pending) = self
            .pending
            .as_mut()
            .filter(|p| p.generation == event.generation)
        else {
            return;
        };
        match &event.kind {
            SinkEventKind::Ready { duration_secs } => {
                log::debug!(
                    "{}: {} loaded, {duration_secs:.3}s",
                    event.generation,
                    event.stem
                );
            }
            SinkEventKind::Failed { reason } => {
                log::warn!(
                    "{}: {} failed to load, continuing without it: {reason}",
                    event.generation,
                    event.stem
                );
                pending.sinks.remove(&event.stem);
            }
            SinkEventKind::TimeUpdate { .. } | SinkEventKind::Ended => {}
        }
    }

    /// Commit the pending swap once every sink has settled.
    ///
    /// Returns the committed generation. A swap whose every sink failed is
    /// dropped while other sinks are live.
    pub fn settle(
        &mut self,
        transport: &mut Transport<S>,
        mixer: &VolumeMixer,
    ) -> Option<Generation> {
        if !self.pending.as_ref().is_some_and(|p| p.is_settled()) {
            return None;
        }
        let mut pending = self.pending.take()?;

        if pending.sinks.is_empty() && !pending.stem_set.is_empty() && !transport.is_empty() {
            log::warn!(
                "{}: no stem could be loaded, keeping {}",
                pending.generation,
                transport.generation()
            );
            return None;
        }

        mixer.apply_all(pending.sinks.values_mut());

        let resume = transport.state().is_playing;
        transport.pause();
        let position = transport.state().position_secs;

        let stems: Vec<&str> = pending.sinks.keys().map(|s| s.as_str()).collect();
        log::info!(
            "{}: swapping in [{}] at {position:.3}s",
            pending.generation,
            stems.join(", ")
        );

        transport.install(pending.generation, pending.sinks);
        transport.seek(position);
        if resume {
            if let Err(e) = transport.play() {
                log::warn!("{}: could not resume playback: {e}", pending.generation);
            }
        }

        self.current = pending.stem_set;
        Some(pending.generation)
    }
}

impl<S: AudioSink> Default for SourceSwapController<S> {
    fn default() -> Self {
        Self::new()
    }
}
