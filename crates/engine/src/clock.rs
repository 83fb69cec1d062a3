//! Headless sinks driven by an explicit clock.
//!
//! Used when no output device is available and by the scenario tests.
//! Nothing is rendered: each sink is a position that moves when
//! [`ClockBackend::advance`] is called.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender, unbounded};
use stemsync_transport::{
    AudioSink, Generation, ReadyState, SinkBackend, SinkError, SinkEvent, SinkEventKind,
    SinkRequest, StemName, WaveformData,
};

/// What loading a locator yields for a clock sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbedResource {
    pub duration_secs: f64,
    pub waveform: Option<Arc<WaveformData>>,
}

impl ProbedResource {
    /// A resource with a known length and nothing to draw.
    pub fn silent(duration_secs: f64) -> Self {
        Self {
            duration_secs,
            waveform: None,
        }
    }
}

type Probe = Box<dyn Fn(&str) -> anyhow::Result<ProbedResource>>;
type SharedProbe = Arc<dyn Fn(&str) -> anyhow::Result<ProbedResource> + Send + Sync>;

type LoadId = u64;

/// Where probes run.
enum Loader {
    /// On the caller's thread, inside `drain_events`.
    Inline(Probe),
    /// One worker thread per load; results are picked up by `drain_events`.
    Threaded {
        probe: SharedProbe,
        tx: Sender<(LoadId, anyhow::Result<ProbedResource>)>,
        rx: Receiver<(LoadId, anyhow::Result<ProbedResource>)>,
        in_flight: HashMap<LoadId, Weak<RefCell<ClockVoice>>>,
        next_id: LoadId,
    },
}

#[derive(Debug)]
struct ClockVoice {
    generation: Generation,
    stem: StemName,
    ready: ReadyState,
    duration: Option<f64>,
    position: f64,
    playing: bool,
    volume: f32,
    waveform: Option<Arc<WaveformData>>,
}

/// Observable state of one live clock sink.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSnapshot {
    pub generation: Generation,
    pub stem: StemName,
    pub ready: ReadyState,
    pub position_secs: f64,
    pub is_playing: bool,
    pub volume: f32,
}

type PlayPolicy = Rc<RefCell<HashMap<StemName, String>>>;

pub struct ClockSink {
    voice: Rc<RefCell<ClockVoice>>,
    denied: PlayPolicy,
}

impl AudioSink for ClockSink {
    fn stem(&self) -> StemName {
        self.voice.borrow().stem
    }

    fn generation(&self) -> Generation {
        self.voice.borrow().generation
    }

    fn ready_state(&self) -> ReadyState {
        self.voice.borrow().ready
    }

    fn duration(&self) -> Option<f64> {
        self.voice.borrow().duration
    }

    fn position(&self) -> f64 {
        self.voice.borrow().position
    }

    fn is_playing(&self) -> bool {
        self.voice.borrow().playing
    }

    fn volume(&self) -> f32 {
        self.voice.borrow().volume
    }

    fn play(&mut self) -> Result<(), SinkError> {
        let mut voice = self.voice.borrow_mut();
        if let Some(reason) = self.denied.borrow().get(&voice.stem) {
            return Err(SinkError::Rejected {
                stem: voice.stem,
                reason: reason.clone(),
            });
        }
        if voice.ready != ReadyState::Ready {
            return Err(SinkError::NotReady { stem: voice.stem });
        }
        voice.playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.voice.borrow_mut().playing = false;
    }

    fn set_position(&mut self, seconds: f64) {
        let mut voice = self.voice.borrow_mut();
        voice.position = match voice.duration {
            Some(duration) => seconds.clamp(0.0, duration),
            None => seconds.max(0.0),
        };
    }

    fn set_volume(&mut self, gain: f32) {
        self.voice.borrow_mut().volume = gain.clamp(0.0, 1.0);
    }

    fn waveform(&self) -> Option<Arc<WaveformData>> {
        self.voice.borrow().waveform.clone()
    }
}

/// Sink backend without an audio device.
///
/// With [`ClockBackend::new`] loads complete on the next
/// [`SinkBackend::drain_events`] unless held with [`ClockBackend::hold_loads`].
/// [`ClockBackend::threaded`] and [`ClockBackend::decoding`] run each load on
/// a worker thread instead. Dropped sinks are forgotten: their pending loads
/// never complete and they stop emitting events.
pub struct ClockBackend {
    loader: Loader,
    voices: Vec<Weak<RefCell<ClockVoice>>>,
    pending: VecDeque<(Weak<RefCell<ClockVoice>>, String)>,
    events: VecDeque<SinkEvent>,
    holding: bool,
    denied: PlayPolicy,
}

impl ClockBackend {
    pub fn new(probe: impl Fn(&str) -> anyhow::Result<ProbedResource> + 'static) -> Self {
        Self::with_loader(Loader::Inline(Box::new(probe)))
    }

    /// Run `probe` off the caller's thread, one worker per load.
    pub fn threaded(
        probe: impl Fn(&str) -> anyhow::Result<ProbedResource> + Send + Sync + 'static,
    ) -> Self {
        let (tx, rx) = unbounded();
        Self::with_loader(Loader::Threaded {
            probe: Arc::new(probe),
            tx,
            rx,
            in_flight: HashMap::new(),
            next_id: 0,
        })
    }

    fn with_loader(loader: Loader) -> Self {
        Self {
            loader,
            voices: Vec::new(),
            pending: VecDeque::new(),
            events: VecDeque::new(),
            holding: false,
            denied: Rc::default(),
        }
    }

    /// Clock sinks whose durations and peaks come from decoding the locator.
    pub fn decoding(bucket_frames: usize) -> Self {
        Self::threaded(move |locator| {
            let audio = stemsync_decode::load_locator(locator)?;
            Ok(ProbedResource {
                duration_secs: audio.duration_secs(),
                waveform: Some(Arc::new(WaveformData::from_audio_arc(&audio, bucket_frames))),
            })
        })
    }

    /// Keep new loads pending until [`ClockBackend::release_loads`].
    pub fn hold_loads(&mut self) {
        self.holding = true;
    }

    pub fn release_loads(&mut self) {
        self.holding = false;
    }

    /// Loads still waiting, dropped sinks excluded.
    pub fn pending_loads(&self) -> usize {
        let queued = self
            .pending
            .iter()
            .filter(|(voice, _)| voice.strong_count() > 0)
            .count();
        let running = match &self.loader {
            Loader::Inline(_) => 0,
            Loader::Threaded { in_flight, .. } => {
                in_flight.values().filter(|v| v.strong_count() > 0).count()
            }
        };
        queued + running
    }

    /// Make every later `play()` on `stem` fail.
    pub fn deny_play(&mut self, stem: StemName, reason: impl Into<String>) {
        self.denied.borrow_mut().insert(stem, reason.into());
    }

    pub fn allow_play(&mut self, stem: StemName) {
        self.denied.borrow_mut().remove(&stem);
    }

    /// Queue an arbitrary event, as if a sink had emitted it.
    pub fn inject(&mut self, event: SinkEvent) {
        self.events.push_back(event);
    }

    pub fn live_sinks(&self) -> usize {
        self.voices.iter().filter(|v| v.strong_count() > 0).count()
    }

    pub fn snapshot(&self) -> Vec<VoiceSnapshot> {
        self.voices
            .iter()
            .filter_map(Weak::upgrade)
            .map(|voice| {
                let voice = voice.borrow();
                VoiceSnapshot {
                    generation: voice.generation,
                    stem: voice.stem,
                    ready: voice.ready,
                    position_secs: voice.position,
                    is_playing: voice.playing,
                    volume: voice.volume,
                }
            })
            .collect()
    }

    /// Move every playing sink forward by `dt` seconds.
    pub fn advance(&mut self, dt: f64) {
        self.voices.retain(|v| v.strong_count() > 0);
        for voice in self.voices.iter().filter_map(Weak::upgrade) {
            let mut voice = voice.borrow_mut();
            if !voice.playing {
                continue;
            }
            let duration = voice.duration.unwrap_or(0.0);
            voice.position = (voice.position + dt).min(duration);
            let kind = if voice.position >= duration {
                voice.playing = false;
                SinkEventKind::Ended
            } else {
                SinkEventKind::TimeUpdate {
                    position_secs: voice.position,
                }
            };
            self.events.push_back(SinkEvent {
                generation: voice.generation,
                stem: voice.stem,
                kind,
            });
        }
    }

    fn complete_loads(&mut self) {
        match &mut self.loader {
            Loader::Inline(probe) => {
                while let Some((voice, locator)) = self.pending.pop_front() {
                    let Some(voice) = voice.upgrade() else {
                        continue;
                    };
                    let result = probe(&locator);
                    self.events.push_back(finish(&mut voice.borrow_mut(), result));
                }
            }
            Loader::Threaded {
                probe,
                tx,
                rx,
                in_flight,
                next_id,
            } => {
                while let Some((voice, locator)) = self.pending.pop_front() {
                    if voice.strong_count() == 0 {
                        continue;
                    }
                    let id = *next_id;
                    *next_id += 1;
                    in_flight.insert(id, voice);

                    let probe = probe.clone();
                    let tx = tx.clone();
                    std::thread::spawn(move || {
                        let _ = tx.send((id, probe(&locator)));
                    });
                }

                while let Ok((id, result)) = rx.try_recv() {
                    let Some(voice) = in_flight.remove(&id).and_then(|v| v.upgrade()) else {
                        continue;
                    };
                    self.events.push_back(finish(&mut voice.borrow_mut(), result));
                }
            }
        }
    }
}

fn finish(voice: &mut ClockVoice, result: anyhow::Result<ProbedResource>) -> SinkEvent {
    let kind = match result {
        Ok(probed) => {
            voice.ready = ReadyState::Ready;
            voice.duration = Some(probed.duration_secs);
            voice.position = voice.position.min(probed.duration_secs);
            voice.waveform = probed.waveform;
            SinkEventKind::Ready {
                duration_secs: probed.duration_secs,
            }
        }
        Err(e) => {
            voice.ready = ReadyState::Failed;
            SinkEventKind::Failed {
                reason: format!("{e:#}"),
            }
        }
    };
    SinkEvent {
        generation: voice.generation,
        stem: voice.stem,
        kind,
    }
}

impl SinkBackend for ClockBackend {
    type Sink = ClockSink;

    fn open(&mut self, request: SinkRequest) -> ClockSink {
        let voice = Rc::new(RefCell::new(ClockVoice {
            generation: request.generation,
            stem: request.stem,
            ready: ReadyState::Loading,
            duration: None,
            position: 0.0,
            playing: false,
            volume: 1.0,
            waveform: None,
        }));
        self.voices.push(Rc::downgrade(&voice));
        self.pending
            .push_back((Rc::downgrade(&voice), request.locator));
        ClockSink {
            voice,
            denied: self.denied.clone(),
        }
    }

    fn drain_events(&mut self, events: &mut Vec<SinkEvent>) {
        if !self.holding {
            self.complete_loads();
        }
        events.extend(self.events.drain(..));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ClockBackend {
        ClockBackend::new(|locator| match locator {
            "missing.mp3" => anyhow::bail!("404 Not Found"),
            "short.mp3" => Ok(ProbedResource::silent(1.0)),
            _ => Ok(ProbedResource::silent(180.0)),
        })
    }

    fn request(stem: StemName, locator: &str) -> SinkRequest {
        SinkRequest {
            generation: Generation(1),
            stem,
            locator: locator.to_string(),
        }
    }

    fn drain(backend: &mut ClockBackend) -> Vec<SinkEvent> {
        let mut events = Vec::new();
        backend.drain_events(&mut events);
        events
    }

    #[test]
    fn test_open_is_loading_until_drained() {
        let mut backend = backend();
        let sink = backend.open(request(StemName::Soprano, "a.mp3"));
        assert_eq!(sink.ready_state(), ReadyState::Loading);
        assert_eq!(sink.duration(), None);

        let events = drain(&mut backend);
        assert_eq!(
            events,
            vec![SinkEvent {
                generation: Generation(1),
                stem: StemName::Soprano,
                kind: SinkEventKind::Ready {
                    duration_secs: 180.0
                },
            }]
        );
        assert_eq!(sink.ready_state(), ReadyState::Ready);
        assert_eq!(sink.duration(), Some(180.0));
    }

    #[test]
    fn test_failed_probe_reports_failure() {
        let mut backend = backend();
        let mut sink = backend.open(request(StemName::Alto, "missing.mp3"));
        let events = drain(&mut backend);
        assert!(matches!(
            &events[0].kind,
            SinkEventKind::Failed { reason } if reason.contains("404")
        ));
        assert_eq!(sink.ready_state(), ReadyState::Failed);
        assert_eq!(
            sink.play(),
            Err(SinkError::NotReady {
                stem: StemName::Alto
            })
        );
    }

    #[test]
    fn test_held_loads_wait_for_release() {
        let mut backend = backend();
        backend.hold_loads();
        let sink = backend.open(request(StemName::Soprano, "a.mp3"));
        assert!(drain(&mut backend).is_empty());
        assert_eq!(backend.pending_loads(), 1);

        backend.release_loads();
        assert_eq!(drain(&mut backend).len(), 1);
        assert_eq!(sink.ready_state(), ReadyState::Ready);
    }

    #[test]
    fn test_dropped_sink_never_completes() {
        let mut backend = backend();
        backend.hold_loads();
        let sink = backend.open(request(StemName::Soprano, "a.mp3"));
        drop(sink);
        assert_eq!(backend.pending_loads(), 0);
        assert_eq!(backend.live_sinks(), 0);

        backend.release_loads();
        assert!(drain(&mut backend).is_empty());
    }

    #[test]
    fn test_advance_emits_time_and_end() {
        let mut backend = backend();
        let mut sink = backend.open(request(StemName::Instrumentals, "short.mp3"));
        drain(&mut backend);
        sink.play().unwrap();

        backend.advance(0.25);
        let events = drain(&mut backend);
        assert_eq!(
            events[0].kind,
            SinkEventKind::TimeUpdate {
                position_secs: 0.25
            }
        );

        backend.advance(5.0);
        let events = drain(&mut backend);
        assert_eq!(events[0].kind, SinkEventKind::Ended);
        assert!(!sink.is_playing());
        assert_eq!(sink.position(), 1.0);
    }

    #[test]
    fn test_paused_sink_does_not_move() {
        let mut backend = backend();
        let sink = backend.open(request(StemName::Soprano, "a.mp3"));
        drain(&mut backend);
        backend.advance(1.0);
        assert!(drain(&mut backend).is_empty());
        assert_eq!(sink.position(), 0.0);
    }

    #[test]
    fn test_denied_play_is_rejected() {
        let mut backend = backend();
        let mut sink = backend.open(request(StemName::Tenor, "a.mp3"));
        drain(&mut backend);

        backend.deny_play(StemName::Tenor, "autoplay blocked");
        assert!(matches!(sink.play(), Err(SinkError::Rejected { .. })));
        assert!(!sink.is_playing());

        backend.allow_play(StemName::Tenor);
        assert!(sink.play().is_ok());
    }

    #[test]
    fn test_position_is_clamped_to_duration() {
        let mut backend = backend();
        let mut sink = backend.open(request(StemName::Soprano, "short.mp3"));
        drain(&mut backend);
        sink.set_position(10.0);
        assert_eq!(sink.position(), 1.0);
        sink.set_position(-3.0);
        assert_eq!(sink.position(), 0.0);
    }

    #[test]
    fn test_position_set_while_loading_survives_load() {
        let mut backend = backend();
        let mut sink = backend.open(request(StemName::Soprano, "a.mp3"));
        sink.set_position(42.0);
        drain(&mut backend);
        assert_eq!(sink.position(), 42.0);
    }

    #[test]
    fn test_threaded_load_does_not_block_drain() {
        let (gate_tx, gate_rx) = crossbeam::channel::unbounded::<()>();
        let mut backend = ClockBackend::threaded(move |_| {
            gate_rx.recv()?;
            Ok(ProbedResource::silent(90.0))
        });
        let sink = backend.open(request(StemName::Soprano, "a.mp3"));

        assert!(drain(&mut backend).is_empty());
        assert_eq!(sink.ready_state(), ReadyState::Loading);
        assert_eq!(backend.pending_loads(), 1);

        gate_tx.send(()).unwrap();
        let events = (0..400)
            .find_map(|_| {
                let events = drain(&mut backend);
                if events.is_empty() {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    return None;
                }
                Some(events)
            })
            .expect("load completes");
        assert_eq!(
            events[0].kind,
            SinkEventKind::Ready {
                duration_secs: 90.0
            }
        );
        assert_eq!(sink.duration(), Some(90.0));
        assert_eq!(backend.pending_loads(), 0);
    }

    #[test]
    fn test_threaded_load_for_dropped_sink_is_discarded() {
        let (gate_tx, gate_rx) = crossbeam::channel::unbounded::<()>();
        let (done_tx, done_rx) = crossbeam::channel::unbounded::<()>();
        let mut backend = ClockBackend::threaded(move |_| {
            gate_rx.recv()?;
            let _ = done_tx.send(());
            Ok(ProbedResource::silent(90.0))
        });
        let sink = backend.open(request(StemName::Alto, "a.mp3"));
        assert!(drain(&mut backend).is_empty());
        drop(sink);
        assert_eq!(backend.pending_loads(), 0);

        gate_tx.send(()).unwrap();
        done_rx.recv().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(drain(&mut backend).is_empty());
    }
}
