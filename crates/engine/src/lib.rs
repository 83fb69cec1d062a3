//! Sink backends.
//!
//! [`EngineBackend`] plays every stem through one cpal output stream. Each
//! sink is a voice in the stream callback, so all voices advance on the same
//! sample clock. [`ClockBackend`] provides the same sink contract without an
//! audio device.

mod clock;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use basedrop::{Collector, Handle, Shared};
use cpal::{
    FromSample, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use crossbeam::channel::{Receiver, Sender, unbounded};
use stemsync_transport::{
    AudioArc, AudioSink, Command, Generation, ReadyState, SinkBackend, SinkError, SinkEvent,
    SinkEventKind, SinkRequest, Status, StemName, VoiceId, WaveformData,
};

pub use clock::{ClockBackend, ClockSink, ProbedResource, VoiceSnapshot};

/// Upper bound on simultaneous voices: four stems, plus a pending swap, plus slack.
const MAX_VOICES: usize = 16;

const DEFAULT_BUCKET_FRAMES: usize = 512;

const STATUS_CAPACITY: usize = 1024;

/// Status slots kept free of position reports, so `Ended` and `Rejected`
/// always fit between two drains.
const RESERVED_STATUS_SLOTS: usize = 2 * MAX_VOICES;

/// A decoded voice handed to the audio thread.
struct NewVoice {
    id: VoiceId,
    audio: Shared<AudioArc>,
    frame: u64,
    gain: f32,
}

struct Voice {
    id: VoiceId,
    audio: Shared<AudioArc>,
    frame: u64,
    gain: f32,
    playing: bool,
}

impl Voice {
    fn frames(&self) -> u64 {
        self.audio.frames() as u64
    }
}

struct LoadResult {
    voice: VoiceId,
    result: anyhow::Result<(AudioArc, WaveformData)>,
}

#[derive(Debug)]
struct VoiceState {
    ready: ReadyState,
    duration: Option<f64>,
    position: f64,
    playing: bool,
    volume: f32,
    waveform: Option<Arc<WaveformData>>,
}

struct Registration {
    generation: Generation,
    stem: StemName,
    state: Weak<RefCell<VoiceState>>,
}

/// Control-side half of the engine, shared by the backend and its sinks.
struct EngineLink {
    commands: RefCell<rtrb::Producer<Command>>,
    output_failed: Arc<AtomicBool>,
    sample_rate: u32,
}

impl EngineLink {
    fn send(&self, command: Command) -> bool {
        self.commands.borrow_mut().push(command).is_ok()
    }
}

/// Sink backed by one voice of the output stream.
pub struct EngineSink {
    voice: VoiceId,
    stem: StemName,
    generation: Generation,
    state: Rc<RefCell<VoiceState>>,
    link: Rc<EngineLink>,
}

impl AudioSink for EngineSink {
    fn stem(&self) -> StemName {
        self.stem
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn ready_state(&self) -> ReadyState {
        self.state.borrow().ready
    }

    fn duration(&self) -> Option<f64> {
        self.state.borrow().duration
    }

    fn position(&self) -> f64 {
        self.state.borrow().position
    }

    fn is_playing(&self) -> bool {
        self.state.borrow().playing
    }

    fn volume(&self) -> f32 {
        self.state.borrow().volume
    }

    fn play(&mut self) -> Result<(), SinkError> {
        if self.link.output_failed.load(Ordering::Relaxed) {
            return Err(SinkError::OutputUnavailable);
        }
        if self.ready_state() != ReadyState::Ready {
            return Err(SinkError::NotReady { stem: self.stem });
        }
        if !self.link.send(Command::Play(self.voice)) {
            return Err(SinkError::QueueFull { stem: self.stem });
        }
        self.state.borrow_mut().playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.ready == ReadyState::Ready && !self.link.send(Command::Pause(self.voice)) {
            log::warn!("{}: pause dropped, command queue full", self.stem);
        }
        state.playing = false;
    }

    fn set_position(&mut self, seconds: f64) {
        let mut state = self.state.borrow_mut();
        let seconds = match state.duration {
            Some(duration) => seconds.clamp(0.0, duration),
            None => seconds.max(0.0),
        };
        state.position = seconds;
        if state.ready == ReadyState::Ready {
            let frame = (seconds * self.link.sample_rate as f64).round() as u64;
            if !self.link.send(Command::Seek {
                voice: self.voice,
                frame,
            }) {
                log::warn!("{}: seek dropped, command queue full", self.stem);
            }
        }
    }

    fn set_volume(&mut self, gain: f32) {
        let gain = gain.clamp(0.0, 1.0);
        let mut state = self.state.borrow_mut();
        state.volume = gain;
        if state.ready == ReadyState::Ready
            && !self.link.send(Command::Gain {
                voice: self.voice,
                gain,
            })
        {
            log::warn!("{}: gain change dropped, command queue full", self.stem);
        }
    }

    fn waveform(&self) -> Option<Arc<WaveformData>> {
        self.state.borrow().waveform.clone()
    }
}

impl Drop for EngineSink {
    fn drop(&mut self) {
        if !self.link.send(Command::Remove(self.voice)) {
            log::warn!("{}: voice {:?} leaked, command queue full", self.stem, self.voice);
        }
    }
}

/// Sink backend that mixes all voices into the default output device.
pub struct EngineBackend {
    link: Rc<EngineLink>,
    status: rtrb::Consumer<Status>,
    new_voices: rtrb::Producer<NewVoice>,
    loads_tx: Sender<LoadResult>,
    loads_rx: Receiver<LoadResult>,
    registrations: HashMap<VoiceId, Registration>,
    next_voice: u64,
    bucket_frames: usize,
    collector: Collector,
    handle: Handle,
    _stream: cpal::Stream,
}

impl EngineBackend {
    /// Open the default output device and start the (silent) stream.
    pub fn start() -> anyhow::Result<Self> {
        Self::with_bucket_frames(DEFAULT_BUCKET_FRAMES)
    }

    /// Like [`EngineBackend::start`], with a custom waveform resolution.
    pub fn with_bucket_frames(bucket_frames: usize) -> anyhow::Result<Self> {
        let collector = Collector::new();
        let handle = collector.handle();

        let (command_tx, command_rx) = rtrb::RingBuffer::<Command>::new(256);
        let (status_tx, status_rx) = rtrb::RingBuffer::<Status>::new(STATUS_CAPACITY);
        let (voices_tx, voices_rx) = rtrb::RingBuffer::<NewVoice>::new(MAX_VOICES);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("no output device found"))?;

        let config = device.default_output_config()?;
        let sample_rate = config.sample_rate().0;
        let output_failed = Arc::new(AtomicBool::new(false));

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => build_stream::<f32>(
                &device,
                &config.into(),
                command_rx,
                voices_rx,
                status_tx,
                output_failed.clone(),
            )?,
            cpal::SampleFormat::I16 => build_stream::<i16>(
                &device,
                &config.into(),
                command_rx,
                voices_rx,
                status_tx,
                output_failed.clone(),
            )?,
            cpal::SampleFormat::U16 => build_stream::<u16>(
                &device,
                &config.into(),
                command_rx,
                voices_rx,
                status_tx,
                output_failed.clone(),
            )?,
            sample_format => anyhow::bail!("unsupported sample format '{sample_format}'"),
        };

        stream.play()?;
        log::info!("audio output started at {sample_rate} Hz");

        let (loads_tx, loads_rx) = unbounded();

        Ok(Self {
            link: Rc::new(EngineLink {
                commands: RefCell::new(command_tx),
                output_failed,
                sample_rate,
            }),
            status: status_rx,
            new_voices: voices_tx,
            loads_tx,
            loads_rx,
            registrations: HashMap::new(),
            next_voice: 0,
            bucket_frames,
            collector,
            handle,
            _stream: stream,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.link.sample_rate
    }

    fn finish_load(&mut self, load: LoadResult, events: &mut Vec<SinkEvent>) {
        let loaded = self.loaded_voices();
        let Some(registration) = self.registrations.get(&load.voice) else {
            return;
        };
        let Some(state) = registration.state.upgrade() else {
            // Sink dropped while loading
            self.registrations.remove(&load.voice);
            return;
        };
        let (generation, stem) = (registration.generation, registration.stem);
        let mut state = state.borrow_mut();

        let kind = match load.result {
            Ok(_) if loaded >= MAX_VOICES => {
                state.ready = ReadyState::Failed;
                SinkEventKind::Failed {
                    reason: format!("too many voices ({MAX_VOICES} loaded)"),
                }
            }
            Ok((audio, waveform)) => {
                let duration = audio.duration_secs();
                let frame = audio.frame_at(state.position);
                let voice = NewVoice {
                    id: load.voice,
                    audio: Shared::new(&self.handle, audio),
                    frame: frame as u64,
                    gain: state.volume,
                };
                match self.new_voices.push(voice) {
                    Ok(()) => {
                        state.ready = ReadyState::Ready;
                        state.duration = Some(duration);
                        state.waveform = Some(Arc::new(waveform));
                        SinkEventKind::Ready {
                            duration_secs: duration,
                        }
                    }
                    Err(_) => {
                        state.ready = ReadyState::Failed;
                        SinkEventKind::Failed {
                            reason: "too many voices".to_string(),
                        }
                    }
                }
            }
            Err(e) => {
                state.ready = ReadyState::Failed;
                SinkEventKind::Failed {
                    reason: format!("{e:#}"),
                }
            }
        };

        events.push(SinkEvent {
            generation,
            stem,
            kind,
        });
    }
}

impl EngineBackend {
    /// Voices handed to the audio thread whose sinks are still alive.
    fn loaded_voices(&self) -> usize {
        self.registrations
            .values()
            .filter_map(|r| r.state.upgrade())
            .filter(|state| state.borrow().ready == ReadyState::Ready)
            .count()
    }

    fn fail_rejected(&mut self, voice: VoiceId, events: &mut Vec<SinkEvent>) {
        let Some(registration) = self.registrations.get(&voice) else {
            return;
        };
        let Some(state) = registration.state.upgrade() else {
            return;
        };
        {
            let mut state = state.borrow_mut();
            state.ready = ReadyState::Failed;
            state.playing = false;
        }
        log::error!("{}: audio thread rejected voice {voice:?}", registration.stem);
        events.push(SinkEvent {
            generation: registration.generation,
            stem: registration.stem,
            kind: SinkEventKind::Failed {
                reason: "rejected by the output stream, too many voices".to_string(),
            },
        });
    }
}

impl SinkBackend for EngineBackend {
    type Sink = EngineSink;

    fn open(&mut self, request: SinkRequest) -> EngineSink {
        let voice = VoiceId(self.next_voice);
        self.next_voice += 1;

        let state = Rc::new(RefCell::new(VoiceState {
            ready: ReadyState::Loading,
            duration: None,
            position: 0.0,
            playing: false,
            volume: 1.0,
            waveform: None,
        }));
        self.registrations.insert(
            voice,
            Registration {
                generation: request.generation,
                stem: request.stem,
                state: Rc::downgrade(&state),
            },
        );

        let tx = self.loads_tx.clone();
        let target_rate = self.link.sample_rate;
        let bucket_frames = self.bucket_frames;
        let locator = request.locator;
        std::thread::spawn(move || {
            let result = stemsync_decode::load_locator(&locator).and_then(|audio| {
                let waveform = WaveformData::from_audio_arc(&audio, bucket_frames);
                Ok((audio.resample(target_rate)?, waveform))
            });
            let _ = tx.send(LoadResult { voice, result });
        });

        EngineSink {
            voice,
            stem: request.stem,
            generation: request.generation,
            state,
            link: self.link.clone(),
        }
    }

    fn drain_events(&mut self, events: &mut Vec<SinkEvent>) {
        while let Ok(load) = self.loads_rx.try_recv() {
            self.finish_load(load, events);
        }

        let mut latest: HashMap<VoiceId, u64> = HashMap::new();
        let mut ended = Vec::new();
        let mut rejected = Vec::new();
        while let Ok(status) = self.status.pop() {
            match status {
                Status::Position { voice, frame } => {
                    latest.insert(voice, frame);
                }
                Status::Ended { voice } => ended.push(voice),
                Status::Rejected { voice } => rejected.push(voice),
            }
        }

        for voice in rejected {
            latest.remove(&voice);
            self.fail_rejected(voice, events);
        }

        let sample_rate = self.link.sample_rate as f64;
        for (voice, frame) in latest {
            let Some(registration) = self.registrations.get(&voice) else {
                continue;
            };
            let Some(state) = registration.state.upgrade() else {
                continue;
            };
            let position = frame as f64 / sample_rate;
            state.borrow_mut().position = position;
            events.push(SinkEvent {
                generation: registration.generation,
                stem: registration.stem,
                kind: SinkEventKind::TimeUpdate {
                    position_secs: position,
                },
            });
        }

        for voice in ended {
            let Some(registration) = self.registrations.get(&voice) else {
                continue;
            };
            let Some(state) = registration.state.upgrade() else {
                continue;
            };
            {
                let mut state = state.borrow_mut();
                state.playing = false;
                if let Some(duration) = state.duration {
                    state.position = duration;
                }
            }
            events.push(SinkEvent {
                generation: registration.generation,
                stem: registration.stem,
                kind: SinkEventKind::Ended,
            });
        }

        self.registrations
            .retain(|_, registration| registration.state.strong_count() > 0);
        self.collector.collect();
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut command_rx: rtrb::Consumer<Command>,
    mut voices_rx: rtrb::Consumer<NewVoice>,
    mut status_tx: rtrb::Producer<Status>,
    output_failed: Arc<AtomicBool>,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let output_channels = config.channels as usize;
    let mut voices: Vec<Voice> = Vec::with_capacity(MAX_VOICES);

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            // New voices first, so commands addressed to them find them
            while let Ok(new_voice) = voices_rx.pop() {
                admit(&mut voices, new_voice, &mut status_tx);
            }

            while let Ok(cmd) = command_rx.pop() {
                match cmd {
                    Command::Remove(id) => voices.retain(|v| v.id != id),
                    Command::Play(id) => {
                        if let Some(v) = voices.iter_mut().find(|v| v.id == id) {
                            v.playing = v.frame < v.frames();
                        }
                    }
                    Command::Pause(id) => {
                        if let Some(v) = voices.iter_mut().find(|v| v.id == id) {
                            v.playing = false;
                        }
                    }
                    Command::Seek { voice, frame } => {
                        if let Some(v) = voices.iter_mut().find(|v| v.id == voice) {
                            v.frame = frame.min(v.frames());
                        }
                    }
                    Command::Gain { voice, gain } => {
                        if let Some(v) = voices.iter_mut().find(|v| v.id == voice) {
                            v.gain = gain;
                        }
                    }
                }
            }

            for frame in data.chunks_mut(output_channels) {
                for (ch, sample) in frame.iter_mut().enumerate() {
                    let mut mixed = 0.0f32;
                    for voice in voices.iter().filter(|v| v.playing) {
                        let voice_channels = voice.audio.channels() as usize;
                        let idx = voice.frame as usize * voice_channels + ch % voice_channels;
                        if let Some(s) = voice.audio.samples().get(idx) {
                            mixed += s * voice.gain;
                        }
                    }
                    *sample = T::from_sample(mixed);
                }

                for voice in voices.iter_mut().filter(|v| v.playing) {
                    voice.frame += 1;
                    if voice.frame >= voice.frames() {
                        voice.playing = false;
                        let _ = status_tx.push(Status::Ended { voice: voice.id });
                    }
                }
            }

            for voice in voices.iter().filter(|v| v.playing) {
                if !report_position(&mut status_tx, voice.id, voice.frame) {
                    break;
                }
            }
        },
        move |err| {
            log::error!("output stream error: {err}");
            output_failed.store(true, Ordering::Relaxed);
        },
        None,
    )?;

    Ok(stream)
}

/// Add a voice to the mix, or report it back when the table is full.
fn admit(voices: &mut Vec<Voice>, new_voice: NewVoice, status_tx: &mut rtrb::Producer<Status>) {
    if voices.len() >= MAX_VOICES {
        let _ = status_tx.push(Status::Rejected { voice: new_voice.id });
        return;
    }
    voices.push(Voice {
        id: new_voice.id,
        audio: new_voice.audio,
        frame: new_voice.frame,
        gain: new_voice.gain,
        playing: false,
    });
}

/// Push a position report unless it would eat into the reserved slots.
fn report_position(status_tx: &mut rtrb::Producer<Status>, voice: VoiceId, frame: u64) -> bool {
    if status_tx.slots() <= RESERVED_STATUS_SLOTS {
        return false;
    }
    status_tx.push(Status::Position { voice, frame }).is_ok()
}
