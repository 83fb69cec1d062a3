//! The seam between the playback core and whatever actually makes sound.
//!
//! A backend opens sinks without blocking. Loading completes later and is
//! reported through [`SinkEvent`]s, which the owner drains on its own loop.

use std::sync::Arc;

use crate::{Generation, StemName, WaveformData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    /// Fully loaded, can play through.
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SinkError {
    #[error("{stem} is not ready to play")]
    NotReady { stem: StemName },

    #[error("playback of {stem} was rejected: {reason}")]
    Rejected { stem: StemName, reason: String },

    #[error("audio output is unavailable")]
    OutputUnavailable,

    #[error("command queue for {stem} is full")]
    QueueFull { stem: StemName },
}

/// A live audio output bound to one stem's resource.
///
/// Dropping a sink releases its output and unsubscribes it from the backend;
/// no event for it is delivered afterwards.
pub trait AudioSink {
    fn stem(&self) -> StemName;
    fn generation(&self) -> Generation;
    fn ready_state(&self) -> ReadyState;
    /// Media duration, known once the sink is ready.
    fn duration(&self) -> Option<f64>;
    fn position(&self) -> f64;
    fn is_playing(&self) -> bool;
    fn volume(&self) -> f32;

    fn play(&mut self) -> Result<(), SinkError>;
    fn pause(&mut self);
    fn set_position(&mut self, seconds: f64);
    fn set_volume(&mut self, gain: f32);

    /// Peaks for drawing, when the backend has decoded audio.
    fn waveform(&self) -> Option<Arc<WaveformData>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkRequest {
    pub generation: Generation,
    pub stem: StemName,
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEventKind {
    Ready { duration_secs: f64 },
    Failed { reason: String },
    TimeUpdate { position_secs: f64 },
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkEvent {
    pub generation: Generation,
    pub stem: StemName,
    pub kind: SinkEventKind,
}

pub trait SinkBackend {
    type Sink: AudioSink;

    /// Start loading `request.locator`. Returns at once with a sink in
    /// [`ReadyState::Loading`].
    fn open(&mut self, request: SinkRequest) -> Self::Sink;

    /// Move every queued event into `events`, oldest first.
    fn drain_events(&mut self, events: &mut Vec<SinkEvent>);
}
