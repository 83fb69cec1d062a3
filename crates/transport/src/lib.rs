mod audio;
mod sink;
mod state;
mod stem;
mod waveform;

pub use audio::{AudioArc, resample_audio_arc};
pub use sink::{
    AudioSink, ReadyState, SinkBackend, SinkError, SinkEvent, SinkEventKind, SinkRequest,
};
pub use state::{Generation, PlaybackPhase, TransportState};
pub use stem::{StemName, StemSet, StemSetError, UnknownStem};
pub use waveform::WaveformData;

/// Identifies one voice inside the output engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(pub u64);

/// Control thread → audio thread.
#[derive(Debug, Clone, Copy)]
pub enum Command {
    Play(VoiceId),
    Pause(VoiceId),
    Seek { voice: VoiceId, frame: u64 },
    Gain { voice: VoiceId, gain: f32 },
    Remove(VoiceId),
}

/// Audio thread → control thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    Position { voice: VoiceId, frame: u64 },
    Ended { voice: VoiceId },
    /// The voice table was full; the voice was never added.
    Rejected { voice: VoiceId },
}
