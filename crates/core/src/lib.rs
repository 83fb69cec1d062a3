pub mod collab;
pub mod config;
pub mod error;
pub mod key;
pub mod lyrics;
pub mod mixer;
pub mod player;
pub mod swap;
pub mod time;
pub mod transport;
pub mod waveform;

pub use collab::{AnalysisManifest, ChangeRequest, ChangeResponse, ResetRequest, resolve_locator};
pub use config::PlayerConfig;
pub use error::{KeyParseError, PlayError, VolumeError};
pub use key::{KeyChange, MusicalKey, SongInfo, bpm_delta};
pub use mixer::VolumeMixer;
pub use player::Player;
pub use swap::SourceSwapController;
pub use time::format_time;
pub use transport::Transport;
pub use waveform::{WaveformTrace, WaveformView};

pub use stemsync_engine::{ClockBackend, EngineBackend, ProbedResource};
pub use stemsync_transport::{
    AudioSink, Generation, PlaybackPhase, SinkBackend, SinkError, SinkEvent, SinkEventKind,
    StemName, StemSet, StemSetError, TransportState,
};
