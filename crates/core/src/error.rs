use stemsync_transport::{SinkError, StemName};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlayError {
    #[error("nothing to play")]
    NoSinks,

    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VolumeError {
    #[error("volume for {stem} must be a finite number, got {value}")]
    NotFinite { stem: StemName, value: f32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyParseError {
    #[error("empty key")]
    Empty,

    #[error("unknown key '{0}'")]
    Unknown(String),
}
