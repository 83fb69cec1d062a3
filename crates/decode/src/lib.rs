use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::Context;
use stemsync_transport::AudioArc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Where a stem locator points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    File(PathBuf),
    Remote(String),
}

impl Locator {
    /// Classify a locator string.
    ///
    /// `http://` and `https://` are fetched, `file://` and bare strings are
    /// treated as local paths.
    pub fn parse(locator: &str) -> anyhow::Result<Self> {
        let locator = locator.trim();
        if locator.is_empty() {
            anyhow::bail!("empty stem locator");
        }
        if locator.starts_with("http://") || locator.starts_with("https://") {
            return Ok(Locator::Remote(locator.to_string()));
        }
        let path = locator.strip_prefix("file://").unwrap_or(locator);
        Ok(Locator::File(PathBuf::from(path)))
    }

    fn extension(&self) -> Option<String> {
        match self {
            Locator::File(path) => path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase),
            Locator::Remote(url) => {
                let path = url.split(['?', '#']).next().unwrap_or(url);
                let last = path.rsplit('/').next()?;
                let (_, ext) = last.rsplit_once('.')?;
                Some(ext.to_lowercase())
            }
        }
    }
}

/// Fetch (if remote) and decode the resource behind `locator`.
pub fn load_locator(locator: &str) -> anyhow::Result<AudioArc> {
    let parsed = Locator::parse(locator)?;
    match &parsed {
        Locator::File(path) => decode_file(path),
        Locator::Remote(url) => {
            log::debug!("fetching {url}");
            let bytes = fetch(url)?;
            decode_bytes(bytes, parsed.extension().as_deref())
                .with_context(|| format!("decoding {url}"))
        }
    }
}

fn fetch(url: &str) -> anyhow::Result<Vec<u8>> {
    let response = reqwest::blocking::get(url)
        .with_context(|| format!("requesting {url}"))?
        .error_for_status()
        .with_context(|| format!("fetching {url}"))?;
    Ok(response.bytes()?.to_vec())
}

pub fn decode_file(path: &Path) -> anyhow::Result<AudioArc> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let extension = path.extension().and_then(|e| e.to_str());
    decode_source(Box::new(file), extension)
        .with_context(|| format!("decoding {}", path.display()))
}

/// Decode an in-memory file. `extension` is only a probe hint.
pub fn decode_bytes(bytes: Vec<u8>, extension: Option<&str>) -> anyhow::Result<AudioArc> {
    decode_source(Box::new(Cursor::new(bytes)), extension)
}

fn decode_source(source: Box<dyn MediaSource>, extension: Option<&str>) -> anyhow::Result<AudioArc> {
    let mss = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("no default track"))?;

    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(2) as u16;
    let track_id = track.id;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A corrupt frame is skipped, the rest of the stem is still usable
            Err(SymphoniaError::DecodeError(reason)) => {
                log::debug!("skipping undecodable packet: {reason}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    if channels == 0 {
        anyhow::bail!("stream reports zero channels");
    }
    // Guard against a truncated final frame
    let whole = samples.len() - samples.len() % channels as usize;
    samples.truncate(whole);

    Ok(AudioArc::new(samples, sample_rate, channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for i in 0..frames {
            let value = ((i % 100) as i16 - 50) * 200;
            for _ in 0..channels {
                writer.write_sample(value).expect("write sample");
            }
        }
        writer.finalize().expect("finalize wav");
    }

    #[test]
    fn test_locator_classification() {
        assert_eq!(
            Locator::parse("http://localhost:5000/static/a.wav").unwrap(),
            Locator::Remote("http://localhost:5000/static/a.wav".to_string())
        );
        assert_eq!(
            Locator::parse("file:///tmp/a.wav").unwrap(),
            Locator::File(PathBuf::from("/tmp/a.wav"))
        );
        assert_eq!(
            Locator::parse("stems/soprano.mp3").unwrap(),
            Locator::File(PathBuf::from("stems/soprano.mp3"))
        );
        assert!(Locator::parse("   ").is_err());
    }

    #[test]
    fn test_remote_extension_ignores_query() {
        let locator = Locator::parse("https://host/song/soprano_C%23.WAV?v=2").unwrap();
        assert_eq!(locator.extension().as_deref(), Some("wav"));
    }

    #[test]
    fn test_decode_wav_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("soprano.wav");
        write_wav(&path, 22050, 2, 22050);

        let audio = decode_file(&path).expect("decode");
        assert_eq!(audio.sample_rate(), 22050);
        assert_eq!(audio.channels(), 2);
        assert_eq!(audio.frames(), 22050);
        assert!((audio.duration_secs() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_locator_with_file_scheme() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("alto.wav");
        write_wav(&path, 8000, 1, 4000);

        let audio = load_locator(&format!("file://{}", path.display())).expect("load");
        assert_eq!(audio.channels(), 1);
        assert!((audio.duration_secs() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_decode_bytes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tenor.wav");
        write_wav(&path, 8000, 1, 800);
        let bytes = std::fs::read(&path).expect("read");

        let audio = decode_bytes(bytes, Some("wav")).expect("decode");
        assert_eq!(audio.frames(), 800);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = decode_file(Path::new("/nonexistent/stem.wav")).unwrap_err();
        assert!(err.to_string().contains("opening"));
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(decode_bytes(b"not audio at all".to_vec(), Some("wav")).is_err());
    }
}
