use crate::AudioArc;

/// Min/max peaks of a stem, mixed down to mono, one pair per bucket of frames.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformData {
    pub peaks: Vec<(f32, f32)>,
    pub samples_per_bucket: usize,
    pub duration_secs: f64,
}

impl WaveformData {
    /// Compute peaks for `audio`, downsampling into buckets of
    /// `samples_per_bucket` frames.
    ///
    /// ```
    /// use stemsync_transport::{AudioArc, WaveformData};
    ///
    /// let audio = AudioArc::new(vec![0.0; 44100 * 2], 44100, 2);
    /// let waveform = WaveformData::from_audio_arc(&audio, 512);
    /// assert_eq!(waveform.peaks.len(), 87);
    /// ```
    pub fn from_audio_arc(audio: &AudioArc, samples_per_bucket: usize) -> Self {
        let samples_per_bucket = samples_per_bucket.max(1);
        let channels = audio.channels() as usize;
        let num_buckets = audio.frames().div_ceil(samples_per_bucket);
        let mut peaks = Vec::with_capacity(num_buckets);

        for bucket in audio.samples().chunks(samples_per_bucket * channels) {
            let mut min_val: f32 = 0.0;
            let mut max_val: f32 = 0.0;

            for frame in bucket.chunks_exact(channels) {
                let mono = frame.iter().sum::<f32>() / channels as f32;
                min_val = min_val.min(mono);
                max_val = max_val.max(mono);
            }

            peaks.push((min_val, max_val));
        }

        Self {
            peaks,
            samples_per_bucket,
            duration_secs: audio.duration_secs(),
        }
    }

    /// Reduce the peaks to exactly `columns` entries for drawing.
    ///
    /// Each column takes the extreme values of the buckets it covers. When there
    /// are fewer buckets than columns, buckets are repeated.
    pub fn columns(&self, columns: usize) -> Vec<(f32, f32)> {
        if columns == 0 {
            return Vec::new();
        }
        if self.peaks.is_empty() {
            return vec![(0.0, 0.0); columns];
        }

        let buckets = self.peaks.len();
        (0..columns)
            .map(|col| {
                let start = col * buckets / columns;
                let end = ((col + 1) * buckets / columns).max(start + 1).min(buckets);
                self.peaks[start..end]
                    .iter()
                    .fold((0.0f32, 0.0f32), |(lo, hi), (min, max)| {
                        (lo.min(*min), hi.max(*max))
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peaks_mix_down_to_mono() {
        // Two stereo frames per bucket: (1.0, 0.0) -> 0.5, (-1.0, -1.0) -> -1.0
        let audio = AudioArc::new(vec![1.0, 0.0, -1.0, -1.0, 0.25, 0.25], 10, 2);
        let waveform = WaveformData::from_audio_arc(&audio, 2);

        assert_eq!(waveform.peaks, vec![(-1.0, 0.5), (0.0, 0.25)]);
        assert!((waveform.duration_secs - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_empty_audio_has_no_peaks() {
        let audio = AudioArc::new(Vec::new(), 44100, 1);
        let waveform = WaveformData::from_audio_arc(&audio, 512);
        assert!(waveform.peaks.is_empty());
        assert_eq!(waveform.columns(4), vec![(0.0, 0.0); 4]);
    }

    #[test]
    fn test_columns_take_extremes() {
        let waveform = WaveformData {
            peaks: vec![(-0.1, 0.1), (-0.9, 0.2), (-0.3, 0.8), (0.0, 0.0)],
            samples_per_bucket: 1,
            duration_secs: 4.0,
        };
        assert_eq!(waveform.columns(2), vec![(-0.9, 0.2), (-0.3, 0.8)]);
        assert_eq!(waveform.columns(8).len(), 8);
        assert_eq!(waveform.columns(8)[1], (-0.1, 0.1));
    }
}
