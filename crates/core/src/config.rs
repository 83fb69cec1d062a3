use serde::{Deserialize, Serialize};

/// Tunables for a [`crate::Player`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Gain every stem starts at.
    pub default_volume: f32,
    /// Source frames per waveform peak.
    pub waveform_bucket_frames: usize,
    /// Largest spread between stem durations that is not reported.
    pub duration_tolerance_secs: f64,
    /// Largest drift between playing sinks before they are realigned.
    pub sync_epsilon_secs: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_volume: 0.5,
            waveform_bucket_frames: 512,
            duration_tolerance_secs: 0.1,
            sync_epsilon_secs: 0.05,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: PlayerConfig = serde_json::from_str(r#"{"default_volume": 0.8}"#).unwrap();
        assert_eq!(config.default_volume, 0.8);
        assert_eq!(config.waveform_bucket_frames, 512);
        assert_eq!(config.sync_epsilon_secs, 0.05);
    }
}
