use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use stemsync_core::PlayerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Analysis and transposition service.
    pub backend_url: String,
    /// Play on the silent clock backend even when an output device exists.
    pub headless: bool,
    /// Directory the open dialog starts in.
    pub last_directory: Option<PathBuf>,
    pub player: PlayerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:5000".to_string(),
            headless: false,
            last_directory: None,
            player: PlayerConfig::default(),
        }
    }
}

impl Config {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("stemsync").join("config.toml"))
    }

    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        match fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                log::warn!("ignoring {}: {e}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn save(&self) {
        let Some(path) = Self::config_path() else {
            return;
        };

        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        match toml::to_string_pretty(self) {
            Ok(contents) => {
                if let Err(e) = fs::write(&path, contents) {
                    log::warn!("could not write {}: {e}", path.display());
                }
            }
            Err(e) => log::warn!("could not serialize config: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file() {
        let config = Config::parse(
            r#"
            headless = true

            [player]
            default_volume = 0.8
            "#,
        )
        .unwrap();
        assert!(config.headless);
        assert_eq!(config.backend_url, "http://localhost:5000");
        assert_eq!(config.player.default_volume, 0.8);
        assert_eq!(config.player.waveform_bucket_frames, 512);
    }

    #[test]
    fn test_invalid_file() {
        assert!(Config::parse("headless = \"maybe\"").is_err());
    }
}
