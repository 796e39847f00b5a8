use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{FadeCurve, Result};

const MIN_SPEED: f32 = 0.1;
const MAX_SPEED: f32 = 8.0;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pacing: PacingConfig,
    pub audio: AudioConfig,
    pub analysis: AnalysisConfig,
    /// Where reading progress is persisted, if anywhere.
    pub progress_file: Option<PathBuf>,
}

impl AppConfig {
    /// Loads a configuration file. Missing sections fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        Ok(config.normalised())
    }

    /// Clamps user supplied values into their valid ranges.
    pub fn normalised(mut self) -> Self {
        self.pacing.speed = clamp_speed(self.pacing.speed);
        self.pacing.speed_options.retain(|s| s.is_finite() && *s > 0.0);
        self.pacing.speed_options.sort_by(|a, b| a.total_cmp(b));
        self.audio.master_volume = clamp_volume(self.audio.master_volume);
        self.audio.fade_step_ms = self.audio.fade_step_ms.max(1);
        self
    }
}

/// Settings for the line-paced scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub words_per_minute: u32,
    pub min_line_ms: u64,
    /// Initial speed multiplier.
    pub speed: f32,
    /// Presets the reader steps through with faster/slower commands.
    pub speed_options: Vec<f32>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            words_per_minute: 200,
            min_line_ms: 800,
            speed: 1.0,
            speed_options: vec![0.5, 0.75, 1.0, 1.25, 1.5, 2.0],
        }
    }
}

impl PacingConfig {
    /// Milliseconds a single word is displayed at 1x speed.
    pub fn ms_per_word(&self) -> f64 {
        60_000.0 / f64::from(self.words_per_minute.max(1))
    }

    /// Next preset above `current`, or `current` when already at the top.
    pub fn faster(&self, current: f32) -> f32 {
        self.speed_options
            .iter()
            .copied()
            .find(|s| *s > current + f32::EPSILON)
            .unwrap_or(current)
    }

    /// Next preset below `current`, or `current` when already at the bottom.
    pub fn slower(&self, current: f32) -> f32 {
        self.speed_options
            .iter()
            .rev()
            .copied()
            .find(|s| *s < current - f32::EPSILON)
            .unwrap_or(current)
    }
}

/// Configuration specific to the ambient audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub master_volume: f32,
    pub fade_duration_ms: u64,
    pub fade_step_ms: u64,
    pub curve: FadeCurve,
    /// Root of the `Category/SubCategory/Mood/*.mp3` tree.
    pub sounds_dir: Option<PathBuf>,
    /// Explicit mood path to audio reference registrations.
    pub tracks: HashMap<String, String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            master_volume: 0.5,
            fade_duration_ms: 4_000,
            fade_step_ms: 50,
            curve: FadeCurve::Quadratic,
            sounds_dir: None,
            tracks: HashMap::new(),
        }
    }
}

impl AudioConfig {
    pub fn fade_duration(&self) -> Duration {
        Duration::from_millis(self.fade_duration_ms)
    }

    pub fn fade_step(&self) -> Duration {
        Duration::from_millis(self.fade_step_ms.max(1))
    }
}

/// Settings for the external mood-analysis service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    /// Environment variable holding the bearer credential.
    pub api_key_env: String,
    pub moods_file: Option<PathBuf>,
    /// How many pages past the current one are analysed ahead of time.
    pub prefetch_ahead: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            api_key_env: "OPENAI_API_KEY".to_string(),
            moods_file: None,
            prefetch_ahead: 1,
        }
    }
}

impl AnalysisConfig {
    /// Reads the bearer credential from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

pub fn clamp_speed(speed: f32) -> f32 {
    if speed.is_finite() {
        speed.clamp(MIN_SPEED, MAX_SPEED)
    } else {
        1.0
    }
}

pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "pacing": { "speed": 40.0 }, "audio": { "master_volume": 1.5, "curve": "linear" } }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.pacing.words_per_minute, 200);
        assert_eq!(config.pacing.speed, MAX_SPEED);
        assert_eq!(config.audio.master_volume, 1.0);
        assert_eq!(config.audio.curve, FadeCurve::Linear);
        assert_eq!(config.analysis.model, "gpt-4o-mini");
    }

    #[test]
    fn steps_through_speed_presets() {
        let pacing = PacingConfig::default();
        assert_eq!(pacing.faster(1.0), 1.25);
        assert_eq!(pacing.slower(1.0), 0.75);
        assert_eq!(pacing.faster(2.0), 2.0);
        assert_eq!(pacing.slower(0.5), 0.5);
    }
}
