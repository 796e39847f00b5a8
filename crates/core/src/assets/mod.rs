use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use rand::seq::IndexedRandom;
use tracing::{debug, warn};

use crate::AudioConfig;

const AUDIO_EXTENSIONS: [&str; 2] = ["mp3", "wav"];

/// Resolves a mood path to a playable audio reference. `None` means the
/// segment plays no music; it is not an error.
pub trait AudioResolver: Send + Sync {
    fn resolve(&self, mood_path: &str) -> Option<String>;
}

/// Registry of ambient tracks: explicit registrations first, then a sound
/// directory laid out as `Category/SubCategory/Mood/*.mp3`.
#[derive(Debug, Default)]
pub struct AssetStore {
    tracks: HashMap<String, String>,
    sounds_dir: Option<PathBuf>,
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            tracks: config.tracks.clone(),
            sounds_dir: config.sounds_dir.clone(),
        }
    }

    pub fn with_sounds_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sounds_dir = Some(dir.into());
        self
    }

    pub fn register(&mut self, mood_path: impl Into<String>, audio_ref: impl Into<String>) {
        self.tracks.insert(mood_path.into(), audio_ref.into());
    }

    fn pick_from_dir(&self, root: &Path, mood_path: &str) -> Option<String> {
        let dir = mood_path
            .split('.')
            .fold(root.to_path_buf(), |dir, part| dir.join(part));

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "no sound directory for mood");
                return None;
            }
        };

        let files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| is_audio_file(path))
            .collect();

        let chosen = files.choose(&mut rand::rng())?;
        debug!(mood = mood_path, track = %chosen.display(), "resolved ambient track");
        Some(chosen.to_string_lossy().into_owned())
    }
}

impl AudioResolver for AssetStore {
    fn resolve(&self, mood_path: &str) -> Option<String> {
        if let Some(track) = self.tracks.get(mood_path) {
            return Some(track.clone());
        }
        let root = self.sounds_dir.as_deref()?;
        self.pick_from_dir(root, mood_path)
    }
}

fn is_audio_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                AUDIO_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            })
            .unwrap_or(false)
}
