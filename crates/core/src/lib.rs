//! Core library for the mood reader.
//!
//! A document is read aloud line by line at an adjustable pace while an
//! ambient soundtrack follows the mood of the passage being read. Each module
//! owns one subsystem (text extraction, mood analysis, line pacing, audio
//! crossfading, etc.) and [`session::ReaderSession`] ties them together for
//! one open document.

pub mod analysis;
pub mod assets;
pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod mapping;
pub mod progress;
pub mod render;
pub mod session;
pub mod source;
pub mod text;
pub mod timeline;

#[cfg(test)]
pub(crate) mod test_support;

pub use analysis::{CompletionBackend, MoodAnalyzer, MoodCatalog, MoodSpan, OpenAiBackend};
pub use assets::{AssetStore, AudioResolver};
#[cfg(feature = "playback")]
pub use audio::{AudioDevice, DeviceOutput};
pub use audio::{AudioOutput, ChannelId, CrossfadeEngine, FadeCurve, FadeStep, SilentOutput};
pub use cache::{prefetch_window, MoodCache};
pub use config::{AnalysisConfig, AppConfig, AudioConfig, PacingConfig};
pub use error::{MoodReaderError, Result};
pub use mapping::{map_spans, segment_for_line, MoodSegment};
pub use progress::{JsonProgressStore, ProgressStore, ReadingProgress};
pub use render::{HighlightView, RenderedFragment};
pub use session::{analyse_page, Command, ReaderSession, SessionBuilder, SessionEvent};
pub use source::{DocumentSource, MemoryDocument};
pub use text::{extract_lines, join_lines, word_count, Line, TextFragment};
pub use timeline::{line_duration, Directive, PacingState, PlaybackState, Scheduler};
