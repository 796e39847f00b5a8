//! Page-addressed access to a document's positioned text.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{MoodReaderError, Result, TextFragment};

const FORM_FEED: char = '\u{c}';

/// Supplies the positioned fragments of one page at a time. Pages are
/// numbered from 1.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn page_count(&self) -> u32;

    async fn fragments(&self, page: u32) -> Result<Vec<TextFragment>>;
}

/// Fully loaded document kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocument {
    pages: Vec<Vec<TextFragment>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonPages {
    Wrapped { pages: Vec<Vec<TextFragment>> },
    Bare(Vec<Vec<TextFragment>>),
}

impl MemoryDocument {
    pub fn new(pages: Vec<Vec<TextFragment>>) -> Self {
        Self { pages }
    }

    /// One fragment per line, each terminating its line.
    pub fn from_lines<S: AsRef<str>>(pages: &[Vec<S>]) -> Self {
        let pages = pages
            .iter()
            .map(|lines| {
                lines
                    .iter()
                    .enumerate()
                    .map(|(row, line)| TextFragment::at(line.as_ref(), true, 0.0, row as f32))
                    .collect()
            })
            .collect();
        Self { pages }
    }

    /// Splits plain text into pages on form feeds, or every
    /// `lines_per_page` lines when the text has none.
    pub fn from_plain_text(text: &str, lines_per_page: usize) -> Self {
        let lines_per_page = lines_per_page.max(1);
        let pages: Vec<Vec<&str>> = if text.contains(FORM_FEED) {
            text.split(FORM_FEED).map(|page| page.lines().collect()).collect()
        } else {
            let lines: Vec<&str> = text.lines().collect();
            lines.chunks(lines_per_page).map(<[&str]>::to_vec).collect()
        };
        Self::from_lines(&pages)
    }

    /// Reads `{"pages": [[fragment, ...], ...]}` or a bare array of pages.
    pub fn from_json(raw: &str) -> Result<Self> {
        let pages = match serde_json::from_str::<JsonPages>(raw)? {
            JsonPages::Wrapped { pages } | JsonPages::Bare(pages) => pages,
        };
        Ok(Self { pages })
    }

    /// Opens a `.json` fragment dump or any other file as plain text.
    pub fn open(path: impl AsRef<Path>, lines_per_page: usize) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json(&raw)
        } else {
            Ok(Self::from_plain_text(&raw, lines_per_page))
        }
    }
}

#[async_trait]
impl DocumentSource for MemoryDocument {
    fn page_count(&self) -> u32 {
        u32::try_from(self.pages.len()).unwrap_or(u32::MAX)
    }

    async fn fragments(&self, page: u32) -> Result<Vec<TextFragment>> {
        let index = page
            .checked_sub(1)
            .ok_or(MoodReaderError::PageUnavailable(page))?;
        self.pages
            .get(index as usize)
            .cloned()
            .ok_or(MoodReaderError::PageUnavailable(page))
    }
}
