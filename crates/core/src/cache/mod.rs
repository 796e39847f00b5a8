use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::MoodSegment;

/// Per-page analysis results plus the set of pages currently being analysed.
///
/// Entries are only written once a page's analysis has fully succeeded; a
/// failed page is simply left out and becomes eligible again.
#[derive(Debug, Default)]
pub struct MoodCache {
    entries: HashMap<u32, Vec<MoodSegment>>,
    in_flight: HashSet<u32>,
}

impl MoodCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, page: u32) -> Option<&[MoodSegment]> {
        self.entries.get(&page).map(Vec::as_slice)
    }

    pub fn contains(&self, page: u32) -> bool {
        self.entries.contains_key(&page)
    }

    pub fn is_in_flight(&self, page: u32) -> bool {
        self.in_flight.contains(&page)
    }

    /// Marks `page` as in flight. Returns false when the page is already
    /// cached or being analysed, in which case no request should be made.
    pub fn begin(&mut self, page: u32) -> bool {
        if self.contains(page) || self.is_in_flight(page) {
            debug!(page, "analysis suppressed, page cached or in flight");
            return false;
        }
        self.in_flight.insert(page)
    }

    /// Stores a finished analysis and clears the in-flight marker.
    pub fn complete(&mut self, page: u32, segments: Vec<MoodSegment>) {
        self.in_flight.remove(&page);
        self.entries.entry(page).or_insert(segments);
    }

    /// Clears the in-flight marker without caching anything.
    pub fn abandon(&mut self, page: u32) {
        self.in_flight.remove(&page);
    }

    /// Pages currently marked as in flight.
    pub fn pending(&self) -> impl Iterator<Item = u32> + '_ {
        self.in_flight.iter().copied()
    }

    /// Drops every entry and marker, e.g. when the document is closed.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.in_flight.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pages worth analysing while `current` is displayed: the page itself and
/// up to `ahead` following pages, bounded by `page_count`.
pub fn prefetch_window(current: u32, page_count: u32, ahead: u32) -> Vec<u32> {
    if current == 0 || current > page_count {
        return Vec::new();
    }
    let last = current.saturating_add(ahead).min(page_count);
    (current..=last).collect()
}
