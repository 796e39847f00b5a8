//! Line-paced playback state machine.
//!
//! The scheduler never sleeps itself. Every transition returns a
//! [`Directive`] telling the owner which timer to arm or which page to load,
//! and every armed [`LineTimer`] carries a token so a timer that fires after
//! being superseded is recognised and ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::clamp_speed, word_count, Line, PacingConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacingState {
    /// Not playing and no current line.
    Idle,
    /// A line timer is pending for the current line.
    Playing,
    /// Lines were cleared and the next page's lines are awaited.
    PageTransition,
    /// Not playing, current line retained.
    Paused,
}

/// Snapshot of the reading position for rendering and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub page_number: u32,
    /// `None` before the first line.
    pub current_line: Option<usize>,
    pub is_playing: bool,
    pub speed_multiplier: f32,
}

/// A single-shot timer the owner must arm for the current line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTimer {
    pub token: u64,
    pub page: u32,
    pub line: usize,
    pub delay: Duration,
}

/// What the owner of the scheduler has to do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Nothing,
    Arm(LineTimer),
    /// Fetch and extract the lines of this page, then call
    /// [`Scheduler::load_page`].
    LoadPage(u32),
    /// The last line of the last page was read.
    Finished,
}

/// Display time of a line: the words-per-minute baseline divided by the
/// speed multiplier, never shorter than the configured minimum.
pub fn line_duration(text: &str, speed: f32, pacing: &PacingConfig) -> Duration {
    let words = word_count(text) as f64;
    let scaled = words * pacing.ms_per_word() / f64::from(clamp_speed(speed));
    let millis = scaled.max(pacing.min_line_ms as f64);
    Duration::from_millis(millis.round() as u64)
}

#[derive(Debug)]
pub struct Scheduler {
    pacing: PacingConfig,
    state: PacingState,
    page: u32,
    page_count: u32,
    lines: Vec<Line>,
    lines_ready: bool,
    current_line: Option<usize>,
    speed: f32,
    next_token: u64,
    pending: Option<LineTimer>,
}

impl Scheduler {
    pub fn new(pacing: PacingConfig, page_count: u32) -> Self {
        let speed = clamp_speed(pacing.speed);
        Self {
            pacing,
            state: PacingState::Idle,
            page: 1,
            page_count,
            lines: Vec::new(),
            lines_ready: false,
            current_line: None,
            speed,
            next_token: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> PacingState {
        self.state
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn lines_ready(&self) -> bool {
        self.lines_ready
    }

    pub fn current_line(&self) -> Option<usize> {
        self.current_line
    }

    pub fn current(&self) -> Option<&Line> {
        self.current_line.and_then(|index| self.lines.get(index))
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    /// True while reading, including the gap between two pages.
    pub fn is_playing(&self) -> bool {
        matches!(self.state, PacingState::Playing | PacingState::PageTransition)
    }

    pub fn pending_timer(&self) -> Option<&LineTimer> {
        self.pending.as_ref()
    }

    pub fn playback_state(&self) -> PlaybackState {
        PlaybackState {
            page_number: self.page,
            current_line: self.current_line,
            is_playing: self.is_playing(),
            speed_multiplier: self.speed,
        }
    }

    /// Fragment indices of the active line, for emphasis when rendering.
    pub fn highlighted_fragments(&self) -> &[usize] {
        self.current()
            .map(|line| line.fragment_indices.as_slice())
            .unwrap_or(&[])
    }

    /// Takes effect from the next line; the line in flight keeps its timer.
    pub fn set_speed(&mut self, speed: f32) {
        self.speed = clamp_speed(speed);
    }

    /// Positions the scheduler at `page`, optionally restoring a line, and
    /// asks for the page to be loaded.
    pub fn open(&mut self, page: u32, line: Option<usize>) -> Directive {
        self.cancel();
        self.state = PacingState::Idle;
        if page == 0 || page > self.page_count {
            self.current_line = None;
            return Directive::Nothing;
        }
        self.page = page;
        self.current_line = line;
        if line.is_some() {
            self.state = PacingState::Paused;
        }
        self.clear_lines();
        Directive::LoadPage(page)
    }

    /// Direct page change. Playing readers drop back to idle; paused ones
    /// keep their line index.
    pub fn navigate(&mut self, page: u32) -> Directive {
        if page == 0 || page > self.page_count {
            debug!(page, page_count = self.page_count, "navigation out of range ignored");
            return Directive::Nothing;
        }

        self.cancel();
        if self.is_playing() {
            self.state = PacingState::Idle;
            self.current_line = None;
        }
        self.page = page;
        self.clear_lines();
        Directive::LoadPage(page)
    }

    /// Installs the extracted lines of `page`. Lines for any other page are
    /// stale and ignored.
    pub fn load_page(&mut self, page: u32, lines: Vec<Line>) -> Directive {
        if page != self.page || self.lines_ready {
            debug!(page, current = self.page, "discarding stale page lines");
            return Directive::Nothing;
        }

        self.lines = lines;
        self.lines_ready = true;

        if self.is_playing() {
            if self.lines.is_empty() {
                return self.turn_page();
            }
            self.state = PacingState::Playing;
            self.current_line = Some(0);
            return self.arm();
        }

        self.current_line = match (self.current_line, self.lines.len()) {
            (_, 0) => None,
            (Some(index), len) => Some(index.min(len - 1)),
            (None, _) => None,
        };
        if self.current_line.is_none() {
            self.state = PacingState::Idle;
        }
        Directive::Nothing
    }

    pub fn play(&mut self) -> Directive {
        if self.is_playing() {
            return Directive::Nothing;
        }
        if !self.lines_ready || self.lines.is_empty() {
            debug!(page = self.page, "nothing to play on this page");
            return Directive::Nothing;
        }

        self.state = PacingState::Playing;
        if self.current_line.is_none() {
            self.current_line = Some(0);
        }
        self.arm()
    }

    pub fn pause(&mut self) -> Directive {
        if self.is_playing() {
            self.cancel();
            self.state = PacingState::Paused;
        }
        Directive::Nothing
    }

    /// Cancels everything and returns to idle, e.g. when closing.
    pub fn stop(&mut self) {
        self.cancel();
        self.state = PacingState::Idle;
        self.current_line = None;
    }

    /// Handles an expired line timer.
    pub fn on_timer(&mut self, token: u64) -> Directive {
        let is_current = self
            .pending
            .as_ref()
            .map(|timer| timer.token == token)
            .unwrap_or(false);
        if self.state != PacingState::Playing || !is_current {
            debug!(token, "ignoring superseded line timer");
            return Directive::Nothing;
        }
        self.pending = None;

        let next = self.current_line.map(|index| index + 1).unwrap_or(0);
        if next < self.lines.len() {
            self.current_line = Some(next);
            return self.arm();
        }
        self.turn_page()
    }

    fn turn_page(&mut self) -> Directive {
        if self.page < self.page_count {
            self.page += 1;
            self.clear_lines();
            self.current_line = None;
            self.state = PacingState::PageTransition;
            debug!(page = self.page, "turning page");
            Directive::LoadPage(self.page)
        } else {
            self.cancel();
            self.state = PacingState::Idle;
            self.current_line = None;
            debug!("end of document");
            Directive::Finished
        }
    }

    fn arm(&mut self) -> Directive {
        let Some(line) = self.current_line else {
            return Directive::Nothing;
        };
        let text = self.lines.get(line).map(|l| l.text.as_str()).unwrap_or("");
        let timer = LineTimer {
            token: self.next_token,
            page: self.page,
            line,
            delay: line_duration(text, self.speed, &self.pacing),
        };
        self.next_token += 1;
        self.pending = Some(timer.clone());
        Directive::Arm(timer)
    }

    fn cancel(&mut self) {
        self.pending = None;
    }

    fn clear_lines(&mut self) {
        self.lines.clear();
        self.lines_ready = false;
    }
}
