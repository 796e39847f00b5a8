use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{join_lines, Line, MoodSpan};

/// A mood span translated into inclusive line-index coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoodSegment {
    pub start_line: usize,
    pub end_line: usize,
    pub mood_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<String>,
}

impl MoodSegment {
    pub fn contains(&self, line: usize) -> bool {
        (self.start_line..=self.end_line).contains(&line)
    }
}

/// Maps excerpt-delimited spans onto the page's lines.
///
/// Output order matches input order. A span whose start excerpt does not
/// occur in the text collapses to a zero-width segment on line 0 instead of
/// being dropped.
pub fn map_spans(spans: &[MoodSpan], lines: &[Line]) -> Vec<MoodSegment> {
    let text = join_lines(lines);
    let starts = line_starts(lines);

    spans
        .iter()
        .map(|span| {
            let (start_line, end_line) = match text.find(&span.start_excerpt) {
                None => {
                    debug!(excerpt = %span.start_excerpt, "start excerpt not found, using line 0");
                    (0, 0)
                }
                Some(start) => {
                    let start_line = line_at(&starts, start);
                    let end_line = find_end(&text, start, &span.end_excerpt)
                        .map(|end| line_at(&starts, end.saturating_sub(1)))
                        .unwrap_or(start_line);
                    (start_line, end_line.max(start_line))
                }
            };

            MoodSegment {
                start_line,
                end_line,
                mood_path: span.mood_path.clone(),
                audio_ref: span.audio_ref.clone(),
            }
        })
        .collect()
}

/// Looks up the segment covering `line`; earlier segments win on overlap.
pub fn segment_for_line(segments: &[MoodSegment], line: usize) -> Option<&MoodSegment> {
    segments.iter().find(|segment| segment.contains(line))
}

/// True when the segments tile `[0, line_count - 1]` in order, without gaps
/// or overlap.
pub fn is_contiguous(segments: &[MoodSegment], line_count: usize) -> bool {
    let mut next = 0;
    for segment in segments {
        if segment.start_line != next || segment.end_line < segment.start_line {
            return false;
        }
        next = segment.end_line + 1;
    }
    next == line_count
}

/// Byte offset just past the end excerpt. The search starts at the span's
/// own start so repeated phrases resolve forwards.
fn find_end(text: &str, from: usize, excerpt: &str) -> Option<usize> {
    text[from..]
        .find(excerpt)
        .map(|offset| from + offset)
        .or_else(|| text.find(excerpt))
        .map(|offset| offset + excerpt.len())
}

/// Byte offset at which each line starts in the newline-joined text.
fn line_starts(lines: &[Line]) -> Vec<usize> {
    let mut running = 0;
    lines
        .iter()
        .map(|line| {
            let start = running;
            running += line.text.len() + 1;
            start
        })
        .collect()
}

/// Index of the line whose `[start, start + len)` range holds `offset`.
/// Offsets on a joining separator belong to the line before it.
fn line_at(starts: &[usize], offset: usize) -> usize {
    starts
        .partition_point(|&start| start <= offset)
        .saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{extract_lines, TextFragment};

    fn lines(texts: &[&str]) -> Vec<Line> {
        let fragments: Vec<TextFragment> =
            texts.iter().map(|t| TextFragment::new(*t, true)).collect();
        extract_lines(&fragments)
    }

    fn range(segment: &MoodSegment) -> (usize, usize) {
        (segment.start_line, segment.end_line)
    }

    #[test]
    fn maps_line_aligned_spans_contiguously() {
        let lines = lines(&[
            "The door creaked open.",
            "Nobody was there.",
            "Sunlight spilled in.",
            "Birds sang outside.",
        ]);
        let spans = vec![
            MoodSpan::new("The door creaked", "Nobody was there.", "Dark.Tense.Dread"),
            MoodSpan::new("Sunlight spilled in.", "Birds sang outside.", "Light.Calm.Warm"),
        ];

        let segments = map_spans(&spans, &lines);
        assert_eq!(range(&segments[0]), (0, 1));
        assert_eq!(range(&segments[1]), (2, 3));
        assert!(is_contiguous(&segments, lines.len()));
    }

    #[test]
    fn unmatched_start_excerpt_collapses_to_line_zero() {
        let lines = lines(&["alpha", "beta", "gamma"]);
        let spans = vec![
            MoodSpan::new("not in the text", "beta", "A.B.Lost"),
            MoodSpan::new("beta", "gamma", "A.B.Found"),
        ];

        let segments = map_spans(&spans, &lines);
        assert_eq!(segments.len(), 2);
        assert_eq!(range(&segments[0]), (0, 0));
        assert_eq!(segments[0].mood_path, "A.B.Lost");
        assert_eq!(range(&segments[1]), (1, 2));
    }

    #[test]
    fn unmatched_end_excerpt_stays_on_start_line() {
        let lines = lines(&["alpha", "beta", "gamma"]);
        let segments = map_spans(&[MoodSpan::new("beta", "omega", "A.B.C")], &lines);
        assert_eq!(range(&segments[0]), (1, 1));
    }

    #[test]
    fn end_before_start_is_clamped() {
        let lines = lines(&["alpha", "beta", "gamma"]);
        let segments = map_spans(&[MoodSpan::new("gamma", "alpha", "A.B.C")], &lines);
        assert_eq!(range(&segments[0]), (2, 2));
    }

    #[test]
    fn excerpts_inside_lines_resolve_to_their_lines() {
        let lines = lines(&["one two three", "four five six", "seven eight"]);
        let segments = map_spans(&[MoodSpan::new("two", "five", "A.B.C")], &lines);
        assert_eq!(range(&segments[0]), (0, 1));
    }

    #[test]
    fn overlapping_segments_resolve_first_match() {
        let segments = vec![
            MoodSegment {
                start_line: 0,
                end_line: 3,
                mood_path: "first".into(),
                audio_ref: None,
            },
            MoodSegment {
                start_line: 2,
                end_line: 5,
                mood_path: "second".into(),
                audio_ref: None,
            },
        ];

        assert_eq!(segment_for_line(&segments, 2).unwrap().mood_path, "first");
        assert_eq!(segment_for_line(&segments, 4).unwrap().mood_path, "second");
        assert!(segment_for_line(&segments, 6).is_none());
        assert!(!is_contiguous(&segments, 6));
    }

    #[test]
    fn separator_offsets_belong_to_previous_line() {
        let starts = vec![0, 6, 11];
        assert_eq!(line_at(&starts, 4), 0);
        assert_eq!(line_at(&starts, 5), 0);
        assert_eq!(line_at(&starts, 6), 1);
        assert_eq!(line_at(&starts, 40), 2);
    }
}
