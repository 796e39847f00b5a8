//! Reconstruction of logical lines from positioned text fragments.

use serde::{Deserialize, Serialize};

/// One positioned piece of text as delivered by the document source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextFragment {
    pub text: String,
    /// Marks the last fragment of a logical line.
    #[serde(default)]
    pub end_of_line: bool,
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
}

impl TextFragment {
    pub fn new(text: impl Into<String>, end_of_line: bool) -> Self {
        Self {
            text: text.into(),
            end_of_line,
            ..Default::default()
        }
    }

    /// Same as [`TextFragment::new`] with an explicit position.
    pub fn at(text: impl Into<String>, end_of_line: bool, x: f32, y: f32) -> Self {
        Self {
            text: text.into(),
            end_of_line,
            x,
            y,
        }
    }
}

/// A trimmed logical line plus the indices of the fragments it was built from.
///
/// The indices are kept so the highlight can be rendered against the page's
/// fragment list without having to re-find fragments by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub text: String,
    pub fragment_indices: Vec<usize>,
}

/// Groups fragments into lines, splitting after every end-of-line fragment.
///
/// Blank lines are dropped but still consume their fragment indices, and a
/// trailing run without a terminating flag becomes the final line.
pub fn extract_lines(fragments: &[TextFragment]) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut pending: Vec<usize> = Vec::new();

    for (index, fragment) in fragments.iter().enumerate() {
        pending.push(index);
        if fragment.end_of_line {
            flush_line(fragments, &mut pending, &mut lines);
        }
    }
    flush_line(fragments, &mut pending, &mut lines);

    lines
}

fn flush_line(fragments: &[TextFragment], pending: &mut Vec<usize>, lines: &mut Vec<Line>) {
    if pending.is_empty() {
        return;
    }

    let joined: String = pending
        .iter()
        .map(|&i| fragments[i].text.as_str())
        .collect();
    let trimmed = joined.trim();
    let indices = std::mem::take(pending);
    if !trimmed.is_empty() {
        lines.push(Line {
            text: trimmed.to_string(),
            fragment_indices: indices,
        });
    }
}

/// Newline-joined page text, the exact string the mood analysis sees.
pub fn join_lines(lines: &[Line]) -> String {
    lines
        .iter()
        .map(|line| line.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[Line]) -> Vec<&str> {
        lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn joins_fragments_up_to_end_of_line() {
        let fragments = vec![
            TextFragment::new("Hello ", false),
            TextFragment::new("world.", true),
            TextFragment::new("Next", true),
        ];

        let lines = extract_lines(&fragments);
        assert_eq!(texts(&lines), vec!["Hello world.", "Next"]);
        assert_eq!(lines[0].fragment_indices, vec![0, 1]);
        assert_eq!(lines[1].fragment_indices, vec![2]);
    }

    #[test]
    fn blank_lines_are_dropped_but_consume_indices() {
        let fragments = vec![
            TextFragment::new("  ", true),
            TextFragment::new("", false),
            TextFragment::new(" ", true),
            TextFragment::new(" Body ", true),
        ];

        let lines = extract_lines(&fragments);
        assert_eq!(texts(&lines), vec!["Body"]);
        assert_eq!(lines[0].fragment_indices, vec![3]);
    }

    #[test]
    fn trailing_run_without_flag_is_emitted() {
        let fragments = vec![
            TextFragment::new("First", true),
            TextFragment::new("dangling ", false),
            TextFragment::new("tail", false),
        ];

        let lines = extract_lines(&fragments);
        assert_eq!(texts(&lines), vec!["First", "dangling tail"]);
        assert_eq!(lines[1].fragment_indices, vec![1, 2]);
    }

    #[test]
    fn empty_input_yields_no_lines() {
        assert!(extract_lines(&[]).is_empty());
        assert_eq!(join_lines(&[]), "");
    }

    #[test]
    fn counts_words_on_any_whitespace() {
        assert_eq!(word_count("  one\ttwo   three \n"), 3);
        assert_eq!(word_count(""), 0);
    }
}
