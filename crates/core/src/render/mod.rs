use crate::TextFragment;

/// One fragment as it should be drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedFragment<'a> {
    pub index: usize,
    pub text: &'a str,
    pub emphasized: bool,
    pub end_of_line: bool,
}

/// The displayed page: its fragments, with the active line's fragments
/// marked for emphasis. Membership is decided by fragment index, so equal
/// fragments on different lines are never confused.
#[derive(Debug, Default, Clone)]
pub struct HighlightView {
    fragments: Vec<TextFragment>,
}

impl HighlightView {
    pub fn new(fragments: Vec<TextFragment>) -> Self {
        Self { fragments }
    }

    pub fn fragments(&self) -> &[TextFragment] {
        &self.fragments
    }

    pub fn render(&self, highlighted: &[usize]) -> Vec<RenderedFragment<'_>> {
        self.fragments
            .iter()
            .enumerate()
            .map(|(index, fragment)| RenderedFragment {
                index,
                text: &fragment.text,
                emphasized: highlighted.contains(&index),
                end_of_line: fragment.end_of_line,
            })
            .collect()
    }

    /// Plain-text rendering with emphasised runs wrapped in `open`/`close`.
    pub fn render_marked(&self, highlighted: &[usize], open: &str, close: &str) -> String {
        let mut out = String::new();
        for fragment in self.render(highlighted) {
            if fragment.emphasized {
                out.push_str(open);
                out.push_str(fragment.text);
                out.push_str(close);
            } else {
                out.push_str(fragment.text);
            }
            if fragment.end_of_line {
                out.push('\n');
            }
        }
        out
    }
}
