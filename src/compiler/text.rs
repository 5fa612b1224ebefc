//! Stray text accumulation.
//!
//! Text and interpolations outside of content tags pile up as segments until
//! a group boundary turns them into a single text item. Grouping removes the
//! indentation shared by every non-blank line and trims the result, keeping
//! track of where each interpolated value ends up so a source map can be
//! attached to the item.

use crate::message::PromptlSourceRef;

#[derive(Debug, Clone)]
struct Segment {
    text: String,
    /// `Some` for interpolated values; carries the bare identifier, if any
    interpolation: Option<Option<String>>,
}

/// Text collected since the last group boundary.
#[derive(Debug, Clone, Default)]
pub(crate) struct StrayText {
    segments: Vec<Segment>,
}

/// Grouped stray text.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GroupedText {
    pub text: String,
    pub source_map: Vec<PromptlSourceRef>,
}

impl StrayText {
    /// Append literal document text.
    pub fn push_literal(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.segments.push(Segment {
            text: text.to_string(),
            interpolation: None,
        });
    }

    /// Append an interpolated value.
    pub fn push_value(&mut self, text: String, identifier: Option<String>) {
        self.segments.push(Segment {
            text,
            interpolation: Some(identifier),
        });
    }

    /// Take everything collected so far. Blank text yields `None`.
    pub fn take(&mut self) -> Option<GroupedText> {
        let segments = std::mem::take(&mut self.segments);
        group(&segments)
    }
}

/// Number of leading whitespace characters shared by every non-blank line.
pub fn common_indent(text: &str) -> usize {
    text.split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.chars().take_while(|c| c.is_whitespace()).count())
        .min()
        .unwrap_or(0)
}

/// Strip the common indent from every line, then trim.
pub fn remove_common_indent(text: &str) -> String {
    let indent = common_indent(text);
    text.split('\n')
        .map(|line| line.chars().skip(indent).collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn group(segments: &[Segment]) -> Option<GroupedText> {
    let tagged: Vec<(char, usize)> = segments
        .iter()
        .enumerate()
        .flat_map(|(index, segment)| segment.text.chars().map(move |c| (c, index)))
        .collect();
    let full: String = tagged.iter().map(|(c, _)| *c).collect();
    let indent = common_indent(&full);

    let mut kept = Vec::with_capacity(tagged.len());
    let mut column = 0;
    for (c, index) in tagged {
        if c == '\n' {
            column = 0;
            kept.push((c, index));
            continue;
        }
        column += 1;
        if column > indent {
            kept.push((c, index));
        }
    }

    let start = kept.iter().position(|(c, _)| !c.is_whitespace())?;
    let end = kept
        .iter()
        .rposition(|(c, _)| !c.is_whitespace())
        .map_or(start, |last| last + 1);
    let kept = &kept[start..end];

    let text = kept.iter().map(|(c, _)| *c).collect();
    let source_map = segments
        .iter()
        .enumerate()
        .filter_map(|(index, segment)| {
            let identifier = segment.interpolation.clone()?;
            let first = kept.iter().position(|(_, owner)| *owner == index)?;
            let last = kept.iter().rposition(|(_, owner)| *owner == index)?;
            Some(PromptlSourceRef {
                start: first,
                end: last + 1,
                identifier,
            })
        })
        .collect();

    Some(GroupedText { text, source_map })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn removes_shared_indentation() {
        let text = "\n    first\n      nested\n\n    last\n  ";
        assert_eq!(remove_common_indent(text), "first\n  nested\n\nlast");
    }

    #[test]
    fn blank_text_groups_to_nothing() {
        let mut stray = StrayText::default();
        stray.push_literal("  \n\t ");
        assert_eq!(stray.take(), None);
    }

    #[test]
    fn source_map_points_into_the_final_text() {
        let mut stray = StrayText::default();
        stray.push_literal("\n  Hello ");
        stray.push_value("Ada".into(), Some("name".into()));
        stray.push_literal(", you are ");
        stray.push_value("36".into(), None);
        stray.push_literal("\n");

        let grouped = stray.take().expect("text");
        assert_eq!(grouped.text, "Hello Ada, you are 36");
        assert_eq!(
            grouped.source_map,
            vec![
                PromptlSourceRef {
                    start: 6,
                    end: 9,
                    identifier: Some("name".into()),
                },
                PromptlSourceRef {
                    start: 19,
                    end: 21,
                    identifier: None,
                },
            ]
        );
        let chars: Vec<char> = grouped.text.chars().collect();
        let name: String = chars[6..9].iter().collect();
        assert_eq!(name, "Ada");
    }

    #[test]
    fn take_resets_the_buffer() {
        let mut stray = StrayText::default();
        stray.push_literal("once");
        assert!(stray.take().is_some());
        assert!(stray.take().is_none());
    }

    proptest! {
        #[test]
        fn grouping_matches_plain_indent_removal(lines in proptest::collection::vec("[ ]{0,4}[a-c ]{0,6}", 0..6)) {
            let text = lines.join("\n");
            let mut stray = StrayText::default();
            stray.push_literal(&text);
            let expected = remove_common_indent(&text);
            match stray.take() {
                Some(grouped) => prop_assert_eq!(grouped.text, expected),
                None => prop_assert!(expected.is_empty()),
            }
        }
    }
}
