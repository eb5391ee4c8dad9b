//! Scope annotations and the range arithmetic that keeps them aligned with
//! the text they describe while that text is being edited.

use std::ops::Range;
use std::sync::Arc;

use crate::view::theme::Attributes;

/// Identifier of the implicit scope that spans the whole text.
pub const GLOBAL_SCOPE: &str = "GLOBAL";

/// A named, half-open byte range of the text.
///
/// Two scopes are equal when their identifier and range are equal; the
/// attribute payload is carried along for the caller and ignored by
/// comparisons.
#[derive(Debug, Clone)]
pub struct Scope {
    pub identifier: Arc<str>,
    pub range: Range<usize>,
    pub attribute: Option<Arc<Attributes>>,
}

impl Scope {
    pub fn new(identifier: impl Into<Arc<str>>, range: Range<usize>) -> Self {
        Self {
            identifier: identifier.into(),
            range,
            attribute: None,
        }
    }

    /// Attach a caller payload (typically resolved theme attributes).
    pub fn with_attribute(mut self, attribute: Arc<Attributes>) -> Self {
        self.attribute = Some(attribute);
        self
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier && self.range == other.range
    }
}

impl Eq for Scope {}

/// One entry of a range query over a [`ScopedString`](super::scoped_string::ScopedString).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSpan {
    pub scope_name: Arc<str>,
    pub range: Range<usize>,
}

/// A single contiguous edit applied to a parsed document.
///
/// Offsets are byte offsets into the text as it was before the edit and must
/// fall on UTF-8 character boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEdit {
    Insert { at: usize, text: String },
    Delete { range: Range<usize> },
}

impl TextEdit {
    pub fn insertion(at: usize, text: impl Into<String>) -> Self {
        TextEdit::Insert {
            at,
            text: text.into(),
        }
    }

    pub fn deletion(range: Range<usize>) -> Self {
        TextEdit::Delete { range }
    }

    /// Offset where the edit begins.
    pub fn start(&self) -> usize {
        match self {
            TextEdit::Insert { at, .. } => *at,
            TextEdit::Delete { range } => range.start,
        }
    }

    /// Offset just past the edit, measured in the edited text.
    pub fn end_after(&self) -> usize {
        match self {
            TextEdit::Insert { at, text } => at + text.len(),
            TextEdit::Delete { range } => range.start,
        }
    }

    /// Whether the edit can be applied to `text`.
    pub fn is_valid_for(&self, text: &str) -> bool {
        match self {
            TextEdit::Insert { at, .. } => *at <= text.len() && text.is_char_boundary(*at),
            TextEdit::Delete { range } => {
                range.start <= range.end
                    && range.end <= text.len()
                    && text.is_char_boundary(range.start)
                    && text.is_char_boundary(range.end)
            }
        }
    }

    /// Map an offset of the pre-edit text to the post-edit text.
    ///
    /// Offsets at or after an insertion point move with the inserted text;
    /// offsets inside a deleted range collapse onto its start.
    pub fn shift_offset(&self, offset: usize) -> usize {
        match self {
            TextEdit::Insert { at, text } if offset >= *at => offset + text.len(),
            TextEdit::Insert { .. } => offset,
            TextEdit::Delete { range } if offset >= range.end => offset - range.len(),
            TextEdit::Delete { range } if offset > range.start => range.start,
            TextEdit::Delete { .. } => offset,
        }
    }
}

/// Range of `range` left over after the bytes in `deleted` are removed and
/// the text after them is pulled back. An empty result means nothing survived.
pub fn remove_indexes(range: &Range<usize>, deleted: &Range<usize>) -> Range<usize> {
    let removed = deleted.len();
    let clip = |offset: usize| {
        if offset <= deleted.start {
            offset
        } else if offset >= deleted.end {
            offset - removed
        } else {
            deleted.start
        }
    };
    clip(range.start)..clip(range.end)
}

/// Range of `range` after `length` bytes are inserted at `at`.
///
/// A range starting at or after the insertion point shifts, a range strictly
/// containing it grows, and a range ending exactly at it is left alone.
pub fn insert_indexes(range: &Range<usize>, at: usize, length: usize) -> Range<usize> {
    if range.start >= at {
        range.start + length..range.end + length
    } else if range.end > at {
        range.start..range.end + length
    } else {
        range.clone()
    }
}

/// Whether `inner` lies entirely within `outer`.
pub fn contains_range(outer: &Range<usize>, inner: &Range<usize>) -> bool {
    outer.start <= inner.start && inner.end <= outer.end
}

/// Whether two ranges share at least one byte.
pub fn intersects(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(location: usize, length: usize) -> Range<usize> {
        location..location + length
    }

    #[test]
    fn test_remove_indexes() {
        assert_eq!(remove_indexes(&span(0, 24), &span(2, 4)), span(0, 20));
        assert_eq!(remove_indexes(&span(20, 40), &span(4, 12)), span(8, 40));
        assert_eq!(remove_indexes(&span(23, 11), &span(20, 5)), span(20, 9));
        assert!(remove_indexes(&span(10, 14), &span(5, 40)).is_empty());
    }

    #[test]
    fn test_insert_indexes() {
        assert_eq!(insert_indexes(&span(23, 11), 20, 5), span(28, 11));
        assert_eq!(insert_indexes(&span(14, 2), 15, 7), span(14, 9));
        assert_eq!(insert_indexes(&span(26, 36), 62, 5), span(26, 36));
    }

    #[test]
    fn test_insert_at_scope_start_shifts() {
        assert_eq!(insert_indexes(&span(7, 2), 7, 3), span(10, 2));
    }

    #[test]
    fn test_contains_and_intersects() {
        assert!(contains_range(&(0..10), &(2..10)));
        assert!(!contains_range(&(0..10), &(2..11)));
        assert!(intersects(&(0..5), &(4..9)));
        assert!(!intersects(&(0..5), &(5..9)));
    }

    #[test]
    fn test_scope_equality_ignores_attribute() {
        let plain = Scope::new("string", 0..4);
        let styled = Scope::new("string", 0..4).with_attribute(Arc::new(Attributes::default()));
        assert_eq!(plain, styled);
        assert_ne!(plain, Scope::new("string", 0..5));
    }

    #[test]
    fn test_text_edit_offsets() {
        let insert = TextEdit::insertion(4, "abc");
        assert_eq!(insert.end_after(), 7);
        assert_eq!(insert.shift_offset(3), 3);
        assert_eq!(insert.shift_offset(4), 7);

        let delete = TextEdit::deletion(4..6);
        assert_eq!(delete.end_after(), 4);
        assert_eq!(delete.shift_offset(5), 4);
        assert_eq!(delete.shift_offset(9), 7);
        assert!(delete.is_valid_for("0123456"));
        assert!(!delete.is_valid_for("0123"));
    }
}
