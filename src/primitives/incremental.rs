//! Document session: one text, its scopes, and incremental re-tokenization.
//!
//! A full parse records the [`RuleStack`] at every line start. After an edit
//! the tokenizer restarts at the start of the edited line with the recorded
//! stack and runs line by line until it reaches a line past the edit whose
//! incoming stack equals the one recorded there; from that line on the old
//! scopes are still valid. Scopes from matches never cross a line, and
//! regions crossing the stop line are exactly the open frames on a stack that
//! did not change, so the merged result is identical to a full parse.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::model::scope::{Scope, TextEdit};
use crate::model::scoped_string::ScopedString;
use crate::primitives::parser::{close_all, line_ranges, Parser, RuleStack};

pub struct Document {
    parser: Parser,
    scoped: ScopedString,
    checkpoints: BTreeMap<usize, RuleStack>,
}

impl Document {
    /// Create a session over `text` and tokenize it fully.
    pub fn new(parser: Parser, text: impl Into<String>) -> Self {
        let mut document = Self {
            parser,
            scoped: ScopedString::new(text),
            checkpoints: BTreeMap::new(),
        };
        document.reparse();
        document
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn text(&self) -> &str {
        self.scoped.as_str()
    }

    pub fn scoped_string(&self) -> &ScopedString {
        &self.scoped
    }

    /// Mutable access for callers attaching attribute payloads.
    pub fn scoped_string_mut(&mut self) -> &mut ScopedString {
        &mut self.scoped
    }

    pub fn into_scoped_string(self) -> ScopedString {
        self.scoped
    }

    /// Replace the text and tokenize it fully. Returns the changed range,
    /// which is the whole text.
    pub fn parse(&mut self, text: impl Into<String>) -> Range<usize> {
        self.scoped = ScopedString::new(text);
        self.reparse()
    }

    fn reparse(&mut self) -> Range<usize> {
        let text = self.scoped.as_str().to_string();
        let mut scoped = ScopedString::new(text.as_str());
        let mut checkpoints = BTreeMap::new();
        let mut stack = RuleStack::new();
        {
            let mut emit = |scope: Scope, level: usize| scoped.add(scope, level);
            for line in line_ranges(&text, 0) {
                checkpoints.insert(line.start, stack.clone());
                self.parser.tokenize_line(&text, line, &mut stack, &mut emit);
            }
            checkpoints.insert(text.len(), stack.clone());
            close_all(&mut stack, text.len(), &mut emit);
        }
        tracing::debug!(
            "Parsed {} bytes into {} scopes",
            text.len(),
            scoped.number_of_scopes()
        );
        self.scoped = scoped;
        self.checkpoints = checkpoints;
        0..text.len()
    }

    /// Apply `edit` and re-tokenize the affected lines.
    ///
    /// Returns the range (in the edited text) whose scopes may have changed:
    /// the union of every scope removed or added plus the edit itself.
    ///
    /// The edit must be valid for the current text (see
    /// [`TextEdit::is_valid_for`]).
    pub fn edit(&mut self, edit: &TextEdit) -> Range<usize> {
        debug_assert!(
            edit.is_valid_for(self.text()),
            "edit {:?} is not valid for a text of {} bytes",
            edit,
            self.text().len()
        );

        match edit {
            TextEdit::Insert { at, text } => self.scoped.insert(text, *at),
            TextEdit::Delete { range } => self.scoped.delete_characters(range.clone()),
        }
        self.shift_checkpoints(edit);

        let text = self.scoped.as_str().to_string();
        let from = text[..edit.start()].rfind('\n').map_or(0, |i| i + 1);
        let Some(mut stack) = self.checkpoints.get(&from).cloned() else {
            tracing::debug!("No checkpoint at {}, parsing from scratch", from);
            return self.reparse();
        };

        let mut emitted: Vec<(Scope, usize)> = Vec::new();
        let mut stop = None;
        {
            let mut emit = |scope: Scope, level: usize| emitted.push((scope, level));
            for line in line_ranges(&text, from) {
                let converged = self.checkpoints.get(&line.start) == Some(&stack);
                if line.start > edit.end_after() && converged {
                    stop = Some(line.start);
                    break;
                }
                self.checkpoints.insert(line.start, stack.clone());
                let stale: Vec<usize> = self
                    .checkpoints
                    .range(line.start + 1..line.end)
                    .map(|(offset, _)| *offset)
                    .collect();
                for offset in stale {
                    self.checkpoints.remove(&offset);
                }
                self.parser.tokenize_line(&text, line, &mut stack, &mut emit);
            }
            if stop.is_none() {
                self.checkpoints.retain(|offset, _| *offset < text.len());
                self.checkpoints.insert(text.len(), stack.clone());
                close_all(&mut stack, text.len(), &mut emit);
            }
        }
        let window = from..stop.unwrap_or(text.len());
        tracing::trace!("Re-tokenized {:?} for {:?}", window, edit);

        let mut changed = edit.start()..edit.end_after();
        let mut touch = |range: &Range<usize>| {
            changed.start = changed.start.min(range.start);
            changed.end = changed.end.max(range.end);
        };

        for scope in self.scoped.remove_scopes(window.clone()) {
            touch(&scope.range);
        }
        for (scope, level) in &emitted {
            if scope.range.start < window.start {
                if let Some(old) = self.scoped.remove_scope_starting_at(*level, scope.range.start) {
                    touch(&old.range);
                }
            }
        }
        for (scope, level) in emitted {
            touch(&scope.range);
            self.scoped.add(scope, level);
        }
        changed
    }

    /// Move recorded stacks to where their line starts are after `edit`.
    fn shift_checkpoints(&mut self, edit: &TextEdit) {
        let old = std::mem::take(&mut self.checkpoints);
        for (offset, mut stack) in old {
            let offset = match edit {
                TextEdit::Insert { at, text } if offset > *at => offset + text.len(),
                TextEdit::Insert { .. } => offset,
                TextEdit::Delete { range } if offset > range.end => offset - range.len(),
                TextEdit::Delete { range } if offset > range.start => continue,
                TextEdit::Delete { .. } => offset,
            };
            stack.shift_starts(|start| edit.shift_offset(start));
            self.checkpoints.insert(offset, stack);
        }
    }

    #[cfg(test)]
    fn checkpoint_offsets(&self) -> Vec<usize> {
        self.checkpoints.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::grammar::Grammar;
    use crate::view::theme::Theme;
    use serde_json::json;
    use std::sync::Arc;

    fn parser(patterns: serde_json::Value) -> Parser {
        let grammar = Grammar::from_json(
            &json!({
                "uuid": "0A2A5B6C-1D2E-4F30-8A1B-2C3D4E5F6071",
                "name": "Test",
                "scopeName": "source.test",
                "patterns": patterns,
            })
            .to_string(),
        )
        .unwrap();
        Parser::new(Arc::new(grammar))
    }

    fn lua_parser() -> Parser {
        parser(json!([
            {
                "name": "comment.block",
                "begin": "--\\[(=*)\\[",
                "end": "\\]\\1\\]",
                "captures": { "0": { "name": "punctuation.comment" } }
            },
            { "name": "comment.line", "match": "--.*$" },
            { "name": "constant.numeric", "match": "\\d+" },
            { "name": "keyword", "match": "\\b(?:local|end|function)\\b" }
        ]))
    }

    fn snapshot(scoped: &ScopedString) -> Vec<(usize, String, Range<usize>)> {
        let mut out: Vec<_> = scoped
            .iter()
            .map(|(level, scope)| (level, scope.identifier.to_string(), scope.range.clone()))
            .collect();
        out.sort_by(|a, b| (a.2.start, a.0).cmp(&(b.2.start, b.0)));
        out
    }

    fn assert_matches_full_parse(document: &Document) {
        let full = document.parser().parse_to_scoped_string(document.text());
        assert_eq!(snapshot(document.scoped_string()), snapshot(&full));
        document.scoped_string().check_invariants().unwrap();
    }

    #[test]
    fn test_insert_inside_scope_grows_it() {
        let mut document = Document::new(
            parser(json!([{ "name": "string.unquoted", "match": "^\\w+: .+$" }])),
            "title: ok\n",
        );
        assert_eq!(document.scoped_string().number_of_scopes(), 2);

        document.edit(&TextEdit::insertion(7, "123"));
        assert_eq!(document.text(), "title: 123ok\n");
        assert_eq!(document.scoped_string().number_of_scopes(), 2);
        let scopes: Vec<_> = document.scoped_string().iter().map(|(_, s)| s.clone()).collect();
        assert_eq!(scopes, vec![Scope::new("string.unquoted", 0..12)]);
    }

    #[test]
    fn test_delete_across_sibling_boundary_merges() {
        let mut document = Document::new(
            parser(json!([
                { "name": "keyword", "match": "abcde" },
                { "name": "constant.numeric", "match": "\\d+" }
            ])),
            "abcde1234",
        );
        assert_eq!(document.scoped_string().number_of_scopes(), 3);

        let changed = document.edit(&TextEdit::deletion(4..6));
        assert_eq!(document.text(), "abcd234");
        assert_eq!(document.scoped_string().number_of_scopes(), 2);
        let scopes: Vec<_> = document.scoped_string().iter().map(|(_, s)| s.clone()).collect();
        assert_eq!(scopes, vec![Scope::new("constant.numeric", 4..7)]);
        assert_eq!(changed, 0..7);
    }

    #[test]
    fn test_edit_stops_at_unchanged_line() {
        let text = "local a = 1\nlocal b = 2\nlocal c = 3\n";
        let mut document = Document::new(lua_parser(), text);
        let changed = document.edit(&TextEdit::insertion(11, "0"));
        assert_eq!(document.text(), "local a = 10\nlocal b = 2\nlocal c = 3\n");
        assert!(changed.end <= 13, "changed {:?} leaked past the edited line", changed);
        assert!(changed.start <= 10 && changed.end >= 11);
        assert_matches_full_parse(&document);
        assert_eq!(document.checkpoint_offsets(), vec![0, 13, 25, 37]);
    }

    #[test]
    fn test_opening_comment_cascades() {
        let text = "local a = 1\nlocal b = 2\n";
        let mut document = Document::new(lua_parser(), text);
        let changed = document.edit(&TextEdit::insertion(0, "--[[ "));
        assert_eq!(changed.end, document.text().len());
        assert_matches_full_parse(&document);
        assert_eq!(
            &*document.scoped_string().topmost_scope(20).identifier,
            "comment.block"
        );

        // Closing it again restores the keywords after the comment.
        let at = document.text().find("local b").unwrap();
        document.edit(&TextEdit::insertion(at, "]] "));
        assert_matches_full_parse(&document);
        let keyword = document.text().find("local b").unwrap();
        assert_eq!(&*document.scoped_string().topmost_scope(keyword).identifier, "keyword");
    }

    #[test]
    fn test_mismatched_close_stays_open() {
        let mut document = Document::new(lua_parser(), "--[==[ a\nb ]==]\nlocal x\n");
        assert_eq!(&*document.scoped_string().topmost_scope(18).identifier, "keyword");

        let close = document.text().find("]==]").unwrap();
        document.edit(&TextEdit::deletion(close + 1..close + 2));
        assert_eq!(document.text(), "--[==[ a\nb ]=]\nlocal x\n");
        assert_eq!(
            &*document.scoped_string().topmost_scope(17).identifier,
            "comment.block"
        );
        assert_matches_full_parse(&document);
    }

    #[test]
    fn test_edit_in_last_line_and_at_end() {
        let mut document = Document::new(lua_parser(), "local a\nfunction");
        document.edit(&TextEdit::insertion(16, " 42"));
        assert_matches_full_parse(&document);
        document.edit(&TextEdit::deletion(0..8));
        assert_eq!(document.text(), "function 42");
        assert_matches_full_parse(&document);
        document.edit(&TextEdit::deletion(0..11));
        assert_eq!(document.scoped_string().number_of_scopes(), 1);
        assert_matches_full_parse(&document);
    }

    #[test]
    fn test_parse_reports_whole_text() {
        let mut document = Document::new(lua_parser(), "");
        assert_eq!(document.parse("local x = 1"), 0..11);
        assert_matches_full_parse(&document);
    }

    #[test]
    fn test_annotated_scopes_leave_the_session() {
        let theme = Theme::from_json(
            &json!({
                "uuid": "8E1A2C3B-4D5E-4F60-8172-93A4B5C6D7E8",
                "name": "Plain",
                "settings": [{ "scope": "keyword", "settings": { "fontStyle": "bold" } }]
            })
            .to_string(),
        )
        .unwrap();
        let mut document = Document::new(lua_parser(), "local x = 1");
        theme.annotate(document.scoped_string_mut());

        let scoped = document.into_scoped_string();
        let keyword = scoped.topmost_scope(0);
        assert_eq!(&*keyword.identifier, "keyword");
        assert!(keyword.attribute.as_ref().unwrap().font_style.unwrap().bold);
        assert!(scoped.topmost_scope(10).attribute.is_none());
    }

    mod property_tests {
        use super::{assert_matches_full_parse, lua_parser};
        use crate::model::scope::TextEdit;
        use crate::model::scoped_string::ScopedString;
        use crate::primitives::incremental::Document;
        use proptest::prelude::*;
        use std::collections::HashMap;
        use std::ops::Range;

        const PIECES: &[&str] = &[
            "local ", "x", " = ", "42", "\n", "--", "[[", "]]", "[=[", "]=]", "end", " ",
            "function",
        ];

        fn arb_text() -> impl Strategy<Value = String> {
            prop::collection::vec(prop::sample::select(PIECES), 0..24)
                .prop_map(|parts| parts.concat())
        }

        #[derive(Debug, Clone)]
        enum EditOp {
            Insert { position: usize, piece: &'static str },
            Delete { position: usize, length: usize },
        }

        fn arb_edit_op() -> impl Strategy<Value = EditOp> {
            prop_oneof![
                (0usize..200, prop::sample::select(PIECES))
                    .prop_map(|(position, piece)| EditOp::Insert { position, piece }),
                (0usize..200, 1usize..12)
                    .prop_map(|(position, length)| EditOp::Delete { position, length }),
            ]
        }

        fn to_text_edit(op: &EditOp, len: usize) -> TextEdit {
            match op {
                EditOp::Insert { position, piece } => {
                    TextEdit::insertion(position % (len + 1), *piece)
                }
                EditOp::Delete { position, length } => {
                    let start = position % (len + 1);
                    TextEdit::deletion(start..(start + length).min(len))
                }
            }
        }

        /// Scopes present in exactly one of the two stores, by name and range.
        fn differing_ranges(a: &ScopedString, b: &ScopedString) -> Vec<Range<usize>> {
            let mut counts: HashMap<(String, Range<usize>), i64> = HashMap::new();
            for (_, scope) in a.iter() {
                *counts
                    .entry((scope.identifier.to_string(), scope.range.clone()))
                    .or_default() += 1;
            }
            for (_, scope) in b.iter() {
                *counts
                    .entry((scope.identifier.to_string(), scope.range.clone()))
                    .or_default() -= 1;
            }
            counts
                .into_iter()
                .filter(|(_, count)| *count != 0)
                .map(|((_, range), _)| range)
                .collect()
        }

        proptest! {
            #[test]
            fn prop_incremental_equals_full(
                text in arb_text(),
                ops in prop::collection::vec(arb_edit_op(), 1..6),
            ) {
                let mut document = Document::new(lua_parser(), text);
                for op in &ops {
                    let edit = to_text_edit(op, document.text().len());
                    let changed = document.edit(&edit);
                    prop_assert!(changed.start <= edit.start());
                    prop_assert!(changed.end <= document.text().len());
                    assert_matches_full_parse(&document);
                }
            }

            #[test]
            fn prop_changed_range_covers_every_difference(
                text in arb_text(),
                ops in prop::collection::vec(arb_edit_op(), 1..6),
            ) {
                let mut document = Document::new(lua_parser(), text);
                for op in &ops {
                    let edit = to_text_edit(op, document.text().len());

                    // The store as it would be if only offsets were shifted.
                    let mut shifted = document.scoped_string().clone();
                    match &edit {
                        TextEdit::Insert { at, text } => shifted.insert(text, *at),
                        TextEdit::Delete { range } => shifted.delete_characters(range.clone()),
                    }

                    let changed = document.edit(&edit);
                    for range in differing_ranges(&shifted, document.scoped_string()) {
                        prop_assert!(
                            changed.start <= range.start && range.end <= changed.end,
                            "scope {:?} changed outside the reported {:?}",
                            range,
                            changed
                        );
                    }
                }
            }
        }
    }
}
