//! Line-oriented tokenizer over a compiled grammar.
//!
//! Text is processed one line at a time (lines keep their trailing `\n`). The
//! only state carried from one line to the next is the [`RuleStack`] of open
//! begin/end regions, which is what lets a document session restart the
//! tokenizer at any line start it has a recorded stack for.
//!
//! Within a line the earliest match wins. Ties go to the region's end pattern,
//! unless the region sets `applyEndPatternLast`, and then to the candidate
//! declared first.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use crate::model::scope::{contains_range, Scope};
use crate::model::scoped_string::ScopedString;
use crate::primitives::grammar::{CaptureCollection, Grammar, PatternId, PatternKind};
use crate::primitives::regex::{MatchResult, RegularExpression};

/// Default for [`Parser::with_max_line_length`].
pub const DEFAULT_MAX_LINE_LENGTH: usize = 20_000;

/// One open begin/end region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    rule: PatternId,
    name: Option<Arc<str>>,
    /// End expression with the begin captures substituted in.
    end: RegularExpression,
    /// Absolute offset where the begin match started.
    start: usize,
    /// Level the region's own scope is placed on.
    level: usize,
}

impl Frame {
    pub fn rule(&self) -> PatternId {
        self.rule
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// Level of scopes found inside the region.
    fn content_level(&self) -> usize {
        self.level + usize::from(self.name.is_some())
    }
}

/// Stack of open regions, innermost last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleStack {
    frames: Vec<Frame>,
}

impl RuleStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    fn content_level(&self) -> usize {
        self.top().map_or(0, Frame::content_level)
    }

    /// Map every frame start through `shift`.
    pub(crate) fn shift_starts(&mut self, shift: impl Fn(usize) -> usize) {
        for frame in &mut self.frames {
            frame.start = shift(frame.start);
        }
    }
}

/// What won the race at the current position.
enum Event {
    Candidate(PatternId, MatchResult),
    End(MatchResult),
}

/// Tokenizer for one grammar. Cheap to clone and safe to share.
#[derive(Debug, Clone)]
pub struct Parser {
    grammar: Arc<Grammar>,
    max_line_length: usize,
}

impl Parser {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        Self {
            grammar,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }

    /// Lines longer than `max_line_length` bytes are passed over: they get no
    /// scopes and leave the rule stack untouched.
    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }

    /// Tokenize `text`, reporting every scope as `(name, range)`.
    ///
    /// Regions report when they close, so an enclosing region is reported
    /// after the scopes inside it. Regions still open at the end of the text
    /// are closed there.
    pub fn parse(&self, text: &str, mut callback: impl FnMut(&str, Range<usize>)) {
        self.tokenize(text, &mut |scope, _level| callback(&scope.identifier, scope.range));
    }

    /// Tokenize `text` into a fresh scope store.
    pub fn parse_to_scoped_string(&self, text: &str) -> ScopedString {
        let mut scoped = ScopedString::new(text);
        self.tokenize(text, &mut |scope, level| scoped.add(scope, level));
        scoped
    }

    fn tokenize(&self, text: &str, emit: &mut dyn FnMut(Scope, usize)) {
        let mut stack = RuleStack::new();
        for line in line_ranges(text, 0) {
            self.tokenize_line(text, line, &mut stack, emit);
        }
        close_all(&mut stack, text.len(), emit);
    }

    /// Tokenize the line `text[line]`, updating `stack` and reporting scopes
    /// with the level they belong on.
    pub(crate) fn tokenize_line(
        &self,
        text: &str,
        line: Range<usize>,
        stack: &mut RuleStack,
        emit: &mut dyn FnMut(Scope, usize),
    ) {
        if line.len() > self.max_line_length {
            tracing::trace!("Skipping line at {} ({} bytes)", line.start, line.len());
            return;
        }
        let offset = line.start;
        let content = &text[line];
        let mut cache: HashMap<PatternId, Option<MatchResult>> = HashMap::new();
        let mut pos = 0;

        while pos <= content.len() {
            let Some(event) = self.next_event(content, offset, pos, stack, &mut cache) else {
                break;
            };
            match event {
                Event::Candidate(id, found) => {
                    let pattern = self.grammar.pattern(id);
                    let level = stack.content_level();
                    match &pattern.kind {
                        PatternKind::Match { captures, .. } => {
                            if let Some(name) = &pattern.name {
                                let range = shifted(found.range(), offset);
                                emit(Scope::new(name.clone(), range), level);
                            }
                            let inner = level + usize::from(pattern.name.is_some());
                            emit_captures(captures, &found, offset, inner, emit);
                            pos = advance(content, &found, pos);
                        }
                        PatternKind::BeginEnd { end, begin_captures, .. } => {
                            let start = offset + found.start();
                            tracing::trace!("Open {:?} at {}", pattern.name, start);
                            let frame = Frame {
                                rule: id,
                                name: pattern.name.clone(),
                                end: end.expand(content, &found),
                                start,
                                level,
                            };
                            let inner = frame.content_level();
                            emit_captures(begin_captures, &found, offset, inner, emit);
                            stack.frames.push(frame);
                            pos = found.end();
                        }
                        PatternKind::Container | PatternKind::Include(_) | PatternKind::Inert => {
                            break
                        }
                    }
                }
                Event::End(found) => {
                    let Some(frame) = stack.frames.pop() else {
                        break;
                    };
                    let rule = &self.grammar.pattern(frame.rule).kind;
                    if let PatternKind::BeginEnd { end_captures, .. } = rule {
                        emit_captures(end_captures, &found, offset, frame.content_level(), emit);
                    }
                    let end = offset + found.end();
                    tracing::trace!("Close {:?} at {}", frame.name, end);
                    if let Some(name) = frame.name {
                        emit(Scope::new(name, frame.start..end), frame.level);
                    }
                    pos = if frame.start == end {
                        advance(content, &found, pos)
                    } else {
                        found.end()
                    };
                }
            }
        }
    }

    /// Earliest match at or after `pos` among the end pattern of the
    /// innermost region and the candidates inside it.
    fn next_event(
        &self,
        content: &str,
        offset: usize,
        pos: usize,
        stack: &RuleStack,
        cache: &mut HashMap<PatternId, Option<MatchResult>>,
    ) -> Option<Event> {
        let container = stack.top().map_or(self.grammar.root(), |frame| frame.rule);
        let mut best: Option<(PatternId, MatchResult)> = None;

        for &id in self.grammar.candidates(container) {
            let pattern = self.grammar.pattern(id);
            let Some(regex) = pattern.opening_regex() else {
                continue;
            };
            let cached = cache
                .get(&id)
                .filter(|hit| hit.as_ref().map_or(true, |m| m.start() >= pos));
            let found = match cached {
                Some(hit) => hit.clone(),
                None => {
                    let hit = regex.find_at(content, pos);
                    cache.insert(id, hit.clone());
                    hit
                }
            };
            let Some(found) = found else {
                continue;
            };
            // A zero-width begin at the start of an identical open region
            // would reopen it forever.
            if found.is_empty()
                && matches!(pattern.kind, PatternKind::BeginEnd { .. })
                && stack
                    .frames
                    .iter()
                    .any(|f| f.rule == id && f.start == offset + found.start())
            {
                continue;
            }
            if best.as_ref().map_or(true, |(_, b)| found.start() < b.start()) {
                best = Some((id, found));
            }
        }

        let end = stack.top().and_then(|frame| {
            let found = frame.end.find_at(content, pos)?;
            let end_last = matches!(
                self.grammar.pattern(frame.rule).kind,
                PatternKind::BeginEnd {
                    apply_end_pattern_last: true,
                    ..
                }
            );
            Some((found, end_last))
        });

        match (best, end) {
            (None, None) => None,
            (Some((id, found)), None) => Some(Event::Candidate(id, found)),
            (None, Some((found, _))) => Some(Event::End(found)),
            (Some((id, candidate)), Some((found, end_last))) => {
                let end_wins = found.start() < candidate.start()
                    || (found.start() == candidate.start() && !end_last);
                if end_wins {
                    Some(Event::End(found))
                } else {
                    Some(Event::Candidate(id, candidate))
                }
            }
        }
    }
}

/// Close every open region at `end`, innermost first.
pub(crate) fn close_all(stack: &mut RuleStack, end: usize, emit: &mut dyn FnMut(Scope, usize)) {
    while let Some(frame) = stack.frames.pop() {
        if let Some(name) = frame.name {
            emit(Scope::new(name, frame.start..end), frame.level);
        }
    }
}

/// Byte ranges of the lines of `text` starting at `from`, each including its
/// trailing newline.
pub(crate) fn line_ranges(text: &str, from: usize) -> impl Iterator<Item = Range<usize>> + '_ {
    let mut start = from;
    text[from..].split_inclusive('\n').map(move |line| {
        let range = start..start + line.len();
        start = range.end;
        range
    })
}

fn shifted(range: Range<usize>, offset: usize) -> Range<usize> {
    range.start + offset..range.end + offset
}

/// Position after `found`, stepping one character past an empty match.
fn advance(content: &str, found: &MatchResult, pos: usize) -> usize {
    if !found.is_empty() {
        return found.end();
    }
    let at = found.end().max(pos);
    content[at..]
        .chars()
        .next()
        .map_or(content.len() + 1, |c| at + c.len_utf8())
}

/// Report the named capture groups of `found`, nesting each inside the
/// enclosing capture that contains it.
///
/// Groups are clipped to the whole match; groups that partially overlap an
/// earlier group are dropped.
fn emit_captures(
    captures: &CaptureCollection,
    found: &MatchResult,
    offset: usize,
    level: usize,
    emit: &mut dyn FnMut(Scope, usize),
) {
    if captures.is_empty() {
        return;
    }
    let whole = found.range();
    let mut spans: Vec<(Range<usize>, &Arc<str>)> = captures
        .iter()
        .filter_map(|(index, name)| {
            let group = found.group(index)?;
            let clipped = group.start.max(whole.start)..group.end.min(whole.end);
            (!clipped.is_empty()).then_some((clipped, name))
        })
        .collect();
    spans.sort_by(|a, b| a.0.start.cmp(&b.0.start).then(b.0.end.cmp(&a.0.end)));

    let mut open: Vec<Range<usize>> = Vec::new();
    'spans: for (range, name) in spans {
        while let Some(top) = open.last() {
            if contains_range(top, &range) {
                break;
            }
            if top.end <= range.start {
                open.pop();
            } else {
                continue 'spans;
            }
        }
        emit(Scope::new(name.clone(), shifted(range.clone(), offset)), level + open.len());
        open.push(range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser(patterns: serde_json::Value, repository: serde_json::Value) -> Parser {
        let grammar = Grammar::from_json(
            &json!({
                "uuid": "0A2A5B6C-1D2E-4F30-8A1B-2C3D4E5F6071",
                "name": "Test",
                "scopeName": "source.test",
                "patterns": patterns,
                "repository": repository,
            })
            .to_string(),
        )
        .unwrap();
        Parser::new(Arc::new(grammar))
    }

    fn scopes(parser: &Parser, text: &str) -> Vec<(String, Range<usize>)> {
        let mut out = Vec::new();
        parser.parse(text, |name, range| out.push((name.to_string(), range)));
        out.sort_by(|a, b| a.1.start.cmp(&b.1.start).then(b.1.end.cmp(&a.1.end)));
        out
    }

    fn scope(name: &str, range: Range<usize>) -> (String, Range<usize>) {
        (name.to_string(), range)
    }

    #[test]
    fn test_single_match_rule() {
        let parser = parser(json!([{ "name": "constant.numeric", "match": "\\d+" }]), json!({}));
        assert_eq!(scopes(&parser, "ab 42 cd"), vec![scope("constant.numeric", 3..5)]);
    }

    #[test]
    fn test_earliest_match_then_declaration_order() {
        let parser = parser(
            json!([
                { "name": "keyword", "match": "\\bif\\b" },
                { "name": "identifier", "match": "\\b\\w+\\b" }
            ]),
            json!({}),
        );
        assert_eq!(
            scopes(&parser, "x if y"),
            vec![
                scope("identifier", 0..1),
                scope("keyword", 2..4),
                scope("identifier", 5..6)
            ]
        );
    }

    #[test]
    fn test_back_referenced_end() {
        let parser = parser(
            json!([{
                "name": "comment.block",
                "begin": "--\\[(=*)\\[",
                "end": "\\]\\1\\]"
            }]),
            json!({}),
        );
        assert_eq!(
            scopes(&parser, "x --[==[ inner ]==] y"),
            vec![scope("comment.block", 2..19)]
        );
        // `]=]` does not close a `[==[` comment, so it runs to the end.
        assert_eq!(
            scopes(&parser, "x --[==[ inner ]=] y"),
            vec![scope("comment.block", 2..20)]
        );
    }

    #[test]
    fn test_region_spans_lines_with_captures() {
        let parser = parser(
            json!([{
                "name": "comment.block.lua",
                "begin": "--\\[(=*)\\[",
                "end": "\\]\\1\\]",
                "captures": { "0": { "name": "punctuation.definition.comment.lua" } }
            }]),
            json!({}),
        );
        let text = "\"Emmmm...\" --[=[ This is \na multi-line comment. ]=]";
        assert_eq!(
            scopes(&parser, text),
            vec![
                scope("comment.block.lua", 11..51),
                scope("punctuation.definition.comment.lua", 11..16),
                scope("punctuation.definition.comment.lua", 48..51)
            ]
        );

        let scoped = parser.parse_to_scoped_string(text);
        assert_eq!(scoped.scope_stack(12).len(), 3);
        assert_eq!(&*scoped.topmost_scope(30).identifier, "comment.block.lua");
        scoped.check_invariants().unwrap();
    }

    #[test]
    fn test_nested_regions_and_subpatterns() {
        let parser = parser(
            json!([{ "include": "#string" }]),
            json!({
                "string": {
                    "name": "string.quoted",
                    "begin": "\"",
                    "end": "\"",
                    "patterns": [
                        { "name": "constant.character.escape", "match": "\\\\." },
                        {
                            "name": "meta.interpolation",
                            "begin": "\\{",
                            "end": "\\}",
                            "patterns": [{ "include": "#string" }]
                        }
                    ]
                }
            }),
        );
        let text = r#"a "x\n{"y"}" b"#;
        let scoped = parser.parse_to_scoped_string(text);
        scoped.check_invariants().unwrap();
        let stack: Vec<_> = scoped
            .scope_stack(8)
            .iter()
            .map(|s| s.identifier.to_string())
            .collect();
        assert_eq!(
            stack,
            vec!["GLOBAL", "string.quoted", "meta.interpolation", "string.quoted"]
        );
        assert_eq!(&*scoped.topmost_scope(4).identifier, "constant.character.escape");
    }

    #[test]
    fn test_nested_captures() {
        let parser = parser(
            json!([{
                "name": "meta.assignment",
                "match": "((\\w+)\\s*)=",
                "captures": {
                    "1": { "name": "meta.lhs" },
                    "2": { "name": "variable" }
                }
            }]),
            json!({}),
        );
        let scoped = parser.parse_to_scoped_string("abc = 1");
        let stack: Vec<_> = scoped
            .scope_stack(1)
            .iter()
            .map(|s| s.identifier.to_string())
            .collect();
        assert_eq!(stack, vec!["GLOBAL", "meta.assignment", "meta.lhs", "variable"]);
    }

    #[test]
    fn test_apply_end_pattern_last() {
        let grammar = |end_last: bool| {
            parser(
                json!([{
                    "name": "meta.block",
                    "begin": "<",
                    "end": "(?=>)|>",
                    "applyEndPatternLast": end_last,
                    "patterns": [{ "name": "punctuation", "match": ">>" }]
                }]),
                json!({}),
            )
        };
        // The end pattern wins the tie at offset 2 by default.
        assert_eq!(scopes(&grammar(false), "<a>>"), vec![scope("meta.block", 0..2)]);
        assert_eq!(
            scopes(&grammar(true), "<a>>"),
            vec![scope("meta.block", 0..4), scope("punctuation", 2..4)]
        );
    }

    #[test]
    fn test_zero_width_rules_terminate() {
        let parser = parser(
            json!([
                { "name": "empty", "match": "(?=x)" },
                { "name": "region", "begin": "(?=y)", "end": "(?=y)" },
                { "name": "anchor", "begin": "^", "end": "$" }
            ]),
            json!({}),
        );
        let scoped = parser.parse_to_scoped_string("xyxy\nyy\n");
        scoped.check_invariants().unwrap();
    }

    #[test]
    fn test_self_recursive_grammar() {
        let parser = parser(
            json!([
                {
                    "name": "meta.paren",
                    "begin": "\\(",
                    "end": "\\)",
                    "patterns": [{ "include": "$self" }]
                },
                { "name": "constant.numeric", "match": "\\d+" }
            ]),
            json!({}),
        );
        let scoped = parser.parse_to_scoped_string("((1) (2 (3)))");
        scoped.check_invariants().unwrap();
        let depth = scoped.scope_stack(9).len();
        assert_eq!(depth, 1 + 3 + 1);
    }

    #[test]
    fn test_long_lines_are_skipped() {
        let parser = parser(json!([{ "name": "constant.numeric", "match": "\\d+" }]), json!({}))
            .with_max_line_length(4);
        assert_eq!(
            scopes(&parser, "1 2 3 4\n5\n"),
            vec![scope("constant.numeric", 8..9)]
        );
    }

    #[test]
    fn test_unicode_offsets_are_bytes() {
        let parser = parser(json!([{ "name": "constant.numeric", "match": "\\d+" }]), json!({}));
        assert_eq!(scopes(&parser, "é 12"), vec![scope("constant.numeric", 3..5)]);
    }

    #[test]
    fn test_rule_stack_carries_open_regions() {
        let parser = parser(
            json!([{ "name": "comment.block", "begin": "/\\*", "end": "\\*/" }]),
            json!({}),
        );
        let text = "a /* b\nc */ d\n";
        let mut stack = RuleStack::new();
        let mut emitted = Vec::new();
        let mut lines = line_ranges(text, 0);

        let first = lines.next().unwrap();
        parser.tokenize_line(text, first, &mut stack, &mut |scope: Scope, _level: usize| {
            emitted.push(scope)
        });
        assert_eq!(stack.depth(), 1);
        let frame = &stack.frames()[0];
        assert_eq!(frame.start(), 2);
        assert_eq!(
            parser.grammar().pattern(frame.rule()).name.as_deref(),
            Some("comment.block")
        );
        assert!(emitted.is_empty());

        let second = lines.next().unwrap();
        parser.tokenize_line(text, second, &mut stack, &mut |scope: Scope, _level: usize| {
            emitted.push(scope)
        });
        assert!(stack.is_empty());
        assert_eq!(emitted, vec![Scope::new("comment.block", 2..11)]);
    }

    #[test]
    fn test_line_ranges() {
        let ranges: Vec<_> = line_ranges("ab\ncd\n\ne", 0).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..7, 7..8]);
        let ranges: Vec<_> = line_ranges("ab\ncd", 3).collect();
        assert_eq!(ranges, vec![3..5]);
    }
}
