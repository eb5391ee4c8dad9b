//! Regular expressions as grammars declare them.
//!
//! Wraps `fancy_regex` (back-references and look-around, which TextMate
//! grammars rely on) and adds the one feature no regex engine has on its own:
//! an end pattern whose `\N` placeholders refer to capture group `N` of the
//! *begin* match that opened the region. Such an expression is a template: it
//! is not compiled up front, and [`RegularExpression::expand`] turns it into a
//! concrete expression once the begin match is known.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use fancy_regex::Regex;

/// Characters escaped when captured text is spliced into a pattern.
const REGEX_METACHARACTERS: &str = "\\|([{}]).?*+^$";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegexOptions {
    pub case_insensitive: bool,
    pub allow_comments_and_whitespace: bool,
    /// Treat the whole pattern as literal text.
    pub ignore_metacharacters: bool,
    pub dot_matches_line_separators: bool,
    /// `^` and `$` match at line boundaries instead of only at the ends.
    pub anchors_match_lines: bool,
}

impl RegexOptions {
    /// Options every grammar-declared expression is compiled with.
    pub const GRAMMAR: RegexOptions = RegexOptions {
        case_insensitive: false,
        allow_comments_and_whitespace: false,
        ignore_metacharacters: false,
        dot_matches_line_separators: false,
        anchors_match_lines: true,
    };

    fn source(&self, pattern: &str) -> String {
        let mut flags = String::new();
        if self.case_insensitive {
            flags.push('i');
        }
        if self.anchors_match_lines {
            flags.push('m');
        }
        if self.dot_matches_line_separators {
            flags.push('s');
        }
        if self.allow_comments_and_whitespace && !self.ignore_metacharacters {
            flags.push('x');
        }

        let body = if self.ignore_metacharacters {
            escape_regex_literal(pattern)
        } else {
            pattern.to_string()
        };
        if flags.is_empty() {
            body
        } else {
            format!("(?{flags}){body}")
        }
    }
}

/// Regex error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegexError {
    Compile { pattern: String, message: String },
}

impl fmt::Display for RegexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegexError::Compile { pattern, message } => {
                write!(f, "Failed to compile {pattern:?}: {message}")
            }
        }
    }
}

impl std::error::Error for RegexError {}

/// Capture-group ranges of one match, as byte offsets into the searched text.
///
/// Group 0 is the whole match and is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    groups: Vec<Option<Range<usize>>>,
}

impl MatchResult {
    /// Build a result from explicit group ranges; `groups[0]` must be present.
    pub fn from_groups(groups: Vec<Option<Range<usize>>>) -> Option<Self> {
        groups.first()?.as_ref()?;
        Some(Self { groups })
    }

    pub fn range(&self) -> Range<usize> {
        self.groups[0].clone().unwrap_or_default()
    }

    pub fn start(&self) -> usize {
        self.range().start
    }

    pub fn end(&self) -> usize {
        self.range().end
    }

    pub fn is_empty(&self) -> bool {
        self.range().is_empty()
    }

    /// Range of group `index`, or `None` if the group did not participate.
    pub fn group(&self, index: usize) -> Option<Range<usize>> {
        self.groups.get(index).cloned().flatten()
    }

    /// Number of groups, group 0 included.
    pub fn len(&self) -> usize {
        self.groups.len()
    }
}

/// A grammar regular expression, possibly a back-reference template.
#[derive(Clone)]
pub struct RegularExpression {
    pattern: Arc<str>,
    options: RegexOptions,
    is_template: bool,
    compiled: Option<Arc<Regex>>,
}

impl fmt::Debug for RegularExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegularExpression")
            .field("pattern", &self.pattern)
            .field("is_template", &self.is_template)
            .finish()
    }
}

impl PartialEq for RegularExpression {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
            && self.options == other.options
            && self.is_template == other.is_template
    }
}

impl Eq for RegularExpression {}

fn compile(pattern: &str, options: RegexOptions) -> Result<Regex, RegexError> {
    Regex::new(&options.source(pattern)).map_err(|e| RegexError::Compile {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

impl RegularExpression {
    /// Compile `pattern`, or keep it as an uncompiled template when it
    /// contains a `\N` placeholder.
    pub fn new(pattern: &str, options: RegexOptions) -> Result<Self, RegexError> {
        if has_back_reference_placeholder(pattern) {
            return Ok(Self {
                pattern: pattern.into(),
                options,
                is_template: true,
                compiled: None,
            });
        }
        let regex = compile(pattern, options)?;
        Ok(Self {
            pattern: pattern.into(),
            options,
            is_template: false,
            compiled: Some(Arc::new(regex)),
        })
    }

    /// Compile a template as an ordinary expression, reading its `\N`
    /// placeholders as back-references to its own groups.
    ///
    /// Used for `match` and `begin` expressions, which have no earlier match
    /// to draw on.
    pub fn into_standalone(self) -> Result<Self, RegexError> {
        if !self.is_template {
            return Ok(self);
        }
        let regex = compile(&self.pattern, self.options)?;
        Ok(Self {
            is_template: false,
            compiled: Some(Arc::new(regex)),
            ..self
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn options(&self) -> RegexOptions {
        self.options
    }

    pub fn is_template(&self) -> bool {
        self.is_template
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// First match starting at or after byte `pos` of `haystack`.
    ///
    /// Templates never match. Look-behind may inspect text before `pos`.
    pub fn find_at(&self, haystack: &str, pos: usize) -> Option<MatchResult> {
        let regex = self.compiled.as_ref()?;
        match regex.captures_from_pos(haystack, pos) {
            Ok(Some(captures)) => {
                let groups = (0..captures.len())
                    .map(|i| captures.get(i).map(|m| m.start()..m.end()))
                    .collect();
                MatchResult::from_groups(groups)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("Regex {:?} gave up at {}: {}", self.pattern, pos, e);
                None
            }
        }
    }

    /// Substitute the captures of `result` (a match over `content`) into the
    /// template's placeholders and compile the outcome.
    ///
    /// A group that did not participate expands to nothing. If the expanded
    /// pattern does not compile the template itself is returned, which never
    /// matches. Non-templates are returned unchanged.
    pub fn expand(&self, content: &str, result: &MatchResult) -> RegularExpression {
        if !self.is_template {
            return self.clone();
        }
        let concrete = substitute_back_references(&self.pattern, content, result);
        match compile(&concrete, self.options) {
            Ok(regex) => RegularExpression {
                pattern: concrete.into(),
                options: self.options,
                is_template: false,
                compiled: Some(Arc::new(regex)),
            },
            Err(e) => {
                tracing::warn!("Expanded end pattern is not a valid regex: {}", e);
                self.clone()
            }
        }
    }
}

/// Whether `pattern` contains an unescaped backslash followed by a digit.
pub fn has_back_reference_placeholder(pattern: &str) -> bool {
    let mut escaped = false;
    for c in pattern.chars() {
        if escaped && c.is_ascii_digit() {
            return true;
        }
        escaped = !escaped && c == '\\';
    }
    false
}

/// Escape every regex metacharacter in `text` so it matches literally.
pub fn escape_regex_literal(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if REGEX_METACHARACTERS.contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Rewrite `\N` references in dollar notation (`$N`).
///
/// The two notations are swapped symmetrically, so a `$N` already present
/// becomes `\N`; this makes the conversion its own inverse on any input.
pub fn to_dollar_notation(pattern: &str) -> String {
    swap_reference_notation(pattern)
}

/// Rewrite `$N` references in backslash notation (`\N`). Inverse of
/// [`to_dollar_notation`].
pub fn to_backslash_notation(pattern: &str) -> String {
    swap_reference_notation(pattern)
}

fn swap_reference_notation(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(d) if d.is_ascii_digit() => {
                    out.push('$');
                    out.push(d);
                }
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            '$' => match chars.peek() {
                Some(&d) if d.is_ascii_digit() => {
                    chars.next();
                    out.push('\\');
                    out.push(d);
                }
                _ => out.push('$'),
            },
            _ => out.push(c),
        }
    }
    out
}

/// Replace each `\N` (N in 1..=9) of `template` with the escaped text of
/// group N of `result`. Other escapes, `\0` included, are kept verbatim.
fn substitute_back_references(template: &str, content: &str, result: &MatchResult) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(d @ '1'..='9') => {
                let index = (d as u8 - b'0') as usize;
                if let Some(text) = result.group(index).and_then(|range| content.get(range)) {
                    out.push_str(&escape_regex_literal(text));
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
