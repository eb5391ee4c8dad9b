/// Scope store for parsed text
///
/// A `ScopedString` owns a copy of the text together with the scopes the
/// parser assigned to it, organised in levels: level 0 holds the outermost
/// scopes, level `n + 1` the scopes nested inside level `n`. Within one level
/// scopes are sorted by start offset and never overlap, so point queries are
/// a binary search per level (O(depth * log n)).
///
/// **Implementation Note:**
/// Edits adjust every scope that ends after the edit point (O(k) for the k
/// scopes in the tail of the document). That is fine for documents with a
/// few thousand scopes per level; a lazily shifted interval tree would be the
/// next step for very large buffers.
use std::ops::Range;

use crate::model::scope::{
    contains_range, insert_indexes, remove_indexes, Scope, ScopeSpan, GLOBAL_SCOPE,
};

// ---
// 1. Level helpers
// ---

/// Scope in `level` covering `index`, if any.
fn find_in_level(level: &[Scope], index: usize) -> Option<&Scope> {
    let after = level.partition_point(|scope| scope.range.start <= index);
    let candidate = level.get(after.checked_sub(1)?)?;
    (candidate.range.end > index).then_some(candidate)
}

/// Position of the first scope in `level` that ends after `offset`.
fn first_ending_after(level: &[Scope], offset: usize) -> usize {
    level.partition_point(|scope| scope.range.end <= offset)
}

fn intersects_level(level: &[Scope], range: &Range<usize>) -> bool {
    level
        .get(first_ending_after(level, range.start))
        .is_some_and(|scope| scope.range.start < range.end)
}

// ---
// 2. The store
// ---

#[derive(Debug, Clone)]
pub struct ScopedString {
    text: String,
    levels: Vec<Vec<Scope>>,
    base_scope: Scope,
}

impl ScopedString {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let base_scope = Scope::new(GLOBAL_SCOPE, 0..text.len());
        Self {
            text,
            levels: Vec::new(),
            base_scope,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// The implicit scope spanning the whole text.
    pub fn base_scope(&self) -> &Scope {
        &self.base_scope
    }

    /// Number of scopes, the global scope included.
    pub fn number_of_scopes(&self) -> usize {
        1 + self.levels.iter().map(Vec::len).sum::<usize>()
    }

    /// Number of levels, the global level included.
    pub fn number_of_levels(&self) -> usize {
        self.levels.len() + 1
    }

    /// All scopes (global scope excluded) with their level, level by level.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Scope)> + '_ {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, scopes)| scopes.iter().map(move |scope| (level, scope)))
    }

    /// Apply `f` to every scope; ranges must not be changed.
    pub fn for_each_scope_mut(&mut self, mut f: impl FnMut(&mut Scope)) {
        for scope in self.levels.iter_mut().flatten() {
            f(scope);
        }
    }

    /// Push `scope` as the innermost scope at its position: it lands on the
    /// lowest level where it does not collide with an existing scope.
    pub fn add_at_top(&mut self, scope: Scope) {
        self.add(scope, 0);
    }

    /// Add `scope` at `level`, moving it further in if that level is taken at
    /// its range. Empty scopes are ignored.
    pub fn add(&mut self, scope: Scope, level: usize) {
        if scope.range.is_empty() {
            return;
        }
        debug_assert!(
            scope.range.end <= self.text.len(),
            "scope {:?} exceeds text length {}",
            scope.range,
            self.text.len()
        );

        let mut level = level;
        while level < self.levels.len() && intersects_level(&self.levels[level], &scope.range) {
            level += 1;
        }
        if level >= self.levels.len() {
            self.levels.resize_with(level + 1, Vec::new);
        }

        let scopes = &mut self.levels[level];
        let at = scopes.partition_point(|s| s.range.start < scope.range.start);
        scopes.insert(at, scope);
    }

    /// Innermost scope covering `index`, or the global scope.
    pub fn topmost_scope(&self, index: usize) -> &Scope {
        self.levels
            .iter()
            .rev()
            .find_map(|level| find_in_level(level, index))
            .unwrap_or(&self.base_scope)
    }

    /// The scope directly enclosing `scope` at `index`, or the global scope.
    pub fn lower_scope(&self, scope: &Scope, index: usize) -> &Scope {
        let mut found = false;
        for level in self.levels.iter().rev() {
            if let Some(candidate) = find_in_level(level, index) {
                if found {
                    return candidate;
                }
                found = candidate == scope;
            }
        }
        &self.base_scope
    }

    /// Level holding `scope`, or `None` if it is not stored.
    pub fn level_of(&self, scope: &Scope) -> Option<usize> {
        self.levels.iter().position(|level| {
            find_in_level(level, scope.range.start).is_some_and(|candidate| candidate == scope)
        })
    }

    /// Scopes covering `index`, outermost first, starting with the global scope.
    pub fn scope_stack(&self, index: usize) -> Vec<&Scope> {
        std::iter::once(&self.base_scope)
            .chain(self.levels.iter().filter_map(|level| find_in_level(level, index)))
            .collect()
    }

    /// Every scope intersecting `range`, ordered by start offset and, for
    /// scopes starting at the same offset, outermost first.
    pub fn scopes_in(&self, range: Range<usize>) -> Vec<ScopeSpan> {
        let mut found: Vec<(usize, &Scope)> = Vec::new();
        for (depth, level) in self.levels.iter().enumerate() {
            let from = first_ending_after(level, range.start);
            found.extend(
                level[from..]
                    .iter()
                    .take_while(|scope| scope.range.start < range.end)
                    .map(|scope| (depth, scope)),
            );
        }
        found.sort_by_key(|(depth, scope)| (scope.range.start, *depth));

        std::iter::once(&self.base_scope)
            .chain(found.into_iter().map(|(_, scope)| scope))
            .map(|scope| ScopeSpan {
                scope_name: scope.identifier.clone(),
                range: scope.range.clone(),
            })
            .collect()
    }

    // ---
    // 3. Edits
    // ---

    /// Insert `text` at `index`, shifting or growing the scopes after it.
    ///
    /// `index` must be a character boundary within the text.
    pub fn insert(&mut self, text: &str, index: usize) {
        debug_assert!(
            index <= self.text.len() && self.text.is_char_boundary(index),
            "insertion point {} is not a character boundary",
            index
        );
        self.text.insert_str(index, text);

        let length = text.len();
        for level in &mut self.levels {
            let from = first_ending_after(level, index);
            for scope in &mut level[from..] {
                scope.range = insert_indexes(&scope.range, index, length);
            }
        }
        self.base_scope.range = 0..self.text.len();
    }

    /// Delete the bytes in `range`, clipping straddling scopes and dropping
    /// those that vanish.
    pub fn delete_characters(&mut self, range: Range<usize>) {
        debug_assert!(
            range.start <= range.end
                && range.end <= self.text.len()
                && self.text.is_char_boundary(range.start)
                && self.text.is_char_boundary(range.end),
            "deletion range {:?} does not fit the text",
            range
        );
        self.text.replace_range(range.clone(), "");

        for level in &mut self.levels {
            let from = first_ending_after(level, range.start);
            let mut tail = level.split_off(from);
            tail.retain_mut(|scope| {
                scope.range = remove_indexes(&scope.range, &range);
                !scope.range.is_empty()
            });
            level.append(&mut tail);
        }
        self.trim_levels();
        self.base_scope.range = 0..self.text.len();
    }

    /// Drop every scope lying entirely within `range`, without shifting
    /// anything. Returns the dropped scopes.
    pub fn remove_scopes(&mut self, range: Range<usize>) -> Vec<Scope> {
        let mut removed = Vec::new();
        for level in &mut self.levels {
            let mut index = first_ending_after(level, range.start);
            while index < level.len() && level[index].range.start < range.end {
                if contains_range(&range, &level[index].range) {
                    removed.push(level.remove(index));
                } else {
                    index += 1;
                }
            }
        }
        self.trim_levels();
        removed
    }

    /// Remove the scope starting at `start` on `level`, if there is one.
    pub(crate) fn remove_scope_starting_at(&mut self, level: usize, start: usize) -> Option<Scope> {
        let scopes = self.levels.get_mut(level)?;
        let at = scopes
            .binary_search_by_key(&start, |scope| scope.range.start)
            .ok()?;
        let scope = scopes.remove(at);
        self.trim_levels();
        Some(scope)
    }

    fn trim_levels(&mut self) {
        while self.levels.last().is_some_and(Vec::is_empty) {
            self.levels.pop();
        }
    }

    /// Check the nesting invariants (for testing)
    ///
    /// Scopes on one level are sorted and disjoint, every scope lies within
    /// the text, and every scope above level 0 sits inside a scope of the
    /// level below.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.base_scope.range != (0..self.text.len()) {
            return Err(format!(
                "global scope {:?} does not span the text (len {})",
                self.base_scope.range,
                self.text.len()
            ));
        }
        for (depth, level) in self.levels.iter().enumerate() {
            for pair in level.windows(2) {
                if pair[0].range.end > pair[1].range.start {
                    return Err(format!(
                        "level {}: {:?} overlaps {:?}",
                        depth, pair[0], pair[1]
                    ));
                }
            }
            for scope in level {
                if scope.range.is_empty() || scope.range.end > self.text.len() {
                    return Err(format!("level {}: bad range for {:?}", depth, scope));
                }
                if depth > 0 {
                    let parent = find_in_level(&self.levels[depth - 1], scope.range.start);
                    if !parent.is_some_and(|p| contains_range(&p.range, &scope.range)) {
                        return Err(format!("level {}: {:?} has no enclosing parent", depth, scope));
                    }
                }
            }
        }
        Ok(())
    }
}
