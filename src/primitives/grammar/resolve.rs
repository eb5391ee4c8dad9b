//! Include resolution.
//!
//! An include is resolved by overwriting its slot with a copy of the target
//! pattern's fields. Subpattern edges are indices, so copying a pattern that
//! (transitively) contains the include itself just produces an index cycle.

use std::collections::HashSet;

use super::types::{PatternGraph, PatternId, PatternKind, Reference};

impl PatternGraph {
    /// Resolve `#name` and `$self` includes among `declared`.
    ///
    /// Includes whose chain ends in a foreign reference are left for
    /// [`resolve_external`](Self::resolve_external).
    pub(crate) fn resolve_internal(&mut self, declared: &[PatternId]) {
        for &id in declared {
            let mut visiting = HashSet::new();
            self.resolve_one(id, None, &mut visiting);
        }
    }

    /// Resolve every remaining include against the grammars in the graph,
    /// binding `$base` to the grammar in slot `base`.
    pub(crate) fn resolve_external(&mut self, base: usize) {
        let pending: Vec<PatternId> = self.includes.clone();
        for id in pending {
            let mut visiting = HashSet::new();
            self.resolve_one(id, Some(base), &mut visiting);
        }
    }

    /// Turn every include still unresolved into an inert pattern.
    pub(crate) fn finish(&mut self) {
        let mut unresolved = 0;
        for index in 0..self.includes.len() {
            let id = self.includes[index];
            if let PatternKind::Include(include) = &self.patterns[id.0].kind {
                tracing::warn!(
                    "Unresolved include {:?} in grammar {}",
                    include.reference,
                    self.grammars[include.grammar].scope_name
                );
                self.patterns[id.0].kind = PatternKind::Inert;
                unresolved += 1;
            }
        }
        if unresolved > 0 {
            tracing::debug!("{} includes left inert", unresolved);
        }
    }

    /// Resolve `id` if it is an include, returning whether it now holds a
    /// concrete pattern. `base` is `None` during the internal phase.
    fn resolve_one(
        &mut self,
        id: PatternId,
        base: Option<usize>,
        visiting: &mut HashSet<PatternId>,
    ) -> bool {
        let include = match &self.patterns[id.0].kind {
            PatternKind::Include(include) => include.clone(),
            _ => return true,
        };
        // A chain of includes that leads back to itself has no concrete target.
        if !visiting.insert(id) {
            return false;
        }

        let target = match &include.reference {
            Reference::Repository(key) => self.lookup(include.repository, key),
            Reference::SelfGrammar => Some(self.grammars[include.grammar].root),
            Reference::Base => base.map(|slot| self.grammars[slot].root),
            Reference::Foreign(language) => base
                .and(self.grammar_slot(language))
                .map(|slot| self.grammars[slot].root),
            Reference::ForeignRepository { language, key } => base
                .and(self.grammar_slot(language))
                .and_then(|slot| {
                    let repository = self.grammars[slot].repository;
                    self.repositories[repository.0].entries.get(key).copied()
                }),
        };

        let resolved = match target {
            Some(target) if target != id && self.resolve_one(target, base, visiting) => {
                let copy = self.patterns[target.0].clone();
                self.patterns[id.0] = copy;
                true
            }
            Some(_) => false,
            None => {
                if base.is_some() || include.reference.is_internal() {
                    tracing::debug!("No target for include {:?}", include.reference);
                }
                false
            }
        };
        visiting.remove(&id);
        resolved
    }
}
