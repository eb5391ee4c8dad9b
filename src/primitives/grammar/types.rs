//! Pure grammar types: decoded grammar documents and the compiled pattern graph.
//!
//! Patterns live in an arena (`PatternGraph`) and refer to each other by
//! [`PatternId`]. Includes are resolved by copying the target's fields into the
//! include's slot (see `resolve.rs`), so cycles through `$self` or mutually
//! referencing repositories are plain index cycles.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::primitives::regex::{RegexOptions, RegularExpression};

/// Grammar error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarError {
    /// A required top-level key is absent or has the wrong type.
    MissingKey(&'static str),
    InvalidUuid(String),
    /// The document is not a grammar at all.
    Malformed(String),
}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarError::MissingKey(key) => write!(f, "Missing grammar key: {key}"),
            GrammarError::InvalidUuid(uuid) => write!(f, "Invalid grammar uuid: {uuid}"),
            GrammarError::Malformed(msg) => write!(f, "Malformed grammar: {msg}"),
        }
    }
}

impl std::error::Error for GrammarError {}

// ---
// Decoded documents
// ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrammarFile {
    uuid: Option<String>,
    name: Option<String>,
    scope_name: Option<String>,
    #[serde(default)]
    file_types: Vec<String>,
    patterns: Option<Vec<Value>>,
    #[serde(default)]
    repository: Map<String, Value>,
}

/// A grammar document with its required keys checked, not yet compiled.
#[derive(Debug, Clone)]
pub struct GrammarDefinition {
    pub uuid: Uuid,
    pub name: String,
    pub scope_name: String,
    pub file_types: Vec<String>,
    pub(crate) patterns: Vec<Value>,
    pub(crate) repository: Map<String, Value>,
}

impl GrammarDefinition {
    pub fn from_value(value: Value) -> Result<Self, GrammarError> {
        let file: GrammarFile =
            serde_json::from_value(value).map_err(|e| GrammarError::Malformed(e.to_string()))?;

        let uuid = file.uuid.ok_or(GrammarError::MissingKey("uuid"))?;
        let uuid = Uuid::parse_str(&uuid).map_err(|_| GrammarError::InvalidUuid(uuid))?;

        Ok(Self {
            uuid,
            name: file.name.ok_or(GrammarError::MissingKey("name"))?,
            scope_name: file.scope_name.ok_or(GrammarError::MissingKey("scopeName"))?,
            file_types: file.file_types,
            patterns: file.patterns.ok_or(GrammarError::MissingKey("patterns"))?,
            repository: file.repository,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, GrammarError> {
        let value = serde_json::from_str(json).map_err(|e| GrammarError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Scope names of the foreign grammars this one includes, in document order.
    pub fn referenced_languages(&self) -> Vec<String> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut visit = |include: &str| {
            if let Some(language) = Reference::parse(include).language() {
                if language != self.scope_name && seen.insert(language.to_string()) {
                    found.push(language.to_string());
                }
            }
        };
        for value in self.patterns.iter().chain(self.repository.values()) {
            collect_includes(value, &mut visit);
        }
        found
    }
}

fn collect_includes(value: &Value, visit: &mut impl FnMut(&str)) {
    match value {
        Value::Object(map) => {
            if let Some(include) = map.get("include").and_then(Value::as_str) {
                visit(include);
            }
            for child in map.values() {
                collect_includes(child, visit);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_includes(child, visit);
            }
        }
        _ => {}
    }
}

/// One raw pattern entry. Every key is optional; which ones are present
/// decides the pattern kind.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPattern {
    name: Option<String>,
    #[serde(rename = "match")]
    match_: Option<String>,
    begin: Option<String>,
    end: Option<String>,
    captures: Option<Map<String, Value>>,
    begin_captures: Option<Map<String, Value>>,
    end_captures: Option<Map<String, Value>>,
    apply_end_pattern_last: Option<Flag>,
    patterns: Option<Vec<Value>>,
    include: Option<String>,
    repository: Option<Map<String, Value>>,
}

/// Property lists store booleans either as `true`/`false` or as `1`/`0`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Int(i) => *i != 0,
        }
    }
}

// ---
// Pattern graph
// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RepositoryId(pub(crate) usize);

/// Scope names keyed by capture-group index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureCollection {
    entries: BTreeMap<usize, Arc<str>>,
}

impl CaptureCollection {
    fn from_map(map: &Map<String, Value>) -> Self {
        let entries = map
            .iter()
            .filter_map(|(key, value)| {
                let index = key.parse::<usize>().ok()?;
                let name = value.get("name")?.as_str()?;
                Some((index, Arc::from(name)))
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(&index).map(|name| name.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<str>)> + '_ {
        self.entries.iter().map(|(index, name)| (*index, name))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Target of an `include`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `#name`
    Repository(String),
    /// `$self`
    SelfGrammar,
    /// `$base`
    Base,
    /// `source.other`
    Foreign(String),
    /// `source.other#name`
    ForeignRepository { language: String, key: String },
}

impl Reference {
    pub fn parse(include: &str) -> Self {
        if let Some(key) = include.strip_prefix('#') {
            Reference::Repository(key.to_string())
        } else if include == "$self" {
            Reference::SelfGrammar
        } else if include == "$base" {
            Reference::Base
        } else if let Some((language, key)) = include.split_once('#') {
            Reference::ForeignRepository {
                language: language.to_string(),
                key: key.to_string(),
            }
        } else {
            Reference::Foreign(include.to_string())
        }
    }

    /// Scope name of the foreign grammar this reference needs, if any.
    pub fn language(&self) -> Option<&str> {
        match self {
            Reference::Foreign(language) | Reference::ForeignRepository { language, .. } => {
                Some(language)
            }
            _ => None,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Reference::Repository(_) | Reference::SelfGrammar)
    }
}

/// An include as declared, before resolution.
#[derive(Debug, Clone)]
pub struct Include {
    pub(crate) reference: Reference,
    /// Innermost repository visible where the include was declared.
    pub(crate) repository: RepositoryId,
    /// Grammar (slot in the graph) that declared the include.
    pub(crate) grammar: usize,
}

#[derive(Debug, Clone)]
pub enum PatternKind {
    Match {
        regex: RegularExpression,
        captures: CaptureCollection,
    },
    BeginEnd {
        begin: RegularExpression,
        end: RegularExpression,
        begin_captures: CaptureCollection,
        end_captures: CaptureCollection,
        apply_end_pattern_last: bool,
    },
    /// Only subpatterns.
    Container,
    /// Placeholder awaiting resolution.
    #[doc(hidden)]
    Include(Include),
    /// Unresolvable include; matches nothing.
    Inert,
}

#[derive(Debug, Clone)]
pub struct Pattern {
    pub name: Option<Arc<str>>,
    pub kind: PatternKind,
    pub subpatterns: Vec<PatternId>,
}

impl Pattern {
    /// Expression that starts a match of this pattern.
    pub fn opening_regex(&self) -> Option<&RegularExpression> {
        match &self.kind {
            PatternKind::Match { regex, .. } => Some(regex),
            PatternKind::BeginEnd { begin, .. } => Some(begin),
            _ => None,
        }
    }

    pub fn is_include(&self) -> bool {
        matches!(self.kind, PatternKind::Include(_))
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Repository {
    pub(crate) parent: Option<RepositoryId>,
    pub(crate) entries: HashMap<String, PatternId>,
}

/// A grammar placed in a graph.
#[derive(Debug, Clone)]
pub(crate) struct GrammarNode {
    pub(crate) scope_name: String,
    pub(crate) root: PatternId,
    pub(crate) repository: RepositoryId,
}

/// Arena holding the patterns of a grammar and of every grammar it includes.
#[derive(Debug, Default)]
pub struct PatternGraph {
    pub(crate) patterns: Vec<Pattern>,
    pub(crate) repositories: Vec<Repository>,
    pub(crate) grammars: Vec<GrammarNode>,
    pub(crate) includes: Vec<PatternId>,
    candidates: Vec<OnceCell<Vec<PatternId>>>,
}

impl PatternGraph {
    pub fn pattern(&self, id: PatternId) -> &Pattern {
        &self.patterns[id.0]
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Patterns reachable from `from` through subpattern edges, each once.
    pub fn reachable(&self, from: PatternId) -> Vec<PatternId> {
        let mut seen = HashSet::from([from]);
        let mut stack = vec![from];
        let mut order = Vec::new();
        while let Some(id) = stack.pop() {
            order.push(id);
            for &child in self.pattern(id).subpatterns.iter().rev() {
                if seen.insert(child) {
                    stack.push(child);
                }
            }
        }
        order
    }

    /// Match and begin/end patterns tried inside `id`, in declaration order,
    /// with containers flattened. Computed on first use.
    pub fn candidates(&self, id: PatternId) -> &[PatternId] {
        self.candidates[id.0].get_or_init(|| {
            let mut out = Vec::new();
            let mut emitted = HashSet::new();
            let mut expanded = HashSet::new();
            self.flatten_into(id, &mut out, &mut emitted, &mut expanded);
            out
        })
    }

    fn flatten_into(
        &self,
        id: PatternId,
        out: &mut Vec<PatternId>,
        emitted: &mut HashSet<PatternId>,
        expanded: &mut HashSet<PatternId>,
    ) {
        for &child in &self.pattern(id).subpatterns {
            match self.pattern(child).kind {
                PatternKind::Match { .. } | PatternKind::BeginEnd { .. } => {
                    if emitted.insert(child) {
                        out.push(child);
                    }
                }
                PatternKind::Container => {
                    if expanded.insert(child) {
                        self.flatten_into(child, out, emitted, expanded);
                    }
                }
                PatternKind::Include(_) | PatternKind::Inert => {}
            }
        }
    }

    pub(crate) fn push(&mut self, pattern: Pattern) -> PatternId {
        let id = PatternId(self.patterns.len());
        if pattern.is_include() {
            self.includes.push(id);
        }
        self.patterns.push(pattern);
        self.candidates.push(OnceCell::new());
        id
    }

    fn push_repository(&mut self, parent: Option<RepositoryId>) -> RepositoryId {
        let id = RepositoryId(self.repositories.len());
        self.repositories.push(Repository {
            parent,
            entries: HashMap::new(),
        });
        id
    }

    /// Look `key` up in `repository` and then in its ancestors.
    pub(crate) fn lookup(&self, repository: RepositoryId, key: &str) -> Option<PatternId> {
        let mut current = Some(repository);
        while let Some(id) = current {
            let repo = &self.repositories[id.0];
            if let Some(&pattern) = repo.entries.get(key) {
                return Some(pattern);
            }
            current = repo.parent;
        }
        None
    }

    pub(crate) fn grammar_slot(&self, scope_name: &str) -> Option<usize> {
        self.grammars.iter().position(|g| g.scope_name == scope_name)
    }

    /// Build `definition` into the arena and resolve its internal includes.
    /// Returns the grammar's slot.
    ///
    /// Malformed nested entries are dropped, but a malformed top-level entry
    /// rejects the whole grammar and leaves the arena as it was.
    pub(crate) fn add_grammar(
        &mut self,
        definition: &GrammarDefinition,
    ) -> Result<usize, GrammarError> {
        let mark = self.mark();
        let slot = self.grammars.len();
        let first_include = self.includes.len();
        let repository = self.push_repository(None);
        // Root is pushed first so its id is known before the children exist.
        let root = self.push(Pattern {
            name: None,
            kind: PatternKind::Container,
            subpatterns: Vec::new(),
        });
        self.grammars.push(GrammarNode {
            scope_name: definition.scope_name.clone(),
            root,
            repository,
        });

        self.fill_repository(repository, &definition.repository, slot);
        let mut subpatterns = Vec::with_capacity(definition.patterns.len());
        for (index, value) in definition.patterns.iter().enumerate() {
            match self.build_pattern(value, repository, slot) {
                Some(id) => subpatterns.push(id),
                None => {
                    self.rollback(mark);
                    return Err(GrammarError::Malformed(format!(
                        "top-level pattern {} of {} is invalid",
                        index, definition.scope_name
                    )));
                }
            }
        }
        self.patterns[root.0].subpatterns = subpatterns;

        let declared: Vec<PatternId> = self.includes[first_include..].to_vec();
        self.resolve_internal(&declared);
        tracing::debug!(
            "Built grammar {} ({} patterns, {} includes)",
            definition.scope_name,
            self.patterns.len(),
            declared.len()
        );
        Ok(slot)
    }

    fn mark(&self) -> [usize; 4] {
        [
            self.patterns.len(),
            self.repositories.len(),
            self.grammars.len(),
            self.includes.len(),
        ]
    }

    /// Forget everything pushed since `mark`.
    fn rollback(&mut self, [patterns, repositories, grammars, includes]: [usize; 4]) {
        self.patterns.truncate(patterns);
        self.candidates.truncate(patterns);
        self.repositories.truncate(repositories);
        self.grammars.truncate(grammars);
        self.includes.truncate(includes);
    }

    fn fill_repository(
        &mut self,
        repository: RepositoryId,
        raw: &Map<String, Value>,
        grammar: usize,
    ) {
        for (key, value) in raw {
            match self.build_pattern(value, repository, grammar) {
                Some(id) => {
                    self.repositories[repository.0].entries.insert(key.clone(), id);
                }
                None => tracing::warn!("Dropping malformed repository entry {:?}", key),
            }
        }
    }

    fn build_patterns(
        &mut self,
        raw: &[Value],
        repository: RepositoryId,
        grammar: usize,
    ) -> Vec<PatternId> {
        raw.iter()
            .filter_map(|value| {
                let built = self.build_pattern(value, repository, grammar);
                if built.is_none() {
                    tracing::warn!("Dropping malformed pattern entry");
                }
                built
            })
            .collect()
    }

    /// Build one raw entry; `None` if it is malformed.
    fn build_pattern(
        &mut self,
        value: &Value,
        repository: RepositoryId,
        grammar: usize,
    ) -> Option<PatternId> {
        let raw: RawPattern = match serde_json::from_value(value.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!("Pattern entry is not a map of known keys: {}", e);
                return None;
            }
        };

        if let Some(include) = raw.include {
            return Some(self.push(Pattern {
                name: None,
                kind: PatternKind::Include(Include {
                    reference: Reference::parse(&include),
                    repository,
                    grammar,
                }),
                subpatterns: Vec::new(),
            }));
        }

        let repository = match &raw.repository {
            Some(local) => {
                let child = self.push_repository(Some(repository));
                self.fill_repository(child, local, grammar);
                child
            }
            None => repository,
        };

        let captures = raw.captures.as_ref().map(CaptureCollection::from_map);
        let kind = if let Some(pattern) = &raw.match_ {
            PatternKind::Match {
                regex: compile_standalone(pattern)?,
                captures: captures.unwrap_or_default(),
            }
        } else if let Some(begin) = &raw.begin {
            let end = raw.end.as_deref()?;
            let end = match RegularExpression::new(end, RegexOptions::GRAMMAR) {
                Ok(end) => end,
                Err(e) => {
                    tracing::warn!("{}", e);
                    return None;
                }
            };
            let begin_captures = raw.begin_captures.as_ref().map(CaptureCollection::from_map);
            let end_captures = raw.end_captures.as_ref().map(CaptureCollection::from_map);
            PatternKind::BeginEnd {
                begin: compile_standalone(begin)?,
                end,
                begin_captures: begin_captures.or_else(|| captures.clone()).unwrap_or_default(),
                end_captures: end_captures.or(captures).unwrap_or_default(),
                apply_end_pattern_last: raw.apply_end_pattern_last.is_some_and(|f| f.is_set()),
            }
        } else if raw.patterns.as_ref().is_some_and(|p| !p.is_empty()) {
            PatternKind::Container
        } else {
            return None;
        };

        let subpatterns = match (&kind, &raw.patterns) {
            (PatternKind::Match { .. }, _) | (_, None) => Vec::new(),
            (_, Some(patterns)) => self.build_patterns(patterns, repository, grammar),
        };

        Some(self.push(Pattern {
            name: raw.name.map(Arc::from),
            kind,
            subpatterns,
        }))
    }
}

fn compile_standalone(pattern: &str) -> Option<RegularExpression> {
    let compiled = RegularExpression::new(pattern, RegexOptions::GRAMMAR)
        .and_then(|regex| regex.into_standalone());
    match compiled {
        Ok(regex) => Some(regex),
        Err(e) => {
            tracing::warn!("{}", e);
            None
        }
    }
}

// ---
// Compiled grammar
// ---

/// A compiled grammar, immutable and shareable across threads.
#[derive(Debug)]
pub struct Grammar {
    uuid: Uuid,
    name: String,
    scope_name: String,
    file_types: Vec<String>,
    graph: PatternGraph,
    root: PatternId,
}

impl Grammar {
    /// Compile `definition` against the grammars it includes.
    ///
    /// `$base` binds to `definition`. Foreign includes naming a grammar absent
    /// from `dependencies`, or one that fails to build, stay inert.
    pub fn compile(
        definition: &GrammarDefinition,
        dependencies: &[GrammarDefinition],
    ) -> Result<Self, GrammarError> {
        let mut graph = PatternGraph::default();
        let base = graph.add_grammar(definition)?;
        for dependency in dependencies {
            if graph.grammar_slot(&dependency.scope_name).is_some() {
                continue;
            }
            if let Err(e) = graph.add_grammar(dependency) {
                tracing::warn!("Skipping included grammar: {}", e);
            }
        }
        graph.resolve_external(base);
        graph.finish();

        let root = graph.grammars[base].root;
        Ok(Self {
            uuid: definition.uuid,
            name: definition.name.clone(),
            scope_name: definition.scope_name.clone(),
            file_types: definition.file_types.clone(),
            graph,
            root,
        })
    }

    /// Compile a grammar without foreign dependencies.
    pub fn from_json(json: &str) -> Result<Self, GrammarError> {
        let definition = GrammarDefinition::from_json(json)?;
        Self::compile(&definition, &[])
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    pub fn file_types(&self) -> &[String] {
        &self.file_types
    }

    pub fn root(&self) -> PatternId {
        self.root
    }

    pub fn graph(&self) -> &PatternGraph {
        &self.graph
    }

    pub fn pattern(&self, id: PatternId) -> &Pattern {
        self.graph.pattern(id)
    }

    pub fn candidates(&self, id: PatternId) -> &[PatternId] {
        self.graph.candidates(id)
    }
}
