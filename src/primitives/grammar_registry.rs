//! Grammar registry for TextMate grammars and themes
//!
//! This module owns the cache of compiled grammars and parsed themes. Documents
//! are found through an injected [`GrammarLoader`]; a grammar is compiled
//! together with every grammar it includes, collected breadth-first by scope
//! name.
//!
//! Failures (missing documents, malformed JSON, missing required keys) are
//! logged and reported as `None`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};

use crate::config::TokenizerConfig;
use crate::primitives::grammar::{
    BundleKind, Grammar, GrammarDefinition, GrammarLoader, LocalGrammarLoader,
};
use crate::primitives::parser::Parser;
use crate::view::theme::Theme;

/// Registry of compiled grammars and themes, keyed by identifier.
pub struct GrammarRegistry {
    loader: Arc<dyn GrammarLoader>,
    config: TokenizerConfig,
    grammars: RwLock<HashMap<String, Arc<Grammar>>>,
    themes: RwLock<HashMap<String, Arc<Theme>>>,
}

impl GrammarRegistry {
    pub fn new(loader: Arc<dyn GrammarLoader>, config: TokenizerConfig) -> Self {
        Self {
            loader,
            config,
            grammars: RwLock::new(HashMap::new()),
            themes: RwLock::new(HashMap::new()),
        }
    }

    /// Registry over the local filesystem, searching `config.grammar_dirs`
    /// before the user config directory.
    pub fn local(config: TokenizerConfig) -> Self {
        let loader = LocalGrammarLoader::new().with_search_dirs(config.grammar_dirs.clone());
        Self::new(Arc::new(loader), config)
    }

    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }

    /// Compiled grammar for `identifier`, from the cache when possible.
    pub fn grammar(&self, identifier: &str) -> Option<Arc<Grammar>> {
        if self.config.cache_grammars {
            let cache = self.grammars.read().unwrap_or_else(|e| e.into_inner());
            if let Some(grammar) = cache.get(identifier) {
                tracing::debug!("Grammar cache hit for {}", identifier);
                return Some(grammar.clone());
            }
        }

        let grammar = match self.compile_grammar(identifier) {
            Ok(grammar) => Arc::new(grammar),
            Err(e) => {
                tracing::warn!("Grammar {} is not available: {:#}", identifier, e);
                return None;
            }
        };

        if self.config.cache_grammars {
            // Concurrent compiles of one identifier agree, so the last write wins.
            self.grammars
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(identifier.to_string(), grammar.clone());
        }
        Some(grammar)
    }

    /// Parsed theme for `identifier`, from the cache when possible.
    pub fn theme(&self, identifier: &str) -> Option<Arc<Theme>> {
        if self.config.cache_themes {
            let cache = self.themes.read().unwrap_or_else(|e| e.into_inner());
            if let Some(theme) = cache.get(identifier) {
                tracing::debug!("Theme cache hit for {}", identifier);
                return Some(theme.clone());
            }
        }

        let theme = match self.load_theme(identifier) {
            Ok(theme) => Arc::new(theme),
            Err(e) => {
                tracing::warn!("Theme {} is not available: {:#}", identifier, e);
                return None;
            }
        };

        if self.config.cache_themes {
            self.themes
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(identifier.to_string(), theme.clone());
        }
        Some(theme)
    }

    /// Tokenizer for the grammar `identifier`, honouring the configured
    /// line length limit.
    pub fn parser(&self, identifier: &str) -> Option<Parser> {
        let grammar = self.grammar(identifier)?;
        Some(Parser::new(grammar).with_max_line_length(self.config.max_line_length))
    }

    /// Drop every cached grammar and theme.
    pub fn clear_caches(&self) {
        self.grammars.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.themes.write().unwrap_or_else(|e| e.into_inner()).clear();
        tracing::debug!("Cleared grammar and theme caches");
    }

    pub fn cached_grammar_count(&self) -> usize {
        self.grammars.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn cached_theme_count(&self) -> usize {
        self.themes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn read_document(&self, identifier: &str, kind: BundleKind) -> Result<serde_json::Value> {
        let path = self
            .loader
            .locate(identifier, kind)
            .with_context(|| format!("no {:?} document for {:?}", kind, identifier))?;
        let content = self
            .loader
            .read_file(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        tracing::debug!("Loaded {:?} document {}", kind, path.display());
        Ok(value)
    }

    fn load_definition(&self, identifier: &str) -> Result<GrammarDefinition> {
        let value = self.read_document(identifier, BundleKind::Language)?;
        GrammarDefinition::from_value(value)
            .with_context(|| format!("invalid grammar {:?}", identifier))
    }

    /// Load `identifier` and every grammar it transitively includes, then
    /// compile it with `$base` bound to itself.
    fn compile_grammar(&self, identifier: &str) -> Result<Grammar> {
        let definition = self.load_definition(identifier)?;

        let mut seen: HashSet<String> = HashSet::from([definition.scope_name.clone()]);
        let mut queue: VecDeque<String> = definition.referenced_languages().into();
        let mut dependencies = Vec::new();
        while let Some(language) = queue.pop_front() {
            if !seen.insert(language.clone()) {
                continue;
            }
            match self.load_definition(&language) {
                Ok(dependency) => {
                    queue.extend(dependency.referenced_languages());
                    dependencies.push(dependency);
                }
                Err(e) => tracing::warn!("Included grammar {} is not available: {:#}", language, e),
            }
        }

        tracing::debug!(
            "Compiling {} with {} included grammars",
            definition.scope_name,
            dependencies.len()
        );
        Grammar::compile(&definition, &dependencies)
            .with_context(|| format!("failed to compile {:?}", identifier))
    }

    fn load_theme(&self, identifier: &str) -> Result<Theme> {
        let value = self.read_document(identifier, BundleKind::Theme)?;
        Theme::from_value(value).with_context(|| format!("invalid theme {:?}", identifier))
    }
}
