// Grammar-driven incremental tokenizer - exposes all core modules for testing

pub mod config;
pub mod model;
pub mod primitives;
pub mod view;

pub use config::{ConfigError, TokenizerConfig};
pub use model::scope::{Scope, ScopeSpan, TextEdit, GLOBAL_SCOPE};
pub use model::scoped_string::ScopedString;
pub use primitives::grammar::{
    BundleKind, EmbeddedGrammarLoader, Grammar, GrammarDefinition, GrammarError, GrammarLoader,
    LocalGrammarLoader,
};
pub use primitives::grammar_registry::GrammarRegistry;
pub use primitives::incremental::Document;
pub use primitives::parser::Parser;
pub use primitives::regex::{MatchResult, RegexError, RegexOptions, RegularExpression};
pub use view::theme::{AttributedRun, Attributes, Color, FontStyle, Theme, ThemeError};
