//! Grammar module with separated pure types and I/O operations.
//!
//! This module is split into:
//! - `types`: decoded grammar documents and the compiled pattern graph (no filesystem access)
//! - `resolve`: include resolution over the pattern graph
//! - `loader`: I/O operations behind the `GrammarLoader` trait
//!
//! # Example
//!
//! ```ignore
//! use scoped_syntax::primitives::grammar::{Grammar, GrammarDefinition};
//!
//! let host = GrammarDefinition::from_json(host_json)?;
//! let guest = GrammarDefinition::from_json(guest_json)?;
//!
//! // `$base` binds to `host`; foreign includes resolve against `guest`.
//! let grammar = Grammar::compile(&host, &[guest])?;
//! ```

mod loader;
mod resolve;
mod types;

pub use loader::*;
pub use types::*;
