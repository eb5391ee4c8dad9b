//! Low-level primitives
//!
//! This module contains the regex adapter, grammar compilation,
//! the tokenizer and incremental document sessions.

pub mod grammar;
pub mod grammar_registry;
pub mod incremental;
pub mod parser;
pub mod regex;
