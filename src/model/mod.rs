//! Core data model for scoped text
//!
//! This module contains scope annotations, edit descriptions and the scope store.

pub mod scope;
pub mod scoped_string;
