//! View layer
//!
//! This module maps scopes to display attributes.

pub mod theme;
