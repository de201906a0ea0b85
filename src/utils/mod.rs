//! Generic utility primitives with zero domain knowledge.
//!
//! - `shell` - Shell and SQL quoting
//! - `template` - String template rendering
//! - `validation` - Input validation helpers

pub mod shell;
pub(crate) mod template;
pub mod validation;
