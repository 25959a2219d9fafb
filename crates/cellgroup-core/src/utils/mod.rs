//! Utility functions for string formatting and manipulation.

pub mod format;

pub use format::{capitalize, format_age, format_last_sync, pluralize, truncate_string};
