//! Utility functions for formatting log and error output.

pub mod format;

// Re-export commonly used functions at module level
pub use format::{format_remaining, format_size, truncate_string};
