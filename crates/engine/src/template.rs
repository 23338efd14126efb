//! Destination names for rotated files.

use chrono::{DateTime, Utc};

pub const FILE_NUM_TOKEN: &str = "%FILENUM";
pub const TIME_TOKEN: &str = "%TIME";
pub const TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// A destination name with optional `%FILENUM` and `%TIME` tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTemplate {
    pattern: String,
}

impl NameTemplate {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self { pattern: pattern.into() }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Without `%FILENUM` or `%TIME` every rotation reuses, and overwrites,
    /// the same destination.
    pub fn is_static(&self) -> bool {
        !self.pattern.contains(FILE_NUM_TOKEN) && !self.pattern.contains(TIME_TOKEN)
    }

    pub fn render(&self, file_num: u64, opened_at: DateTime<Utc>) -> String {
        self.pattern
            .replace(FILE_NUM_TOKEN, &file_num.to_string())
            .replace(TIME_TOKEN, &opened_at.format(TIME_FORMAT).to_string())
    }
}
