//! Records flowing through the connectors and the descriptors/summaries they emit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a descriptor names a file-shaped entry or a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Row,
}

/// A discovered entry, produced by a scan tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    /// File path or row key.
    pub name: String,
    pub kind: EntryKind,
    /// Byte size for files, stored version count for rows.
    pub size: u64,
    /// Modification time (files) or newest cell timestamp (rows), in epoch millis.
    pub timestamp: i64,
    pub discovered_at: DateTime<Utc>,
}

impl EntryDescriptor {
    pub fn file(name: impl Into<String>, size: u64, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size,
            timestamp,
            discovered_at: Utc::now(),
        }
    }

    pub fn row(key: impl Into<String>, versions: u64, timestamp: i64) -> Self {
        Self {
            name: key.into(),
            kind: EntryKind::Row,
            size: versions,
            timestamp,
            discovered_at: Utc::now(),
        }
    }
}

/// One cell version, shaped like the row result output schema
/// `{row, numResults, columnFamily, columnQualifier, value}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRecord {
    pub row: String,
    pub num_results: i32,
    pub column_family: String,
    pub column_qualifier: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<i64>,
    /// Table this record goes to, overriding the writer's configured table.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub table: Option<String>,
}

impl RowRecord {
    pub fn new(
        row: impl Into<String>,
        column_family: impl Into<String>,
        column_qualifier: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            row: row.into(),
            num_results: 1,
            column_family: column_family.into(),
            column_qualifier: column_qualifier.into(),
            value: value.into(),
            timestamp: None,
            table: None,
        }
    }

    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

/// A record payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Record {
    Line(String),
    Blob(Vec<u8>),
    Row(RowRecord),
}

impl Record {
    /// Payload size used for byte-count rotation.
    pub fn byte_len(&self) -> usize {
        match self {
            Record::Line(line) => line.len() + 1,
            Record::Blob(bytes) => bytes.len(),
            Record::Row(row) => {
                row.row.len()
                    + row.column_family.len()
                    + row.column_qualifier.len()
                    + row.value.len()
                    + 4
            }
        }
    }
}

impl From<&str> for Record {
    fn from(line: &str) -> Self {
        Record::Line(line.to_string())
    }
}

impl From<String> for Record {
    fn from(line: String) -> Self {
        Record::Line(line)
    }
}

/// Markers interleaved with records on an input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punctuation {
    /// End of a window; closes the destination only under close-on-punctuation.
    Window,
    /// End of the stream; always closes the destination.
    Final,
}

/// Write summary `{fileName, fileSize}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_name: String,
    pub file_size: u64,
}

/// Outcome of a single-row mutation or put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    pub row: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub new_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl MutationResult {
    pub fn ok(row: impl Into<String>) -> Self {
        Self { row: row.into(), success: true, new_value: None, message: None }
    }

    pub fn counter(row: impl Into<String>, value: i64) -> Self {
        Self { row: row.into(), success: true, new_value: Some(value), message: None }
    }

    pub fn failed(row: impl Into<String>, message: impl Into<String>) -> Self {
        Self { row: row.into(), success: false, new_value: None, message: Some(message.into()) }
    }
}

/// Summary emitted when a write destination closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WriteOutput {
    File(FileInfo),
    Put(MutationResult),
}
