//! The request/response vocabulary spoken to a store, and the trait a store
//! transport implements.

use crate::config::CredentialSource;
use cellar_common::Result;
use chrono::{DateTime, Utc};

/// Restricts a get or scan to one column family and optionally one qualifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnFilter {
    pub family: Option<String>,
    pub qualifier: Option<String>,
}

impl ColumnFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(family: Option<String>, qualifier: Option<String>) -> Self {
        Self { family, qualifier }
    }

    pub fn matches(&self, family: &str, qualifier: &str) -> bool {
        self.family.as_deref().map_or(true, |f| f == family)
            && self.qualifier.as_deref().map_or(true, |q| q == qualifier)
    }
}

/// Row key range: `start_row` inclusive, `end_row` exclusive, optional prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowRange {
    pub start_row: Option<String>,
    pub end_row: Option<String>,
    pub prefix: Option<String>,
}

impl RowRange {
    pub fn contains(&self, row: &str) -> bool {
        if let Some(start) = &self.start_row {
            if row < start.as_str() {
                return false;
            }
        }
        if let Some(end) = &self.end_row {
            if row >= end.as_str() {
                return false;
            }
        }
        self.prefix.as_deref().map_or(true, |p| row.starts_with(p))
    }
}

/// Guard for check-and-mutate: the latest value of the cell must equal
/// `expected`, or the cell must be absent when `expected` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckCondition {
    pub column_family: String,
    pub column_qualifier: String,
    pub expected: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Request {
    ListFiles {
        directory: String,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: Vec<u8>,
    },
    ListRows {
        table: String,
        range: RowRange,
    },
    Get {
        table: String,
        row: String,
        columns: ColumnFilter,
        /// 0 means every stored version.
        max_versions: u32,
        min_timestamp: Option<i64>,
    },
    Scan {
        table: String,
        range: RowRange,
        columns: ColumnFilter,
        max_versions: u32,
        min_timestamp: Option<i64>,
    },
    Put {
        table: String,
        row: String,
        family: String,
        qualifier: String,
        value: Vec<u8>,
        timestamp: Option<i64>,
        check: Option<CheckCondition>,
    },
    Delete {
        table: String,
        row: String,
        columns: ColumnFilter,
        all_versions: bool,
        check: Option<CheckCondition>,
    },
    Increment {
        table: String,
        row: String,
        family: String,
        qualifier: String,
        delta: i64,
    },
}

impl Request {
    /// Short operation name for logs.
    pub fn op(&self) -> &'static str {
        match self {
            Request::ListFiles { .. } => "list_files",
            Request::ReadFile { .. } => "read_file",
            Request::WriteFile { .. } => "write_file",
            Request::ListRows { .. } => "list_rows",
            Request::Get { .. } => "get",
            Request::Scan { .. } => "scan",
            Request::Put { .. } => "put",
            Request::Delete { .. } => "delete",
            Request::Increment { .. } => "increment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: String,
    pub size: u64,
    /// Modification time in epoch millis.
    pub modified: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowStat {
    pub row: String,
    pub versions: u64,
    /// Newest cell timestamp in the row.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub row: String,
    pub family: String,
    pub qualifier: String,
    pub timestamp: i64,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Files(Vec<FileStat>),
    Content(Vec<u8>),
    Written { size: u64 },
    Rows(Vec<RowStat>),
    /// Cells of one or more rows, rows in key order; within a row, columns in
    /// the order they were first written and versions newest first.
    Cells(Vec<Cell>),
    /// Whether a (possibly conditional) mutation was applied.
    Applied(bool),
    Counter(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A transport to the store.
///
/// `execute` answers `Error::SessionExpired` when the token is no longer
/// accepted; the client refreshes and replays in that case.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn authenticate(&self, source: &CredentialSource) -> Result<SessionToken>;

    async fn execute(&self, session: &SessionToken, request: Request) -> Result<Response>;
}
