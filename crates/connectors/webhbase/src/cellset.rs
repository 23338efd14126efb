//! JSON documents exchanged with the REST gateway. Row keys, columns and
//! values travel base64-encoded; a column is `family:qualifier`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cellar_client::{Cell, ColumnFilter};
use cellar_common::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSet {
    #[serde(rename = "Row", default)]
    pub rows: Vec<RowModel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowModel {
    pub key: String,
    #[serde(rename = "Cell", default)]
    pub cells: Vec<CellModel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellModel {
    pub column: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<i64>,
    #[serde(rename = "$", default)]
    pub value: String,
}

/// Body of a scanner creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerModel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_row: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_row: Option<String>,
    #[serde(rename = "column", skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    pub batch: u32,
    pub max_versions: i32,
}

pub fn encode(raw: impl AsRef<[u8]>) -> String {
    STANDARD.encode(raw)
}

fn decode(field: &str, encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| Error::Remote(format!("malformed {} in cell set: {}", field, e)))
}

/// `family:qualifier`, or just `family` to address the whole family. A
/// qualifier without a family cannot be addressed and is filtered locally.
pub fn column_spec(columns: &ColumnFilter) -> Option<String> {
    let family = columns.family.as_deref()?;
    Some(match columns.qualifier.as_deref() {
        Some(qualifier) => format!("{}:{}", family, qualifier),
        None => family.to_string(),
    })
}

/// The gateway has no "every version" marker; 0 asks for as many as it keeps.
pub fn versions_param(max_versions: u32) -> i32 {
    match max_versions {
        0 => i32::MAX,
        n => i32::try_from(n).unwrap_or(i32::MAX),
    }
}

impl CellSet {
    /// A document for one row with no cells yet.
    pub fn row(key: &str) -> Self {
        CellSet { rows: vec![RowModel { key: encode(key), cells: Vec::new() }] }
    }

    pub fn with_cell(mut self, family: &str, qualifier: &str, timestamp: Option<i64>, value: &[u8]) -> Self {
        if let Some(row) = self.rows.last_mut() {
            row.cells.push(CellModel {
                column: encode(format!("{}:{}", family, qualifier)),
                timestamp,
                value: encode(value),
            });
        }
        self
    }

    /// Flattens the document into cells, in the order the gateway sent them.
    pub fn into_cells(self) -> Result<Vec<Cell>> {
        let mut cells = Vec::new();
        for row in self.rows {
            let key = String::from_utf8_lossy(&decode("row key", &row.key)?).into_owned();
            for cell in row.cells {
                let column = String::from_utf8_lossy(&decode("column", &cell.column)?).into_owned();
                let (family, qualifier) = column.split_once(':').unwrap_or((column.as_str(), ""));
                cells.push(Cell {
                    row: key.clone(),
                    family: family.to_string(),
                    qualifier: qualifier.to_string(),
                    timestamp: cell.timestamp.unwrap_or_default(),
                    value: decode("value", &cell.value)?,
                });
            }
        }
        Ok(cells)
    }
}
