//! Materializes the content behind an entry descriptor.

use cellar_client::{Cell, ColumnFilter, StorageClient};
use cellar_common::{ConfigError, EntryDescriptor, Error, Record, Result, RowRecord};
use serde::Deserialize;
use tracing::{debug, warn};

/// Records of one entry. Finite and single-pass.
pub type RecordIter = Box<dyn Iterator<Item = Record> + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// One `Line` record per line.
    #[default]
    Text,
    /// The whole file as one `Blob` record.
    Binary,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    pub format: Option<FileFormat>,
    pub table: Option<String>,
    pub column_family: Option<String>,
    pub column_qualifier: Option<String>,
    pub max_versions: Option<u32>,
    pub min_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadConfig {
    Files { format: FileFormat },
    Table { table: String, columns: ColumnFilter, max_versions: u32, min_timestamp: Option<i64> },
}

impl ReadOptions {
    pub fn validate(self) -> std::result::Result<ReadConfig, ConfigError> {
        match self.table {
            None => {
                for (param, set) in [
                    ("column_family", self.column_family.is_some()),
                    ("column_qualifier", self.column_qualifier.is_some()),
                    ("max_versions", self.max_versions.is_some()),
                    ("min_timestamp", self.min_timestamp.is_some()),
                ] {
                    if set {
                        return Err(ConfigError::invalid_value(param, "only applies to table reads"));
                    }
                }
                Ok(ReadConfig::Files { format: self.format.unwrap_or_default() })
            }
            Some(table) => {
                if self.format.is_some() {
                    return Err(ConfigError::invalid_value("format", "only applies to file reads"));
                }
                Ok(ReadConfig::Table {
                    table,
                    columns: ColumnFilter::new(self.column_family, self.column_qualifier),
                    max_versions: self.max_versions.unwrap_or(0),
                    min_timestamp: self.min_timestamp,
                })
            }
        }
    }
}

/// One lookup that names its own row and, optionally, its own columns and
/// table. Unset fields fall back to the connector's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GetRequest {
    pub row: String,
    #[serde(default)]
    pub column_family: Option<String>,
    #[serde(default)]
    pub column_qualifier: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
}

impl GetRequest {
    pub fn new(row: impl Into<String>) -> Self {
        Self { row: row.into(), ..Default::default() }
    }

    pub fn columns(mut self, family: impl Into<String>, qualifier: Option<&str>) -> Self {
        self.column_family = Some(family.into());
        self.column_qualifier = qualifier.map(str::to_string);
        self
    }

    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// A request naming a family replaces the configured columns entirely;
    /// a bare qualifier narrows the configured family.
    fn column_filter(&self, configured: &ColumnFilter) -> ColumnFilter {
        match &self.column_family {
            Some(family) => ColumnFilter::new(Some(family.clone()), self.column_qualifier.clone()),
            None => ColumnFilter::new(
                configured.family.clone(),
                self.column_qualifier.clone().or_else(|| configured.qualifier.clone()),
            ),
        }
    }
}

/// Lines of a byte buffer, produced on demand. The final line need not end
/// in `\n`; a trailing `\r` stays part of the line.
struct Lines {
    content: Vec<u8>,
    pos: usize,
}

impl Iterator for Lines {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if self.pos >= self.content.len() {
            return None;
        }
        let rest = &self.content[self.pos..];
        let (line, consumed) = match rest.iter().position(|b| *b == b'\n') {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        let record = Record::Line(String::from_utf8_lossy(line).into_owned());
        self.pos += consumed;
        Some(record)
    }
}

pub struct ReadConnector {
    client: StorageClient,
    config: ReadConfig,
}

impl ReadConnector {
    pub fn new(client: StorageClient, config: ReadConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ReadConfig {
        &self.config
    }

    /// Fetches the entry named by `descriptor`.
    ///
    /// An entry that vanished since it was discovered reads as empty.
    pub async fn read(&self, descriptor: &EntryDescriptor) -> Result<RecordIter> {
        let fetched = match &self.config {
            ReadConfig::Files { format } => self.read_file(&descriptor.name, *format).await,
            ReadConfig::Table { table, columns, max_versions, min_timestamp } => {
                self.read_row(table, &descriptor.name, columns, *max_versions, *min_timestamp).await
            }
        };
        empty_if_gone(&descriptor.name, fetched)
    }

    /// Fetches the row a request names, with its per-request columns and
    /// table applied. Only table connectors answer gets.
    pub async fn get(&self, request: &GetRequest) -> Result<RecordIter> {
        let ReadConfig::Table { table, columns, max_versions, min_timestamp } = &self.config else {
            return Err(Error::Config(ConfigError::invalid_value("get", "needs a table read connector")));
        };
        let table = request.table.as_deref().unwrap_or(table);
        let columns = request.column_filter(columns);
        let fetched = self.read_row(table, &request.row, &columns, *max_versions, *min_timestamp).await;
        empty_if_gone(&request.row, fetched)
    }

    async fn read_file(&self, path: &str, format: FileFormat) -> Result<RecordIter> {
        let content = self.client.read_file(path).await?;
        debug!("Read {} bytes from {}", content.len(), path);
        Ok(match format {
            FileFormat::Text => Box::new(Lines { content, pos: 0 }),
            FileFormat::Binary => Box::new(std::iter::once(Record::Blob(content))),
        })
    }

    async fn read_row(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnFilter,
        max_versions: u32,
        min_timestamp: Option<i64>,
    ) -> Result<RecordIter> {
        let mut cells = self.client.get(table, row, columns.clone(), max_versions, min_timestamp).await?;
        // Stable: equal timestamps keep the column order the store reported.
        cells.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let num_results = i32::try_from(cells.len()).unwrap_or(i32::MAX);
        debug!("Row '{}' of {} returned {} cells", row, table, num_results);
        Ok(Box::new(cells.into_iter().map(move |cell| row_record(cell, num_results))))
    }
}

fn empty_if_gone(name: &str, fetched: Result<RecordIter>) -> Result<RecordIter> {
    match fetched {
        Err(Error::NotFound(what)) => {
            warn!("Entry '{}' is gone: {}", name, what);
            Ok(Box::new(std::iter::empty()))
        }
        other => other,
    }
}

fn row_record(cell: Cell, num_results: i32) -> Record {
    Record::Row(RowRecord {
        row: cell.row,
        num_results,
        column_family: cell.family,
        column_qualifier: cell.qualifier,
        value: String::from_utf8_lossy(&cell.value).into_owned(),
        timestamp: Some(cell.timestamp),
        table: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<Record> {
        Lines { content: text.as_bytes().to_vec(), pos: 0 }.collect()
    }

    #[test]
    fn splits_on_newlines() {
        assert_eq!(lines("a\nb\n"), vec![Record::from("a"), Record::from("b")]);
        assert_eq!(lines("a\n\nb"), vec![Record::from("a"), Record::from(""), Record::from("b")]);
        assert_eq!(lines("crlf\r\n"), vec![Record::from("crlf\r")]);
        assert!(lines("").is_empty());
    }

    #[test]
    fn get_requests_override_configured_columns() {
        let configured = ColumnFilter::new(Some("location".into()), Some("home".into()));
        let own = GetRequest::new("gandalf").columns("info", None);
        assert_eq!(own.column_filter(&configured), ColumnFilter::new(Some("info".into()), None));

        let narrowed = GetRequest { column_qualifier: Some("end".into()), ..GetRequest::new("frodo") };
        assert_eq!(
            narrowed.column_filter(&configured),
            ColumnFilter::new(Some("location".into()), Some("end".into()))
        );
        assert_eq!(GetRequest::new("sam").column_filter(&configured), configured);
    }

    #[test]
    fn get_requests_deserialize_with_defaults() {
        let request: GetRequest =
            serde_json::from_str(r#"{"row":"gandalf","column_family":"location","table":"characters"}"#).unwrap();
        assert_eq!(request, GetRequest::new("gandalf").columns("location", None).in_table("characters"));
    }

    #[test]
    fn table_options_reject_file_format() {
        let options = ReadOptions {
            table: Some("t".into()),
            format: Some(FileFormat::Binary),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn file_options_reject_table_settings() {
        let options = ReadOptions { max_versions: Some(2), ..Default::default() };
        assert!(options.validate().is_err());
        assert_eq!(
            ReadOptions::default().validate().unwrap(),
            ReadConfig::Files { format: FileFormat::Text }
        );
    }
}
