//! Persists inbound records, rotating destinations per flush policy.
//!
//! Writes, punctuation and the rotation timer all go through one async
//! mutex around the open destination, so a rotation never interleaves with a
//! write and summaries leave in the order destinations close.
//!
//! Buffered records live in memory until their destination closes. `close`
//! flushes them; dropping or aborting the connector loses them.

use crate::flush::FlushPolicy;
use crate::operators::{per_record, shutdown_requested};
use crate::template::NameTemplate;
use crate::time::TimeParam;
use cellar_client::{CheckCondition, StorageClient};
use cellar_common::{
    ConfigError, Error, FileInfo, MutationResult, Punctuation, Record, Result, RowRecord, WriteOutput,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CheckOptions {
    pub column_family: String,
    pub column_qualifier: String,
    /// Unset means the cell must not exist yet.
    pub value: Option<String>,
}

impl CheckOptions {
    pub fn validate(self) -> std::result::Result<CheckCondition, ConfigError> {
        if self.column_family.is_empty() {
            return Err(ConfigError::invalid_value("check.column_family", "must not be empty"));
        }
        if self.column_qualifier.is_empty() {
            return Err(ConfigError::invalid_value("check.column_qualifier", "must not be empty"));
        }
        Ok(CheckCondition {
            column_family: self.column_family,
            column_qualifier: self.column_qualifier,
            expected: self.value,
        })
    }
}

/// Write options as they appear in settings files.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Destination file name template.
    pub file: Option<String>,
    pub table: Option<String>,
    pub time_per_file: Option<TimeParam>,
    pub tuples_per_file: Option<u64>,
    pub bytes_per_file: Option<u64>,
    pub batch_size: Option<usize>,
    pub check: Option<CheckOptions>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteTarget {
    File { template: NameTemplate },
    Table { table: String, batch_size: usize, check: Option<CheckCondition> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteConfig {
    pub target: WriteTarget,
    pub policy: FlushPolicy,
}

impl WriteOptions {
    pub fn validate(self) -> std::result::Result<WriteConfig, ConfigError> {
        let policy = FlushPolicy::from_options(self.time_per_file, self.tuples_per_file, self.bytes_per_file)?;
        let target = match (self.file, self.table) {
            (Some(_), Some(_)) => return Err(ConfigError::Conflict(vec!["file".to_string(), "table".to_string()])),
            (None, None) => return Err(ConfigError::Missing("file or table to write".to_string())),
            (Some(template), None) => {
                if self.batch_size.is_some() || self.check.is_some() {
                    return Err(ConfigError::invalid_value("file", "batch_size and check only apply to tables"));
                }
                if template.trim().is_empty() {
                    return Err(ConfigError::invalid_value("file", "must not be empty"));
                }
                WriteTarget::File { template: NameTemplate::new(template) }
            }
            (None, Some(table)) => {
                let batch_size = self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
                if batch_size == 0 {
                    return Err(ConfigError::invalid_value("batch_size", "must be at least 1"));
                }
                WriteTarget::Table { table, batch_size, check: self.check.map(CheckOptions::validate).transpose()? }
            }
        };
        Ok(WriteConfig { target, policy })
    }
}

struct OpenFile {
    name: String,
    opened_at: DateTime<Utc>,
    content: Vec<u8>,
}

#[derive(Default)]
struct WriterState {
    file_num: u64,
    file: Option<OpenFile>,
    rows: Vec<RowRecord>,
    tuples: u64,
    bytes: u64,
    closed: bool,
}

pub struct WriteConnector {
    client: StorageClient,
    config: WriteConfig,
    state: Mutex<WriterState>,
    output: Option<mpsc::Sender<WriteOutput>>,
}

impl WriteConnector {
    pub fn new(client: StorageClient, config: WriteConfig) -> Self {
        Self { client, config, state: Mutex::new(WriterState::default()), output: None }
    }

    /// Also delivers every summary to `output`, in close order.
    pub fn with_output(mut self, output: mpsc::Sender<WriteOutput>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn config(&self) -> &WriteConfig {
        &self.config
    }

    /// Buffers one record, closing the destination if that fills it.
    pub async fn write(&self, record: Record) -> Result<Vec<WriteOutput>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Remote("write after close".to_string()));
        }

        let record_size = record.byte_len() as u64;
        let size = match &self.config.target {
            WriteTarget::File { template } => {
                let encoded = encode_line(record)?;
                let file_num = state.file_num;
                let file = state.file.get_or_insert_with(|| {
                    let opened_at = Utc::now();
                    let name = template.render(file_num, opened_at);
                    debug!("Opened {}", name);
                    OpenFile { name, opened_at, content: Vec::new() }
                });
                file.content.extend_from_slice(&encoded);
                encoded.len() as u64
            }
            WriteTarget::Table { table, .. } => match record {
                Record::Row(row) => {
                    state.rows.push(row);
                    record_size
                }
                other => {
                    return Err(Error::Config(ConfigError::invalid_type(
                        "record",
                        &format!("a row record for table {}, got a {}", table, kind_of(&other)),
                    )))
                }
            },
        };
        state.tuples += 1;
        state.bytes += size;

        let batch_full = match &self.config.target {
            WriteTarget::Table { batch_size, .. } => state.rows.len() >= *batch_size,
            WriteTarget::File { .. } => false,
        };
        if batch_full || self.config.policy.is_full(state.tuples, state.bytes) {
            return self.flush_locked(&mut state).await;
        }
        Ok(Vec::new())
    }

    /// `Window` closes the destination under close-on-punctuation only;
    /// `Final` always does.
    pub async fn punctuate(&self, punctuation: Punctuation) -> Result<Vec<WriteOutput>> {
        match punctuation {
            Punctuation::Window if self.config.policy != FlushPolicy::OnPunctuation => Ok(Vec::new()),
            _ => self.flush().await,
        }
    }

    /// Closes the open destination and returns its summaries. Nothing is
    /// emitted when nothing was buffered.
    pub async fn flush(&self) -> Result<Vec<WriteOutput>> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    /// Final flush; later writes fail.
    pub async fn close(&self) -> Result<Vec<WriteOutput>> {
        let mut state = self.state.lock().await;
        let outputs = self.flush_locked(&mut state).await?;
        state.closed = true;
        info!("Write connector closed after {} files", state.file_num);
        Ok(outputs)
    }

    /// Nothing leaves the buffer before the store has accepted it, so a
    /// failed or cancelled flush loses no records.
    async fn flush_locked(&self, state: &mut WriterState) -> Result<Vec<WriteOutput>> {
        let outputs = match &self.config.target {
            WriteTarget::File { .. } => match &state.file {
                None => Vec::new(),
                Some(file) => {
                    let file_name = file.name.clone();
                    let file_size = self.client.write_file(&file_name, file.content.clone()).await?;
                    if let Some(file) = state.file.take() {
                        debug!("Closed {} ({} bytes, opened {})", file_name, file_size, file.opened_at);
                    }
                    state.file_num += 1;
                    vec![WriteOutput::File(FileInfo { file_name, file_size })]
                }
            },
            WriteTarget::Table { table, check, .. } => {
                let mut outputs = Vec::with_capacity(state.rows.len());
                let mut failure = None;
                for row in &state.rows {
                    let target = row.table.as_deref().unwrap_or(table);
                    let result = self.put_row(target, row, check.clone()).await;
                    match per_record(&row.row, result) {
                        Ok(result) => outputs.push(WriteOutput::Put(result)),
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                state.rows.drain(..outputs.len());
                if let Some(err) = failure {
                    warn!("{} rows stay buffered after a failed put", state.rows.len());
                    self.deliver(&outputs).await;
                    return Err(err);
                }
                outputs
            }
        };
        state.tuples = 0;
        state.bytes = 0;
        self.deliver(&outputs).await;
        Ok(outputs)
    }

    async fn deliver(&self, outputs: &[WriteOutput]) {
        if let Some(tx) = &self.output {
            for output in outputs {
                if tx.send(output.clone()).await.is_err() {
                    warn!("Write summary receiver is gone");
                    break;
                }
            }
        }
    }

    async fn put_row(&self, table: &str, row: &RowRecord, check: Option<CheckCondition>) -> Result<MutationResult> {
        let applied = self
            .client
            .put(
                table,
                &row.row,
                &row.column_family,
                &row.column_qualifier,
                row.value.clone().into_bytes(),
                row.timestamp,
                check,
            )
            .await?;
        Ok(if applied {
            MutationResult::ok(&row.row)
        } else {
            MutationResult::failed(&row.row, "check failed")
        })
    }

    /// Rotates every `period` on a dedicated task until `stop` fires or the
    /// connector closes. A rotation already under way finishes first, so
    /// await the handle rather than aborting it.
    pub fn spawn_rotation_timer(
        connector: Arc<WriteConnector>,
        period: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_requested(&mut stop) => break,
                    _ = ticker.tick() => {}
                }
                if connector.state.lock().await.closed {
                    break;
                }
                match connector.flush().await {
                    Ok(outputs) => debug!("Timed rotation emitted {} summaries", outputs.len()),
                    Err(err) if err.is_fatal() => {
                        error!("Timed rotation stopped: {}", err);
                        break;
                    }
                    Err(err) => warn!("Timed rotation failed, retrying next period: {}", err),
                }
            }
        })
    }
}

fn kind_of(record: &Record) -> &'static str {
    match record {
        Record::Line(_) => "line",
        Record::Blob(_) => "blob",
        Record::Row(_) => "row",
    }
}

/// File bytes for one record: lines get a newline, blobs go as is, rows
/// become a CSV line `row,family,qualifier,value`.
fn encode_line(record: Record) -> Result<Vec<u8>> {
    match record {
        Record::Line(line) => {
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            Ok(bytes)
        }
        Record::Blob(bytes) => Ok(bytes),
        Record::Row(row) => {
            let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
            writer
                .write_record([&row.row, &row.column_family, &row.column_qualifier, &row.value])
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            writer.into_inner().map_err(|e| Error::Io(e.into_error()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_encode_as_csv() {
        let row = RowRecord::new("frodo", "location", "end", "Grey Havens, West");
        let bytes = encode_line(Record::Row(row)).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "frodo,location,end,\"Grey Havens, West\"\n");
    }

    #[test]
    fn options_pick_one_target() {
        assert!(matches!(WriteOptions::default().validate().unwrap_err(), ConfigError::Missing(_)));
        let both = WriteOptions { file: Some("f".into()), table: Some("t".into()), ..Default::default() };
        assert!(matches!(both.validate().unwrap_err(), ConfigError::Conflict(_)));
        let file_batch = WriteOptions { file: Some("f".into()), batch_size: Some(3), ..Default::default() };
        assert!(file_batch.validate().is_err());
    }

    #[test]
    fn options_report_conflicting_flush_settings() {
        let options = WriteOptions {
            file: Some("/out/%FILENUM.txt".into()),
            time_per_file: Some(TimeParam::Seconds(10.0)),
            tuples_per_file: Some(5),
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("time_per_file, tuples_per_file"));
    }

    #[test]
    fn table_options_carry_check() {
        let options = WriteOptions {
            table: Some("characters".into()),
            check: Some(CheckOptions {
                column_family: "location".into(),
                column_qualifier: "status".into(),
                value: None,
            }),
            ..Default::default()
        };
        match options.validate().unwrap().target {
            WriteTarget::Table { batch_size, check: Some(check), .. } => {
                assert_eq!(batch_size, DEFAULT_BATCH_SIZE);
                assert_eq!(check.expected, None);
            }
            other => panic!("unexpected target {:?}", other),
        }
    }
}
