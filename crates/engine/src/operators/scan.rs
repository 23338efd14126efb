//! Periodic discovery of new or changed entries in a directory or table.

use crate::operators::shutdown_requested;
use crate::time::{check_interval, check_time_param, TimeParam};
use cellar_client::{ColumnFilter, RowRange, StorageClient};
use cellar_common::{ConfigError, EntryDescriptor, Error, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_TRIGGER_INTERVAL: Duration = Duration::from_secs(10);

/// Scan options as they appear in settings files.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub directory: Option<String>,
    pub pattern: Option<String>,
    pub table: Option<String>,
    pub start_row: Option<String>,
    pub end_row: Option<String>,
    pub row_prefix: Option<String>,
    pub column_family: Option<String>,
    pub column_qualifier: Option<String>,
    pub init_delay: Option<TimeParam>,
    pub trigger_interval: Option<TimeParam>,
    pub min_timestamp: Option<i64>,
    pub max_channels: Option<u32>,
    pub channel: Option<u32>,
    pub max_threads: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum ScanSource {
    Directory { path: String, pattern: Option<Regex> },
    Table { table: String, range: RowRange, columns: ColumnFilter },
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub source: ScanSource,
    pub init_delay: Option<Duration>,
    pub trigger_interval: Duration,
    pub min_timestamp: i64,
    pub max_channels: u32,
    pub channel: u32,
    pub max_threads: usize,
}

impl ScanOptions {
    pub fn validate(self) -> std::result::Result<ScanConfig, ConfigError> {
        let source = match (self.directory, self.table) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Conflict(vec!["directory".to_string(), "table".to_string()]))
            }
            (None, None) => return Err(ConfigError::Missing("directory or table to scan".to_string())),
            (Some(path), None) => {
                let pattern = self
                    .pattern
                    .map(|p| Regex::new(&p).map_err(|e| ConfigError::invalid_value("pattern", e.to_string())))
                    .transpose()?;
                ScanSource::Directory { path, pattern }
            }
            (None, Some(table)) => {
                if self.pattern.is_some() {
                    return Err(ConfigError::invalid_value("pattern", "only applies to directory scans"));
                }
                ScanSource::Table {
                    table,
                    range: RowRange { start_row: self.start_row, end_row: self.end_row, prefix: self.row_prefix },
                    columns: ColumnFilter::new(self.column_family, self.column_qualifier),
                }
            }
        };

        let init_delay = self.init_delay.map(|d| check_time_param("init_delay", d)).transpose()?;
        let trigger_interval = match self.trigger_interval {
            Some(t) => check_interval("trigger_interval", t)?,
            None => DEFAULT_TRIGGER_INTERVAL,
        };

        let max_channels = self.max_channels.unwrap_or(1);
        if max_channels == 0 {
            return Err(ConfigError::invalid_value("max_channels", "must be at least 1"));
        }
        let channel = self.channel.unwrap_or(0);
        if channel >= max_channels {
            return Err(ConfigError::invalid_value(
                "channel",
                format!("{} is not below max_channels ({})", channel, max_channels),
            ));
        }
        let max_threads = self.max_threads.unwrap_or(1);
        if max_threads == 0 {
            return Err(ConfigError::invalid_value("max_threads", "must be at least 1"));
        }

        Ok(ScanConfig {
            source,
            init_delay,
            trigger_interval,
            min_timestamp: self.min_timestamp.unwrap_or(0),
            max_channels,
            channel,
            max_threads,
        })
    }
}

/// Highest processed timestamp plus the names already emitted at exactly
/// that timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermark {
    pub min_timestamp: i64,
    pub last_seen_names: HashSet<String>,
}

impl Watermark {
    pub fn new(min_timestamp: i64) -> Self {
        Self { min_timestamp, last_seen_names: HashSet::new() }
    }

    pub fn admits(&self, name: &str, timestamp: i64) -> bool {
        timestamp > self.min_timestamp
            || (timestamp == self.min_timestamp && !self.last_seen_names.contains(name))
    }

    fn advance(&mut self, emitted: &[EntryDescriptor]) {
        let Some(newest) = emitted.iter().map(|d| d.timestamp).max() else {
            return;
        };
        if newest > self.min_timestamp {
            self.min_timestamp = newest;
            self.last_seen_names.clear();
        }
        self.last_seen_names.extend(
            emitted.iter().filter(|d| d.timestamp == newest).map(|d| d.name.clone()),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Stopped,
}

/// 32-bit FNV-1a, stable across processes so channel ownership never moves.
fn fnv1a(name: &str) -> u32 {
    name.bytes().fold(0x811c_9dc5_u32, |hash, b| (hash ^ b as u32).wrapping_mul(0x0100_0193))
}

pub fn channel_of(name: &str, max_channels: u32) -> u32 {
    fnv1a(name) % max_channels.max(1)
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub struct ScanCursor {
    client: StorageClient,
    config: ScanConfig,
    watermark: Watermark,
    state: ScanState,
}

impl ScanCursor {
    pub fn new(client: StorageClient, config: ScanConfig) -> Self {
        let watermark = Watermark::new(config.min_timestamp);
        Self { client, config, watermark, state: ScanState::Idle }
    }

    /// One cursor per channel of `config.max_channels`, each owning a
    /// disjoint share of the names.
    pub fn sharded(client: StorageClient, config: ScanConfig) -> Vec<ScanCursor> {
        (0..config.max_channels)
            .map(|channel| {
                let config = ScanConfig { channel, ..config.clone() };
                ScanCursor::new(client.clone(), config)
            })
            .collect()
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    fn owns(&self, name: &str) -> bool {
        self.config.max_channels <= 1 || channel_of(name, self.config.max_channels) == self.config.channel
    }

    async fn list(&self) -> Result<Vec<EntryDescriptor>> {
        match &self.config.source {
            ScanSource::Directory { path, pattern } => {
                let files = self.client.list_files(path).await?;
                Ok(files
                    .into_iter()
                    .filter(|f| pattern.as_ref().map_or(true, |re| re.is_match(file_name(&f.path))))
                    .map(|f| EntryDescriptor::file(f.path, f.size, f.modified))
                    .collect())
            }
            ScanSource::Table { table, range, columns } if columns.family.is_none() && columns.qualifier.is_none() => {
                let rows = self.client.list_rows(table, range.clone()).await?;
                Ok(rows.into_iter().map(|r| EntryDescriptor::row(r.row, r.versions, r.timestamp)).collect())
            }
            ScanSource::Table { table, range, columns } => {
                // Cells arrive grouped by row in key order.
                let cells = self.client.scan(table, range.clone(), columns.clone(), 0, None).await?;
                let mut rows: Vec<EntryDescriptor> = Vec::new();
                for cell in cells {
                    match rows.last_mut() {
                        Some(last) if last.name == cell.row => {
                            last.size += 1;
                            last.timestamp = last.timestamp.max(cell.timestamp);
                        }
                        _ => rows.push(EntryDescriptor::row(cell.row, 1, cell.timestamp)),
                    }
                }
                Ok(rows)
            }
        }
    }

    /// Lists the source once and returns the entries the watermark has not
    /// yet seen, oldest first. A missing directory yields nothing.
    pub async fn tick(&mut self) -> Result<Vec<EntryDescriptor>> {
        self.state = ScanState::Scanning;
        let listed = self.list().await;
        self.state = ScanState::Idle;

        let listed = match listed {
            Ok(listed) => listed,
            Err(Error::NotFound(what)) => {
                warn!("Scan source not found: {}", what);
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let mut fresh: Vec<EntryDescriptor> = listed
            .into_iter()
            .filter(|d| self.owns(&d.name) && self.watermark.admits(&d.name, d.timestamp))
            .collect();
        fresh.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));
        self.watermark.advance(&fresh);

        debug!(
            "Channel {} found {} new entries, watermark at {}",
            self.config.channel,
            fresh.len(),
            self.watermark.min_timestamp
        );
        Ok(fresh)
    }

    /// Ticks every `trigger_interval` after waiting `init_delay`, sending
    /// descriptors to `tx`, until shutdown or until `tx` is closed.
    ///
    /// Transient failures skip a tick; anything fatal stops the cursor.
    pub async fn run(mut self, tx: mpsc::Sender<EntryDescriptor>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let start = Instant::now() + self.config.init_delay.unwrap_or_default();
        let mut ticker = interval_at(start, self.config.trigger_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Scan channel {} of {} started", self.config.channel, self.config.max_channels);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            let descriptors = match self.tick().await {
                Ok(descriptors) => descriptors,
                Err(err) if err.is_transient() => {
                    warn!("Scan channel {} skipped a tick: {}", self.config.channel, err);
                    continue;
                }
                Err(err) => {
                    error!("Scan channel {} stopped: {}", self.config.channel, err);
                    self.state = ScanState::Stopped;
                    return Err(err);
                }
            };
            for descriptor in descriptors {
                if tx.send(descriptor).await.is_err() {
                    self.state = ScanState::Stopped;
                    return Ok(());
                }
            }
        }

        self.state = ScanState::Stopped;
        info!("Scan channel {} stopped", self.config.channel);
        Ok(())
    }
}
