//! Single-row deletes and atomic increments.

use crate::operators::per_record;
use crate::operators::write::CheckOptions;
use cellar_client::{CheckCondition, ColumnFilter, StorageClient};
use cellar_common::{ConfigError, MutationResult, Result};
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_MUTATION_BATCH_SIZE: usize = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MutationOptions {
    pub table: Option<String>,
    /// Used when a mutation names no family of its own.
    pub column_family: Option<String>,
    pub column_qualifier: Option<String>,
    pub delete_all_versions: Option<bool>,
    pub batch_size: Option<usize>,
    pub check: Option<CheckOptions>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationConfig {
    pub table: String,
    pub column_family: Option<String>,
    pub column_qualifier: Option<String>,
    pub delete_all_versions: bool,
    pub batch_size: usize,
    /// Guards deletes.
    pub check: Option<CheckCondition>,
}

impl MutationOptions {
    pub fn validate(self) -> std::result::Result<MutationConfig, ConfigError> {
        let table = self.table.ok_or_else(|| ConfigError::Missing("table to mutate".to_string()))?;
        if self.column_qualifier.is_some() && self.column_family.is_none() {
            return Err(ConfigError::invalid_value("column_qualifier", "needs column_family"));
        }
        let batch_size = self.batch_size.unwrap_or(DEFAULT_MUTATION_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be at least 1"));
        }
        Ok(MutationConfig {
            table,
            column_family: self.column_family,
            column_qualifier: self.column_qualifier,
            delete_all_versions: self.delete_all_versions.unwrap_or(false),
            batch_size,
            check: self.check.map(CheckOptions::validate).transpose()?,
        })
    }
}

/// One mutation request. `table`, `column_family` and `column_qualifier`
/// override the connector's configuration for this request only.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Mutation {
    Delete {
        row: String,
        #[serde(default)]
        column_family: Option<String>,
        #[serde(default)]
        column_qualifier: Option<String>,
        #[serde(default)]
        all_versions: Option<bool>,
        #[serde(default)]
        table: Option<String>,
    },
    Increment {
        row: String,
        #[serde(default)]
        column_family: Option<String>,
        #[serde(default)]
        column_qualifier: Option<String>,
        delta: i64,
        #[serde(default)]
        table: Option<String>,
    },
}

impl Mutation {
    pub fn delete(row: impl Into<String>) -> Self {
        Mutation::Delete {
            row: row.into(),
            column_family: None,
            column_qualifier: None,
            all_versions: None,
            table: None,
        }
    }

    pub fn increment(row: impl Into<String>, delta: i64) -> Self {
        Mutation::Increment { row: row.into(), column_family: None, column_qualifier: None, delta, table: None }
    }

    pub fn columns(mut self, family: Option<String>, qualifier: Option<String>) -> Self {
        match &mut self {
            Mutation::Delete { column_family, column_qualifier, .. }
            | Mutation::Increment { column_family, column_qualifier, .. } => {
                *column_family = family;
                *column_qualifier = qualifier;
            }
        }
        self
    }

    pub fn in_table(mut self, name: impl Into<String>) -> Self {
        match &mut self {
            Mutation::Delete { table, .. } | Mutation::Increment { table, .. } => *table = Some(name.into()),
        }
        self
    }

    pub fn row(&self) -> &str {
        match self {
            Mutation::Delete { row, .. } | Mutation::Increment { row, .. } => row,
        }
    }

    fn table(&self) -> Option<&str> {
        match self {
            Mutation::Delete { table, .. } | Mutation::Increment { table, .. } => table.as_deref(),
        }
    }
}

pub struct MutationConnector {
    client: StorageClient,
    config: MutationConfig,
}

impl MutationConnector {
    pub fn new(client: StorageClient, config: MutationConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &MutationConfig {
        &self.config
    }

    /// Deletes the latest version of every matching cell, or all of their
    /// versions when `all_versions` is set. With no family every column of
    /// the row matches, so `all_versions` then removes the whole row.
    pub async fn delete(
        &self,
        row: &str,
        column_family: Option<&str>,
        column_qualifier: Option<&str>,
        all_versions: bool,
    ) -> Result<MutationResult> {
        self.delete_in(&self.config.table, row, column_family, column_qualifier, all_versions).await
    }

    /// Adds `delta` to a counter cell; a missing cell counts from zero.
    pub async fn increment(
        &self,
        row: &str,
        column_family: Option<&str>,
        column_qualifier: Option<&str>,
        delta: i64,
    ) -> Result<MutationResult> {
        self.increment_in(&self.config.table, row, column_family, column_qualifier, delta).await
    }

    async fn delete_in(
        &self,
        table: &str,
        row: &str,
        column_family: Option<&str>,
        column_qualifier: Option<&str>,
        all_versions: bool,
    ) -> Result<MutationResult> {
        let family = column_family.or(self.config.column_family.as_deref());
        let qualifier = column_qualifier.or(self.config.column_qualifier.as_deref());
        let columns = ColumnFilter::new(family.map(str::to_string), qualifier.map(str::to_string));
        let applied = self.client.delete(table, row, columns, all_versions, self.config.check.clone()).await?;
        debug!("Delete of row '{}' in {} applied: {}", row, table, applied);
        Ok(if applied {
            MutationResult::ok(row)
        } else {
            MutationResult::failed(row, "check failed")
        })
    }

    async fn increment_in(
        &self,
        table: &str,
        row: &str,
        column_family: Option<&str>,
        column_qualifier: Option<&str>,
        delta: i64,
    ) -> Result<MutationResult> {
        let family = column_family.or(self.config.column_family.as_deref());
        let qualifier = column_qualifier.or(self.config.column_qualifier.as_deref());
        let (Some(family), Some(qualifier)) = (family, qualifier) else {
            return Ok(MutationResult::failed(row, "increment needs a column family and qualifier"));
        };
        let value = self.client.increment(table, row, family, qualifier, delta).await?;
        debug!("Counter {}:{} of row '{}' in {} is now {}", family, qualifier, row, table, value);
        Ok(MutationResult::counter(row, value))
    }

    /// Applies one mutation. Failures confined to its row come back as a
    /// `success=false` result.
    pub async fn apply(&self, mutation: &Mutation) -> Result<MutationResult> {
        let table = mutation.table().unwrap_or(&self.config.table);
        let result = match mutation {
            Mutation::Delete { row, column_family, column_qualifier, all_versions, .. } => {
                self.delete_in(
                    table,
                    row,
                    column_family.as_deref(),
                    column_qualifier.as_deref(),
                    all_versions.unwrap_or(self.config.delete_all_versions),
                )
                .await
            }
            Mutation::Increment { row, column_family, column_qualifier, delta, .. } => {
                self.increment_in(table, row, column_family.as_deref(), column_qualifier.as_deref(), *delta)
                    .await
            }
        };
        per_record(mutation.row(), result)
    }

    /// Applies mutations in order, `batch_size` at a time, with one result
    /// per mutation. A row the store rejects is reported in its result and
    /// the rest of the batch still runs; only credential, configuration and
    /// I/O failures stop it.
    pub async fn apply_batch(&self, mutations: &[Mutation]) -> Result<Vec<MutationResult>> {
        let mut results = Vec::with_capacity(mutations.len());
        for (n, batch) in mutations.chunks(self.config.batch_size).enumerate() {
            for mutation in batch {
                results.push(self.apply(mutation).await?);
            }
            debug!("Applied batch {} of {} mutations", n, batch.len());
        }
        Ok(results)
    }
}
