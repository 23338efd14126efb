//! Cellar command line
//!
//! One subcommand per connector operation. Every result is printed as one
//! JSON object per line; logs go to stderr.

use anyhow::{anyhow, bail, Context};
use cellar_client::StorageClient;
use cellar_common::{EntryDescriptor, Punctuation, Record, RowRecord};
use cellar_engine::{
    GetRequest, Mutation, MutationConfig, MutationConnector, ReadConfig, ReadConnector, ScanConfig, ScanCursor,
    WriteConfig, WriteConnector, WriteTarget,
};
use cellar_worker::{run_until_interrupted, Output, Pipeline, Validated};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file; defaults to `CELLAR_CONFIG_PATH` or the bundled default.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// List new entries once, or keep scanning until interrupted.
    Scan {
        /// Run the configured pipeline until Ctrl-C.
        #[arg(long)]
        follow: bool,
    },
    /// Read one file or row with the configured read connector. The column
    /// and table options apply to table reads only.
    Read {
        name: String,
        #[arg(long)]
        family: Option<String>,
        #[arg(long)]
        qualifier: Option<String>,
        #[arg(long)]
        table: Option<String>,
    },
    /// Write stdin through the configured write connector. In file mode each
    /// line is a record and an empty line ends a window; in table mode each
    /// line is a JSON row record.
    Write,
    /// Delete cells of one row.
    Delete {
        row: String,
        #[arg(long)]
        family: Option<String>,
        #[arg(long)]
        qualifier: Option<String>,
        #[arg(long)]
        all_versions: bool,
        #[arg(long)]
        table: Option<String>,
    },
    /// Add a delta to a counter cell.
    Increment {
        row: String,
        #[arg(allow_negative_numbers = true)]
        delta: i64,
        #[arg(long)]
        family: Option<String>,
        #[arg(long)]
        qualifier: Option<String>,
        #[arg(long)]
        table: Option<String>,
    },
}

fn emit(out: &mut impl Write, output: &Output) -> anyhow::Result<()> {
    let line = serde_json::to_string(output).context("encoding output")?;
    writeln!(out, "{}", line)?;
    Ok(())
}

/// Runs one tick on every channel and prints what was discovered.
pub async fn scan_once(client: &StorageClient, scan: ScanConfig, out: &mut impl Write) -> anyhow::Result<usize> {
    let mut found = 0;
    for mut cursor in ScanCursor::sharded(client.clone(), scan) {
        for descriptor in cursor.tick().await? {
            emit(out, &Output::Entry(descriptor))?;
            found += 1;
        }
    }
    Ok(found)
}

/// Runs the configured pipeline until it drains or Ctrl-C asks it to stop.
pub async fn follow(client: &StorageClient, validated: Validated, capacity: usize) -> anyhow::Result<()> {
    let (sink, outputs) = mpsc::channel::<Output>(capacity);
    let pipeline = Pipeline::from_config(client, validated, capacity, sink);
    if pipeline.is_idle() {
        warn!("Nothing to follow: configure a scan section");
        return Ok(());
    }
    Ok(run_until_interrupted(pipeline, outputs).await?)
}

/// Reads `request.row` as a file or a row key, depending on the read
/// settings. Column and table overrides need a table read connector.
pub async fn read(
    client: &StorageClient,
    read: ReadConfig,
    request: GetRequest,
    out: &mut impl Write,
) -> anyhow::Result<usize> {
    let plain_file = matches!(read, ReadConfig::Files { .. }) && request == GetRequest::new(request.row.as_str());
    let connector = ReadConnector::new(client.clone(), read);
    let records = if plain_file {
        connector.read(&EntryDescriptor::file(request.row.as_str(), 0, 0)).await?
    } else {
        connector.get(&request).await?
    };
    let mut count = 0;
    for record in records {
        emit(out, &Output::Record(record))?;
        count += 1;
    }
    Ok(count)
}

/// Feeds `input` to a write connector and prints every summary it produces.
pub async fn write(
    client: &StorageClient,
    write: WriteConfig,
    input: impl AsyncBufRead + Unpin,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let rows = matches!(write.target, WriteTarget::Table { .. });
    let connector = WriteConnector::new(client.clone(), write);
    let mut lines = input.lines();
    let mut n = 0usize;
    while let Some(line) = lines.next_line().await? {
        n += 1;
        let summaries = if line.is_empty() {
            connector.punctuate(Punctuation::Window).await?
        } else if rows {
            let row: RowRecord =
                serde_json::from_str(&line).with_context(|| format!("line {} is not a row record", n))?;
            connector.write(Record::Row(row)).await?
        } else {
            connector.write(Record::Line(line)).await?
        };
        for summary in summaries {
            emit(out, &Output::Written(summary))?;
        }
    }
    for summary in connector.close().await? {
        emit(out, &Output::Written(summary))?;
    }
    Ok(())
}

/// Applies one mutation and prints its result.
pub async fn mutate(
    client: &StorageClient,
    mutation: MutationConfig,
    request: Mutation,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let connector = MutationConnector::new(client.clone(), mutation);
    let result = connector.apply(&request).await?;
    emit(out, &Output::Mutated(result))
}

/// Dispatches a parsed command against an authenticated client.
pub async fn execute(
    command: Command,
    client: &StorageClient,
    validated: Validated,
    capacity: usize,
) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    match command {
        Command::Scan { follow: true } => {
            if validated.scan.is_none() {
                bail!("no scan section configured");
            }
            follow(client, validated, capacity).await
        }
        Command::Scan { follow: false } => {
            let scan = validated.scan.ok_or_else(|| anyhow!("no scan section configured"))?;
            let found = scan_once(client, scan, &mut stdout).await?;
            info!("Discovered {} entries", found);
            Ok(())
        }
        Command::Read { name, family, qualifier, table } => {
            let config = validated.read.ok_or_else(|| anyhow!("no read section configured"))?;
            let request = GetRequest { row: name, column_family: family, column_qualifier: qualifier, table };
            read(client, config, request, &mut stdout).await?;
            Ok(())
        }
        Command::Write => {
            let config = validated.write.ok_or_else(|| anyhow!("no write section configured"))?;
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            write(client, config, stdin, &mut stdout).await
        }
        Command::Delete { row, family, qualifier, all_versions, table } => {
            let config = validated.mutation.ok_or_else(|| anyhow!("no mutation section configured"))?;
            let request = Mutation::Delete {
                row,
                column_family: family,
                column_qualifier: qualifier,
                all_versions: all_versions.then_some(true),
                table,
            };
            mutate(client, config, request, &mut stdout).await
        }
        Command::Increment { row, delta, family, qualifier, table } => {
            let config = validated.mutation.ok_or_else(|| anyhow!("no mutation section configured"))?;
            let request = Mutation::Increment { row, column_family: family, column_qualifier: qualifier, delta, table };
            mutate(client, config, request, &mut stdout).await
        }
    }
}
