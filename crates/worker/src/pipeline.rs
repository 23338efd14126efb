//! Long-lived connector workers and the wiring between them.
//!
//! Every connector instance runs as its own task. A fatal error stops that
//! instance only; the others keep running until shutdown.
//!
//! Shutdown is graceful by default: cursors finish their current tick,
//! in-flight requests complete or time out, and writers flush what they have
//! buffered. `Pipeline::abort` skips all of that, and buffered writes are
//! lost.

use crate::config::Validated;
use crate::error::{Result, WorkerError};
use cellar_client::StorageClient;
use cellar_common::{EntryDescriptor, MutationResult, Punctuation, Record, WriteOutput};
use cellar_engine::{
    shutdown_requested, Mutation, MutationConfig, MutationConnector, ReadConfig, ReadConnector, ScanConfig,
    ScanCursor, WriteConfig, WriteConnector,
};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Everything a pipeline emits, one JSON object per item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Output {
    Entry(EntryDescriptor),
    Record(Record),
    Written(WriteOutput),
    Mutated(MutationResult),
}

/// What a write worker consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Record(Record),
    Punctuation(Punctuation),
}

/// Requests a graceful shutdown from outside the pipeline.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.0.send_replace(true);
    }
}

pub struct Pipeline {
    worker_id: String,
    capacity: usize,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: JoinSet<Result<()>>,
}

impl Pipeline {
    pub fn new(capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            capacity: capacity.max(1),
            shutdown: Arc::new(shutdown),
            tasks: JoinSet::new(),
        }
    }

    /// Starts whatever `validated` configures. A scan feeds the writer when
    /// both are present (discovered names become lines when there is no
    /// read step); otherwise its output goes to `sink`.
    pub fn from_config(
        client: &StorageClient,
        validated: Validated,
        capacity: usize,
        sink: mpsc::Sender<Output>,
    ) -> Self {
        let mut pipeline = Pipeline::new(capacity);
        let writer = validated.write.map(|write| pipeline.start_writer(client.clone(), write, sink.clone()));

        if let Some(scan) = validated.scan {
            match writer {
                Some(writer) => {
                    let (tx, rx) = mpsc::channel(pipeline.capacity);
                    pipeline.start_scan(client.clone(), scan, validated.read, tx);
                    pipeline.tasks.spawn(bridge(rx, writer));
                }
                None => pipeline.start_scan(client.clone(), scan, validated.read, sink.clone()),
            }
        }
        if validated.mutation.is_some() {
            info!("Mutation settings are used by the mutation commands, not by the pipeline");
        }
        pipeline
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger(self.shutdown.clone())
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// One cursor per channel, each with its own fetch fan-out.
    pub fn start_scan(
        &mut self,
        client: StorageClient,
        scan: ScanConfig,
        read: Option<ReadConfig>,
        out: mpsc::Sender<Output>,
    ) {
        let max_threads = scan.max_threads;
        let reader = read.map(|read| Arc::new(ReadConnector::new(client.clone(), read)));
        for cursor in ScanCursor::sharded(client, scan) {
            let (tx, rx) = mpsc::channel(self.capacity);
            let shutdown = self.shutdown_signal();
            self.tasks.spawn(async move { cursor.run(tx, shutdown).await.map_err(WorkerError::from) });
            self.tasks.spawn(fetch(reader.clone(), rx, max_threads, out.clone()));
        }
        info!("Worker {} started scanning", self.worker_id);
    }

    /// Returns the writer's ordered input queue. Summaries go to `out`.
    pub fn start_writer(&mut self, client: StorageClient, write: WriteConfig, out: mpsc::Sender<Output>) -> mpsc::Sender<Input> {
        let (summary_tx, mut summary_rx) = mpsc::channel(self.capacity);
        let connector = Arc::new(WriteConnector::new(client, write).with_output(summary_tx));
        let (tx, rx) = mpsc::channel(self.capacity);
        self.tasks.spawn(run_writer(connector, rx, self.shutdown_signal()));
        self.tasks.spawn(async move {
            while let Some(summary) = summary_rx.recv().await {
                if out.send(Output::Written(summary)).await.is_err() {
                    break;
                }
            }
            Ok(())
        });
        tx
    }

    /// Returns the mutation worker's ordered input queue. Results go to `out`.
    pub fn start_mutations(
        &mut self,
        client: StorageClient,
        mutation: MutationConfig,
        out: mpsc::Sender<Output>,
    ) -> mpsc::Sender<Mutation> {
        let connector = Arc::new(MutationConnector::new(client, mutation));
        let (tx, rx) = mpsc::channel(self.capacity);
        self.tasks.spawn(run_mutations(connector, rx, out, self.shutdown_signal()));
        tx
    }

    /// Asks every worker to stop after flushing.
    pub fn shutdown(&self) {
        info!("Worker {} shutting down", self.worker_id);
        self.shutdown.send_replace(true);
    }

    /// Stops every worker at once. Buffered, unflushed writes are dropped.
    pub fn abort(&mut self) {
        warn!("Worker {} aborting; unflushed writes are lost", self.worker_id);
        self.tasks.abort_all();
    }

    /// Waits for every worker, returning the first failure once all are done.
    pub async fn join(mut self) -> Result<()> {
        let mut first = None;
        while let Some(joined) = self.tasks.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Ok(()),
                Err(err) => Err(WorkerError::from(err)),
            };
            if let Err(err) = outcome {
                error!("Worker {} lost a connector: {}", self.worker_id, err);
                first.get_or_insert(err);
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn bridge(mut scanned: mpsc::Receiver<Output>, writer: mpsc::Sender<Input>) -> Result<()> {
    while let Some(output) = scanned.recv().await {
        let input = match output {
            Output::Record(record) => Input::Record(record),
            Output::Entry(descriptor) => Input::Record(Record::Line(descriptor.name)),
            other => {
                debug!("Not forwarding {:?} to the writer", other);
                continue;
            }
        };
        if writer.send(input).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Reads descriptors in arrival order with up to `max_threads` reads in flight.
async fn fetch(
    reader: Option<Arc<ReadConnector>>,
    mut descriptors: mpsc::Receiver<EntryDescriptor>,
    max_threads: usize,
    out: mpsc::Sender<Output>,
) -> Result<()> {
    let Some(reader) = reader else {
        while let Some(descriptor) = descriptors.recv().await {
            if out.send(Output::Entry(descriptor)).await.is_err() {
                break;
            }
        }
        return Ok(());
    };

    let mut fetched = ReceiverStream::new(descriptors)
        .map(|descriptor| {
            let reader = reader.clone();
            async move {
                let records = reader.read(&descriptor).await;
                (descriptor, records)
            }
        })
        .buffered(max_threads.max(1));

    while let Some((descriptor, records)) = fetched.next().await {
        match records {
            Ok(records) => {
                for record in records {
                    if out.send(Output::Record(record)).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Err(err) if err.is_fatal() => {
                error!("Read connector stopped at {}: {}", descriptor.name, err);
                return Err(err.into());
            }
            Err(err) => warn!("Skipping {}: {}", descriptor.name, err),
        }
    }
    Ok(())
}

/// Applies inputs in arrival order. On shutdown or end of input the open
/// destination is flushed, after any timed rotation under way completes.
pub async fn run_writer(
    connector: Arc<WriteConnector>,
    mut input: mpsc::Receiver<Input>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (stop_timer, timer_stop) = watch::channel(false);
    let timer = connector
        .config()
        .policy
        .rotation_period()
        .map(|period| WriteConnector::spawn_rotation_timer(connector.clone(), period, timer_stop));

    let outcome = loop {
        let next = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => None,
            next = input.recv() => next,
        };
        let Some(next) = next else {
            break Ok(());
        };
        let step = match next {
            Input::Record(record) => connector.write(record).await,
            Input::Punctuation(punctuation) => connector.punctuate(punctuation).await,
        };
        match step {
            Ok(_) => {}
            Err(err) if err.is_fatal() => {
                error!("Write connector stopped: {}", err);
                break Err(err);
            }
            Err(err) => warn!("Write failed, records stay buffered: {}", err),
        }
    };

    stop_timer.send_replace(true);
    if let Some(timer) = timer {
        timer.await?;
    }
    outcome?;
    connector.close().await?;
    Ok(())
}

/// Applies mutations in arrival order, grouping whatever is already queued
/// into batches of up to `batch_size`.
pub async fn run_mutations(
    connector: Arc<MutationConnector>,
    mut input: mpsc::Receiver<Mutation>,
    out: mpsc::Sender<Output>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let batch_size = connector.config().batch_size;
    loop {
        let first = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => None,
            next = input.recv() => next,
        };
        let Some(first) = first else {
            return Ok(());
        };
        let mut batch = vec![first];
        while batch.len() < batch_size {
            match input.try_recv() {
                Ok(mutation) => batch.push(mutation),
                Err(_) => break,
            }
        }

        // Rejected rows come back as failed results; an error here means the
        // connector itself can no longer work.
        let results = connector.apply_batch(&batch).await.map_err(|err| {
            error!("Mutation connector stopped: {}", err);
            err
        })?;
        for result in results {
            if out.send(Output::Mutated(result)).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Runs `pipeline` until it drains or Ctrl-C asks it to stop, printing every
/// output as one JSON line on stdout.
pub async fn run_until_interrupted(pipeline: Pipeline, mut outputs: mpsc::Receiver<Output>) -> Result<()> {
    info!("Worker {} running", pipeline.worker_id());
    let printer = tokio::spawn(async move {
        while let Some(output) = outputs.recv().await {
            match serde_json::to_string(&output) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Cannot encode output: {}", e),
            }
        }
    });

    let trigger = pipeline.shutdown_trigger();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, flushing before exit");
            trigger.fire();
        }
    });

    let result = pipeline.join().await;
    interrupt.abort();
    printer.await?;
    result
}
