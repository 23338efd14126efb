//! Worker crate
//!
//! Runs the connectors as long-lived tasks: scan channels with a bounded
//! fetch fan-out, ordered write and mutation queues, timed rotation and
//! graceful shutdown. Settings come from a TOML file layered with
//! `CELLAR__…` environment overrides.

pub mod backend;
pub mod config;
pub mod error;
pub mod pipeline;

pub use backend::backend_for;
pub use config::{ConnectionSettings, Settings, Validated};
pub use error::{Result, WorkerError};
pub use pipeline::{run_mutations, run_until_interrupted, run_writer, Input, Output, Pipeline, ShutdownTrigger};

use cellar_client::{EnvSnapshot, StorageClient};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Resolves the connection from `settings` (falling back to `env`), picks
/// the store transport and authenticates.
pub async fn connect(settings: &Settings, env: &EnvSnapshot) -> Result<StorageClient> {
    let config = settings.connection.resolve(env)?;
    let backend = backend_for(&config)?;
    Ok(StorageClient::connect_with_options(config, backend, settings.client.clone()).await?)
}

/// Logs to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
