//! The four connectors.

pub mod mutation;
pub mod read;
pub mod scan;
pub mod write;

pub use mutation::{Mutation, MutationConfig, MutationConnector, MutationOptions};
pub use read::{FileFormat, GetRequest, ReadConfig, ReadConnector, ReadOptions, RecordIter};
pub use scan::{ScanConfig, ScanCursor, ScanOptions, ScanSource, ScanState, Watermark};
pub use write::{CheckOptions, WriteConfig, WriteConnector, WriteOptions, WriteTarget};

use cellar_common::{MutationResult, Result};
use tokio::sync::watch;
use tracing::warn;

/// Resolves once `shutdown` carries `true` or its sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Turns a failure confined to one row into a `success=false` result so the
/// rest of the batch keeps going. Credential, configuration and I/O errors
/// still propagate.
pub(crate) fn per_record(row: &str, result: Result<MutationResult>) -> Result<MutationResult> {
    match result {
        Err(err) if err.is_row_level() => {
            warn!("Mutation of row '{}' failed: {}", row, err);
            Ok(MutationResult::failed(row, err.to_string()))
        }
        other => other,
    }
}
