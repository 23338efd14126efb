use crate::error::{Result, WorkerError};
use cellar_client::{ConnectionConfig, MemoryBackend, StorageBackend};
use cellar_connector_filesystem::LocalFsBackend;
use cellar_connector_webhbase::RestBackend;
use std::sync::Arc;
use tracing::info;

/// Picks the store transport for an endpoint scheme.
///
/// `file://` endpoints are served from the local directory they name,
/// `memory://` from a fresh in-process store, and `webhbase://` or `hbase://`
/// through the HBase REST gateway.
pub fn backend_for(config: &ConnectionConfig) -> Result<Arc<dyn StorageBackend>> {
    let endpoint = config.endpoint();
    match config.scheme() {
        "file" => {
            let root = endpoint.trim_start_matches("file://");
            info!("Using local store at {}", root);
            Ok(Arc::new(LocalFsBackend::new(root)))
        }
        "memory" => {
            info!("Using in-process store {}", endpoint);
            Ok(Arc::new(MemoryBackend::new()))
        }
        "webhbase" | "hbase" => Ok(Arc::new(RestBackend::from_config(config)?)),
        _ => Err(WorkerError::UnsupportedEndpoint(endpoint.to_string())),
    }
}
