//! Client crate
//!
//! Owns the authenticated connection to the store: connection configuration and
//! credential resolution, the `StorageBackend` seam, retry policy and the shared
//! `StorageClient` every connector issues requests through.

pub mod backend;
pub mod client;
pub mod config;
pub mod env;
pub mod memory;
pub mod retry;

pub use backend::{
    Cell, CheckCondition, ColumnFilter, FileStat, Request, Response, RowRange, RowStat,
    SessionToken, StorageBackend,
};
pub use client::{ClientOptions, StorageClient};
pub use config::{ConnectionConfig, CredentialSource, KeytabAuth, Secret, SERVICE_SCHEME, SERVICE_URL_PROPERTY};
pub use env::{resolve_site_config, EnvSnapshot};
pub use memory::{Fault, MemoryBackend};
pub use retry::RetryPolicy;
