//! The shared, authenticated client every connector issues requests through.

use crate::backend::{
    Cell, CheckCondition, ColumnFilter, FileStat, Request, Response, RowRange, RowStat,
    SessionToken, StorageBackend,
};
use crate::config::{ConnectionConfig, CredentialSource};
use crate::retry::RetryPolicy;
use cellar_common::{ConfigError, Error, Result};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    #[serde(deserialize_with = "secs")]
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30), retry: RetryPolicy::default() }
    }
}

fn secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Duration::from_secs_f64(f64::deserialize(deserializer)?.max(0.0)))
}

struct Session {
    token: SessionToken,
    /// Bumped on every refresh so concurrent callers holding the same stale
    /// token refresh only once.
    generation: u64,
}

struct ClientInner {
    config: ConnectionConfig,
    backend: Arc<dyn StorageBackend>,
    options: ClientOptions,
    session: RwLock<Session>,
}

/// Cheap to clone; all clones share one connection and session.
#[derive(Clone)]
pub struct StorageClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient").field("endpoint", &self.inner.config.endpoint()).finish()
    }
}

impl StorageClient {
    pub async fn connect(config: ConnectionConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        Self::connect_with_options(config, backend, ClientOptions::default()).await
    }

    /// Authenticates against `backend` and returns a client holding the session.
    ///
    /// Transient failures while authenticating are retried; rejected
    /// credentials fail with `Error::Auth`.
    pub async fn connect_with_options(
        config: ConnectionConfig,
        backend: Arc<dyn StorageBackend>,
        options: ClientOptions,
    ) -> Result<Self> {
        if let CredentialSource::SiteFile { keytab: Some(auth), .. } = config.source() {
            if !auth.keytab.is_file() {
                return Err(Error::Config(ConfigError::Missing(format!(
                    "keytab {} for principal {}",
                    auth.keytab.display(),
                    auth.principal
                ))));
            }
        }

        let token = options
            .retry
            .run("authenticate", || authenticate(backend.as_ref(), &config, options.request_timeout))
            .await?;
        info!("Connected to {}", config.endpoint());

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                backend,
                options,
                session: RwLock::new(Session { token, generation: 0 }),
            }),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Sends one request, retrying transient failures per the retry policy.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let op = request.op();
        self.inner.options.retry.run(op, || self.attempt(request.clone())).await
    }

    async fn attempt(&self, request: Request) -> Result<Response> {
        let (token, generation) = {
            let session = self.inner.session.read().await;
            (session.token.clone(), session.generation)
        };

        let token = if token.is_expired(Utc::now()) {
            self.refresh(generation).await?
        } else {
            token
        };

        match self.call(&token, request.clone()).await {
            Err(Error::SessionExpired) => {
                debug!("Session expired during {}, refreshing", request.op());
                let fresh = self.refresh(generation).await?;
                self.call(&fresh, request).await
            }
            other => other,
        }
    }

    async fn call(&self, token: &SessionToken, request: Request) -> Result<Response> {
        let op = request.op();
        match tokio::time::timeout(self.inner.options.request_timeout, self.inner.backend.execute(token, request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} did not complete within {:?}",
                op, self.inner.options.request_timeout
            ))),
        }
    }

    /// Re-authenticates unless someone else already did since `observed`.
    async fn refresh(&self, observed: u64) -> Result<SessionToken> {
        let mut session = self.inner.session.write().await;
        if session.generation == observed {
            session.token =
                authenticate(self.inner.backend.as_ref(), &self.inner.config, self.inner.options.request_timeout)
                    .await?;
            session.generation += 1;
            info!("Refreshed session for {} (generation {})", self.inner.config.endpoint(), session.generation);
        }
        Ok(session.token.clone())
    }

    pub async fn list_files(&self, directory: &str) -> Result<Vec<FileStat>> {
        match self.request(Request::ListFiles { directory: directory.to_string() }).await? {
            Response::Files(files) => Ok(files),
            other => Err(unexpected("list_files", other)),
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        match self.request(Request::ReadFile { path: path.to_string() }).await? {
            Response::Content(content) => Ok(content),
            other => Err(unexpected("read_file", other)),
        }
    }

    /// Writes (or overwrites) a file and returns its size.
    pub async fn write_file(&self, path: &str, content: Vec<u8>) -> Result<u64> {
        match self.request(Request::WriteFile { path: path.to_string(), content }).await? {
            Response::Written { size } => Ok(size),
            other => Err(unexpected("write_file", other)),
        }
    }

    pub async fn list_rows(&self, table: &str, range: RowRange) -> Result<Vec<RowStat>> {
        match self.request(Request::ListRows { table: table.to_string(), range }).await? {
            Response::Rows(rows) => Ok(rows),
            other => Err(unexpected("list_rows", other)),
        }
    }

    pub async fn get(
        &self,
        table: &str,
        row: &str,
        columns: ColumnFilter,
        max_versions: u32,
        min_timestamp: Option<i64>,
    ) -> Result<Vec<Cell>> {
        let request = Request::Get {
            table: table.to_string(),
            row: row.to_string(),
            columns,
            max_versions,
            min_timestamp,
        };
        match self.request(request).await? {
            Response::Cells(cells) => Ok(cells),
            other => Err(unexpected("get", other)),
        }
    }

    pub async fn scan(
        &self,
        table: &str,
        range: RowRange,
        columns: ColumnFilter,
        max_versions: u32,
        min_timestamp: Option<i64>,
    ) -> Result<Vec<Cell>> {
        let request = Request::Scan { table: table.to_string(), range, columns, max_versions, min_timestamp };
        match self.request(request).await? {
            Response::Cells(cells) => Ok(cells),
            other => Err(unexpected("scan", other)),
        }
    }

    /// Stores a new version of a cell. Returns `false` when `check` did not hold.
    #[allow(clippy::too_many_arguments)]
    pub async fn put(
        &self,
        table: &str,
        row: &str,
        family: &str,
        qualifier: &str,
        value: Vec<u8>,
        timestamp: Option<i64>,
        check: Option<CheckCondition>,
    ) -> Result<bool> {
        let request = Request::Put {
            table: table.to_string(),
            row: row.to_string(),
            family: family.to_string(),
            qualifier: qualifier.to_string(),
            value,
            timestamp,
            check,
        };
        match self.request(request).await? {
            Response::Applied(applied) => Ok(applied),
            other => Err(unexpected("put", other)),
        }
    }

    pub async fn delete(
        &self,
        table: &str,
        row: &str,
        columns: ColumnFilter,
        all_versions: bool,
        check: Option<CheckCondition>,
    ) -> Result<bool> {
        let request = Request::Delete {
            table: table.to_string(),
            row: row.to_string(),
            columns,
            all_versions,
            check,
        };
        match self.request(request).await? {
            Response::Applied(applied) => Ok(applied),
            other => Err(unexpected("delete", other)),
        }
    }

    pub async fn increment(&self, table: &str, row: &str, family: &str, qualifier: &str, delta: i64) -> Result<i64> {
        let request = Request::Increment {
            table: table.to_string(),
            row: row.to_string(),
            family: family.to_string(),
            qualifier: qualifier.to_string(),
            delta,
        };
        match self.request(request).await? {
            Response::Counter(value) => Ok(value),
            other => Err(unexpected("increment", other)),
        }
    }
}

async fn authenticate(
    backend: &dyn StorageBackend,
    config: &ConnectionConfig,
    timeout: Duration,
) -> Result<SessionToken> {
    match tokio::time::timeout(timeout, backend.authenticate(config.source())).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Authentication against {} timed out", config.endpoint());
            Err(Error::Timeout(format!("authenticate did not complete within {:?}", timeout)))
        }
    }
}

fn unexpected(op: &str, response: Response) -> Error {
    Error::Remote(format!("unexpected response to {}: {:?}", op, response))
}
