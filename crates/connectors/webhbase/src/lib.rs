//! HBase REST gateway transport
//!
//! Serves `webhbase://` endpoints (the gateway behind service credentials,
//! reached over HTTPS with basic auth) and `hbase://` endpoints from a site
//! file (the cluster's own REST server). Row operations map onto the gateway's
//! JSON resources; file operations are not offered by the gateway.

mod cellset;

pub use cellset::{CellSet, CellModel, RowModel, ScannerModel};

use cellar_client::{
    Cell, CheckCondition, ColumnFilter, ConnectionConfig, CredentialSource, Request, Response, RowRange,
    RowStat, Secret, SessionToken, StorageBackend, SERVICE_SCHEME, SERVICE_URL_PROPERTY,
};
use cellar_common::{ConfigError, Error, Result};
use cellset::{column_spec, encode, versions_param};
use reqwest::header::{ACCEPT, LOCATION};
use reqwest::{Method, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Port of the cluster REST server when the site file does not name one.
pub const DEFAULT_REST_PORT: u16 = 8080;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_BATCH: u32 = 1000;
const INCREMENT_ATTEMPTS: usize = 8;
const JSON: &str = "application/json";

#[derive(Debug)]
pub struct RestBackend {
    http: reqwest::Client,
    base: Url,
    credentials: Option<(String, Secret)>,
}

impl RestBackend {
    pub fn new(base: Url, credentials: Option<(String, Secret)>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("cellar/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::invalid_value("http client", e.to_string()))?;
        Ok(Self { http, base, credentials })
    }

    /// Resolves the gateway URL and credentials for a `webhbase://` or
    /// `hbase://` connection.
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        let base = base_url(config)?;
        let credentials = match config.source() {
            CredentialSource::Service { user, password } => Some((user.clone(), password.clone())),
            CredentialSource::SiteFile { .. } => None,
        };
        info!("Using REST gateway at {}", base);
        Self::new(base, credentials)
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ConfigError::invalid_value("endpoint", format!("'{}' cannot take a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url).header(ACCEPT, JSON);
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, Some(password.expose())),
            None => builder,
        }
    }

    /// Sends `builder`, turning transport failures and error statuses into
    /// the store's error taxonomy. 2xx and 304 come back as responses.
    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, what, &body))
    }

    async fn cell_set(&self, response: reqwest::Response) -> Result<Vec<Cell>> {
        let set: CellSet = response.json().await.map_err(transport_error)?;
        set.into_cells()
    }

    async fn get(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnFilter,
        max_versions: u32,
        min_timestamp: Option<i64>,
    ) -> Result<Vec<Cell>> {
        let spec = column_spec(columns);
        let mut segments = vec![table, row];
        segments.extend(spec.as_deref());
        let mut url = self.url(&segments)?;
        url.query_pairs_mut().append_pair("v", &versions_param(max_versions).to_string());

        let what = format!("row '{}' in table '{}'", row, table);
        let response = self.send(self.request(Method::GET, url), &what).await?;
        let mut cells = self.cell_set(response).await?;
        cells.retain(|cell| keep(cell, columns, min_timestamp));
        Ok(cells)
    }

    async fn latest(&self, table: &str, row: &str, family: &str, qualifier: &str) -> Result<Option<Vec<u8>>> {
        let columns = ColumnFilter::new(Some(family.to_string()), Some(qualifier.to_string()));
        match self.get(table, row, &columns, 1, None).await {
            Ok(cells) => Ok(cells.into_iter().next().map(|cell| cell.value)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Opens a scanner, drains it and releases it. Range bounds and the
    /// prefix are also applied locally, since the gateway only knows start
    /// and end rows.
    async fn scan(
        &self,
        table: &str,
        range: &RowRange,
        columns: &ColumnFilter,
        max_versions: u32,
        min_timestamp: Option<i64>,
    ) -> Result<Vec<Cell>> {
        let model = ScannerModel {
            start_row: range.start_row.as_ref().or(range.prefix.as_ref()).map(encode),
            end_row: range.end_row.as_ref().map(encode),
            columns: column_spec(columns).map(encode).into_iter().collect(),
            batch: SCAN_BATCH,
            max_versions: versions_param(max_versions),
        };
        let what = format!("table '{}'", table);
        let created = self.send(self.request(Method::PUT, self.url(&[table, "scanner"])?).json(&model), &what).await?;
        let location = created
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Error::Remote(format!("scanner on {} came back without a location", what)))?;
        let scanner = self
            .base
            .join(location)
            .map_err(|e| Error::Remote(format!("scanner location '{}': {}", location, e)))?;

        let mut cells = Vec::new();
        let drained = self.drain(&scanner, &what, &mut cells).await;
        if let Err(err) = self.send(self.request(Method::DELETE, scanner.clone()), "scanner").await {
            warn!("Could not release scanner {}: {}", scanner, err);
        }
        drained?;

        cells.retain(|cell| range.contains(&cell.row) && keep(cell, columns, min_timestamp));
        Ok(cells)
    }

    async fn drain(&self, scanner: &Url, what: &str, cells: &mut Vec<Cell>) -> Result<()> {
        loop {
            let response = self.send(self.request(Method::GET, scanner.clone()), what).await?;
            if response.status() == StatusCode::NO_CONTENT {
                return Ok(());
            }
            let batch = self.cell_set(response).await?;
            debug!("Scanner on {} returned {} cells", what, batch.len());
            cells.extend(batch);
        }
    }

    async fn list_rows(&self, table: &str, range: &RowRange) -> Result<Vec<RowStat>> {
        let cells = self.scan(table, range, &ColumnFilter::all(), 0, None).await?;
        let mut rows: Vec<RowStat> = Vec::new();
        for cell in cells {
            match rows.last_mut() {
                Some(last) if last.row == cell.row => {
                    last.versions += 1;
                    last.timestamp = last.timestamp.max(cell.timestamp);
                }
                _ => rows.push(RowStat { row: cell.row, versions: 1, timestamp: cell.timestamp }),
            }
        }
        Ok(rows)
    }

    /// Stores one cell. A check travels as the last cell of a `check=put`
    /// document, with an empty value meaning the checked cell must be absent;
    /// the gateway answers 304 when the check fails.
    #[allow(clippy::too_many_arguments)]
    async fn put(
        &self,
        table: &str,
        row: &str,
        family: &str,
        qualifier: &str,
        value: &[u8],
        timestamp: Option<i64>,
        check: Option<&CheckCondition>,
    ) -> Result<bool> {
        let body = CellSet::row(row).with_cell(family, qualifier, timestamp, value);
        let column = format!("{}:{}", family, qualifier);
        let url = match check {
            None => self.url(&[table, row, column.as_str()])?,
            Some(_) => {
                let mut url = self.url(&[table, row])?;
                url.query_pairs_mut().append_pair("check", "put");
                url
            }
        };
        let body = match check {
            Some(check) => with_check(body, check),
            None => body,
        };
        let what = format!("row '{}' in table '{}'", row, table);
        let response = self.send(self.request(Method::PUT, url).json(&body), &what).await?;
        Ok(response.status() != StatusCode::NOT_MODIFIED)
    }

    /// With `all_versions` the addressed family, column or row is removed
    /// outright. Otherwise only the newest version of each matching column
    /// goes, one timestamped delete per column. A checked delete is a single
    /// `check=delete` call and always removes every version it addresses.
    async fn delete(
        &self,
        table: &str,
        row: &str,
        columns: &ColumnFilter,
        all_versions: bool,
        check: Option<&CheckCondition>,
    ) -> Result<bool> {
        let what = format!("row '{}' in table '{}'", row, table);
        let spec = column_spec(columns);
        let mut segments = vec![table, row];
        segments.extend(spec.as_deref());

        if let Some(check) = check {
            let mut url = self.url(&segments)?;
            url.query_pairs_mut().append_pair("check", "delete");
            let body = with_check(CellSet::row(row), check);
            let response = self.send(self.request(Method::PUT, url).json(&body), &what).await?;
            return Ok(response.status() != StatusCode::NOT_MODIFIED);
        }
        // A bare qualifier cannot be addressed, so those cells are found first.
        if all_versions && (columns.family.is_some() || columns.qualifier.is_none()) {
            self.send(self.request(Method::DELETE, self.url(&segments)?), &what).await?;
            return Ok(true);
        }

        let versions = if all_versions { 0 } else { 1 };
        let cells = match self.get(table, row, columns, versions, None).await {
            Ok(cells) => cells,
            Err(Error::NotFound(_)) => return Ok(true),
            Err(err) => return Err(err),
        };
        for cell in cells {
            let column = format!("{}:{}", cell.family, cell.qualifier);
            let timestamp = cell.timestamp.to_string();
            let url = self.url(&[table, row, column.as_str(), timestamp.as_str()])?;
            match self.send(self.request(Method::DELETE, url), &what).await {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    /// The gateway has no increment of its own, so the counter is read and
    /// swapped in with a checked put, retrying while other writers race it.
    async fn increment(&self, table: &str, row: &str, family: &str, qualifier: &str, delta: i64) -> Result<i64> {
        for attempt in 1..=INCREMENT_ATTEMPTS {
            let current = self.latest(table, row, family, qualifier).await?;
            let value = match &current {
                None => 0,
                Some(raw) => parse_counter(raw).ok_or_else(|| {
                    Error::Remote(format!("cell {}:{} of row '{}' does not hold a counter", family, qualifier, row))
                })?,
            };
            let next = value.checked_add(delta).ok_or_else(|| {
                Error::Remote(format!("counter {}:{} of row '{}' overflows", family, qualifier, row))
            })?;
            let check = CheckCondition {
                column_family: family.to_string(),
                column_qualifier: qualifier.to_string(),
                expected: current.map(|raw| String::from_utf8_lossy(&raw).into_owned()),
            };
            let stored = next.to_string();
            if self.put(table, row, family, qualifier, stored.as_bytes(), None, Some(&check)).await? {
                return Ok(next);
            }
            debug!("Counter {}:{} of row '{}' moved under us (attempt {})", family, qualifier, row, attempt);
        }
        Err(Error::Remote(format!(
            "counter {}:{} of row '{}' kept changing; gave up after {} attempts",
            family, qualifier, row, INCREMENT_ATTEMPTS
        )))
    }
}

fn base_url(config: &ConnectionConfig) -> Result<Url> {
    let endpoint = Url::parse(config.endpoint())
        .map_err(|e| ConfigError::invalid_value("endpoint", format!("'{}': {}", config.endpoint(), e)))?;
    let host = endpoint
        .host_str()
        .ok_or_else(|| ConfigError::invalid_value("endpoint", format!("'{}' has no host", config.endpoint())))?;

    let raw = match config.scheme() {
        SERVICE_SCHEME => match config.property(SERVICE_URL_PROPERTY) {
            Some(service) => service.to_string(),
            None => format!("https://{}:{}/", host, endpoint.port().unwrap_or(443)),
        },
        "hbase" => {
            let secure = config.property("hbase.rest.ssl.enabled").is_some_and(|v| v.trim() == "true");
            let port = match config.property("hbase.rest.port") {
                Some(port) => {
                    port.trim().parse().map_err(|_| ConfigError::invalid_type("hbase.rest.port", "a port number"))?
                }
                // Without a REST host the endpoint port belongs to ZooKeeper.
                None if config.property("hbase.rest.host").is_none() && config.property("fs.defaultFS").is_none() => {
                    DEFAULT_REST_PORT
                }
                None => endpoint.port().unwrap_or(DEFAULT_REST_PORT),
            };
            format!("{}://{}:{}/", if secure { "https" } else { "http" }, host, port)
        }
        other => {
            return Err(ConfigError::invalid_value(
                "endpoint",
                format!("'{}' endpoints are not served by the REST gateway", other),
            )
            .into())
        }
    };
    Url::parse(&raw).map_err(|e| ConfigError::invalid_value("endpoint", format!("'{}': {}", raw, e)).into())
}

fn with_check(body: CellSet, check: &CheckCondition) -> CellSet {
    let expected = check.expected.as_deref().unwrap_or_default();
    body.with_cell(&check.column_family, &check.column_qualifier, None, expected.as_bytes())
}

fn keep(cell: &Cell, columns: &ColumnFilter, min_timestamp: Option<i64>) -> bool {
    columns.matches(&cell.family, &cell.qualifier) && min_timestamp.map_or(true, |min| cell.timestamp >= min)
}

/// Counters are stored as decimal text; 8-byte cells written by native
/// increments are read as big-endian longs.
fn parse_counter(raw: &[u8]) -> Option<i64> {
    if let Some(value) = std::str::from_utf8(raw).ok().and_then(|s| s.trim().parse().ok()) {
        return Some(value);
    }
    <[u8; 8]>::try_from(raw).ok().map(i64::from_be_bytes)
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else if err.is_decode() {
        Error::Remote(format!("unreadable gateway response: {}", err))
    } else {
        Error::Network(err.to_string())
    }
}

/// Maps a gateway status onto the error taxonomy. 401 means the credentials
/// were not accepted this time, so the client re-authenticates once.
pub fn status_error(status: StatusCode, what: &str, body: &str) -> Error {
    let detail = match body.trim() {
        "" => format!("{} answered {}", what, status),
        body => format!("{} answered {}: {}", what, status, body),
    };
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED => Error::SessionExpired,
        StatusCode::FORBIDDEN => Error::Auth(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Error::Timeout(detail),
        status if status.is_server_error() => Error::Network(detail),
        _ => Error::Remote(detail),
    }
}

#[async_trait::async_trait]
impl StorageBackend for RestBackend {
    async fn authenticate(&self, source: &CredentialSource) -> Result<SessionToken> {
        if let CredentialSource::SiteFile { keytab: Some(keytab), .. } = source {
            return Err(Error::Auth(format!(
                "the REST gateway transport cannot log in as {} with a keytab; use service credentials",
                keytab.principal
            )));
        }
        let url = self.url(&["version", "cluster"])?;
        match self.send(self.request(Method::GET, url), "REST gateway").await {
            Ok(_) => {}
            Err(Error::SessionExpired) => {
                return Err(Error::Auth(format!("{} rejected the credentials", self.base)));
            }
            Err(err) => return Err(err),
        }
        let value = match &self.credentials {
            Some((user, _)) => format!("basic:{}", user),
            None => "anonymous".to_string(),
        };
        Ok(SessionToken { value, expires_at: None })
    }

    async fn execute(&self, _session: &SessionToken, request: Request) -> Result<Response> {
        match request {
            Request::ListRows { table, range } => Ok(Response::Rows(self.list_rows(&table, &range).await?)),
            Request::Get { table, row, columns, max_versions, min_timestamp } => {
                Ok(Response::Cells(self.get(&table, &row, &columns, max_versions, min_timestamp).await?))
            }
            Request::Scan { table, range, columns, max_versions, min_timestamp } => {
                Ok(Response::Cells(self.scan(&table, &range, &columns, max_versions, min_timestamp).await?))
            }
            Request::Put { table, row, family, qualifier, value, timestamp, check } => {
                let applied = self.put(&table, &row, &family, &qualifier, &value, timestamp, check.as_ref()).await?;
                Ok(Response::Applied(applied))
            }
            Request::Delete { table, row, columns, all_versions, check } => {
                Ok(Response::Applied(self.delete(&table, &row, &columns, all_versions, check.as_ref()).await?))
            }
            Request::Increment { table, row, family, qualifier, delta } => {
                Ok(Response::Counter(self.increment(&table, &row, &family, &qualifier, delta).await?))
            }
            other => Err(Error::Remote(format!("the REST gateway does not support {} requests", other.op()))),
        }
    }
}
