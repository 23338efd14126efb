//! In-process column store.
//!
//! Tables of rows, rows of cells keyed by (family, qualifier), cells of
//! timestamped versions; plus a flat namespace of file entries. Serves
//! `memory://` endpoints and every connector test. Faults can be queued to
//! exercise retry, timeout and session-refresh paths.

use crate::backend::{
    Cell, CheckCondition, ColumnFilter, FileStat, Request, Response, RowRange, RowStat,
    SessionToken, StorageBackend,
};
use crate::config::CredentialSource;
use cellar_common::{Error, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// A failure the backend should produce on its next call.
#[derive(Debug, Clone)]
pub enum Fault {
    Network,
    /// Sleep before answering, long enough to trip the client's request timeout.
    Stall(Duration),
    Remote(String),
    /// Invalidate every live session before answering.
    ExpireSessions,
}

#[derive(Debug, Clone)]
struct Version {
    timestamp: i64,
    value: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Column {
    family: String,
    qualifier: String,
    /// Newest first.
    versions: Vec<Version>,
}

#[derive(Debug, Default)]
struct Row {
    /// In the order each column was first written.
    columns: Vec<Column>,
}

impl Row {
    fn latest(&self, family: &str, qualifier: &str) -> Option<&[u8]> {
        self.columns
            .iter()
            .find(|c| c.family == family && c.qualifier == qualifier)
            .and_then(|c| c.versions.first())
            .map(|v| v.value.as_slice())
    }

    fn put(&mut self, family: &str, qualifier: &str, timestamp: i64, value: Vec<u8>) {
        let existing = self
            .columns
            .iter()
            .position(|c| c.family == family && c.qualifier == qualifier);
        let idx = match existing {
            Some(idx) => idx,
            None => {
                self.columns.push(Column {
                    family: family.to_string(),
                    qualifier: qualifier.to_string(),
                    versions: Vec::new(),
                });
                self.columns.len() - 1
            }
        };
        let column = &mut self.columns[idx];
        match column.versions.binary_search_by(|v| timestamp.cmp(&v.timestamp)) {
            Ok(idx) => column.versions[idx].value = value,
            Err(idx) => column.versions.insert(idx, Version { timestamp, value }),
        }
    }

    fn version_count(&self) -> u64 {
        self.columns.iter().map(|c| c.versions.len() as u64).sum()
    }

    fn newest_timestamp(&self) -> i64 {
        self.columns
            .iter()
            .filter_map(|c| c.versions.first())
            .map(|v| v.timestamp)
            .max()
            .unwrap_or_default()
    }

    fn cells(&self, key: &str, columns: &ColumnFilter, max_versions: u32, min_ts: Option<i64>) -> Vec<Cell> {
        let limit = if max_versions == 0 { usize::MAX } else { max_versions as usize };
        self.columns
            .iter()
            .filter(|c| columns.matches(&c.family, &c.qualifier))
            .flat_map(move |c| {
                c.versions
                    .iter()
                    .filter(move |v| min_ts.map_or(true, |min| v.timestamp >= min))
                    .take(limit)
                    .map(move |v| Cell {
                        row: key.to_string(),
                        family: c.family.clone(),
                        qualifier: c.qualifier.clone(),
                        timestamp: v.timestamp,
                        value: v.value.clone(),
                    })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<String, Row>,
}

#[derive(Debug)]
struct FileEntry {
    content: Vec<u8>,
    modified: i64,
}

#[derive(Debug, Default)]
struct Store {
    tables: HashMap<String, Table>,
    files: BTreeMap<String, FileEntry>,
}

impl Store {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::Remote(format!("table '{}' does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::Remote(format!("table '{}' does not exist", name)))
    }
}

fn check_holds(row: Option<&Row>, check: &CheckCondition) -> bool {
    let current = row.and_then(|r| r.latest(&check.column_family, &check.column_qualifier));
    current == check.expected.as_deref().map(str::as_bytes)
}

pub struct MemoryBackend {
    store: RwLock<Store>,
    users: HashMap<String, String>,
    principals: HashSet<String>,
    session_ttl: Option<Duration>,
    sessions: Mutex<HashSet<String>>,
    faults: Mutex<VecDeque<Fault>>,
    clock: AtomicI64,
    executed: AtomicU64,
    logins: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// An open store: any credentials are accepted until users or principals
    /// are registered.
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store::default()),
            users: HashMap::new(),
            principals: HashSet::new(),
            session_ttl: None,
            sessions: Mutex::new(HashSet::new()),
            faults: Mutex::new(VecDeque::new()),
            clock: AtomicI64::new(0),
            executed: AtomicU64::new(0),
            logins: AtomicU64::new(0),
        }
    }

    pub fn with_user(mut self, user: &str, password: &str) -> Self {
        self.users.insert(user.to_string(), password.to_string());
        self
    }

    pub fn with_principal(mut self, principal: &str) -> Self {
        self.principals.insert(principal.to_string());
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    pub async fn create_table(&self, name: &str) {
        let mut store = self.store.write().await;
        store.tables.entry(name.to_string()).or_default();
    }

    /// Places a file entry directly, with an explicit modification time.
    pub async fn insert_file(&self, path: &str, content: impl Into<Vec<u8>>, modified: i64) {
        let mut store = self.store.write().await;
        store.files.insert(path.to_string(), FileEntry { content: content.into(), modified });
    }

    pub async fn remove_file(&self, path: &str) -> bool {
        self.store.write().await.files.remove(path).is_some()
    }

    pub fn inject(&self, fault: Fault) {
        self.lock_faults().push_back(fault);
    }

    pub fn expire_sessions(&self) {
        self.lock_sessions().clear();
    }

    /// Requests answered so far, including failed ones.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    /// Successful authentications so far.
    pub fn logins(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, VecDeque<Fault>> {
        self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Strictly increasing epoch-millis clock.
    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self.clock.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    async fn apply_fault(&self) -> Result<()> {
        let fault = self.lock_faults().pop_front();
        match fault {
            None => Ok(()),
            Some(Fault::Network) => Err(Error::Network("connection refused".to_string())),
            Some(Fault::Remote(msg)) => Err(Error::Remote(msg)),
            Some(Fault::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(Fault::ExpireSessions) => {
                self.expire_sessions();
                Ok(())
            }
        }
    }

    fn check_session(&self, session: &SessionToken) -> Result<()> {
        if session.is_expired(Utc::now()) || !self.lock_sessions().contains(&session.value) {
            return Err(Error::SessionExpired);
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::ListFiles { directory } => {
                let prefix = format!("{}/", directory.trim_end_matches('/'));
                let store = self.store.read().await;
                let files = store
                    .files
                    .range(prefix.clone()..)
                    .take_while(|(path, _)| path.starts_with(&prefix))
                    .filter(|(path, _)| !path[prefix.len()..].contains('/'))
                    .map(|(path, entry)| FileStat {
                        path: path.clone(),
                        size: entry.content.len() as u64,
                        modified: entry.modified,
                    })
                    .collect();
                Ok(Response::Files(files))
            }
            Request::ReadFile { path } => {
                let store = self.store.read().await;
                store
                    .files
                    .get(&path)
                    .map(|entry| Response::Content(entry.content.clone()))
                    .ok_or_else(|| Error::NotFound(format!("file '{}'", path)))
            }
            Request::WriteFile { path, content } => {
                let modified = self.next_timestamp();
                let size = content.len() as u64;
                let mut store = self.store.write().await;
                store.files.insert(path, FileEntry { content, modified });
                Ok(Response::Written { size })
            }
            Request::ListRows { table, range } => {
                let store = self.store.read().await;
                let rows = store
                    .table(&table)?
                    .rows
                    .iter()
                    .filter(|(key, _)| range.contains(key))
                    .map(|(key, row)| RowStat {
                        row: key.clone(),
                        versions: row.version_count(),
                        timestamp: row.newest_timestamp(),
                    })
                    .collect();
                Ok(Response::Rows(rows))
            }
            Request::Get { table, row, columns, max_versions, min_timestamp } => {
                let store = self.store.read().await;
                let found = store
                    .table(&table)?
                    .rows
                    .get(&row)
                    .ok_or_else(|| Error::NotFound(format!("row '{}' in table '{}'", row, table)))?;
                Ok(Response::Cells(found.cells(&row, &columns, max_versions, min_timestamp)))
            }
            Request::Scan { table, range, columns, max_versions, min_timestamp } => {
                let store = self.store.read().await;
                let cells = store
                    .table(&table)?
                    .rows
                    .iter()
                    .filter(|(key, _)| range.contains(key))
                    .flat_map(|(key, row)| row.cells(key, &columns, max_versions, min_timestamp))
                    .collect();
                Ok(Response::Cells(cells))
            }
            Request::Put { table, row, family, qualifier, value, timestamp, check } => {
                let timestamp = timestamp.unwrap_or_else(|| self.next_timestamp());
                let mut store = self.store.write().await;
                let rows = &mut store.table_mut(&table)?.rows;
                if let Some(check) = &check {
                    if !check_holds(rows.get(&row), check) {
                        return Ok(Response::Applied(false));
                    }
                }
                rows.entry(row).or_default().put(&family, &qualifier, timestamp, value);
                Ok(Response::Applied(true))
            }
            Request::Delete { table, row, columns, all_versions, check } => {
                let mut store = self.store.write().await;
                let rows = &mut store.table_mut(&table)?.rows;
                let Some(target) = rows.get_mut(&row) else {
                    return Err(Error::NotFound(format!("row '{}' in table '{}'", row, table)));
                };
                if let Some(check) = &check {
                    if !check_holds(Some(target), check) {
                        return Ok(Response::Applied(false));
                    }
                }
                let mut matched = false;
                for column in target.columns.iter_mut() {
                    if !columns.matches(&column.family, &column.qualifier) {
                        continue;
                    }
                    matched = true;
                    if all_versions {
                        column.versions.clear();
                    } else if !column.versions.is_empty() {
                        column.versions.remove(0);
                    }
                }
                if !matched {
                    return Err(Error::NotFound(format!("no matching cells in row '{}'", row)));
                }
                target.columns.retain(|c| !c.versions.is_empty());
                if target.columns.is_empty() {
                    rows.remove(&row);
                }
                Ok(Response::Applied(true))
            }
            Request::Increment { table, row, family, qualifier, delta } => {
                let timestamp = self.next_timestamp();
                let mut store = self.store.write().await;
                let target = store.table_mut(&table)?.rows.entry(row.clone()).or_default();
                let current = match target.latest(&family, &qualifier) {
                    None => 0,
                    Some(raw) => std::str::from_utf8(raw)
                        .ok()
                        .and_then(|s| s.trim().parse::<i64>().ok())
                        .ok_or_else(|| {
                            Error::Remote(format!(
                                "cell {}:{} of row '{}' does not hold a counter",
                                family, qualifier, row
                            ))
                        })?,
                };
                let next = current.checked_add(delta).ok_or_else(|| {
                    Error::Remote(format!("counter {}:{} of row '{}' overflows", family, qualifier, row))
                })?;
                target.put(&family, &qualifier, timestamp, next.to_string().into_bytes());
                Ok(Response::Counter(next))
            }
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn authenticate(&self, source: &CredentialSource) -> Result<SessionToken> {
        self.apply_fault().await?;
        match source {
            CredentialSource::Service { user, password } => {
                if !self.users.is_empty()
                    && self.users.get(user).map(String::as_str) != Some(password.expose())
                {
                    return Err(Error::Auth(format!("invalid credentials for user '{}'", user)));
                }
            }
            CredentialSource::SiteFile { keytab: Some(auth), .. } => {
                if !self.principals.is_empty() && !self.principals.contains(&auth.principal) {
                    return Err(Error::Auth(format!("unknown principal '{}'", auth.principal)));
                }
            }
            CredentialSource::SiteFile { keytab: None, .. } => {}
        }

        let token = SessionToken {
            value: Uuid::new_v4().to_string(),
            expires_at: self
                .session_ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| Utc::now() + ttl),
        };
        self.lock_sessions().insert(token.value.clone());
        self.logins.fetch_add(1, Ordering::SeqCst);
        debug!("Issued session {}", token.value);
        Ok(token)
    }

    async fn execute(&self, session: &SessionToken, request: Request) -> Result<Response> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.apply_fault().await?;
        self.check_session(session)?;
        self.dispatch(request).await
    }
}
