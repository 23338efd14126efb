use cellar_client::{
    CheckCondition, ColumnFilter, ConnectionConfig, CredentialSource, Request, Response, RowRange, Secret,
    SessionToken, StorageBackend, StorageClient,
};
use cellar_common::Error;
use cellar_connector_webhbase::{CellSet, RestBackend};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

#[derive(Debug, Clone)]
struct Seen {
    method: String,
    target: String,
    authorization: Option<String>,
    body: String,
}

impl Seen {
    fn cells(&self) -> Vec<cellar_client::Cell> {
        serde_json::from_str::<CellSet>(&self.body).unwrap().into_cells().unwrap()
    }
}

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Reply {
    fn status(status: u16) -> Self {
        Reply { status, headers: Vec::new(), body: String::new() }
    }

    fn json(value: serde_json::Value) -> Self {
        Reply { status: 200, headers: vec![("Content-Type".into(), "application/json".into())], body: value.to_string() }
    }

    fn header(mut self, name: &str, value: String) -> Self {
        self.headers.push((name.to_string(), value));
        self
    }
}

type Log = Arc<Mutex<Vec<Seen>>>;

/// Serves one request per connection, answering with `handler`.
async fn gateway<F>(handler: F) -> (Url, Log)
where
    F: Fn(&Seen) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = Url::parse(&format!("http://{}/gateway/hbase/", listener.local_addr().unwrap())).unwrap();
    let log: Log = Arc::default();
    let handler = Arc::new(handler);
    let seen = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let _ = serve(stream, handler.as_ref(), &seen).await;
            });
        }
    });
    (base, log)
}

async fn serve<F>(mut stream: TcpStream, handler: &F, log: &Log) -> std::io::Result<()>
where
    F: Fn(&Seen) -> Reply,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();
    let mut length = 0;
    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => length = value.trim().parse().unwrap_or(0),
                "authorization" => authorization = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    while buf.len() < head_end + length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[head_end..]).into_owned();
    let seen = Seen { method, target, authorization, body };
    let reply = handler(&seen);
    log.lock().unwrap().push(seen);

    let mut out = format!("HTTP/1.1 {} Gateway\r\nConnection: close\r\nContent-Length: {}\r\n", reply.status, reply.body.len());
    for (name, value) in &reply.headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");
    out.push_str(&reply.body);
    stream.write_all(out.as_bytes()).await?;
    stream.shutdown().await
}

fn cells_of(row: &str, cells: &[(&str, i64, &str)]) -> CellSet {
    let mut set = CellSet::row(row);
    for (column, timestamp, value) in cells {
        let (family, qualifier) = column.split_once(':').unwrap();
        set = set.with_cell(family, qualifier, Some(*timestamp), value.as_bytes());
    }
    set
}

fn cell_set(row: &str, cells: &[(&str, i64, &str)]) -> serde_json::Value {
    serde_json::to_value(cells_of(row, cells)).unwrap()
}

fn anonymous(base: Url) -> RestBackend {
    RestBackend::new(base, None).unwrap()
}

fn session() -> SessionToken {
    SessionToken { value: "anonymous".into(), expires_at: None }
}

fn log_of(log: &Log) -> Vec<Seen> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn service_credentials_authenticate_with_basic_auth() {
    let (base, log) = gateway(|seen| match seen.target.as_str() {
        "/gateway/hbase/version/cluster" => Reply::json(json!("2.5.8")),
        _ => Reply::status(404),
    })
    .await;
    let credentials = json!({"cluster": {
        "user": "clsadmin",
        "password": "s3cret",
        "service_endpoints": {"webhbase": base.as_str()}
    }});
    let config = ConnectionConfig::from_service_credentials(&credentials).unwrap();
    let backend = Arc::new(RestBackend::from_config(&config).unwrap());

    StorageClient::connect(config, backend).await.unwrap();
    let seen = log_of(&log);
    assert_eq!(seen[0].method, "GET");
    assert_eq!(seen[0].authorization.as_deref(), Some("Basic Y2xzYWRtaW46czNjcmV0"));
}

#[tokio::test]
async fn rejected_credentials_fail_authentication() {
    let (base, _log) = gateway(|_| Reply::status(401)).await;
    let backend = RestBackend::new(base, Some(("clsadmin".into(), Secret::new("wrong")))).unwrap();
    let source = CredentialSource::Service { user: "clsadmin".into(), password: Secret::new("wrong") };
    assert!(matches!(backend.authenticate(&source).await, Err(Error::Auth(_))));
}

#[tokio::test]
async fn gets_return_the_requested_columns() {
    let (base, log) = gateway(|seen| match seen.target.as_str() {
        "/gateway/hbase/users/user%2F1/info?v=2" => {
            Reply::json(cell_set("user/1", &[("info:name", 20, "Ada"), ("info:name", 10, "Ada L"), ("info:city", 5, "London")]))
        }
        _ => Reply::status(404),
    })
    .await;
    let backend = anonymous(base);
    let request = Request::Get {
        table: "users".into(),
        row: "user/1".into(),
        columns: ColumnFilter::new(Some("info".into()), None),
        max_versions: 2,
        min_timestamp: Some(10),
    };

    let Response::Cells(cells) = backend.execute(&session(), request).await.unwrap() else {
        panic!("expected cells");
    };
    assert_eq!(cells.len(), 2);
    assert_eq!(cells[0].value, b"Ada");
    assert_eq!(cells[1].timestamp, 10);
    assert_eq!(log_of(&log).len(), 1);
}

#[tokio::test]
async fn statuses_become_store_errors() {
    let (base, _log) = gateway(|seen| match seen.target.as_str() {
        t if t.starts_with("/gateway/hbase/users/missing") => Reply::status(404),
        t if t.starts_with("/gateway/hbase/users/busy") => Reply::status(503),
        _ => Reply::status(400),
    })
    .await;
    let backend = anonymous(base);
    let get = |row: &str| Request::Get {
        table: "users".into(),
        row: row.into(),
        columns: ColumnFilter::all(),
        max_versions: 1,
        min_timestamp: None,
    };

    assert!(matches!(backend.execute(&session(), get("missing")).await, Err(Error::NotFound(_))));
    assert!(matches!(backend.execute(&session(), get("busy")).await, Err(Error::Network(_))));
    assert!(matches!(backend.execute(&session(), get("odd")).await, Err(Error::Remote(_))));
}

#[tokio::test]
async fn unreachable_gateways_are_network_errors() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let backend = anonymous(Url::parse(&format!("http://{}/", addr)).unwrap());
    let err = backend
        .execute(&session(), Request::ListRows { table: "t".into(), range: RowRange::default() })
        .await
        .unwrap_err();
    assert!(err.is_transient(), "{:?}", err);
}

#[tokio::test]
async fn checked_puts_report_a_failed_check() {
    let (base, log) = gateway(|seen| match seen.target.as_str() {
        "/gateway/hbase/t/r?check=put" => Reply::status(304),
        _ => Reply::status(404),
    })
    .await;
    let backend = anonymous(base);
    let request = Request::Put {
        table: "t".into(),
        row: "r".into(),
        family: "f".into(),
        qualifier: "q".into(),
        value: b"new".to_vec(),
        timestamp: Some(7),
        check: Some(CheckCondition { column_family: "f".into(), column_qualifier: "lock".into(), expected: None }),
    };

    assert_eq!(backend.execute(&session(), request).await.unwrap(), Response::Applied(false));
    let cells = log_of(&log)[0].cells();
    assert_eq!((cells[0].qualifier.as_str(), cells[0].value.as_slice(), cells[0].timestamp), ("q", &b"new"[..], 7));
    assert_eq!((cells[1].qualifier.as_str(), cells[1].value.as_slice()), ("lock", &b""[..]));
}

#[tokio::test]
async fn scans_drain_and_release_the_scanner() {
    let fetched = Arc::new(AtomicUsize::new(0));
    let (base, log) = gateway(move |seen| match (seen.method.as_str(), seen.target.as_str()) {
        ("PUT", "/gateway/hbase/t/scanner") => {
            Reply::status(201).header("Location", "/gateway/hbase/t/scanner/42".to_string())
        }
        ("GET", "/gateway/hbase/t/scanner/42") => match fetched.fetch_add(1, Ordering::SeqCst) {
            0 => {
                let mut batch = cells_of("a1", &[("f:q", 3, "x")]);
                batch.rows.extend(cells_of("a2", &[("f:q", 4, "y"), ("f:r", 9, "z")]).rows);
                batch.rows.extend(cells_of("b1", &[("f:q", 5, "w")]).rows);
                Reply::json(serde_json::to_value(batch).unwrap())
            }
            _ => Reply::status(204),
        },
        ("DELETE", "/gateway/hbase/t/scanner/42") => Reply::status(200),
        _ => Reply::status(400),
    })
    .await;
    let backend = anonymous(base);
    let range = RowRange { prefix: Some("a".into()), ..Default::default() };

    let Response::Rows(rows) = backend
        .execute(&session(), Request::ListRows { table: "t".into(), range })
        .await
        .unwrap()
    else {
        panic!("expected rows");
    };
    assert_eq!(rows.len(), 2);
    assert_eq!((rows[1].row.as_str(), rows[1].versions, rows[1].timestamp), ("a2", 2, 9));

    let seen = log_of(&log);
    let opened: serde_json::Value = serde_json::from_str(&seen[0].body).unwrap();
    assert_eq!(opened["startRow"], "YQ==");
    assert_eq!(seen.last().map(|s| s.method.as_str()), Some("DELETE"));
}

#[tokio::test]
async fn increments_swap_in_the_new_value() {
    let (base, log) = gateway(|seen| match (seen.method.as_str(), seen.target.as_str()) {
        ("GET", "/gateway/hbase/counters/r/c:n?v=1") => Reply::json(cell_set("r", &[("c:n", 1, "41")])),
        ("PUT", "/gateway/hbase/counters/r?check=put") => Reply::status(200),
        _ => Reply::status(400),
    })
    .await;
    let backend = anonymous(base);
    let request = Request::Increment {
        table: "counters".into(),
        row: "r".into(),
        family: "c".into(),
        qualifier: "n".into(),
        delta: 1,
    };

    assert_eq!(backend.execute(&session(), request).await.unwrap(), Response::Counter(42));
    let cells = log_of(&log)[1].cells();
    assert_eq!(cells[0].value, b"42");
    assert_eq!(cells[1].value, b"41");
}

#[tokio::test]
async fn increments_reject_cells_that_are_not_counters() {
    let (base, log) = gateway(|seen| match seen.method.as_str() {
        "GET" => Reply::json(cell_set("r", &[("c:n", 1, "Ada")])),
        _ => Reply::status(200),
    })
    .await;
    let backend = anonymous(base);
    let request = Request::Increment {
        table: "counters".into(),
        row: "r".into(),
        family: "c".into(),
        qualifier: "n".into(),
        delta: 1,
    };

    let err = backend.execute(&session(), request).await.unwrap_err();
    assert!(matches!(&err, Error::Remote(m) if m.contains("does not hold a counter")));
    assert_eq!(log_of(&log).len(), 1);
}

#[tokio::test]
async fn deletes_remove_only_the_newest_version_unless_asked() {
    let (base, log) = gateway(|seen| match (seen.method.as_str(), seen.target.as_str()) {
        ("GET", "/gateway/hbase/t/r/f?v=1") => Reply::json(cell_set("r", &[("f:a", 20, "x"), ("f:b", 30, "y")])),
        ("DELETE", _) => Reply::status(200),
        _ => Reply::status(400),
    })
    .await;
    let backend = anonymous(base);
    let delete = |all_versions| Request::Delete {
        table: "t".into(),
        row: "r".into(),
        columns: ColumnFilter::new(Some("f".into()), None),
        all_versions,
        check: None,
    };

    assert_eq!(backend.execute(&session(), delete(false)).await.unwrap(), Response::Applied(true));
    assert_eq!(backend.execute(&session(), delete(true)).await.unwrap(), Response::Applied(true));
    let targets: Vec<_> = log_of(&log).into_iter().map(|s| format!("{} {}", s.method, s.target)).collect();
    assert_eq!(
        targets,
        vec![
            "GET /gateway/hbase/t/r/f?v=1",
            "DELETE /gateway/hbase/t/r/f:a/20",
            "DELETE /gateway/hbase/t/r/f:b/30",
            "DELETE /gateway/hbase/t/r/f",
        ]
    );
}

#[tokio::test]
async fn file_requests_are_refused() {
    let (base, log) = gateway(|_| Reply::status(200)).await;
    let backend = anonymous(base);
    let err = backend
        .execute(&session(), Request::ListFiles { directory: "/in".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote(_)));
    assert!(log_of(&log).is_empty());
}
