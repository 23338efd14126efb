use cellar_client::{
    ClientOptions, ColumnFilter, ConnectionConfig, Fault, MemoryBackend, RetryPolicy, StorageClient,
};
use cellar_common::Error;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn credentials(user: &str, password: &str) -> ConnectionConfig {
    ConnectionConfig::from_service_credentials(&json!({
        "cluster": {
            "user": user,
            "password": password,
            "service_endpoints": { "webhbase": "https://hbase.example.net:8443/gateway/default/webhbase/v1/" }
        }
    }))
    .expect("valid credentials")
}

fn fast_options() -> ClientOptions {
    ClientOptions { request_timeout: Duration::from_millis(200), retry: RetryPolicy::immediate(3) }
}

#[tokio::test]
async fn connect_rejects_bad_password() {
    let backend = Arc::new(MemoryBackend::new().with_user("admin", "right"));
    let err = StorageClient::connect_with_options(credentials("admin", "wrong"), backend, fast_options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth(_)), "got {:?}", err);
}

#[tokio::test]
async fn connect_retries_unreachable_backend() {
    let backend = Arc::new(MemoryBackend::new());
    backend.inject(Fault::Network);
    backend.inject(Fault::Network);
    let client = StorageClient::connect_with_options(credentials("u", "p"), backend.clone(), fast_options())
        .await
        .expect("third attempt succeeds");
    assert_eq!(client.config().endpoint(), "webhbase://hbase.example.net:8443");
    assert_eq!(backend.logins(), 1);
}

#[tokio::test]
async fn transient_request_failures_are_retried() {
    let backend = Arc::new(MemoryBackend::new());
    backend.create_table("t").await;
    let client = StorageClient::connect_with_options(credentials("u", "p"), backend.clone(), fast_options())
        .await
        .unwrap();

    backend.inject(Fault::Network);
    assert!(client.put("t", "r", "f", "q", b"v".to_vec(), None, None).await.unwrap());
    let cells = client.get("t", "r", ColumnFilter::all(), 0, None).await.unwrap();
    assert_eq!(cells.len(), 1);
}

#[tokio::test]
async fn retries_are_bounded() {
    let backend = Arc::new(MemoryBackend::new());
    let client = StorageClient::connect_with_options(credentials("u", "p"), backend.clone(), fast_options())
        .await
        .unwrap();
    for _ in 0..4 {
        backend.inject(Fault::Network);
    }
    let err = client.list_files("/data").await.unwrap_err();
    assert!(matches!(err, Error::Network(_)));
}

#[tokio::test]
async fn remote_errors_propagate_without_retry() {
    let backend = Arc::new(MemoryBackend::new());
    let client = StorageClient::connect_with_options(credentials("u", "p"), backend.clone(), fast_options())
        .await
        .unwrap();
    let before = backend.executed();
    let err = client.list_rows("no_such_table", Default::default()).await.unwrap_err();
    assert!(matches!(err, Error::Remote(_)));
    assert_eq!(backend.executed() - before, 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_request_times_out() {
    let backend = Arc::new(MemoryBackend::new());
    let options = ClientOptions { request_timeout: Duration::from_millis(100), retry: RetryPolicy::no_retry() };
    let client = StorageClient::connect_with_options(credentials("u", "p"), backend.clone(), options)
        .await
        .unwrap();
    backend.inject(Fault::Stall(Duration::from_secs(5)));
    let err = client.list_files("/data").await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {:?}", err);
}

#[tokio::test]
async fn expired_session_is_refreshed_once_for_concurrent_callers() {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_file("/data/a.txt", "a", 1).await;
    let client = StorageClient::connect_with_options(credentials("u", "p"), backend.clone(), fast_options())
        .await
        .unwrap();
    assert_eq!(backend.logins(), 1);

    backend.expire_sessions();
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.read_file("/data/a.txt").await })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.expect("task panicked").unwrap(), b"a".to_vec());
    }
    assert_eq!(backend.logins(), 2);
}

#[tokio::test]
async fn ttl_expiry_triggers_proactive_refresh() {
    let backend = Arc::new(MemoryBackend::new().with_session_ttl(Duration::from_millis(10)));
    let client = StorageClient::connect_with_options(credentials("u", "p"), backend.clone(), fast_options())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    client.list_files("/").await.unwrap();
    assert_eq!(backend.logins(), 2);
}

#[tokio::test]
async fn keytab_file_must_exist() {
    let doc = "<configuration>\
        <property><name>hbase.rest.host</name><value>h</value></property>\
        <property><name>hbase.rest.port</name><value>8080</value></property>\
        <property><name>hbase.client.keytab.principal</name><value>p@REALM</value></property>\
        <property><name>hbase.client.keytab.file</name><value>/no/such.keytab</value></property>\
        </configuration>";
    let config = ConnectionConfig::from_site_document("hbase-site.xml", doc).unwrap();
    let err = StorageClient::connect(config, Arc::new(MemoryBackend::new())).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn keytab_principal_is_checked() {
    let dir = tempfile::tempdir().unwrap();
    let keytab = dir.path().join("streams.keytab");
    std::fs::write(&keytab, b"keytab").unwrap();
    let doc = format!(
        "<configuration>\
        <property><name>hbase.rest.host</name><value>h</value></property>\
        <property><name>hbase.rest.port</name><value>8080</value></property>\
        <property><name>hbase.client.keytab.principal</name><value>intruder@REALM</value></property>\
        <property><name>hbase.client.keytab.file</name><value>{}</value></property>\
        </configuration>",
        keytab.display()
    );
    let config = ConnectionConfig::from_site_document("hbase-site.xml", &doc).unwrap();
    let backend = Arc::new(MemoryBackend::new().with_principal("streams@REALM"));
    let err = StorageClient::connect(config, backend).await.unwrap_err();
    assert!(matches!(err, Error::Auth(_)));
}
