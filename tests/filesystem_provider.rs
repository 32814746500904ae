use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{duplex, split};

use agentwire::mcp::{McpTransport, StdioTransport};
use agentwire::{
    with_providers, AgentError, FilesystemServer, ProviderConfig, ProviderConnection,
    ProviderPool, ToolRegistry,
};

const FS_PROVIDER: &str = env!("CARGO_BIN_EXE_fs-provider");

fn binary_provider(name: &str, root: &std::path::Path) -> ProviderConfig {
    ProviderConfig::stdio(
        name,
        FS_PROVIDER,
        ["--root-dir".to_string(), root.display().to_string()],
    )
    .with_env("AGENTWIRE_LOG", "warn")
}

fn in_process(root: &std::path::Path) -> Arc<dyn McpTransport> {
    let server = Arc::new(FilesystemServer::new(root, false).unwrap());
    let (client, provider) = duplex(64 * 1024);
    let (provider_read, provider_write) = split(provider);
    tokio::spawn(async move {
        server.serve(provider_read, provider_write).await.unwrap();
    });
    let (client_read, client_write) = split(client);
    Arc::new(StdioTransport::from_streams(client_read, client_write))
}

#[tokio::test]
async fn in_process_round_trip_through_registry() {
    let dir = tempfile::tempdir().unwrap();
    let conn = Arc::new(ProviderConnection::new(ProviderConfig::stdio("fs", "unused", ["x"])));
    conn.connect_with(in_process(dir.path())).await.unwrap();

    let mut registry = ToolRegistry::new();
    conn.register_tools(&mut registry).await.unwrap();

    registry
        .execute_tool("write", json!({"path": "docs/readme.md", "content": "# hi"}))
        .await
        .unwrap();
    let listing = registry
        .execute_tool("list", json!({"path": "docs"}))
        .await
        .unwrap();
    assert_eq!(listing["entries"][0]["path"], "docs/readme.md");

    let read = registry
        .execute_tool("read", json!({"path": "docs/readme.md"}))
        .await
        .unwrap();
    assert_eq!(read["content"], "# hi");

    let escaped = registry
        .execute_tool("read", json!({"path": "../../etc/passwd"}))
        .await
        .unwrap_err();
    assert!(matches!(escaped, AgentError::ToolExecution { ref message, .. } if message == "Path outside root directory"));

    conn.ping().await.unwrap();
    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn spawned_provider_serves_tools() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hi").unwrap();

    let conn = ProviderConnection::new(binary_provider("fs", dir.path()));
    conn.connect().await.unwrap();
    assert!(matches!(
        conn.connect().await,
        Err(AgentError::AlreadyConnected(_))
    ));

    let tools = conn.list_tools().await.unwrap();
    assert_eq!(tools.len(), 3);
    let read = conn.call_tool("read", json!({"path": "a.txt"})).await.unwrap();
    assert_eq!(read["content"], "hi");
    assert_eq!(read["size"], 2);

    conn.disconnect().await.unwrap();
    conn.disconnect().await.unwrap();
    assert!(matches!(
        conn.list_tools().await,
        Err(AgentError::NotConnected(_))
    ));
}

#[tokio::test]
async fn pool_releases_successful_connections_when_one_fails() {
    let dir = tempfile::tempdir().unwrap();
    let good = Arc::new(ProviderConnection::new(binary_provider("good", dir.path())));
    let bad = Arc::new(ProviderConnection::new(ProviderConfig::stdio(
        "bad",
        "/no/such/provider",
        Vec::<String>::new(),
    )));

    let err = ProviderPool::connect_all(vec![Arc::clone(&good), Arc::clone(&bad)])
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AgentError::Connection { ref provider, .. } if provider == "bad"));
    assert!(!good.is_connected().await);
    assert!(!bad.is_connected().await);
    assert!(matches!(
        good.list_tools().await,
        Err(AgentError::NotConnected(_))
    ));
}

#[tokio::test]
async fn with_providers_disconnects_after_the_body() {
    let dir = tempfile::tempdir().unwrap();
    let configs = vec![binary_provider("fs", dir.path())];

    let (kept, count) = with_providers(&configs, |pool| async move {
        let mut registry = ToolRegistry::new();
        let count = pool.register_tools(&mut registry).await?;
        Ok((Arc::clone(&pool.connections()[0]), count))
    })
    .await
    .unwrap();

    assert_eq!(count, 3);
    assert!(!kept.is_connected().await);

    let failed: agentwire::Result<()> = with_providers(&configs, |pool| async move {
        let conn = Arc::clone(&pool.connections()[0]);
        conn.call_tool("read", json!({"path": "missing"})).await?;
        Ok(())
    })
    .await;
    assert!(failed.unwrap_err().is_provider_failure());
}

#[cfg(feature = "watch")]
#[tokio::test]
async fn watch_mode_pushes_change_notifications() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProviderConfig::stdio(
        "fs",
        FS_PROVIDER,
        [
            "--root-dir".to_string(),
            dir.path().display().to_string(),
            "--watch".to_string(),
        ],
    );
    let conn = ProviderConnection::new(config);
    conn.connect().await.unwrap();
    let mut changes = conn.subscribe().await.unwrap();

    conn.call_tool("write", json!({"path": "watched.txt", "content": "x"}))
        .await
        .unwrap();

    let note = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let note = changes.recv().await.unwrap();
            if note.params.as_ref().map(|p| p["path"] == "watched.txt").unwrap_or(false) {
                return note;
            }
        }
    })
    .await
    .expect("no change notification within 10s");

    assert_eq!(note.method, "filesystem/change");
    assert_eq!(note.params.unwrap()["type"], "filesystem_change");
    conn.disconnect().await.unwrap();
}
