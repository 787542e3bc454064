//! Integration tests for httpd fixtures, driven by the mock-httpd binary

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ephemeral_server::httpd::{httpd_server, HttpdOptions, HttpdServer, REQUIRED_MODULES};
use ephemeral_server::logging;
use ephemeral_server::{FixtureConfig, ProcessState, ServerProduct};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Get the path to the mock httpd binary
fn mock_httpd_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock-httpd"))
}

/// Directory of empty module files satisfying the dependency check
fn fake_modules() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for module in REQUIRED_MODULES {
        std::fs::write(dir.path().join(module), b"").unwrap();
    }
    dir
}

/// Helper to create a fixture config that runs mock-httpd
fn mock_config(modules: &Path) -> FixtureConfig {
    let mut config = FixtureConfig::default();
    config.httpd_executable = mock_httpd_path();
    config.httpd_modules = modules.to_path_buf();
    config.hostname = Some("127.0.0.1".to_string());
    config.startup_timeout_secs = 10;
    config.ready_poll_interval_ms = 20;
    config.shutdown_grace_period_secs = 2;
    config.client_retry_delay_ms = 50;
    config
}

/// Upstream answering every request with a JSON body naming the path it saw
async fn json_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("").to_string();
                let body = json!({"pong": true, "path": path}).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    port
}

#[tokio::test]
async fn test_httpd_lifecycle() {
    logging::init_test_logging();
    let modules = fake_modules();
    let config = mock_config(modules.path());

    let mut server = httpd_server(&config, HttpdOptions::new()).await.unwrap();
    assert_eq!(server.state(), ProcessState::Running);
    assert_eq!(server.hostname(), "127.0.0.1");
    assert_eq!(server.uri(), format!("http://127.0.0.1:{}", server.port()));
    assert!(server.pid().is_some());

    let workspace = server.workspace().to_path_buf();
    assert!(workspace.join("run").join("httpd.pid").is_file());
    assert!(workspace.join("logs").is_dir());

    let rendered = std::fs::read_to_string(server.config_path()).unwrap();
    assert!(rendered.contains(&format!("Listen 127.0.0.1:{}", server.port())));

    let root = server.client().query_raw("/", &[]).await.unwrap();
    assert_eq!(root.status, 200);
    assert!(root.text().contains("Index of /"));

    server.teardown().await;
    assert_eq!(server.state(), ProcessState::Stopped);
    assert!(!workspace.exists());

    // Second teardown is a no-op
    server.teardown().await;
    assert_eq!(server.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn test_wildcard_hostname_uri_is_connectable() {
    logging::init_test_logging();
    let modules = fake_modules();
    let mut config = mock_config(modules.path());
    config.hostname = Some("0.0.0.0".to_string());

    let mut server = httpd_server(&config, HttpdOptions::new()).await.unwrap();
    assert_eq!(server.hostname(), "0.0.0.0");
    assert_eq!(server.uri(), format!("http://127.0.0.1:{}", server.port()));
    assert_eq!(server.uri(), server.client().base_uri());

    // uri() works on its own, outside the fixture's client
    let response = reqwest::get(server.url("/")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    server.teardown().await;
}

#[tokio::test]
async fn test_proxy_rule_forwards_json() {
    logging::init_test_logging();
    let modules = fake_modules();
    let config = mock_config(modules.path());
    let upstream = json_upstream().await;

    let options = HttpdOptions::new().proxy_rule("/api/", format!("http://127.0.0.1:{}/", upstream));
    let mut server = httpd_server(&config, options).await.unwrap();

    let rendered = std::fs::read_to_string(server.config_path()).unwrap();
    assert!(rendered.contains(&format!("ProxyPass /api/ http://127.0.0.1:{}/", upstream)));
    assert!(rendered.contains(&format!("ProxyPassReverse /api/ http://127.0.0.1:{}/", upstream)));

    let body = server.query("/api/ping", &[]).await.unwrap();
    assert_eq!(body, json!({"pong": true, "path": "/ping"}));

    server.teardown().await;
}

#[tokio::test]
async fn test_document_root_and_extra_cfg() {
    logging::init_test_logging();
    let modules = fake_modules();
    let config = mock_config(modules.path());
    let docs = tempfile::tempdir().unwrap();
    std::fs::write(docs.path().join("data.json"), r#"{"items":[1,2]}"#).unwrap();
    let logs = tempfile::tempdir().unwrap();

    let options = HttpdOptions::new()
        .document_root(docs.path())
        .log_dir(logs.path().join("httpd"))
        .extra_cfg("Header set X-Fixture yes");
    let mut server = httpd_server(&config, options).await.unwrap();

    let data = server.query("/data.json", &[]).await.unwrap();
    assert_eq!(data["items"], json!([1, 2]));

    let missing = server.client().query_raw("/missing.json", &[]).await.unwrap();
    assert_eq!(missing.status, 404);

    let rendered = std::fs::read_to_string(server.config_path()).unwrap();
    assert!(rendered.trim_end().ends_with("Header set X-Fixture yes"));

    server.teardown().await;

    // httpd's own logs went to the custom directory and outlive the workspace
    let access = std::fs::read_to_string(logs.path().join("httpd").join("access.log")).unwrap();
    assert!(access.contains("GET /data.json"));
}

#[tokio::test]
async fn test_missing_executable_acquires_nothing() {
    logging::init_test_logging();
    let modules = fake_modules();
    let root = tempfile::tempdir().unwrap();
    let mut config = mock_config(modules.path());
    config.httpd_executable = PathBuf::from("/nonexistent/sbin/httpd");
    config.workspace_root = Some(root.path().to_path_buf());

    let err = httpd_server(&config, HttpdOptions::new()).await.unwrap_err();
    assert!(err.is_dependency(), "{}", err);

    // No workspace was created
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_missing_module_is_dependency_error() {
    let modules = tempfile::tempdir().unwrap();
    let config = mock_config(modules.path());
    let err = httpd_server(&config, HttpdOptions::new()).await.unwrap_err();
    assert!(err.is_dependency());
}

#[tokio::test]
async fn test_keep_workspace() {
    logging::init_test_logging();
    let modules = fake_modules();
    let mut config = mock_config(modules.path());
    config.keep_workspace = true;

    let mut server = httpd_server(&config, HttpdOptions::new()).await.unwrap();
    let workspace = server.workspace().to_path_buf();
    server.teardown().await;

    assert!(workspace.join("httpd.conf").is_file());
    assert!(workspace.join("logs").join("error.log").is_file());
    std::fs::remove_dir_all(&workspace).unwrap();
}

#[tokio::test]
async fn test_drop_without_teardown_cleans_up() {
    logging::init_test_logging();
    let modules = fake_modules();
    let config = mock_config(modules.path());

    let server = httpd_server(&config, HttpdOptions::new()).await.unwrap();
    let workspace = server.workspace().to_path_buf();
    let port = server.port();
    drop(server);

    assert!(!workspace.exists());

    // The killed server stops accepting connections
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
        assert!(std::time::Instant::now() < deadline, "server still listening after drop");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_instances_get_unique_ports() {
    logging::init_test_logging();
    let modules = fake_modules();
    let config = mock_config(modules.path());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            httpd_server(&config, HttpdOptions::new()).await
        }));
    }

    let mut servers = Vec::new();
    for handle in handles {
        servers.push(handle.await.unwrap().unwrap());
    }

    let ports: HashSet<u16> = servers.iter().map(|s| s.port()).collect();
    assert_eq!(ports.len(), servers.len());
    let workspaces: HashSet<PathBuf> = servers.iter().map(|s| s.workspace().to_path_buf()).collect();
    assert_eq!(workspaces.len(), servers.len());

    for server in servers.iter_mut() {
        server.teardown().await;
    }
}

#[tokio::test]
async fn test_slow_start_is_waited_for() {
    logging::init_test_logging();
    let modules = fake_modules();
    let config = mock_config(modules.path());

    let started = std::time::Instant::now();
    let options = HttpdOptions::new().extra_cfg("MockStartupDelay 500");
    let mut server = httpd_server(&config, options).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));
    server.teardown().await;
}

/// Runs against a system Apache when one is installed
#[tokio::test]
async fn test_real_httpd() {
    logging::init_test_logging();
    let mut config = FixtureConfig::from_env().unwrap();
    config.hostname.get_or_insert_with(|| "127.0.0.1".to_string());

    let product = HttpdServer::new(HttpdOptions::new()).unwrap();
    if let Err(e) = product.check_dependencies(&config) {
        eprintln!("Skipping test: {}", e);
        return;
    }

    let mut server = httpd_server(&config, HttpdOptions::new()).await.unwrap();
    let root = server.client().query_raw("/", &[]).await.unwrap();
    assert!(root.is_success());
    server.teardown().await;
}
