//! End-to-end tests: a real proxy listener, raw HTTP/1.1 requests with custom
//! Host headers, and the `devhost-echo` binary as the managed process.

use devhost::config::{AppConfig, LaunchSpec, ServerConfig, ServiceConfig, SupervisorConfig};
use devhost::context::AppContext;
use devhost::proxy::ProxyServer;
use devhost::registry::AppRegistry;
use devhost::supervisor::ProcessSupervisor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn echo_command() -> String {
    format!("'{}'", env!("CARGO_BIN_EXE_devhost-echo"))
}

struct TestProxy {
    ctx: Arc<AppContext>,
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TestProxy {
    async fn start(apps: Vec<AppConfig>, port_range_start: u16) -> Self {
        let supervisor = ProcessSupervisor::new(SupervisorConfig {
            port_range_start,
            port_range_end: port_range_start + 50,
            readiness_timeout_secs: 10,
            probe_interval_ms: 20,
            shutdown_grace_period_ms: 500,
            restart_delay_ms: 10,
            shell: Some("/bin/sh".to_string()),
            shell_args: vec!["-c".to_string()],
            ..Default::default()
        });
        let settings = ServerConfig {
            tld: "test".to_string(),
            request_timeout_secs: 5,
            ..Default::default()
        };
        let registry = Arc::new(AppRegistry::with_apps(apps));
        let ctx = AppContext::new(settings, registry, supervisor);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::new(addr, Arc::clone(&ctx), shutdown_rx);
        let handle = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            ctx,
            port: addr.port(),
            shutdown_tx,
            handle,
        }
    }

    async fn get(&self, host: &str, path: &str) -> String {
        http_get_with_host(self.port, path, host).await.unwrap()
    }

    /// Repeat a request until the response contains `needle`
    async fn get_until(&self, host: &str, path: &str, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let response = self.get(host, path).await;
            if response.contains(needle) {
                return response;
            }
            if Instant::now() > deadline {
                panic!("never saw {:?}; last response:\n{}", needle, response);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn shutdown(self) {
        self.ctx.supervisor().stop_all().await;
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Send HTTP request with custom Host header
async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn status_code(response: &str) -> u16 {
    response
        .split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_command_app_waiting_then_proxied() {
    let proxy = TestProxy::start(
        vec![AppConfig::command("echoapp", LaunchSpec::new(echo_command()))],
        47000,
    )
    .await;

    let first = proxy.get("echoapp.test", "/hello").await;
    assert_eq!(status_code(&first), 502, "Response: {}", first);
    assert!(first.contains("Starting echoapp"));

    let process = proxy.ctx.supervisor().get("echoapp").unwrap();
    let pid = process.pid();

    let response = proxy
        .get_until("echoapp.test:80", "/hello?x=1", "echo response GET /hello?x=1")
        .await;
    assert_eq!(status_code(&response), 200);
    assert!(response.contains("x-forwarded-host: echoapp.test:80"));
    assert!(response.contains("x-forwarded-proto: http"));

    // Still the one process launched by the first request
    assert_eq!(proxy.ctx.supervisor().all().len(), 1);
    assert_eq!(proxy.ctx.supervisor().get("echoapp").unwrap().pid(), pid);

    let html = proxy.get("echoapp.test", "/html").await;
    assert!(html.to_lowercase().contains("cache-control: no-store"), "Response: {}", html);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_out_of_band_exit_restarts_from_idle() {
    let proxy = TestProxy::start(
        vec![AppConfig::command("echoapp", LaunchSpec::new(echo_command()))],
        47100,
    )
    .await;

    proxy.get("echoapp.test", "/").await;
    proxy.get_until("echoapp.test", "/", "echo response").await;
    let first_pid = proxy.ctx.supervisor().get("echoapp").unwrap().pid();

    // The backend replies, then exits on its own
    proxy.get("echoapp.test", "/exit").await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while proxy.ctx.supervisor().get("echoapp").is_some() {
        assert!(Instant::now() < deadline, "exited process was never reaped");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let response = proxy.get("echoapp.test", "/").await;
    assert_eq!(status_code(&response), 502, "Response: {}", response);
    assert!(response.contains("Starting echoapp"));

    proxy.get_until("echoapp.test", "/again", "echo response GET /again").await;
    let second_pid = proxy.ctx.supervisor().get("echoapp").unwrap().pid();
    assert_ne!(first_pid, second_pid);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_failed_launch_shows_output_and_restart_link() {
    let proxy = TestProxy::start(
        vec![AppConfig::command(
            "broken",
            LaunchSpec::new("echo missing dependency xyz; exit 3"),
        )],
        47200,
    )
    .await;

    let response = proxy.get_until("broken.test", "/", "failed to start").await;
    assert_eq!(status_code(&response), 502);
    assert!(response.contains("missing dependency xyz"));
    assert!(response.contains("/api/restart?name=broken"));

    // Failed stays failed until an explicit restart
    let again = proxy.get("broken.test", "/").await;
    assert!(again.contains("failed to start"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_service_request_starts_dependencies() {
    let app = AppConfig::multi(
        "shop",
        vec![
            ServiceConfig::new("web", &echo_command()).depends_on(&["api"]),
            ServiceConfig::new("api", &echo_command()),
        ],
    );
    let proxy = TestProxy::start(vec![app], 47300).await;

    let first = proxy.get("web-shop.test", "/").await;
    assert_eq!(status_code(&first), 502);
    assert!(proxy.ctx.supervisor().get("api-shop").is_some());

    proxy.get_until("web-shop.test", "/", "echo response").await;
    proxy.get_until("api-shop.test", "/", "echo response").await;

    // No default and two services: the bare host lists them
    let bare = proxy.get("shop.test", "/").await;
    assert_eq!(status_code(&bare), 200);
    assert!(bare.contains("http://web-shop.test"));
    assert!(bare.contains("http://api-shop.test"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_control_api_on_dashboard_host() {
    let proxy = TestProxy::start(
        vec![AppConfig::command("echoapp", LaunchSpec::new(echo_command()))],
        47400,
    )
    .await;

    let status = proxy.get("devhost.test", "/api/status").await;
    assert_eq!(status_code(&status), 200);
    assert!(status.contains("\"name\":\"echoapp\""));

    let started = proxy.get("devhost.test", "/api/start?name=echoapp").await;
    assert_eq!(status_code(&started), 200, "Response: {}", started);

    proxy
        .get_until("devhost.test", "/api/logs?name=echoapp", "echo: listening")
        .await;
    proxy
        .get_until("devhost.test", "/api/app-status?name=echoapp", "\"running\":true")
        .await;

    let stopped = proxy.get("localhost", "/api/stop?name=echoapp").await;
    assert_eq!(status_code(&stopped), 200);
    assert!(proxy.ctx.supervisor().get("echoapp").is_none());

    let unknown = proxy.get("devhost.test", "/api/stop?name=nope").await;
    assert_eq!(status_code(&unknown), 404);
    assert!(unknown.contains("UNKNOWN_APP"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_unknown_host_returns_404() {
    let proxy = TestProxy::start(vec![AppConfig::port("known", 1)], 47500).await;

    let response = proxy.get("nothing.test", "/").await;
    assert_eq!(status_code(&response), 404, "Response: {}", response);
    assert!(response.contains("No app for nothing.test"));
    assert!(response.contains("http://known.test"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_missing_host_header() {
    let proxy = TestProxy::start(vec![], 47550).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.port)).await.unwrap();
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert_eq!(status_code(&response), 400, "Response: {}", response);
    assert!(response.contains("MISSING_HOST_HEADER"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_port_app_is_proxied_directly() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = backend.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let body = "fixed port backend";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    let proxy = TestProxy::start(vec![AppConfig::port("legacy", backend_port)], 47600).await;

    let response = proxy.get("admin.legacy.test", "/").await;
    assert_eq!(status_code(&response), 200, "Response: {}", response);
    assert!(response.contains("fixed port backend"));
    assert!(proxy.ctx.supervisor().all().is_empty());

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_static_app_is_served() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>static home</h1>").unwrap();
    std::fs::write(dir.path().join("style.css"), "body {}").unwrap();

    let proxy = TestProxy::start(
        vec![AppConfig::static_files("site", dir.path())],
        47650,
    )
    .await;

    let css = proxy.get("site.test", "/style.css").await;
    assert_eq!(status_code(&css), 200);
    assert!(css.contains("body {}"));

    // Client-side routes fall back to the main page
    let route = proxy.get("site.test", "/settings/profile").await;
    assert!(route.contains("static home"));

    proxy.shutdown().await;
}
