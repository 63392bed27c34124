use crate::config::AppKind;
use crate::context::AppContext;
use crate::control;
use crate::error::{json_error_response, ErrorCode};
use crate::pages;
use crate::registry::Target;
use crate::router::Route;
use crate::static_files;
use crate::supervisor::ProcessState;
use anyhow::Context;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// The front listener: every app hostname and the dashboard host land here
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: Arc<AppContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        ctx: Arc<AppContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.bind_addr))?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_rx;
        info!(addr = %listener.local_addr()?, "Proxy server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<AppContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    // HTTP/1.1 for browsers and upgrades, h2c for tools that speak it
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<AppContext>,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, hyper::Error> {
    let Some(host) = extract_host(&req) else {
        return Ok(json_error_response(
            ErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    debug!(host, method = %req.method(), uri = %req.uri(), "Incoming request");

    let response = match ctx.router().route(&host) {
        Route::Dashboard => control::handle(req, &ctx).await,
        Route::Unknown(host) => {
            let apps: Vec<(String, String)> = ctx
                .registry()
                .all()
                .iter()
                .filter(|app| !app.hidden)
                .map(|app| (app.name.clone(), ctx.urls().for_label(&app.name)))
                .collect();
            pages::not_found_page(&host, &apps)
        }
        Route::Target(target) => dispatch(req, &ctx, target, client_addr).await,
    };

    Ok(response)
}

/// Host header, or the URI authority for HTTP/2 requests
fn extract_host<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;

    let host = host.trim();
    if host.is_empty() || host.len() > 253 {
        return None;
    }
    // Keeps control characters out of logs and generated pages
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '[' | ']'))
    {
        return None;
    }
    Some(host.to_string())
}

async fn dispatch(
    req: Request<Incoming>,
    ctx: &Arc<AppContext>,
    target: Target,
    client_addr: SocketAddr,
) -> ProxyResponse {
    let app = Arc::clone(&target.app);
    match &app.kind {
        AppKind::Port { port } => forward(req, ctx, &app.name, *port, client_addr).await,
        AppKind::Static { path } => {
            let method = req.method().clone();
            let request_path = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            drop(req);
            static_files::serve(path, &method, &request_path).await
        }
        AppKind::Multi { services, .. } if target.service.is_none() => {
            match app.default_service() {
                Some(service) => {
                    let target = Target::service(Arc::clone(&app), service.name.clone());
                    managed(req, ctx, target, client_addr).await
                }
                None => {
                    let links: Vec<(String, String)> = services
                        .keys()
                        .map(|s| (s.clone(), ctx.urls().for_service(&app.name, s)))
                        .collect();
                    pages::service_list_page(&app.name, &links)
                }
            }
        }
        AppKind::Command(_) | AppKind::Multi { .. } => managed(req, ctx, target, client_addr).await,
    }
}

/// Requests for command apps and services: proxy when running, otherwise
/// start on demand and answer with an interstitial
async fn managed(
    req: Request<Incoming>,
    ctx: &Arc<AppContext>,
    target: Target,
    client_addr: SocketAddr,
) -> ProxyResponse {
    let name = target.process_name();
    ctx.start_dependencies(&target);

    let Some(process) = ctx.supervisor().get(&name) else {
        let Some(launch) = target.launch() else {
            return json_error_response(ErrorCode::NotManaged, format!("'{}' has no command", name));
        };
        return match ctx.supervisor().start_async(&name, launch) {
            Ok(_) => pages::waiting_page(&name),
            Err(e) => pages::failure_page(&name, &e.to_string(), &[], &ctx.restart_url(&name)),
        };
    };

    match process.state() {
        ProcessState::Running => forward(req, ctx, &name, process.port(), client_addr).await,
        ProcessState::Failed { reason } => pages::failure_page(
            &name,
            &reason,
            &process.logs().tail(pages::FAILURE_LOG_LINES),
            &ctx.restart_url(&name),
        ),
        ProcessState::Starting | ProcessState::Idle => pages::waiting_page(&name),
    }
}

/// Reverse-proxy a request to a local port
async fn forward(
    mut req: Request<Incoming>,
    ctx: &Arc<AppContext>,
    name: &str,
    port: u16,
    client_addr: SocketAddr,
) -> ProxyResponse {
    let request_id = set_forwarding_headers(&mut req, client_addr);

    if is_upgrade_request(&req) {
        return handle_upgrade(req, name.to_string(), port, request_id).await;
    }

    let request_timeout = ctx.settings().request_timeout();
    let result = tokio::time::timeout(request_timeout, ctx.pool().send_request(req, port)).await;

    match result {
        Ok(Ok(mut response)) => {
            force_no_store_on_html(&mut response);
            response
        }
        Ok(Err(e)) => {
            error!(name, port, error = %e, "Failed to forward request");
            json_error_response(ErrorCode::ConnectionFailed, "Failed to connect to backend")
        }
        Err(_) => {
            warn!(
                name,
                port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            json_error_response(
                ErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            )
        }
    }
}

/// Overwrite client-supplied forwarding headers; returns the request ID
fn set_forwarding_headers<B>(req: &mut Request<B>, client_addr: SocketAddr) -> String {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    request_id
}

/// Browsers must not cache pages of a process that may be restarted
fn force_no_store_on_html<B>(response: &mut Response<B>) {
    let is_html = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false);
    if is_html {
        response
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request<B>(req: &Request<B>, port: u16) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: 127.0.0.1:{}\r\n\r\n", port));
    request.into_bytes()
}

/// Parse the backend's answer to an upgrade request
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let code: u16 = status_line.split(' ').nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

async fn forward_bidirectional(client: Upgraded, mut backend: TcpStream, name: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                name,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(name, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Pass a WebSocket (or other) upgrade through to the backend
async fn handle_upgrade(
    req: Request<Incoming>,
    name: String,
    port: u16,
    request_id: String,
) -> ProxyResponse {
    let raw_request = build_upgrade_request(&req, port);

    let mut backend = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(name, port, error = %e, "Failed to connect to backend for upgrade");
            return json_error_response(
                ErrorCode::ConnectionFailed,
                format!("Failed to connect to backend: {}", e),
            );
        }
    };

    if let Err(e) = backend.write_all(&raw_request).await {
        error!(name, error = %e, "Failed to send upgrade request to backend");
        return json_error_response(
            ErrorCode::ConnectionFailed,
            format!("Failed to send upgrade request: {}", e),
        );
    }

    let mut buf = vec![0u8; 4096];
    let n = match backend.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            return json_error_response(ErrorCode::ConnectionFailed, "Backend closed connection");
        }
        Err(e) => {
            error!(name, error = %e, "Failed to read upgrade response from backend");
            return json_error_response(
                ErrorCode::ConnectionFailed,
                format!("Failed to read backend response: {}", e),
            );
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&buf[..n]) else {
        return json_error_response(
            ErrorCode::ConnectionFailed,
            "Invalid upgrade response from backend",
        );
    };

    let mut response = Response::builder().status(status);
    for (header, value) in &response_headers {
        let lower = header.to_ascii_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let (Ok(hn), Ok(hv)) = (
            HeaderName::from_bytes(header.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response = response.header(hn, hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(name, status = %status, "Backend rejected upgrade request");
        return response;
    }

    debug!(name, request_id, "Upgrade accepted by backend");
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => forward_bidirectional(upgraded, backend, &name, &request_id).await,
            Err(e) => error!(name, error = %e, "Failed to upgrade client connection"),
        }
    });

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn request(host: Option<&str>) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().uri("/path?q=1");
        if let Some(host) = host {
            builder = builder.header("Host", host);
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host(&request(Some("blog.test:8080"))).as_deref(), Some("blog.test:8080"));
        assert_eq!(extract_host(&request(Some("[::1]:80"))).as_deref(), Some("[::1]:80"));
        assert_eq!(extract_host(&request(None)), None);
        assert_eq!(extract_host(&request(Some("bad host"))), None);

        let h2 = Request::builder()
            .uri("http://api-shop.test/x")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(extract_host(&h2).as_deref(), Some("api-shop.test"));
    }

    #[test]
    fn test_forwarding_headers_overwrite_client_values() {
        let mut req = Request::builder()
            .uri("/")
            .header("Host", "blog.test")
            .header(X_FORWARDED_FOR, "6.6.6.6")
            .header(X_FORWARDED_PROTO, "https")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let id = set_forwarding_headers(&mut req, "127.0.0.1:5555".parse().unwrap());
        assert!(!id.is_empty());
        assert_eq!(req.headers().get(X_REQUEST_ID).unwrap(), id.as_str());
        assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "127.0.0.1");
        assert_eq!(req.headers().get(X_FORWARDED_HOST).unwrap(), "blog.test");
        assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "http");
    }

    #[test]
    fn test_request_id_is_propagated() {
        let mut req = Request::builder()
            .uri("/")
            .header(X_REQUEST_ID, "abc-123")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let id = set_forwarding_headers(&mut req, "127.0.0.1:5555".parse().unwrap());
        assert_eq!(id, "abc-123");
    }

    #[test]
    fn test_no_store_forced_on_html_only() {
        let mut html = Response::builder()
            .header(CONTENT_TYPE, "Text/HTML; charset=utf-8")
            .header(CACHE_CONTROL, "max-age=3600")
            .body(())
            .unwrap();
        force_no_store_on_html(&mut html);
        assert_eq!(html.headers().get(CACHE_CONTROL).unwrap(), "no-store");

        let mut js = Response::builder()
            .header(CONTENT_TYPE, "application/javascript")
            .header(CACHE_CONTROL, "max-age=3600")
            .body(())
            .unwrap();
        force_no_store_on_html(&mut js);
        assert_eq!(js.headers().get(CACHE_CONTROL).unwrap(), "max-age=3600");
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder().header("Upgrade", "websocket").body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_build_upgrade_request_rewrites_host() {
        let req = Request::builder()
            .uri("/ws?token=1")
            .header("Host", "blog.test")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        let raw = String::from_utf8(build_upgrade_request(&req, 41000)).unwrap();
        assert!(raw.starts_with("GET /ws?token=1 HTTP/1.1\r\n"));
        assert!(raw.contains("Host: 127.0.0.1:41000\r\n"));
        assert!(!raw.contains("blog.test"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers[0], ("Upgrade".to_string(), "websocket".to_string()));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }
}
