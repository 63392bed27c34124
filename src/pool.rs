//! Pooled HTTP client for forwarding requests to local backend ports
//!
//! Dev servers are hit over and over from the same browser tab, so keeping
//! connections to `127.0.0.1:<port>` alive saves a handshake per request.

use crate::config::ServerConfig;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per backend port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(server.pool_idle_timeout_secs),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    forwarded: AtomicU64,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            forwarded: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of requests forwarded so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Forward `req` unchanged to `127.0.0.1:port`, keeping its path and query
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = backend_uri(port, req.uri().path_and_query().map(|pq| pq.as_str()));

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.forwarded.fetch_add(1, Ordering::Relaxed);

        let response = self.client.request(backend_req).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

fn backend_uri(port: u16, path_and_query: Option<&str>) -> String {
    format!("http://127.0.0.1:{}{}", port, path_and_query.unwrap_or("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_config_from_server_settings() {
        let server = ServerConfig {
            pool_max_idle_per_host: 3,
            pool_idle_timeout_secs: 15,
            ..Default::default()
        };
        let config = PoolConfig::from(&server);
        assert_eq!(config.max_idle_per_host, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.forwarded(), 0);
    }

    #[test]
    fn test_backend_uri() {
        assert_eq!(backend_uri(41000, Some("/a?b=1")), "http://127.0.0.1:41000/a?b=1");
        assert_eq!(backend_uri(41000, None), "http://127.0.0.1:41000/");
    }
}
