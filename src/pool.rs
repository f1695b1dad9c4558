//! Backend HTTP client
//!
//! The proxy forwards through the [`HttpClient`] capability so request
//! handling can be exercised against test doubles. [`ConnectionPool`] is the
//! production implementation, a pooled hyper client.

use futures::future::BoxFuture;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Boxed error type carried by proxied bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used for both directions of a proxied exchange
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// A body with no content
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A body with the given content
pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Error type for backend requests
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// The backend could not be reached or answered with garbage
    #[error("backend error: {0}")]
    Backend(String),
}

/// Capability to send a fully-rewritten request to a backend.
pub trait HttpClient: Send + Sync + 'static {
    fn send(&self, req: Request<ProxyBody>) -> BoxFuture<'static, Result<Response<ProxyBody>, ClientError>>;
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
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

/// A pooled HTTP client for backend servers
pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
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

        Self { client }
    }
}

impl HttpClient for ConnectionPool {
    fn send(&self, req: Request<ProxyBody>) -> BoxFuture<'static, Result<Response<ProxyBody>, ClientError>> {
        let client = self.client.clone();

        Box::pin(async move {
            let response = client.request(req).await?;

            let (parts, body) = response.into_parts();
            let body = body.map_err(|e| -> BoxError { Box::new(e) }).boxed();
            Ok(Response::from_parts(parts, body))
        })
    }
}
