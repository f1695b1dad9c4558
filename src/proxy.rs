//! The development proxy server
//!
//! Every request is either the live-reload websocket upgrade or is routed by
//! path prefix to a backend, with HTML responses rewritten to carry the
//! reload script.

use crate::error::{error_response, Error, ProxyErrorCode, Result};
use crate::pool::{BoxError, HttpClient, ProxyBody};
use crate::reload::{handle_upgrade, ConnectionRegistry, RELOAD_PATH};
use crate::rewrite::rewrite_response;
use crate::router::Router;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Request handler shared by every connection
#[derive(Clone)]
pub struct Proxy {
    router: Arc<Router>,
    client: Arc<dyn HttpClient>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
}

impl Proxy {
    pub fn new(
        router: Router,
        client: Arc<dyn HttpClient>,
        registry: Arc<ConnectionRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            router: Arc::new(router),
            client,
            registry,
            shutdown,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Answer one inbound request.
    ///
    /// Never fails: routing and backend errors become empty-bodied 404/500
    /// responses, so one bad request cannot take the server down.
    pub async fn handle(&self, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
        if req.uri().path() == RELOAD_PATH {
            return handle_upgrade(req, Arc::clone(&self.registry), self.shutdown.clone());
        }

        let path = req.uri().path().to_string();
        let Some(target) = self.router.route(&path) else {
            debug!(path = %path, "No target for path");
            return error_response(ProxyErrorCode::NoTarget);
        };

        if let Err(e) = target.rewrite_request(&mut req) {
            warn!(path = %path, prefix = target.prefix(), error = %e, "Cannot build backend URI");
            return error_response(ProxyErrorCode::BackendFailed);
        }
        debug!(method = %req.method(), path = %path, backend = %req.uri(), "Proxying request");

        let response = match self.client.send(req).await {
            Ok(response) => response,
            Err(e) => {
                error!(path = %path, backend = %target.authority(), error = %e, "Backend request failed");
                return error_response(ProxyErrorCode::BackendFailed);
            }
        };

        match rewrite_response(response).await {
            Ok(response) => response,
            Err(e) => {
                error!(path = %path, backend = %target.authority(), error = %e, "Failed to read backend response");
                error_response(ProxyErrorCode::ResponseReadFailed)
            }
        }
    }
}

/// Accept loop for the proxy
pub struct ProxyServer {
    listener: TcpListener,
    proxy: Proxy,
}

impl ProxyServer {
    /// Bind the listen address. Fails before anything is served if the port is taken.
    pub async fn bind(addr: SocketAddr, proxy: Proxy) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self { listener, proxy })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, targets = self.proxy.router().len(), "Proxy server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            let proxy = self.proxy.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, proxy).await {
                                    debug!(addr = %remote, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Proxy server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, proxy: Proxy) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = proxy.clone();
        async move {
            let req = req.map(|body| body.map_err(|e| -> BoxError { Box::new(e) }).boxed());
            Ok::<_, Infallible>(proxy.handle(req).await)
        }
    });

    // Upgrades must stay enabled for the live-reload websocket
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::X_SENTINEL_ERROR;
    use crate::pool::{full, ClientError};
    use crate::rewrite::RELOAD_SNIPPET;
    use crate::router::Target;
    use futures::future::BoxFuture;
    use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
    use hyper::{Method, StatusCode, Uri};
    use parking_lot::Mutex;

    #[derive(Clone, Copy)]
    enum Reply {
        Html(&'static str),
        Json(&'static str),
        Fail,
    }

    struct FakeClient {
        reply: Reply,
        seen: Mutex<Vec<(Method, Uri, Option<String>)>>,
    }

    impl FakeClient {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl HttpClient for FakeClient {
        fn send(&self, req: Request<ProxyBody>) -> BoxFuture<'static, std::result::Result<Response<ProxyBody>, ClientError>> {
            let host = req
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            self.seen.lock().push((req.method().clone(), req.uri().clone(), host));

            let reply = self.reply;
            Box::pin(async move {
                match reply {
                    Reply::Html(body) => Ok(Response::builder()
                        .header(CONTENT_TYPE, "text/html; charset=utf-8")
                        .header(CONTENT_LENGTH, body.len().to_string())
                        .body(full(body))
                        .unwrap()),
                    Reply::Json(body) => Ok(Response::builder()
                        .header(CONTENT_TYPE, "application/json")
                        .body(full(body))
                        .unwrap()),
                    Reply::Fail => Err(ClientError::Backend("connection refused".to_string())),
                }
            })
        }
    }

    fn proxy(targets: &[(&str, &str)], client: Arc<FakeClient>) -> Proxy {
        let targets = targets
            .iter()
            .map(|(prefix, url)| Target::new(prefix, url).unwrap())
            .collect();
        Proxy::new(
            Router::new(targets),
            client,
            Arc::new(ConnectionRegistry::new()),
            CancellationToken::new(),
        )
    }

    fn get(uri: &str) -> Request<ProxyBody> {
        Request::builder()
            .uri(uri)
            .header(HOST, "localhost:8080")
            .body(full(""))
            .unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_unmatched_path_is_404_with_empty_body() {
        let client = FakeClient::new(Reply::Json("{}"));
        let proxy = proxy(&[("/api", "http://localhost:4000")], client.clone());

        let response = proxy.handle(get("/index.html")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get(X_SENTINEL_ERROR).unwrap(), "NO_TARGET");
        assert_eq!(body_string(response).await, "");
        assert!(client.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_is_500() {
        let client = FakeClient::new(Reply::Fail);
        let proxy = proxy(&[("/", "http://localhost:3000")], client);

        let response = proxy.handle(get("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get(X_SENTINEL_ERROR).unwrap(), "BACKEND_FAILED");
        assert_eq!(body_string(response).await, "");
    }

    #[tokio::test]
    async fn test_request_forwarded_to_backend() {
        let client = FakeClient::new(Reply::Json("{\"ok\":true}"));
        let proxy = proxy(&[("/api", "http://localhost:4000/v1")], client.clone());

        let mut req = get("/api/users?page=2");
        *req.method_mut() = Method::DELETE;
        let response = proxy.handle(req).await;
        assert_eq!(response.status(), StatusCode::OK);

        let seen = client.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        let (method, uri, host) = &seen[0];
        assert_eq!(*method, Method::DELETE);
        assert_eq!(uri.to_string(), "http://localhost:4000/v1/users?page=2");
        assert_eq!(host.as_deref(), Some("localhost:4000"));
    }

    #[tokio::test]
    async fn test_html_gets_reload_script() {
        let client = FakeClient::new(Reply::Html("<html><body><h1>hi</h1></body></html>"));
        let proxy = proxy(&[("/", "http://localhost:3000")], client);

        let body = body_string(proxy.handle(get("/")).await).await;
        assert_eq!(
            body,
            format!("<html><body><h1>hi</h1>{}</body></html>", RELOAD_SNIPPET)
        );
    }

    #[tokio::test]
    async fn test_non_html_unchanged() {
        let client = FakeClient::new(Reply::Json("{\"html\":\"</body>\"}"));
        let proxy = proxy(&[("/", "http://localhost:3000")], client);

        let body = body_string(proxy.handle(get("/data.json")).await).await;
        assert_eq!(body, "{\"html\":\"</body>\"}");
    }

    #[tokio::test]
    async fn test_most_specific_target_chosen() {
        for _ in 0..20 {
            let client = FakeClient::new(Reply::Json("{}"));
            let proxy = proxy(
                &[("/", "http://localhost:3000"), ("/api", "http://localhost:4000")],
                client.clone(),
            );

            proxy.handle(get("/api/x")).await;
            proxy.handle(get("/about")).await;

            let seen = client.seen.lock().clone();
            assert_eq!(seen[0].1.to_string(), "http://localhost:4000/x");
            assert_eq!(seen[1].1.to_string(), "http://localhost:3000/about");
        }
    }

    #[tokio::test]
    async fn test_reload_path_not_routed() {
        let client = FakeClient::new(Reply::Json("{}"));
        let proxy = proxy(&[("/", "http://localhost:3000")], client.clone());

        // A plain GET is not a websocket handshake
        let response = proxy.handle(get(RELOAD_PATH)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(client.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bind_conflict_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let client = FakeClient::new(Reply::Json("{}"));
        let result = ProxyServer::bind(addr, proxy(&[], client)).await;
        assert!(matches!(result, Err(Error::Bind { .. })));
    }
}
