//! Wiring of watcher, proxy server and reload loop into one runnable unit

use crate::config::Config;
use crate::error::Result;
use crate::orchestrator::ReloadLoop;
use crate::pool::{ConnectionPool, HttpClient};
use crate::process::{CommandRunner, OsCommandRunner, ProcessOrchestrator, READINESS_POLL_INTERVAL};
use crate::proxy::{Proxy, ProxyServer};
use crate::reload::ConnectionRegistry;
use crate::router::Router;
use crate::watcher::ChangeWatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long `start` waits for the server's accept loop after the reload loop ends
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// A configured development proxy.
///
/// `start` runs until the watcher fails or `stop` is called; `stop` may be
/// called from any task holding a reference.
pub struct Sentinel {
    config: Config,
    router: Router,
    listen_addr: SocketAddr,
    runner: Arc<dyn CommandRunner>,
    client: Option<Arc<dyn HttpClient>>,
    registry: Arc<ConnectionRegistry>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl Sentinel {
    /// Validate the configuration and prepare (but do not start) the proxy.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let router = config.proxy.router()?;
        let listen_addr = config.proxy.listen_addr()?;

        Ok(Self {
            config,
            router,
            listen_addr,
            runner: Arc::new(OsCommandRunner::new()),
            client: None,
            registry: Arc::new(ConnectionRegistry::new()),
            poll_interval: READINESS_POLL_INTERVAL,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Token cancelled by [`Sentinel::stop`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask a running `start` to wind down
    pub fn stop(&self) {
        info!("Stopping sentinel");
        self.shutdown.cancel();
    }

    /// Run the proxy and the reload loop.
    ///
    /// Setup failures (unwatchable path, port in use) are returned before any
    /// command runs. A fatal watcher error is returned after every process has
    /// been cancelled. Returns `Ok` after `stop`.
    pub async fn start(&self) -> Result<()> {
        let watcher = ChangeWatcher::new(&self.config.watch.files)?;

        let client = match &self.client {
            Some(client) => Arc::clone(client),
            None => Arc::new(ConnectionPool::new(self.config.proxy.pool_config())) as Arc<dyn HttpClient>,
        };
        let proxy = Proxy::new(
            self.router.clone(),
            client,
            Arc::clone(&self.registry),
            self.shutdown.clone(),
        );
        let server = ProxyServer::bind(self.listen_addr, proxy).await?;
        let server_task = tokio::spawn(server.run(self.shutdown.clone()));

        info!(
            version = VERSION,
            addr = %self.listen_addr,
            watched = self.config.watch.files.len(),
            build_steps = self.config.watch.build.len(),
            exec_steps = self.config.watch.exec.len(),
            "Sentinel started"
        );

        let processes =
            ProcessOrchestrator::new(Arc::clone(&self.runner)).with_poll_interval(self.poll_interval);
        let reload_loop = ReloadLoop::new(
            processes,
            Arc::clone(&self.registry),
            self.config.watch.build.clone(),
            self.config.watch.exec.clone(),
        );
        let result = reload_loop.run(watcher, self.shutdown.clone()).await;

        self.shutdown.cancel();
        match tokio::time::timeout(SERVER_STOP_TIMEOUT, server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Proxy server error"),
            Ok(Err(e)) => warn!(error = %e, "Proxy server task failed"),
            Err(_) => warn!("Timed out waiting for proxy server to stop"),
        }

        info!("Sentinel stopped");
        result
    }
}
