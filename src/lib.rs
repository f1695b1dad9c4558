//! Sentinel - A development reverse proxy with live reload
//!
//! This library provides a local proxy for web development that:
//! - Routes requests by path prefix to one or more backend servers
//! - Injects a live-reload script into every HTML page it serves
//! - Watches source files and restarts the backend processes on every write
//! - Waits for user-defined readiness checks before telling browsers to reload
//! - Cancels stale process generations so only the newest build is ever announced

pub mod app;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod reload;
pub mod rewrite;
pub mod router;
pub mod watcher;

pub use app::Sentinel;
pub use config::Config;
pub use error::{Error, Result};
