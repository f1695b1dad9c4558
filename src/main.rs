use sentinel::app::{Sentinel, PKG_NAME, VERSION};
use sentinel::config::{self, Config, DEFAULT_CONFIG_FILE};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const USAGE: &str = "\
Usage: sentinel <command> [--config <path>]

Commands:
  init     Create default configuration file
  run      Run sentinel proxy
  version  Print the binary version
  help     Print this message

Options:
  --config <path>  Configuration file (default: .sentinel.json, *.toml read as TOML)";

enum Command {
    Run(PathBuf),
    Init(PathBuf),
    Version,
    Help,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Command> {
    let mut command = None;
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_FILE);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                config_path = PathBuf::from(path);
            }
            _ if command.is_none() => command = Some(arg),
            _ => anyhow::bail!("unexpected argument {:?}", arg),
        }
    }

    match command.as_deref() {
        None | Some("help") | Some("--help") | Some("-h") => Ok(Command::Help),
        Some("run") => Ok(Command::Run(config_path)),
        Some("init") => Ok(Command::Init(config_path)),
        Some("version") | Some("--version") => Ok(Command::Version),
        Some(other) => anyhow::bail!("unknown command {:?}\n\n{}", other, USAGE),
    }
}

fn print_version() {
    println!("{} v{}", PKG_NAME, VERSION);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sentinel=info".parse().expect("valid log directive")),
        )
        .init();

    match parse_args(std::env::args().skip(1))? {
        Command::Help => {
            print_version();
            println!();
            println!("{}", USAGE);
            Ok(())
        }
        Command::Version => {
            print_version();
            Ok(())
        }
        Command::Init(path) => {
            config::init(&path)?;
            info!(path = %path.display(), "Configuration file created");
            Ok(())
        }
        Command::Run(path) => run(path).await,
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    let sentinel = Arc::new(Sentinel::new(config)?);

    let signals = {
        let sentinel = Arc::clone(&sentinel);
        tokio::spawn(async move {
            wait_for_signal().await;
            sentinel.stop();
        })
    };

    let result = sentinel.start().await;
    signals.abort();

    result.map_err(|e| {
        error!(error = %e, "Sentinel exited with error");
        e.into()
    })
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}
