use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::process::{split_command, CommandSpec};
use crate::router::Router;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file used when none is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = ".sentinel.json";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// What to watch and which commands to run
    #[serde(default)]
    pub watch: WatchConfig,

    /// Listen address and backend targets
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Files or directories whose writes trigger a restart
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// One-shot commands run in order at startup
    #[serde(default)]
    pub build: Vec<CommandSpec>,

    /// Long-running commands restarted on every change
    #[serde(default)]
    pub exec: Vec<CommandSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `host:port`, or `:port` for all interfaces (default: ":8080")
    #[serde(default = "default_address")]
    pub address: String,

    /// Path prefix -> backend base URL
    #[serde(default)]
    pub targets: BTreeMap<String, String>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle backend connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            targets: BTreeMap::new(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

fn default_address() -> String {
    ":8080".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl ProxyConfig {
    /// Resolve the listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let address = if self.address.starts_with(':') {
            format!("0.0.0.0{}", self.address)
        } else {
            self.address.clone()
        };

        address
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| Error::InvalidAddress(self.address.clone()))
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }

    pub fn router(&self) -> Result<Router> {
        Router::from_map(&self.targets)
    }
}

impl Config {
    /// Read and validate a config file. `*.toml` is parsed as TOML, anything else as JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;

        let config: Config = if is_toml(path) {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.proxy.listen_addr() {
            errors.push(e.to_string());
        }
        if let Err(e) = self.proxy.router() {
            errors.push(e.to_string());
        }

        let steps = self
            .watch
            .build
            .iter()
            .map(|s| ("build", s))
            .chain(self.watch.exec.iter().map(|s| ("exec", s)));
        for (kind, spec) in steps {
            if let Err(e) = split_command(&spec.command) {
                errors.push(format!("{} command {:?}: {}", kind, spec.command, e));
            }
            if let Some(condition) = &spec.condition {
                if let Err(e) = split_command(condition) {
                    errors.push(format!("{} condition {:?}: {}", kind, condition, e));
                }
            }
        }

        if !errors.is_empty() {
            return Err(Error::Config(format!("\n  - {}", errors.join("\n  - "))));
        }

        Ok(())
    }

    /// The configuration written by `init`: a Go project serving on port 3000
    pub fn scaffold() -> Self {
        Self {
            watch: WatchConfig {
                files: vec![PathBuf::from("./templates/")],
                build: vec![CommandSpec::new("go build -o ./tmp/main ./cmd/main.go")],
                exec: vec![CommandSpec::new("./tmp/main")
                    .with_condition("curl -Is http://localhost:3000/health -o /dev/null")],
            },
            proxy: ProxyConfig {
                targets: BTreeMap::from([("/".to_string(), "http://localhost:3000/".to_string())]),
                ..ProxyConfig::default()
            },
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().map(|ext| ext == "toml").unwrap_or(false)
}

/// Write the scaffold config to `path` in the format `Config::load` reads
/// back for it. Never overwrites an existing file.
pub fn init<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let scaffold = Config::scaffold();
    let content = if is_toml(path) {
        toml::to_string_pretty(&scaffold)
            .map_err(|e| Error::Config(format!("cannot encode config: {}", e)))?
    } else {
        let mut json = serde_json::to_string_pretty(&scaffold)
            .map_err(|e| Error::Config(format!("cannot encode config: {}", e)))?;
        json.push('\n');
        json
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                Error::Config(format!("{} already exists", path.display()))
            }
            _ => Error::Config(format!("cannot create {}: {}", path.display(), e)),
        })?;

    file.write_all(content.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let json = r#"{
            "watch": {
                "files": ["./templates/", "main.go"],
                "build": [{ "cmd": "go build -o ./tmp/main ./cmd/main.go" }],
                "exec": [
                    { "cmd": "./tmp/main", "condition": "curl -Is http://localhost:3000/health" },
                    { "cmd": "npm run css" }
                ]
            },
            "proxy": {
                "address": "127.0.0.1:9000",
                "targets": { "/": "http://localhost:3000/", "/api": "http://localhost:4000" }
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.watch.files.len(), 2);
        assert_eq!(config.watch.build.len(), 1);
        assert_eq!(config.watch.exec[0].condition.as_deref(), Some("curl -Is http://localhost:3000/health"));
        assert!(config.watch.exec[1].condition.is_none());
        assert_eq!(config.proxy.targets.len(), 2);
        assert_eq!(config.proxy.listen_addr().unwrap(), "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.proxy.router().unwrap().len(), 2);
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str(r#"{ "proxy": {} }"#).unwrap();
        assert_eq!(config.proxy.address, ":8080");
        assert!(config.proxy.targets.is_empty());
        assert!(config.watch.files.is_empty());
        assert!(config.watch.exec.is_empty());

        let pool = config.proxy.pool_config();
        assert_eq!(pool.max_idle_per_host, 10);
        assert_eq!(pool.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_port_only_address_binds_all_interfaces() {
        let proxy = ProxyConfig {
            address: ":8080".to_string(),
            ..ProxyConfig::default()
        };
        assert_eq!(proxy.listen_addr().unwrap(), "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_invalid_address() {
        let proxy = ProxyConfig {
            address: "not an address".to_string(),
            ..ProxyConfig::default()
        };
        assert!(matches!(proxy.listen_addr(), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_validation_reports_all_errors() {
        let mut config = Config::scaffold();
        config.proxy.targets.insert("api".to_string(), "http://localhost:4000".to_string());
        config.watch.exec.push(CommandSpec::new("  "));
        config.watch.build.push(CommandSpec::new("make").with_condition("echo \"oops"));

        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("\"api\""));
        assert!(msg.contains("exec command"));
        assert!(msg.contains("build condition"));
    }

    #[test]
    fn test_scaffold_is_valid_and_fresh() {
        let mut first = Config::scaffold();
        first.validate().unwrap();
        first.proxy.address = ":9999".to_string();

        assert_eq!(Config::scaffold().proxy.address, ":8080");
        assert_eq!(Config::scaffold().proxy.targets["/"], "http://localhost:3000/");
    }

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);

        init(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::scaffold());
    }

    #[test]
    fn test_init_toml_path_writes_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.toml");

        init(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.trim_start().starts_with('{'));
        assert_eq!(Config::load(&path).unwrap(), Config::scaffold());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "{}").unwrap();

        let err = init(&path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.toml");
        std::fs::write(
            &path,
            r#"
[watch]
files = ["src"]

[[watch.exec]]
cmd = "cargo run"
condition = "curl -sf http://localhost:3000"

[proxy]
address = ":3001"

[proxy.targets]
"/" = "http://localhost:3000"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.watch.exec[0].command, "cargo run");
        assert_eq!(config.proxy.listen_addr().unwrap().port(), 3001);
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ \"proxy\": ").unwrap();

        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
        assert!(matches!(Config::load(dir.path().join("missing.json")), Err(Error::Config(_))));
    }
}
