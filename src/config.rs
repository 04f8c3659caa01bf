use std::{io, net::SocketAddr, time::Duration};

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "tally", about = "Tally - queued balance and ledger pipeline")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "tally.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Which parts of the pipeline this process runs
    #[arg(short, long, value_enum)]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// HTTP API and intake only
    Api,
    /// Queue consumers only
    Worker,
    /// Both, in one process
    All,
}

impl Role {
    pub fn serves_http(&self) -> bool {
        matches!(self, Role::Api | Role::All)
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, Role::Worker | Role::All)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
    #[error("invalid listen address {0}")]
    ListenAddr(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_role")]
    pub role: Role,

    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

/// Backend URLs: `memory`, `sqlite:<path>` or `postgres://...`.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub balance: String,

    #[serde(default = "default_backend")]
    pub ledger: String,

    /// `memory` or `sqlite:<path>`.
    #[serde(default = "default_backend")]
    pub queue: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Competing consumers per queue.
    #[serde(default = "default_consumers")]
    pub consumers: usize,

    /// Deliveries of one task before it is dead-lettered. 0 retries forever.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Record applied reference ids with the balance so a redelivered
    /// transaction never mutates twice.
    #[serde(default)]
    pub guard_replays: bool,
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn default_role() -> Role {
    Role::All
}

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_consumers() -> usize {
    2
}

fn default_max_deliveries() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_lease_secs() -> u64 {
    30
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            balance: default_backend(),
            ledger: default_backend(),
            queue: default_backend(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            consumers: default_consumers(),
            max_deliveries: default_max_deliveries(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            guard_replays: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            role: default_role(),
            server: default_server(),
            logging: default_logging(),
            storage: StorageConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Config {
    /// Reads the config file named on the command line, if it exists, and
    /// applies CLI overrides. A missing file yields the defaults.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).map_err(|source| ConfigError::Parse {
                path: cli.config.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: cli.config.clone(),
                    source,
                })
            }
        };

        // CLI overrides
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(role) = cli.role {
            config.role = role;
        }

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        addr.parse().map_err(|_| ConfigError::ListenAddr(addr))
    }
}
