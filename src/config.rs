use std::collections::HashMap;
use std::fs::read_to_string;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
struct Cli {
    /// Path to a serde_json5 config document. Falls back to built-in
    /// defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

fn default_addr_pp() -> SocketAddr {
    "0.0.0.0:3478".parse().unwrap()
}

fn default_advertised() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_threshold() -> u32 {
    50
}

fn default_rate_limit_window_secs() -> u64 {
    1
}

fn default_rate_limit_capacity() -> usize {
    65536
}

/// Endpoint bind options. Serialized as a flat table in the config file,
/// matching the options enumerated for the dispatch core.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoints {
    #[serde(default = "default_addr_pp")]
    pub addr_pp: SocketAddr,
    pub addr_pa: Option<SocketAddr>,
    pub addr_ap: Option<SocketAddr>,
    pub addr_aa: Option<SocketAddr>,
    #[serde(default = "default_advertised")]
    pub addr_primary_advertised: IpAddr,
    pub addr_alternate_advertised: Option<IpAddr>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            addr_pp: default_addr_pp(),
            addr_pa: None,
            addr_ap: None,
            addr_aa: None,
            addr_primary_advertised: default_advertised(),
            addr_alternate_advertised: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoints: Endpoints,
    #[serde(default)]
    pub threading_per_socket: u32,
    #[serde(default)]
    pub max_connections: u32,
    #[serde(default)]
    pub is_full_mode: bool,
    #[serde(default)]
    pub tcp: bool,
    #[serde(default = "default_true")]
    pub reuse_addr: bool,
    #[serde(default)]
    pub enable_dos_protection: bool,
    #[serde(default = "default_rate_limit_threshold")]
    pub rate_limit_threshold: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: usize,
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default)]
    pub auth: HashMap<String, String>,
    #[serde(default)]
    pub log: Log,
}

fn default_realm() -> String {
    "stun-server".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            threading_per_socket: 0,
            max_connections: 1024,
            is_full_mode: false,
            tcp: false,
            reuse_addr: true,
            enable_dos_protection: false,
            rate_limit_threshold: default_rate_limit_threshold(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_capacity: default_rate_limit_capacity(),
            realm: default_realm(),
            auth: HashMap::new(),
            log: Log { level: LogLevel::Info },
        }
    }
}

impl Config {
    /// Parses `--config <path>` off argv and loads that file as
    /// `serde_json5`, or returns built-in defaults if no path was given.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();

        match cli.config {
            Some(path) => {
                let raw = read_to_string(&path)?;
                Ok(serde_json5::from_str(&raw)?)
            }
            None => Ok(Self::default()),
        }
    }
}
