//! Configuration management for toolwire
//!
//! Handles environment variables, defaults, and the per-component settings
//! derived from them.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Line printed to stderr once a server is accepting requests
pub const READY_MARKER: &str = "Server started with tools:";

/// Configuration for toolwire
#[derive(Debug, Clone)]
pub struct Config {
    /// Host the TCP server binds to and the socket client dials
    pub host: String,

    /// TCP port
    pub port: u16,

    /// Maximum size of a single framed line
    pub max_line_bytes: usize,

    /// Per-call response budget
    pub call_timeout: Duration,

    /// Bound on process readiness and TCP connect
    pub startup_timeout: Duration,

    /// Grace period for a child process to exit before it is killed
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Create a new configuration from the environment
    pub fn new() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            host: std::env::var("TOOLWIRE_HOST").unwrap_or(defaults.host),
            port: env_or("TOOLWIRE_PORT", defaults.port)?,
            max_line_bytes: env_or("TOOLWIRE_MAX_LINE_BYTES", defaults.max_line_bytes)?,
            call_timeout: env_millis_or("TOOLWIRE_CALL_TIMEOUT_MS", defaults.call_timeout)?,
            startup_timeout: env_millis_or(
                "TOOLWIRE_STARTUP_TIMEOUT_MS",
                defaults.startup_timeout,
            )?,
            shutdown_timeout: env_millis_or(
                "TOOLWIRE_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout,
            )?,
        })
    }

    /// `host:port` address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings for a client correlator
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            call_timeout: self.call_timeout,
            max_line_bytes: self.max_line_bytes,
        }
    }

    /// Settings for a server dispatcher
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_line_bytes: self.max_line_bytes,
        }
    }

    /// Settings for spawning a counterpart process
    pub fn process_config(&self, command: impl Into<PathBuf>, args: Vec<String>) -> ProcessConfig {
        ProcessConfig {
            command: command.into(),
            args,
            ready_marker: READY_MARKER.to_string(),
            startup_timeout: self.startup_timeout,
            shutdown_timeout: self.shutdown_timeout,
            client: self.client_config(),
        }
    }

    /// Settings for dialing a TCP server
    pub fn socket_config(&self, addr: impl Into<String>) -> SocketConfig {
        SocketConfig {
            addr: addr.into(),
            connect_timeout: self.startup_timeout,
            client: self.client_config(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3002,
            max_line_bytes: 1024 * 1024,
            call_timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Client correlator settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub call_timeout: Duration,
    pub max_line_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Config::default().client_config()
    }
}

/// Server dispatcher settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Config::default().server_config()
    }
}

/// Settings for the process transport
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Executable to launch
    pub command: PathBuf,

    /// Arguments passed to the executable
    pub args: Vec<String>,

    /// stderr line content that signals readiness
    pub ready_marker: String,

    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub client: ClientConfig,
}

/// Settings for the socket transport
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// `host:port` to dial
    pub addr: String,

    pub connect_timeout: Duration,
    pub client: ClientConfig,
}

fn env_or<T: FromStr>(var: &str, default: T) -> Result<T> {
    match std::env::var(var) {
        Ok(value) => value.trim().parse().map_err(|_| {
            ConfigError::InvalidValue {
                var: var.to_string(),
                value,
            }
            .into()
        }),
        Err(_) => Ok(default),
    }
}

fn env_millis_or(var: &str, default: Duration) -> Result<Duration> {
    let millis = env_or(var, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
