//! Server configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! command-line flags. The resolved [`ServerConfig`] is immutable once the
//! server starts.
//!
//! ```toml
//! [server]
//! socket = "/tmp/sockrelay.sock"   # or: address = "0.0.0.0", port = 7070
//! max_clients = 10
//! idle_timeout_secs = 30           # 0 disables the timeout
//! max_request_bytes = 16777216
//! mode = "letters"                 # letters | echo | lookup
//!
//! [logging]
//! level = "info"
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RelayError, Result};
use crate::socket_server::protocol::ComputationKind;

pub const DEFAULT_SOCKET_FILE: &str = "/tmp/sockrelay.sock";
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_MAX_CLIENTS: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Where the server listens and the client connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    /// Filesystem path of a unix domain socket
    Unix(PathBuf),
    /// `host:port` for TCP
    Tcp(String),
}

impl BindTarget {
    /// Build a target from the socket/address/port trio.
    ///
    /// A port selects TCP (address defaults to loopback); otherwise the
    /// socket path is used, falling back to [`DEFAULT_SOCKET_FILE`].
    pub fn from_parts(
        socket: Option<PathBuf>,
        address: Option<String>,
        port: Option<u16>,
    ) -> Result<Self> {
        match (socket, address, port) {
            (Some(_), _, Some(_)) => Err(RelayError::InvalidTarget {
                message: "a socket path and a TCP port are mutually exclusive".to_string(),
            }),
            (Some(_), Some(_), None) => Err(RelayError::InvalidTarget {
                message: "a socket path and a TCP address are mutually exclusive".to_string(),
            }),
            (Some(path), None, None) => {
                if path.as_os_str().is_empty() {
                    return Err(RelayError::InvalidTarget {
                        message: "socket path is empty".to_string(),
                    });
                }
                Ok(Self::Unix(path))
            }
            (None, address, Some(port)) => {
                let host = address.unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
                Ok(Self::Tcp(format!("{}:{}", host, port)))
            }
            (None, Some(address), None) => Err(RelayError::InvalidTarget {
                message: format!("address '{}' given without a port", address),
            }),
            (None, None, None) => Ok(Self::Unix(PathBuf::from(DEFAULT_SOCKET_FILE))),
        }
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindTarget::Unix(path) => write!(f, "unix:{}", path.display()),
            BindTarget::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// Resolved, immutable server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: BindTarget,
    pub max_sessions: usize,
    /// Per read/write inactivity bound; `None` disables it
    pub idle_timeout: Option<Duration>,
    pub max_request_bytes: usize,
    pub mode: ComputationKind,
}

impl ServerConfig {
    /// Defaults for everything but the bind target
    pub fn new(bind: BindTarget) -> Self {
        Self {
            bind,
            max_sessions: DEFAULT_MAX_CLIENTS,
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            mode: ComputationKind::default(),
        }
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_request_bytes(mut self, max_request_bytes: usize) -> Self {
        self.max_request_bytes = max_request_bytes;
        self
    }

    pub fn with_mode(mut self, mode: ComputationKind) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(RelayError::Config {
                message: "max clients must be at least 1".to_string(),
            });
        }
        if self.max_request_bytes == 0 {
            return Err(RelayError::Config {
                message: "max request bytes must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// `[server]` table; also the shape command-line overrides are merged in
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub socket: Option<PathBuf>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub max_clients: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub max_request_bytes: Option<usize>,
    pub mode: Option<ComputationKind>,
}

impl ServerSection {
    /// Overlay `overrides` on top of `self`.
    ///
    /// If the overrides name any part of the bind target, they replace the
    /// whole target so a file's socket path can't collide with a CLI port.
    pub fn merge(self, overrides: ServerSection) -> ServerSection {
        let override_bind =
            overrides.socket.is_some() || overrides.address.is_some() || overrides.port.is_some();
        let (socket, address, port) = if override_bind {
            (overrides.socket, overrides.address, overrides.port)
        } else {
            (self.socket, self.address, self.port)
        };

        ServerSection {
            socket,
            address,
            port,
            max_clients: overrides.max_clients.or(self.max_clients),
            idle_timeout_secs: overrides.idle_timeout_secs.or(self.idle_timeout_secs),
            max_request_bytes: overrides.max_request_bytes.or(self.max_request_bytes),
            mode: overrides.mode.or(self.mode),
        }
    }

    /// Fill in defaults and validate
    pub fn into_config(self) -> Result<ServerConfig> {
        let bind = BindTarget::from_parts(self.socket, self.address, self.port)?;
        let idle_timeout = match self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let config = ServerConfig::new(bind)
            .with_max_sessions(self.max_clients.unwrap_or(DEFAULT_MAX_CLIENTS))
            .with_idle_timeout(idle_timeout)
            .with_max_request_bytes(self.max_request_bytes.unwrap_or(DEFAULT_MAX_REQUEST_BYTES))
            .with_mode(self.mode.unwrap_or_default());
        config.validate()?;
        Ok(config)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Contents of a sockrelay TOML config file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FileConfig {
    /// Load configuration from `path`
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| RelayError::ConfigRead {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RelayError::Config {
            message: format!("Failed to parse config: {}", e),
        })
    }
}
