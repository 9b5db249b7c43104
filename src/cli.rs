//! CLI argument definitions using clap with subcommand architecture
//!
//! Every option can also be supplied through a `SOCKRELAY_*` environment
//! variable. Serve options left unset fall through to the config file and
//! then to built-in defaults (see [`crate::config`]).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{BindTarget, ServerSection};
use crate::error::Result;
use crate::socket_server::protocol::ComputationKind;

/// Bounded concurrent request server over unix sockets or TCP
#[derive(Parser, Debug)]
#[command(name = "sockrelay")]
#[command(about = "Bounded concurrent line-protocol server and client")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands for sockrelay
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the server until SIGINT/SIGTERM
    Serve(ServeArgs),

    /// Send a file to a running server and print the response
    Send(SendArgs),
}

/// Where to listen or connect. Socket and port are mutually exclusive.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Unix domain socket path
    #[arg(long, value_name = "PATH", env = "SOCKRELAY_SOCKET", conflicts_with = "port")]
    pub socket: Option<PathBuf>,

    /// TCP host (requires --port)
    #[arg(long, value_name = "HOST", env = "SOCKRELAY_ADDRESS", requires = "port")]
    pub address: Option<String>,

    /// TCP port
    #[arg(short, long, env = "SOCKRELAY_PORT")]
    pub port: Option<u16>,
}

impl TargetArgs {
    /// Resolve to a bind target, defaulting to the standard socket path
    pub fn target(&self) -> Result<BindTarget> {
        BindTarget::from_parts(self.socket.clone(), self.address.clone(), self.port)
    }
}

/// Arguments for the serve command
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Maximum number of concurrently admitted clients
    #[arg(short = 'n', long, value_name = "N", env = "SOCKRELAY_MAX_CLIENTS")]
    pub max_clients: Option<usize>,

    /// Seconds a client may stay silent before it is dropped (0 disables)
    #[arg(long, value_name = "SECS", env = "SOCKRELAY_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Maximum request size in bytes, header included
    #[arg(long, value_name = "N", env = "SOCKRELAY_MAX_REQUEST_BYTES")]
    pub max_request_bytes: Option<usize>,

    /// Computation applied to each request
    #[arg(short, long, value_enum, env = "SOCKRELAY_MODE")]
    pub mode: Option<ComputationKind>,

    /// TOML config file
    #[arg(short, long, value_name = "FILE", env = "SOCKRELAY_CONFIG")]
    pub config: Option<PathBuf>,
}

impl ServeArgs {
    /// Command-line values as a layer to merge over the config file
    pub fn overrides(&self) -> ServerSection {
        ServerSection {
            socket: self.target.socket.clone(),
            address: self.target.address.clone(),
            port: self.target.port,
            max_clients: self.max_clients,
            idle_timeout_secs: self.idle_timeout,
            max_request_bytes: self.max_request_bytes,
            mode: self.mode,
        }
    }
}

/// Arguments for the send command
#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// File whose path is sent as the header and contents as the body
    #[arg(short, long, value_name = "FILE")]
    pub file: PathBuf,

    #[command(flatten)]
    pub target: TargetArgs,
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
