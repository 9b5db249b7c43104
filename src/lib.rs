//! Sockrelay: bounded concurrent line-protocol server
//!
//! A server accepts clients over a unix domain socket or TCP, admits at most
//! a configured number at a time, and answers each admitted client's single
//! request with one response line. Connections beyond the limit receive a
//! capacity notice and are closed.
//!
//! # Example
//!
//! ```no_run
//! use sockrelay::{BindTarget, Server, ServerConfig};
//!
//! # async fn demo() -> sockrelay::Result<()> {
//! let config = ServerConfig::new(BindTarget::Tcp("127.0.0.1:7070".into()))
//!     .with_max_sessions(4);
//! let server = Server::start(config).await?;
//!
//! let response = sockrelay::client::send_file(server.local_target(), "notes.txt".as_ref()).await?;
//! println!("{}", response);
//!
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod fs_utils;
pub mod socket_server;

// Re-export commonly used types
pub use cli::Cli;
pub use config::{BindTarget, FileConfig, ServerConfig};
pub use error::{RelayError, Result, SessionError};
pub use socket_server::{
    Computation, ComputationKind, RegistryHandle, RegistrySnapshot, Server, SessionId,
};
