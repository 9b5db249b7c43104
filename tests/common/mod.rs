//! Common test utilities for sockrelay integration tests
//!
//! - `TestServer`: a running server on an ephemeral TCP port or a unix
//!   socket inside a temp dir, shut down on request
//! - raw request helpers that drive the wire protocol directly

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use sockrelay::{BindTarget, ComputationKind, RegistrySnapshot, Server, ServerConfig};

/// Capacity line as a client receives it
pub fn capacity_line(active: usize) -> String {
    format!(
        "Sorry, we are currently at full capacity with {} clients. Please try again later.\n",
        active
    )
}

pub struct TestServer {
    pub server: Server,
    /// Keeps a unix socket's directory alive
    pub dir: Option<TempDir>,
}

impl TestServer {
    pub async fn tcp(max_sessions: usize) -> Self {
        Self::tcp_with(max_sessions, ComputationKind::Letters, Some(Duration::from_secs(5))).await
    }

    pub async fn tcp_with(
        max_sessions: usize,
        mode: ComputationKind,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let config = ServerConfig::new(BindTarget::Tcp("127.0.0.1:0".to_string()))
            .with_max_sessions(max_sessions)
            .with_idle_timeout(idle_timeout)
            .with_mode(mode);
        let server = Server::start(config).await.expect("server should start");
        Self { server, dir: None }
    }

    pub async fn unix(max_sessions: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sockrelay.sock");
        let config = ServerConfig::new(BindTarget::Unix(path)).with_max_sessions(max_sessions);
        let server = Server::start(config).await.expect("server should start");
        Self {
            server,
            dir: Some(dir),
        }
    }

    pub fn target(&self) -> &BindTarget {
        self.server.local_target()
    }

    pub fn tcp_addr(&self) -> String {
        match self.target() {
            BindTarget::Tcp(addr) => addr.clone(),
            other => panic!("expected tcp target, got {:?}", other),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        match self.target() {
            BindTarget::Unix(path) => path.clone(),
            other => panic!("expected unix target, got {:?}", other),
        }
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.tcp_addr()).await.unwrap()
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.server.snapshot().await.expect("registry should be running")
    }

    /// Poll the registry until `check` holds
    pub async fn wait_for<F: Fn(&RegistrySnapshot) -> bool>(&self, check: F) -> RegistrySnapshot {
        for _ in 0..300 {
            let snapshot = self.snapshot().await;
            if check(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached expected state: {:?}", self.snapshot().await);
    }

    pub async fn shutdown(&self) {
        self.server.shutdown().await;
    }
}

/// Write a full request, half-close, and read everything the server sends
pub async fn send_raw(stream: &mut TcpStream, request: &[u8]) -> String {
    stream.write_all(request).await.unwrap();
    stream.shutdown().await.unwrap();
    read_all(stream).await
}

pub async fn read_all(stream: &mut TcpStream) -> String {
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}
