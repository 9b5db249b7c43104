//! Server lifecycle
//!
//! `Server::start` acquires resources in order and records each on a
//! teardown stack. `Server::shutdown` pops the stack, so release happens in
//! reverse:
//!
//! ```text
//!   acquire: socket path -> registry loop -> accept loop
//!   release: stop accept loop (drops listener)
//!            -> registry shutdown (closes sessions)
//!            -> remove socket path
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{BindTarget, ServerConfig};
use crate::error::Result;
use crate::fs_utils::remove_path_if_exists;
use crate::socket_server::handler::ProtocolHandler;
use crate::socket_server::listener::{accept_loop, Listener};
use crate::socket_server::protocol::Computation;
use crate::socket_server::registry::{Registry, RegistryHandle, RegistrySnapshot};
use crate::socket_server::session::IdGenerator;

/// One acquired resource and how to release it
enum Teardown {
    SocketPath(PathBuf),
    Registry {
        handle: RegistryHandle,
        task: JoinHandle<()>,
    },
    AcceptLoop {
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
    },
}

impl Teardown {
    async fn release(self) {
        match self {
            Teardown::AcceptLoop { stop, task } => {
                let _ = stop.send(true);
                if let Err(e) = task.await {
                    tracing::warn!("Accept loop ended abnormally: {}", e);
                }
                tracing::debug!("Listener closed");
            }
            Teardown::Registry { handle, task } => {
                handle.shutdown().await;
                if let Err(e) = task.await {
                    tracing::warn!("Registry loop ended abnormally: {}", e);
                }
            }
            Teardown::SocketPath(path) => remove_socket_path(&path),
        }
    }
}

fn remove_socket_path(path: &Path) {
    match remove_path_if_exists(path) {
        Ok(true) => tracing::info!("Removed socket file {}", path.display()),
        Ok(false) => tracing::debug!("Socket file {} already removed", path.display()),
        Err(e) => tracing::warn!("Failed to remove socket file {}: {}", path.display(), e),
    }
}

/// A running relay server
pub struct Server {
    local: BindTarget,
    registry: RegistryHandle,
    teardown: Mutex<Vec<Teardown>>,
}

impl Server {
    /// Bind and start serving with the computation named by `config.mode`
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let computation = config.mode.build();
        Self::start_with(config, computation).await
    }

    /// Bind and start serving with an explicit computation
    pub async fn start_with(config: ServerConfig, computation: Arc<dyn Computation>) -> Result<Self> {
        config.validate()?;
        let mode = computation.name();
        let mut teardown = Vec::new();

        let listener = Listener::bind(&config.bind).await?;
        let local = listener.local_target()?;
        if let BindTarget::Unix(path) = &local {
            teardown.push(Teardown::SocketPath(path.clone()));
        }

        let handler = Arc::new(ProtocolHandler::new(
            computation,
            config.idle_timeout,
            config.max_request_bytes,
        ));
        let (registry, registry_task) = Registry::spawn(config.max_sessions, handler);
        teardown.push(Teardown::Registry {
            handle: registry.clone(),
            task: registry_task,
        });

        let (stop, stop_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::new(IdGenerator::new()),
            registry.events().clone(),
            stop_rx,
        ));
        teardown.push(Teardown::AcceptLoop {
            stop,
            task: accept_task,
        });

        tracing::info!(
            "Listening on {} (max {} clients, mode {})",
            local,
            config.max_sessions,
            mode
        );

        Ok(Self {
            local,
            registry,
            teardown: Mutex::new(teardown),
        })
    }

    /// Where clients connect; for TCP this carries the bound port
    pub fn local_target(&self) -> &BindTarget {
        &self.local
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Current registry state, or `None` after shutdown
    pub async fn snapshot(&self) -> Option<RegistrySnapshot> {
        self.registry.snapshot().await
    }

    /// Release everything `start` acquired, in reverse order.
    ///
    /// Only the first call does any work; later calls return immediately.
    pub async fn shutdown(&self) {
        let stack = std::mem::take(&mut *self.teardown.lock());
        if stack.is_empty() {
            return;
        }

        tracing::info!("Shutting down {}", self.local);
        for step in stack.into_iter().rev() {
            step.release().await;
        }
        tracing::info!("Shutdown complete");
    }

    /// Serve until SIGINT or SIGTERM, then shut down
    pub async fn run_until_signal(&self) -> io::Result<()> {
        wait_for_shutdown_signal().await?;
        self.shutdown().await;
        Ok(())
    }
}

impl Drop for Server {
    /// Best-effort release when `shutdown` was never awaited. The registry
    /// stops by itself once its last handle is dropped.
    fn drop(&mut self) {
        let stack = std::mem::take(&mut *self.teardown.lock());
        if stack.is_empty() {
            return;
        }
        tracing::debug!("Server dropped without shutdown");
        for step in stack.into_iter().rev() {
            match step {
                Teardown::AcceptLoop { stop, task } => {
                    let _ = stop.send(true);
                    task.abort();
                }
                Teardown::Registry { .. } => {}
                Teardown::SocketPath(path) => remove_socket_path(&path),
            }
        }
    }
}

/// Wait for SIGTERM or SIGINT
async fn wait_for_shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C");
    }

    Ok(())
}
