//! Listening socket and accept loop
//!
//! The accept loop turns every accepted stream into a [`Session`] and submits
//! it to the registry as a join. It never decides admission itself.

use std::io;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::watch;

use crate::config::BindTarget;
use crate::error::{RelayError, Result, SessionError};
#[cfg(unix)]
use crate::fs_utils::remove_path_if_exists;
use crate::socket_server::registry::EventSender;
use crate::socket_server::session::{BoxedStream, IdGenerator, PeerAddr, Session};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listening socket
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind `target`. A leftover unix socket file at the path is removed
    /// first so a crashed previous run doesn't block startup.
    pub async fn bind(target: &BindTarget) -> Result<Self> {
        let bind_error = |source: io::Error| RelayError::Bind {
            target: target.to_string(),
            source,
        };

        match target {
            BindTarget::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await.map_err(bind_error)?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            BindTarget::Unix(path) => {
                match remove_path_if_exists(path) {
                    Ok(true) => tracing::info!("Removed stale socket file {}", path.display()),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Could not remove {}: {}", path.display(), e),
                }
                let listener = UnixListener::bind(path).map_err(bind_error)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            BindTarget::Unix(_) => Err(RelayError::InvalidTarget {
                message: "unix sockets are not supported on this platform".to_string(),
            }),
        }
    }

    /// The address clients should connect to. For TCP this carries the real
    /// port when bound to port 0.
    pub fn local_target(&self) -> io::Result<BindTarget> {
        match self {
            Listener::Tcp(listener) => Ok(BindTarget::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(BindTarget::Unix(path.clone())),
        }
    }

    pub async fn accept(&self) -> io::Result<(BoxedStream, PeerAddr)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                // One-line request and response; don't wait on Nagle
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("set_nodelay failed for {}: {}", addr, e);
                }
                let stream: BoxedStream = Box::new(stream);
                Ok((stream, PeerAddr::Tcp(addr)))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, addr) = listener.accept().await?;
                let peer = PeerAddr::Unix(addr.as_pathname().map(|p| p.to_path_buf()));
                let stream: BoxedStream = Box::new(stream);
                Ok((stream, peer))
            }
        }
    }
}

/// Errors meaning the listening socket itself is gone
pub fn is_listener_closed(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected
    )
}

/// Accept connections until `shutdown` fires or the listener is closed.
///
/// The listener is dropped when this returns.
pub async fn accept_loop(
    listener: Listener,
    ids: Arc<IdGenerator>,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            result = listener.accept() => result,
        };

        match accepted {
            Ok((stream, peer)) => {
                let session = Session::new(ids.next_id(), peer, stream);
                tracing::debug!("Accepted session {} from {}", session.id(), session.peer());
                if !events.join(session) {
                    break;
                }
            }
            Err(e) if is_listener_closed(&e) => {
                tracing::debug!("Listener closed: {}", e);
                break;
            }
            Err(e) => {
                events.error(None, SessionError::Accept(e));
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket_server::registry::RegistryEvent;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_tcp_bind_reports_real_port() {
        let listener = Listener::bind(&BindTarget::Tcp("127.0.0.1:0".to_string()))
            .await
            .unwrap();
        match listener.local_target().unwrap() {
            BindTarget::Tcp(addr) => assert!(!addr.ends_with(":0"), "got {}", addr),
            other => panic!("expected tcp target, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bind_failure_is_bind_error() {
        let first = Listener::bind(&BindTarget::Tcp("127.0.0.1:0".to_string()))
            .await
            .unwrap();
        let taken = first.local_target().unwrap();

        let err = Listener::bind(&taken).await.unwrap_err();
        assert!(matches!(err, RelayError::Bind { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_replaces_stale_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("relay.sock");
        std::fs::write(&path, "stale").unwrap();

        let listener = Listener::bind(&BindTarget::Unix(path.clone())).await.unwrap();
        assert_eq!(listener.local_target().unwrap(), BindTarget::Unix(path));
    }

    #[tokio::test]
    async fn test_accept_loop_submits_joins_and_stops() {
        let listener = Listener::bind(&BindTarget::Tcp("127.0.0.1:0".to_string()))
            .await
            .unwrap();
        let addr = match listener.local_target().unwrap() {
            BindTarget::Tcp(addr) => addr,
            other => panic!("expected tcp target, got {:?}", other),
        };

        let (events, mut rx) = EventSender::channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(IdGenerator::new()),
            events,
            stop_rx,
        ));

        let mut client = TcpStream::connect(&addr).await.unwrap();
        client.write_all(b"hello\n").await.unwrap();

        match rx.recv().await {
            Some(RegistryEvent::Join(session)) => {
                assert!(matches!(session.peer(), PeerAddr::Tcp(_)));
            }
            other => panic!("expected join, got {:?}", other),
        }

        stop_tx.send(true).unwrap();
        task.await.unwrap();

        // Listener dropped with the loop
        assert!(TcpStream::connect(&addr).await.is_err());
    }

    #[test]
    fn test_closed_listener_errors() {
        assert!(is_listener_closed(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(!is_listener_closed(&io::Error::from(io::ErrorKind::ConnectionAborted)));
    }
}
