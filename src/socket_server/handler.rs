//! Per-session request/response cycle
//!
//! Runs inside the session's own task. The handler never touches the
//! registry table; it reports back through an [`EventSender`] and always
//! finishes with exactly one leave event, handing the session back so the
//! registry can close it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt};

use crate::error::SessionError;
use crate::fs_utils::sanitize_input;
use crate::socket_server::protocol::{Computation, Request, LINE_TERMINATOR};
use crate::socket_server::registry::EventSender;
use crate::socket_server::session::Session;

/// Executes one request/response cycle against a session
pub struct ProtocolHandler {
    computation: Arc<dyn Computation>,
    /// Bound on each read and write; `None` waits forever
    idle_timeout: Option<Duration>,
    /// Bound on header plus body bytes
    max_request_bytes: usize,
}

impl ProtocolHandler {
    pub fn new(
        computation: Arc<dyn Computation>,
        idle_timeout: Option<Duration>,
        max_request_bytes: usize,
    ) -> Self {
        Self {
            computation,
            idle_timeout,
            max_request_bytes,
        }
    }

    pub fn computation_name(&self) -> &'static str {
        self.computation.name()
    }

    /// Serve `session` and report the outcome.
    ///
    /// Emits at most one error event followed by exactly one leave event.
    pub async fn run(&self, mut session: Session, events: EventSender) {
        if let Err(cause) = self.serve(&mut session).await {
            events.error(Some(session.id()), cause);
        }
        events.leave(session);
    }

    async fn serve(&self, session: &mut Session) -> Result<(), SessionError> {
        let request = self.read_request(session).await?;
        tracing::debug!(
            "Session {} request '{}': {} lines, {} bytes",
            session.id(),
            request.subject,
            request.line_count,
            request.body.len()
        );

        let computation = Arc::clone(&self.computation);
        let subject = request.subject.clone();
        let response =
            match tokio::task::spawn_blocking(move || computation.compute(&request)).await {
                Ok(response) => response,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => return Err(SessionError::Computation(e.to_string())),
            };

        self.deadline(session.write_line(&response))
            .await?
            .map_err(SessionError::Write)?;

        tracing::info!(
            "Session {} answered '{}' with {} bytes ({})",
            session.id(),
            subject,
            response.len(),
            self.computation.name()
        );
        Ok(())
    }

    /// Read the header line, then body lines until the client half-closes
    async fn read_request(&self, session: &mut Session) -> Result<Request, SessionError> {
        let mut budget = self.max_request_bytes;

        let mut header = Vec::new();
        if self.read_line(session, &mut header, &mut budget).await? == 0 {
            return Err(SessionError::HeaderMissing);
        }
        if header.last() != Some(&LINE_TERMINATOR) {
            return Err(SessionError::HeaderUnterminated);
        }
        let subject = sanitize_input(&String::from_utf8_lossy(&header));
        session.set_subject(subject.clone());

        let mut body = Vec::new();
        let mut line_count = 0;
        let mut line = Vec::new();
        loop {
            line.clear();
            if self.read_line(session, &mut line, &mut budget).await? == 0 {
                break;
            }
            body.extend_from_slice(strip_terminator(&line));
            body.push(LINE_TERMINATOR);
            line_count += 1;
        }

        Ok(Request {
            subject,
            body,
            line_count,
        })
    }

    /// Read one line into `buf`, charging its length against `budget`.
    ///
    /// Returns 0 at end of stream.
    async fn read_line(
        &self,
        session: &mut Session,
        buf: &mut Vec<u8>,
        budget: &mut usize,
    ) -> Result<usize, SessionError> {
        let limit = (*budget as u64).saturating_add(1);
        let mut reader = session.reader_mut().take(limit);

        let n = self
            .deadline(reader.read_until(LINE_TERMINATOR, buf))
            .await?
            .map_err(SessionError::Read)?;

        if n > *budget {
            return Err(SessionError::RequestTooLarge {
                limit: self.max_request_bytes,
            });
        }
        *budget -= n;
        Ok(n)
    }

    async fn deadline<F: Future>(&self, fut: F) -> Result<F::Output, SessionError> {
        match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| SessionError::IdleTimeout(limit)),
            None => Ok(fut.await),
        }
    }
}

/// Strip a trailing `\n` and a `\r` before it, if present
fn strip_terminator(line: &[u8]) -> &[u8] {
    match line.strip_suffix(&[LINE_TERMINATOR]) {
        Some(rest) => rest.strip_suffix(b"\r").unwrap_or(rest),
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket_server::protocol::{Echo, LetterCount};
    use crate::socket_server::registry::RegistryEvent;
    use crate::socket_server::session::{IdGenerator, PeerAddr};
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// What the registry would have seen, with sessions dropped (closed)
    #[derive(Debug)]
    enum Seen {
        Error(SessionError),
        Leave(Option<String>),
    }

    fn handler(computation: Arc<dyn Computation>) -> ProtocolHandler {
        ProtocolHandler::new(computation, Some(Duration::from_secs(5)), 1024)
    }

    fn session() -> (Session, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let session = Session::new(IdGenerator::new().next_id(), PeerAddr::Local, Box::new(server));
        (session, client)
    }

    fn drain(rx: &mut UnboundedReceiver<RegistryEvent>) -> Vec<Seen> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                RegistryEvent::Error { cause, .. } => out.push(Seen::Error(cause)),
                RegistryEvent::Leave(session) => {
                    out.push(Seen::Leave(session.subject().map(str::to_string)))
                }
                other => panic!("unexpected event from handler: {:?}", other),
            }
        }
        out
    }

    /// Send `input`, half-close, run the handler, return the response text
    async fn exchange(handler: &ProtocolHandler, input: &[u8]) -> (String, Vec<Seen>) {
        let (session, mut client) = session();
        let (events, mut rx) = EventSender::channel();

        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        handler.run(session, events).await;
        let seen = drain(&mut rx);

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        (response, seen)
    }

    fn count_errors(seen: &[Seen]) -> usize {
        seen.iter().filter(|e| matches!(e, Seen::Error(_))).count()
    }

    fn count_leaves(seen: &[Seen]) -> usize {
        seen.iter().filter(|e| matches!(e, Seen::Leave(_))).count()
    }

    #[tokio::test]
    async fn test_letter_count_round_trip() {
        let handler = handler(Arc::new(LetterCount));
        let (response, seen) = exchange(&handler, b"foo.txt\nab\ncd\n").await;

        assert_eq!(response, "4\n");
        assert_eq!(count_errors(&seen), 0);
        assert_eq!(count_leaves(&seen), 1);
        match seen.last() {
            Some(Seen::Leave(subject)) => assert_eq!(subject.as_deref(), Some("foo.txt")),
            other => panic!("expected leave, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_header_only_is_not_an_error() {
        let handler = handler(Arc::new(LetterCount));
        let (response, seen) = exchange(&handler, b"foo.txt\n").await;

        assert_eq!(response, "0\n");
        assert_eq!(count_errors(&seen), 0);
        assert_eq!(count_leaves(&seen), 1);
    }

    #[tokio::test]
    async fn test_final_unterminated_line_is_kept() {
        let handler = handler(Arc::new(Echo));
        let (response, _) = exchange(&handler, b"x\nab\r\ncd").await;
        assert_eq!(response, "ab\ncd\n");
    }

    #[tokio::test]
    async fn test_immediate_disconnect_reports_one_error_then_leave() {
        let handler = handler(Arc::new(LetterCount));
        let (response, seen) = exchange(&handler, b"").await;

        assert_eq!(response, "");
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], Seen::Error(SessionError::HeaderMissing)));
        assert!(matches!(seen[1], Seen::Leave(None)));
    }

    #[tokio::test]
    async fn test_unterminated_header_is_an_error() {
        let handler = handler(Arc::new(LetterCount));
        let (response, seen) = exchange(&handler, b"foo.txt").await;

        assert_eq!(response, "");
        assert!(matches!(seen[0], Seen::Error(SessionError::HeaderUnterminated)));
        assert_eq!(count_leaves(&seen), 1);
    }

    #[tokio::test]
    async fn test_request_too_large() {
        let handler = ProtocolHandler::new(Arc::new(LetterCount), None, 8);
        let (_, seen) = exchange(&handler, b"a\nbbbbbbbbbbbb\n").await;

        assert!(matches!(
            seen[0],
            Seen::Error(SessionError::RequestTooLarge { limit: 8 })
        ));
        assert_eq!(count_leaves(&seen), 1);
    }

    #[tokio::test]
    async fn test_idle_client_times_out() {
        let handler = ProtocolHandler::new(
            Arc::new(LetterCount),
            Some(Duration::from_millis(50)),
            1024,
        );
        let (session, mut client) = session();
        let (events, mut rx) = EventSender::channel();

        // Header arrives but the client never finishes the body
        client.write_all(b"slow.txt\nab").await.unwrap();
        handler.run(session, events).await;

        let seen = drain(&mut rx);
        assert!(matches!(seen[0], Seen::Error(SessionError::IdleTimeout(_))));
        assert_eq!(count_leaves(&seen), 1);
    }

    /// Blocks its thread until released, or gives up after a few seconds
    struct Gate {
        release: parking_lot::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Computation for Gate {
        fn name(&self) -> &'static str {
            "gate"
        }

        fn compute(&self, _request: &Request) -> Vec<u8> {
            match self.release.lock().recv_timeout(Duration::from_secs(5)) {
                Ok(()) => b"released".to_vec(),
                Err(_) => b"stalled".to_vec(),
            }
        }
    }

    #[tokio::test]
    async fn test_computation_does_not_block_the_runtime() {
        let (release, gate) = std::sync::mpsc::channel();
        let handler = Arc::new(handler(Arc::new(Gate {
            release: parking_lot::Mutex::new(gate),
        })));
        let (session, mut client) = session();
        let (events, _rx) = EventSender::channel();

        client.write_all(b"slow.txt\nbody\n").await.unwrap();
        client.shutdown().await.unwrap();
        let task = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.run(session, events).await }
        });

        // Single-threaded runtime: this only wakes if compute left the worker
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.send(()).unwrap();

        task.await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert_eq!(response, "released\n");
    }

    #[test]
    fn test_strip_terminator() {
        assert_eq!(strip_terminator(b"ab\n"), b"ab");
        assert_eq!(strip_terminator(b"ab\r\n"), b"ab");
        assert_eq!(strip_terminator(b"ab"), b"ab");
        assert_eq!(strip_terminator(b"\n"), b"");
    }
}
