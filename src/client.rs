//! Client side of the line protocol
//!
//! Sends a file as one request: the sanitized path as the header line, the
//! file's lines as the body, then half-closes and waits for the single
//! response line.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::config::BindTarget;
use crate::error::{RelayError, Result};
use crate::fs_utils::{read_text_file_contents, sanitize_input};
use crate::socket_server::protocol::LINE_TERMINATOR;
use crate::socket_server::session::BoxedStream;

/// Open a stream to `target`
pub async fn connect(target: &BindTarget) -> Result<BoxedStream> {
    let stream: BoxedStream = match target {
        BindTarget::Tcp(addr) => Box::new(TcpStream::connect(addr.as_str()).await?),
        #[cfg(unix)]
        BindTarget::Unix(path) => Box::new(UnixStream::connect(path).await?),
        #[cfg(not(unix))]
        BindTarget::Unix(_) => {
            return Err(RelayError::InvalidTarget {
                message: "unix sockets are not supported on this platform".to_string(),
            })
        }
    };
    Ok(stream)
}

/// Send `file` to the server at `target` and return the response line
/// without its terminator.
pub async fn send_file(target: &BindTarget, file: &Path) -> Result<String> {
    let header = sanitize_input(&file.to_string_lossy());
    if header.is_empty() || header.contains(LINE_TERMINATOR as char) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot send {:?} as a request header", header),
        )
        .into());
    }

    // Read before connecting so a missing file never occupies a server slot
    let owned: PathBuf = file.to_path_buf();
    let contents = tokio::task::spawn_blocking(move || read_text_file_contents(&owned))
        .await
        .map_err(io::Error::other)??;

    let stream = connect(target).await?;
    tracing::debug!("Connected to {}", target);
    request(stream, &header, &contents).await
}

/// Run one request over an already connected stream
pub async fn request(stream: BoxedStream, header: &str, body: &str) -> Result<String> {
    let (read_half, mut write_half) = tokio::io::split(stream);

    write_request(&mut write_half, header, body).await?;
    write_half.shutdown().await?;

    let mut reader = BufReader::new(read_half);
    let mut response = String::new();
    if reader.read_line(&mut response).await? == 0 {
        return Err(RelayError::NoResponse);
    }
    if response.ends_with('\n') {
        response.pop();
    }
    Ok(response)
}

async fn write_request<W>(writer: &mut W, header: &str, body: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&[LINE_TERMINATOR]).await?;

    let mut lines = 0usize;
    for line in body.split_inclusive('\n') {
        writer.write_all(line.as_bytes()).await?;
        lines += 1;
    }
    writer.flush().await?;
    tracing::debug!("Sent '{}' with {} body lines", header, lines);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_request_writes_header_and_body() {
        let (client, mut server) = tokio::io::duplex(1024);

        let server_side = tokio::spawn(async move {
            let mut received = String::new();
            server.read_to_string(&mut received).await.unwrap();
            server.write_all(b"4\n").await.unwrap();
            received
        });

        let response = request(Box::new(client), "foo.txt", "ab\ncd").await.unwrap();
        assert_eq!(response, "4");
        assert_eq!(server_side.await.unwrap(), "foo.txt\nab\ncd");
    }

    #[tokio::test]
    async fn test_close_without_response_is_an_error() {
        let (client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut sink = Vec::new();
            server.read_to_end(&mut sink).await.unwrap();
        });

        let err = request(Box::new(client), "foo.txt", "").await.unwrap_err();
        assert!(matches!(err, RelayError::NoResponse));
    }

    #[tokio::test]
    async fn test_missing_file_fails_before_connecting() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.txt");
        // Nothing listens on this target; the file error must come first
        let target = BindTarget::Unix(dir.path().join("nobody.sock"));

        let err = send_file(&target, &missing).await.unwrap_err();
        match err {
            RelayError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("expected io error, got {:?}", other),
        }
    }
}
