//! Host-side vsock client: dials the VMM's UDS vsock bridge, runs the
//! `CONNECT <port>` handshake, and drives the framed request/response/log
//! protocol defined in `vulcan_core::protocol`.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use vulcan_core::protocol::{self, GuestMessage, GuestRequest, GuestResponse, MAX_FRAME_BYTES};

use crate::error::{FirecrackerError, Result};

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// A connected vsock channel, holding the buffered reader used for the
/// handshake so read-ahead bytes are never lost on the first protocol read.
pub struct VsockConnection {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

/// Dial `uds_path`, retrying up to `MAX_ATTEMPTS` times with exponential
/// backoff starting at 100ms, then perform the `CONNECT <port>` vsock
/// handshake.
///
/// # Errors
///
/// `FirecrackerError::Vsock` if every attempt fails, or the handshake
/// response does not begin with `OK `.
pub async fn dial(uds_path: &Path, port: u32, deadline: Option<Duration>) -> Result<VsockConnection> {
    let mut backoff = INITIAL_BACKOFF;
    let mut last_err = None;

    for attempt in 0..MAX_ATTEMPTS {
        let connect = async {
            let stream = UnixStream::connect(uds_path).await?;
            handshake(stream, port).await
        };

        let result = match deadline {
            Some(d) => timeout(d, connect).await.map_err(|_| {
                FirecrackerError::Vsock(format!("dial deadline of {d:?} exceeded"))
            })?,
            None => connect.await,
        };

        match result {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < MAX_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| FirecrackerError::Vsock("dial failed".to_string())))
}

async fn handshake(stream: UnixStream, port: u32) -> Result<VsockConnection> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(format!("CONNECT {port}\n").as_bytes())
        .await
        .map_err(FirecrackerError::Io)?;

    let mut line = String::new();
    read_line(&mut reader, &mut line).await?;

    if !line.starts_with("OK ") {
        return Err(FirecrackerError::Vsock(format!(
            "handshake rejected: {}",
            line.trim_end()
        )));
    }

    Ok(VsockConnection {
        reader,
        writer: write_half,
    })
}

async fn read_line(
    reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
    out: &mut String,
) -> Result<()> {
    use tokio::io::AsyncBufReadExt;
    let n = reader.read_line(out).await.map_err(FirecrackerError::Io)?;
    if n == 0 {
        return Err(FirecrackerError::Vsock(
            "connection closed during handshake".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::net::UnixListener;

    use super::*;

    #[tokio::test]
    async fn handshake_succeeds_on_ok_prefixed_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("CONNECT 52"));
            stream.write_all(b"OK 0\n").await.unwrap();
        });

        dial(&path, 52, Some(Duration::from_secs(1))).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_a_response_without_the_ok_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"ERR no such port\n").await.unwrap();
        });

        let stream = UnixStream::connect(&path).await.unwrap();
        match handshake(stream, 52).await {
            Err(FirecrackerError::Vsock(msg)) => assert!(msg.contains("ERR no such port")),
            other => panic!("expected a rejected handshake, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dial_retries_with_backoff_and_fails_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            for _ in 0..MAX_ATTEMPTS {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 64];
                let _ = stream.read(&mut buf).await.unwrap();
                stream.write_all(b"ERR nope\n").await.unwrap();
            }
        });

        match dial(&path, 52, None).await {
            Err(FirecrackerError::Vsock(msg)) => assert!(msg.contains("handshake rejected")),
            other => panic!("expected every attempt to fail the handshake, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_surfaces_a_per_attempt_deadline_as_a_vsock_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        // Bound but never accepted: the handshake write succeeds (kernel
        // backlog) but the read for the response blocks until the deadline.
        let _listener = UnixListener::bind(&path).unwrap();

        match dial(&path, 52, Some(Duration::from_millis(20))).await {
            Err(FirecrackerError::Vsock(msg)) => assert!(msg.contains("deadline")),
            other => panic!("expected a deadline error, got {other:?}"),
        }
    }
}

impl VsockConnection {
    /// Send the single `GuestRequest`, then read messages until a `result`
    /// is received, invoking `on_log` for each `log` message along the way.
    ///
    /// # Errors
    ///
    /// `FirecrackerError::Vsock` on any framing error, unknown message type,
    /// a `result` with a null response (not representable given
    /// `GuestResponse`'s shape, but validated here for robustness against a
    /// misbehaving guest), or a read error / unexpected EOF before a result
    /// arrives.
    pub async fn run(
        mut self,
        request: &GuestRequest,
        mut on_log: impl FnMut(String),
    ) -> Result<GuestResponse> {
        let frame = protocol::encode(request)
            .map_err(|e| FirecrackerError::Vsock(e.to_string()))?;
        self.writer.write_all(&frame).await.map_err(FirecrackerError::Io)?;

        loop {
            let mut len_buf = [0u8; 4];
            self.reader
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| FirecrackerError::Vsock(format!("reading frame length: {e}")))?;
            let len = protocol::decode_length(&len_buf)
                .map_err(|e| FirecrackerError::Vsock(e.to_string()))?;
            if len > MAX_FRAME_BYTES {
                return Err(FirecrackerError::Vsock("frame exceeds limit".to_string()));
            }

            let mut payload = vec![0u8; len as usize];
            self.reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| FirecrackerError::Vsock(format!("reading frame payload: {e}")))?;

            let message: GuestMessage = protocol::decode_payload(&payload)
                .map_err(|e| FirecrackerError::Vsock(e.to_string()))?;

            match message {
                GuestMessage::Log { line } => on_log(line),
                GuestMessage::Result { response } => return Ok(response),
            }
        }
    }
}
