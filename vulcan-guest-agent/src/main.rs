//! Vulcan guest agent: runs as PID 1 (or close to it) inside a provisioned
//! microVM. Listens on a fixed vsock port; for each connection, extracts the
//! workload's code, runs it under the requested runtime, streams logs, and
//! sends exactly one terminal result. A per-connection error never brings
//! the agent down; it keeps serving subsequent connections.

mod error;
mod runner;
mod workspace;

use std::time::Duration;

use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio_vsock::{VsockAddr, VsockListener, VsockStream, VMADDR_CID_ANY};
use tracing::{error, info, warn};

use vulcan_core::domain::DEFAULT_TIMEOUT_S;
use vulcan_core::protocol::{self, GuestMessage, GuestRequest, GuestResponse, MAX_FRAME_BYTES};

use error::{AgentError, Result};

/// The vsock port this agent listens on; must match the host's expectation
/// when configuring the VM's vsock device.
const AGENT_PORT: u32 = 52;

const WORK_ROOT: &str = "/tmp/vulcan-workloads";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, AGENT_PORT))
        .map_err(|e| anyhow::anyhow!("failed to bind vsock port {AGENT_PORT}: {e}"))?;
    info!(port = AGENT_PORT, "guest agent listening");

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed, continuing to serve");
                continue;
            }
        };
        info!(peer = ?addr, "accepted connection");

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream).await {
                error!(error = %e, "connection handling failed");
            }
        });
    }
}

/// Outbound frames a connection's log callback and its terminal result both
/// feed into a single writer task, so only one task ever holds the write
/// half of the socket.
enum Outbound {
    Log(String),
    Result(GuestResponse),
}

async fn handle_connection(stream: VsockStream) -> Result<()> {
    let (mut read_half, mut write_half) = split(stream);

    read_connect_line(&mut read_half).await?;
    write_half.write_all(format!("OK {AGENT_PORT}\n").as_bytes()).await?;

    let request = read_request(&mut read_half).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match msg {
                Outbound::Log(line) => protocol::encode(&GuestMessage::Log { line }),
                Outbound::Result(response) => {
                    protocol::encode(&GuestMessage::Result { response })
                }
            };
            match frame {
                Ok(frame) => {
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode outbound frame"),
            }
        }
    });

    let workload_dir =
        workspace::per_workload_dir(std::path::Path::new(WORK_ROOT), &workload_label(&request));

    let response = match workspace::materialize(&workload_dir, &request).await {
        Err(e) => GuestResponse {
            exit_code: None,
            output: Vec::new(),
            error: Some(e.to_string()),
            log_lines: None,
        },
        Ok(()) => {
            let timeout = Duration::from_secs(if request.timeout_s == 0 {
                DEFAULT_TIMEOUT_S
            } else {
                request.timeout_s
            });

            let log_tx = tx.clone();
            let outcome = runner::run(
                &request.runtime,
                &workload_dir,
                request.input.as_deref(),
                timeout,
                move |line| {
                    let _ = log_tx.send(Outbound::Log(line));
                },
            )
            .await;

            match outcome {
                Ok(outcome) => GuestResponse {
                    exit_code: outcome.exit_code,
                    output: outcome.output,
                    error: outcome.error,
                    log_lines: None,
                },
                Err(e) => GuestResponse {
                    exit_code: None,
                    output: Vec::new(),
                    error: Some(e.to_string()),
                    log_lines: None,
                },
            }
        }
    };

    let _ = tx.send(Outbound::Result(response));
    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

async fn read_connect_line(read_half: &mut ReadHalf<VsockStream>) -> Result<()> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        read_half.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
    }
    Ok(())
}

async fn read_request(read_half: &mut ReadHalf<VsockStream>) -> Result<GuestRequest> {
    let mut len_buf = [0u8; 4];
    read_half.read_exact(&mut len_buf).await?;
    let len = protocol::decode_length(&len_buf)?;
    if len > MAX_FRAME_BYTES {
        return Err(AgentError::Framing(
            vulcan_core::protocol::FramingError::FrameTooLarge(len, MAX_FRAME_BYTES),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    read_half.read_exact(&mut payload).await?;
    Ok(protocol::decode_payload(&payload)?)
}

fn workload_label(request: &GuestRequest) -> String {
    // No workload id travels over the wire; derive a process-unique label
    // from the entrypoint name and PID so concurrent connections (there are
    // none in practice, one VM serves one workload) never collide.
    format!(
        "{}-{}",
        request.entrypoint.as_deref().unwrap_or(&request.runtime),
        std::process::id()
    )
}
