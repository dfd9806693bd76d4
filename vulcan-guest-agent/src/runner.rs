//! Runs the extracted entrypoint under the runtime's interpreter/toolchain,
//! streaming each stdout line to a callback and enforcing the request's
//! timeout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::{AgentError, Result};

/// What ran and how it ended.
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub output: Vec<u8>,
    pub error: Option<String>,
}

/// Build the command line for `runtime` against files in `work_dir`.
///
/// # Errors
///
/// `AgentError::UnsupportedRuntime` for any runtime this agent image does
/// not carry a toolchain for.
fn command_for(runtime: &str, work_dir: &Path) -> Result<Command> {
    let mut cmd = match runtime {
        "node" => {
            let mut c = Command::new("node");
            c.arg(work_dir.join("index.js"));
            c
        }
        "python" => {
            let mut c = Command::new("python3");
            c.arg(work_dir.join("main.py"));
            c
        }
        "go" => {
            let mut c = Command::new("go");
            c.arg("run").arg(work_dir.join("main.go"));
            c
        }
        other => return Err(AgentError::UnsupportedRuntime(other.to_string())),
    };
    cmd.current_dir(work_dir);
    Ok(cmd)
}

/// Execute `runtime`'s entrypoint, invoking `on_log` once per stdout line as
/// it is produced, and enforcing `timeout` by killing the child process.
///
/// # Errors
///
/// `AgentError::UnsupportedRuntime` if `runtime` has no known command.
/// `AgentError::Spawn` if the process fails to start.
pub async fn run(
    runtime: &str,
    work_dir: &Path,
    input: Option<&[u8]>,
    timeout: Duration,
    mut on_log: impl FnMut(String),
) -> Result<RunOutcome> {
    let mut cmd = command_for(runtime, work_dir)?;
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(AgentError::Spawn)?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        use tokio::io::AsyncWriteExt;
        let input = input.to_vec();
        tokio::spawn(async move {
            let _ = stdin.write_all(&input).await;
        });
    }

    let stdout = child.stdout.take().ok_or(AgentError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(AgentError::MissingPipe("stderr"))?;

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut output = Vec::new();
    let stream_stdout = async {
        while let Ok(Some(line)) = stdout_lines.next_line().await {
            output.extend_from_slice(line.as_bytes());
            output.push(b'\n');
            on_log(line);
        }
    };

    let mut stderr_lines = BufReader::new(stderr).lines();
    let collect_stderr = async {
        let mut buf = String::new();
        while let Ok(Some(line)) = stderr_lines.next_line().await {
            buf.push_str(&line);
            buf.push('\n');
        }
        buf
    };

    let run_to_completion = async {
        let (_, stderr_buf) = tokio::join!(stream_stdout, collect_stderr);
        let status = child.wait().await;
        (status, stderr_buf)
    };

    match tokio::time::timeout(timeout, run_to_completion).await {
        Ok((status, stderr_buf)) => {
            let status = status.map_err(AgentError::Io)?;
            let error = if status.success() {
                None
            } else if stderr_buf.is_empty() {
                Some(format!("process exited with {status}"))
            } else {
                Some(stderr_buf)
            };
            Ok(RunOutcome {
                exit_code: status.code(),
                output,
                error,
            })
        }
        Err(_elapsed) => {
            let _ = child.kill().await;
            Ok(RunOutcome {
                exit_code: None,
                output,
                error: Some(format!("execution timed out after {}s", timeout.as_secs())),
            })
        }
    }
}
