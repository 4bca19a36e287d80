//! Child process execution with output forwarded to the log.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::vm::PreparatoryAction;

const RULE: &str = "--------------------------------------------------------------------------------";

/// Run `program` in `cwd`, logging every line it prints, and return its exit
/// status once both output streams are drained.
pub async fn exec_with_trace(program: &str, args: &[String], cwd: &Path) -> Result<ExitStatus> {
    info!("running {} with args: {} {}", program, program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    info!("{RULE}");
    let (stdout_lines, stderr_lines) =
        tokio::join!(forward_lines(child.stdout.take()), forward_lines(child.stderr.take()));
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to wait for {program}"))?;
    info!("{RULE}");
    info!(stdout_lines, stderr_lines, "{} exited with {}", program, status);

    Ok(status)
}

/// Run preparatory actions in order, stopping at the first failure.
pub async fn run_preparatory(actions: &[PreparatoryAction], cwd: &Path) -> Result<()> {
    for action in actions {
        let status = exec_with_trace(&action.program, &action.args, cwd).await?;
        if !status.success() {
            bail!("preparatory command `{}` failed ({status})", action.program);
        }
    }
    Ok(())
}

/// Log every line of `stream` until EOF and return how many were seen.
/// Output that is not valid UTF-8 is logged lossily.
async fn forward_lines<R: AsyncRead + Unpin>(stream: Option<R>) -> usize {
    let Some(stream) = stream else { return 0 };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                count += 1;
                info!("{}", String::from_utf8_lossy(&buf).trim_end());
            }
            Err(e) => {
                warn!(error = %e, "stopped reading child output");
                break;
            }
        }
    }
    count
}
