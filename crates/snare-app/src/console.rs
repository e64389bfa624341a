//! Line-oriented observer bridge.
//!
//! Events go out as one JSON object per line; operator commands come in
//! the same way.

use std::sync::Arc;

use snare_core::{ControlCommand, ProxyEvent};
use snare_proxy::Pipeline;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Writes every event as a JSON line until the pipeline goes away.
pub async fn print_events<W>(mut rx: mpsc::Receiver<ProxyEvent>, mut out: W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
    }
    Ok(())
}

/// Applies commands read from `input` until it is closed.
///
/// Malformed lines are logged and skipped.
pub async fn read_commands<R>(input: R, pipeline: Arc<Pipeline>) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ControlCommand>(line) {
            Ok(command) => {
                tracing::debug!("Command: {:?}", command);
                pipeline.handle_command(command).await;
            }
            Err(e) => tracing::warn!("Ignoring malformed command {:?}: {}", line, e),
        }
    }
    tracing::debug!("Command input closed");
    Ok(())
}
