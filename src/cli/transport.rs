//! JSON-lines transport for `serve`

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Reads one request per line from stdin
pub struct RequestReader {
    lines: Lines<BufReader<Stdin>>,
}

impl RequestReader {
    pub fn stdin() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Next well-formed request; `None` at end of input
    pub async fn next<R: DeserializeOwned>(&mut self) -> Result<Option<R>> {
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(request) => return Ok(Some(request)),
                Err(e) => warn!("Ignoring malformed message: {}", e),
            }
        }
        Ok(None)
    }
}

/// Write every event to stdout as it arrives, until all senders are gone
pub fn spawn_writer<E>(mut rx: mpsc::UnboundedReceiver<E>) -> JoinHandle<Result<()>>
where
    E: Serialize + Send + 'static,
{
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = rx.recv().await {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        Ok(())
    })
}
