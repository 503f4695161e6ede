use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::error::BridgeError;

/// Longest request line accepted before the rest of it is discarded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// One line read off the wire.
#[derive(Debug)]
pub enum Incoming {
    Request(JsonRpcRequest),
    /// The line was not JSON at all. Carries the parser's complaint.
    Malformed(String),
    /// Valid JSON, but not a JSON-RPC request, or a line over the length limit.
    Invalid(String),
}

// ── Stdio transport ──────────────────────────────────────────────────────────

/// Newline-delimited JSON-RPC over a byte stream pair (stdin/stdout in
/// production, an in-memory duplex in tests).
pub struct StdioTransport<R, W> {
    reader: BufReader<R>,
    writer: ResponseWriter<W>,
    max_line_bytes: usize,
}

impl StdioTransport<tokio::io::Stdin, tokio::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: ResponseWriter::new(writer),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }

    /// Handle for sending responses; cheap to clone into per-request tasks.
    pub fn writer(&self) -> ResponseWriter<W> {
        self.writer.clone()
    }

    /// Wait for the next message. `Ok(None)` means the peer closed the stream.
    ///
    /// Only I/O failures are errors. Undecodable or oversized lines come back
    /// as `Malformed` / `Invalid` so the session can answer them and go on.
    pub async fn receive(&mut self) -> Result<Option<Incoming>, BridgeError> {
        loop {
            let Some((line, overflowed)) = self.read_line_capped().await? else {
                return Ok(None);
            };
            if overflowed {
                warn!("discarding request line over {} bytes", self.max_line_bytes);
                return Ok(Some(Incoming::Invalid(format!(
                    "request line exceeds {} bytes",
                    self.max_line_bytes
                ))));
            }
            let text = match std::str::from_utf8(&line) {
                Ok(text) => text,
                Err(e) => return Ok(Some(Incoming::Malformed(e.to_string()))),
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            debug!("MCP stdio ← {}", trimmed);

            let incoming = match serde_json::from_str::<Value>(trimmed) {
                Err(e) => Incoming::Malformed(e.to_string()),
                Ok(raw) => match serde_json::from_value::<JsonRpcRequest>(raw) {
                    Ok(req) => Incoming::Request(req),
                    Err(e) => Incoming::Invalid(e.to_string()),
                },
            };
            return Ok(Some(incoming));
        }
    }

    /// Read raw bytes up to and including `\n`, keeping at most
    /// `max_line_bytes`. The remainder of a longer line is consumed and
    /// dropped, and the flag is set.
    async fn read_line_capped(&mut self) -> std::io::Result<Option<(Vec<u8>, bool)>> {
        let mut line = Vec::new();
        let mut overflowed = false;
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if line.is_empty() && !overflowed {
                    return Ok(None);
                }
                return Ok(Some((line, overflowed)));
            }
            let (chunk, done) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (&available[..=i], true),
                None => (available, false),
            };
            let room = self.max_line_bytes.saturating_sub(line.len());
            if chunk.len() > room {
                line.extend_from_slice(&chunk[..room]);
                overflowed = true;
            } else {
                line.extend_from_slice(chunk);
            }
            let used = chunk.len();
            self.reader.consume(used);
            if done {
                return Ok(Some((line, overflowed)));
            }
        }
    }
}

/// Serializes whole response lines onto the shared output stream.
pub struct ResponseWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for ResponseWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> ResponseWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn send(&self, response: &JsonRpcResponse) -> Result<(), BridgeError> {
        let mut line = serde_json::to_string(response)
            .map_err(|e| BridgeError::Transport(std::io::Error::other(e)))?;
        line.push('\n');
        debug!("MCP stdio → {}", line.trim());

        let mut out = self.inner.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }
}
