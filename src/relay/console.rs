//! Console endpoint (stdin/stdout)
//!
//! Each line read is relayed with a single `\n` terminator, whatever line
//! ending the terminal used. Bytes that are not UTF-8 are replaced with
//! U+FFFD rather than ending the session. Payloads from others are written
//! exactly as received and flushed at once.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tracing::debug;

use crate::error::Result;

use super::endpoint::{Departure, Endpoint, EndpointKind};

/// The local operator's terminal as a relay endpoint
pub struct ConsoleEndpoint<R, W> {
    reader: R,
    partial: Vec<u8>,
    writer: W,
}

impl<R, W> ConsoleEndpoint<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            partial: Vec::new(),
            writer,
        }
    }

    /// Take one line (terminator included) out of the partial buffer
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.partial.iter().position(|b| *b == b'\n')?;
        Some(self.partial.drain(..=end).collect())
    }
}

/// Console bound to the process's standard streams
pub fn stdio() -> ConsoleEndpoint<BufReader<Stdin>, Stdout> {
    ConsoleEndpoint::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
}

/// Strip the line ending and normalise to one `\n`
fn decode_line(mut raw: Vec<u8>) -> String {
    if raw.last() == Some(&b'\n') {
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
    }
    let mut line = match String::from_utf8(raw) {
        Ok(line) => line,
        Err(e) => {
            debug!(bytes = e.as_bytes().len(), "Console line is not UTF-8, replacing invalid bytes");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    };
    line.push('\n');
    line
}

#[async_trait]
impl<R, W> Endpoint for ConsoleEndpoint<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> EndpointKind {
        EndpointKind::Console
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        // Only fill_buf is awaited; bytes move to `partial` synchronously,
        // so dropping this future loses nothing
        loop {
            if let Some(raw) = self.take_line() {
                return Ok(Some(decode_line(raw)));
            }

            let chunk = self.reader.fill_buf().await?;
            if chunk.is_empty() {
                if self.partial.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.partial);
                return Ok(Some(decode_line(rest)));
            }
            let n = chunk.len();
            self.partial.extend_from_slice(chunk);
            self.reader.consume(n);
        }
    }

    async fn send(&mut self, payload: &str) -> Result<()> {
        self.writer.write_all(payload.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self, _departure: Departure) {
        let _ = self.writer.flush().await;
    }
}
