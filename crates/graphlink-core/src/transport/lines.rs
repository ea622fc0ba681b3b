//! Newline-delimited JSON framing.

use super::Channel;
use crate::TransportError;
use serde_json::Value;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Capacity of each direction of an in-memory pair.
const MEMORY_CAPACITY: usize = 64 * 1024;

/// Longest line accepted by default, newline included.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// One JSON value per line. Blank lines are skipped.
///
/// `recv` is cancel safe: bytes taken from the reader stay buffered until
/// their line is complete.
pub struct LineChannel<R, W> {
    reader: R,
    writer: W,
    line: Vec<u8>,
    max_frame: usize,
    closed: bool,
}

/// Line channel over a TCP socket.
pub type TcpChannel = LineChannel<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

/// Line channel over one end of an in-memory pipe.
pub type MemoryChannel = LineChannel<BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>>;

impl<R, W> LineChannel<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            line: Vec::new(),
            max_frame: MAX_FRAME,
            closed: false,
        }
    }

    /// Reject lines longer than `bytes`.
    pub fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes;
        self
    }

    /// The next raw line, or `None` at end of stream. A final line without a
    /// newline is still returned.
    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.line.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.line)));
            }
            let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(end) => (&available[..=end], true),
                None => (available, false),
            };
            let used = chunk.len();
            if self.line.len() + used > self.max_frame {
                self.line.clear();
                self.reader.consume(used);
                return Err(TransportError::FrameTooLarge(self.max_frame));
            }
            self.line.extend_from_slice(chunk);
            self.reader.consume(used);
            if complete {
                return Ok(Some(std::mem::take(&mut self.line)));
            }
        }
    }
}

impl TcpChannel {
    pub fn tcp(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self::new(BufReader::new(read), write)
    }
}

/// Two connected in-memory channels.
pub fn memory_pair() -> (MemoryChannel, MemoryChannel) {
    let (a, b) = tokio::io::duplex(MEMORY_CAPACITY);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        LineChannel::new(BufReader::new(a_read), a_write),
        LineChannel::new(BufReader::new(b_read), b_write),
    )
}

impl<R, W> Channel for LineChannel<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Value) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut text = serde_json::to_string(&frame)?;
        text.push('\n');
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Value>, TransportError> {
        if self.closed {
            return Ok(None);
        }
        while let Some(line) = self.next_line().await? {
            let text = line.trim_ascii();
            if !text.is_empty() {
                return Ok(Some(serde_json::from_slice(text)?));
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.writer.shutdown().await {
                tracing::debug!(error = %e, "shutdown of line channel failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_cross_the_pipe_in_order() {
        let (mut a, mut b) = memory_pair();
        a.send(json!({"x": 4})).await.unwrap();
        a.send(json!({})).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(json!({"x": 4})));
        assert_eq!(b.recv().await.unwrap(), Some(json!({})));
        a.close().await;
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(matches!(
            a.send(json!({})).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn reads_from_a_byte_stream() {
        let input: &[u8] = b"{\"jsonrpc\":\"2.0\"}\n\n  [1,2]\nnot json\n";
        let mut chan = LineChannel::new(input, tokio::io::sink());
        assert_eq!(chan.recv().await.unwrap(), Some(json!({"jsonrpc": "2.0"})));
        assert_eq!(chan.recv().await.unwrap(), Some(json!([1, 2])));
        assert!(matches!(chan.recv().await, Err(TransportError::Json(_))));
        assert_eq!(chan.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_lines_are_rejected() {
        let input: &[u8] = b"[1]\n[22222222]\n[3]";
        let mut chan = LineChannel::new(input, tokio::io::sink()).with_max_frame(6);
        assert_eq!(chan.recv().await.unwrap(), Some(json!([1])));
        assert!(matches!(
            chan.recv().await,
            Err(TransportError::FrameTooLarge(6))
        ));
        assert_eq!(chan.recv().await.unwrap(), Some(json!([3])));
    }

    #[tokio::test]
    async fn endless_line_hits_the_cap() {
        let (mut peer, ours) = tokio::io::duplex(MEMORY_CAPACITY);
        let (read, write) = tokio::io::split(ours);
        let mut chan = LineChannel::new(BufReader::new(read), write).with_max_frame(64);
        peer.write_all(&[b'1'; 1024]).await.unwrap();
        assert!(matches!(
            chan.recv().await,
            Err(TransportError::FrameTooLarge(64))
        ));
    }

    #[tokio::test]
    async fn cancelled_recv_keeps_partial_line() {
        let (mut peer, ours) = tokio::io::duplex(MEMORY_CAPACITY);
        let (read, write) = tokio::io::split(ours);
        let mut chan = LineChannel::new(BufReader::new(read), write);
        peer.write_all(b"{\"half\":").await.unwrap();
        let cut = tokio::time::timeout(std::time::Duration::from_millis(20), chan.recv()).await;
        assert!(cut.is_err());
        peer.write_all(b" true}\n").await.unwrap();
        assert_eq!(chan.recv().await.unwrap(), Some(json!({"half": true})));
    }
}
