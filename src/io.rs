//! Byte-level wrappers over duplex streams.
//!
//! The tokenizer consumes input one byte at a time through [`ByteReader`], and
//! the writer hands output to [`ByteWriter`], which coalesces small writes up
//! to a threshold.  Both wrappers work over anything implementing tokio's
//! `AsyncRead`/`AsyncWrite` (sockets, pipes, in-memory duplex streams, files)
//! and race every blocking operation against a [`CancellationToken`], so a
//! shutdown request unblocks a stalled read or write instead of hanging.
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{Result, RpcError};

/// Internal read batch size.  The contract exposed to the tokenizer is still
/// one byte at a time.
const READ_CHUNK_SIZE: usize = 4096;

/// Buffered output beyond this many bytes is flushed to the transport even
/// before `flush` is called.
const WRITE_BUFFER_LIMIT: usize = 512;

/// Lookahead-1 byte source over an `AsyncRead`.
pub struct ByteReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    offset: u64,
    cancel: CancellationToken,
}

impl<R: AsyncRead + Unpin> ByteReader<R> {
    pub fn new(inner: R, cancel: CancellationToken) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            offset: 0,
            cancel,
        }
    }

    /// Byte offset of the next unconsumed byte, for diagnostics.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Look at the next byte without consuming it.  `None` means end of
    /// stream.
    pub async fn peek(&mut self) -> Result<Option<u8>> {
        if !self.fill().await? {
            return Ok(None);
        }
        Ok(Some(self.buf[self.pos]))
    }

    /// Consume and return the next byte.  `None` means end of stream.
    pub async fn next_byte(&mut self) -> Result<Option<u8>> {
        if !self.fill().await? {
            return Ok(None);
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        self.offset += 1;
        Ok(Some(b))
    }

    async fn fill(&mut self) -> Result<bool> {
        if self.pos < self.buf.len() {
            return Ok(true);
        }
        if self.cancel.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let cancel = self.cancel.clone();
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(RpcError::ConnectionClosed),
            read = self.inner.read(&mut chunk) => read?,
        };
        if n == 0 {
            return Ok(false);
        }
        self.buf.clear();
        self.buf.extend_from_slice(&chunk[..n]);
        self.pos = 0;
        Ok(true)
    }
}

/// Buffering byte sink over an `AsyncWrite`.
pub struct ByteWriter<W> {
    inner: W,
    buf: Vec<u8>,
    limit: usize,
    cancel: CancellationToken,
}

impl<W: AsyncWrite + Unpin> ByteWriter<W> {
    pub fn new(inner: W, cancel: CancellationToken) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            limit: WRITE_BUFFER_LIMIT,
            cancel,
        }
    }

    /// Append bytes to the output buffer, flushing if it grows past the
    /// coalescing threshold.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.limit {
            self.flush().await?;
        }
        Ok(())
    }

    /// Push all buffered bytes to the transport and flush it.
    pub async fn flush(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buf);
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(RpcError::ConnectionClosed),
            flushed = async {
                self.inner.write_all(&data).await?;
                self.inner.flush().await
            } => {
                flushed?;
                Ok(())
            }
        }
    }

    /// Flush anything still buffered (unless already cancelled) and close the
    /// write side of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.cancel.is_cancelled() {
            self.flush().await?;
        }
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn byte_reader_yields_bytes_then_eof() {
        let mut reader = ByteReader::new(&b"ab"[..], CancellationToken::new());
        assert_eq!(reader.peek().await.unwrap(), Some(b'a'));
        assert_eq!(reader.next_byte().await.unwrap(), Some(b'a'));
        assert_eq!(reader.next_byte().await.unwrap(), Some(b'b'));
        assert_eq!(reader.offset(), 2);
        assert_eq!(reader.peek().await.unwrap(), None);
        assert_eq!(reader.next_byte().await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_stalled_read() {
        let (client, _server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let mut reader = ByteReader::new(client, cancel.clone());

        let pending = tokio::spawn(async move { reader.next_byte().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("read did not observe cancellation")
            .unwrap();
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn writer_coalesces_until_threshold() {
        let mut out = Vec::new();
        let mut writer = ByteWriter::new(&mut out, CancellationToken::new());
        writer.limit = 4;

        writer.write(b"ab").await.unwrap();
        assert!(writer.buf.len() == 2);
        writer.write(b"cdef").await.unwrap();
        // crossing the threshold flushed everything buffered so far
        assert!(writer.buf.is_empty());
        writer.write(b"g").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);
        assert_eq!(out, b"abcdefg");
    }

    #[tokio::test]
    async fn closed_writer_rejects_flush() {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        let mut writer = ByteWriter::new(&mut out, cancel.clone());
        writer.write(b"x").await.unwrap();
        cancel.cancel();
        assert!(matches!(
            writer.flush().await,
            Err(RpcError::ConnectionClosed)
        ));
    }
}
