use crate::{DedupError, StreamError};
use bytes::{Bytes, BytesMut};
use std::io::{Error, ErrorKind, Write};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The write side of the pipe between a producer on the blocking pool and an async consumer.
///
/// Written bytes are collected into chunks of roughly `chunk_size` bytes before they are sent.
/// Sending blocks the calling thread while the channel is full, so this must only be used
/// outside of the async runtime.
pub(crate) struct ChannelWriter {
    sender: mpsc::Sender<std::io::Result<Bytes>>,
    buffer: BytesMut,
    chunk_size: usize,
    cancellation_token: CancellationToken,
    completed: bool,
}

impl ChannelWriter {
    pub fn new(
        sender: mpsc::Sender<std::io::Result<Bytes>>,
        chunk_size: usize,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            sender,
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
            cancellation_token,
            completed: false,
        }
    }

    fn send(&self, item: std::io::Result<Bytes>) -> std::io::Result<()> {
        self.sender.blocking_send(item).map_err(|_| {
            Error::new(
                ErrorKind::BrokenPipe,
                "the reader of the layer stream was dropped",
            )
        })
    }

    fn send_buffer(&mut self) -> std::io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        self.send(Ok(chunk))
    }

    fn check_cancelled(&self) -> std::io::Result<()> {
        // Not `ErrorKind::Interrupted`, `std::io::copy` retries those.
        if self.cancellation_token.is_cancelled() {
            Err(Error::new(ErrorKind::Other, "the layer rewrite was cancelled"))
        } else {
            Ok(())
        }
    }

    /// Sends what is left in the buffer. Dropping the writer afterwards ends the stream with a
    /// plain end of file.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.completed = true;
        self.send_buffer()
    }

    /// Sends what is left in the buffer followed by `err`, which ends the stream.
    pub fn fail(mut self, err: &DedupError) {
        self.completed = true;
        // The consumer may already be gone, which is what failed the pass in the first place.
        let _ = self.send_buffer();
        let _ = self.send(Err(err.to_stream_error()));
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.check_cancelled()?;
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= self.chunk_size {
            self.send_buffer()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.check_cancelled()?;
        self.send_buffer()
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        // Reached when the producer unwinds. Without this the consumer would see a clean end of
        // file.
        if !self.completed {
            let aborted = StreamError::aborted();
            let _ = self.send(Err(Error::new(ErrorKind::Other, aborted)));
        }
    }
}
