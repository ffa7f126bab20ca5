use super::HashingWriter;
use digest::Digest;
use std::{
    io::Error,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::AsyncWrite;

impl<W: AsyncWrite, D: Digest> AsyncWrite for HashingWriter<W, D> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, Error>> {
        let this = self.project();
        match this.writer.poll_write(cx, buf) {
            Poll::Ready(Ok(bytes)) => {
                this.hasher.update(&buf[..bytes]);
                Poll::Ready(Ok(bytes))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        self.project().writer.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        // Shutting down finishes encoders further down the chain, so it has to be forwarded.
        self.project().writer.poll_shutdown(cx)
    }
}
