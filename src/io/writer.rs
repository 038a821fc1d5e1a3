//! Tracked async writer.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

use super::tracking::{StreamTracker, Tracking};

/// Writer reporting bytes written and elapsed time.
///
/// Tracking ends on shutdown, the first error, an explicit
/// [`close`](Self::close) or drop.
#[derive(Debug)]
pub struct TrackedWriter<W> {
    inner: W,
    tracking: Tracking,
}

impl<W> TrackedWriter<W> {
    pub fn new(inner: W, tracking: Tracking) -> Self {
        Self { inner, tracking }
    }

    pub fn bytes_written(&self) -> u64 {
        self.tracking.size()
    }

    pub fn close(&mut self) {
        self.tracking.finish();
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl StreamTracker {
    pub fn wrap_writer<W>(&self, writer: W, parent: &opentelemetry::Context) -> TrackedWriter<W> {
        TrackedWriter::new(writer, self.track(parent))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TrackedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.tracking.start();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.tracking.add(n as u64);
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                this.tracking.fail(&e);
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(Err(e)) => {
                this.tracking.fail(&e);
                Poll::Ready(Err(e))
            }
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(Ok(())) => {
                this.tracking.finish();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.tracking.fail(&e);
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
