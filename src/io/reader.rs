//! Tracked async reader.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use super::tracking::{StreamTracker, Tracking};

/// Reader reporting bytes read and elapsed time.
///
/// Tracking ends at the first clean end of stream, the first error, an
/// explicit [`close`](Self::close) or drop, whichever comes first.
#[derive(Debug)]
pub struct TrackedReader<R> {
    inner: R,
    tracking: Tracking,
}

impl<R> TrackedReader<R> {
    pub fn new(inner: R, tracking: Tracking) -> Self {
        Self { inner, tracking }
    }

    pub fn bytes_read(&self) -> u64 {
        self.tracking.size()
    }

    /// Stop tracking; the stream is not read any further.
    pub fn close(&mut self) {
        self.tracking.finish();
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl StreamTracker {
    pub fn wrap_reader<R>(&self, reader: R, parent: &opentelemetry::Context) -> TrackedReader<R> {
        TrackedReader::new(reader, self.track(parent))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TrackedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.tracking.start();
        let before = buf.filled().len();
        let wanted = buf.remaining();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n == 0 && wanted > 0 {
                    this.tracking.finish();
                } else {
                    this.tracking.add(n as u64);
                }
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
