//! Tracked HTTP body.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Buf;
use http_body::{Body, Frame, SizeHint};

use super::tracking::{StreamTracker, Tracking};

/// Body reporting the data bytes that went through it.
///
/// Trailers are passed along but not counted.
#[derive(Debug)]
pub struct TrackedBody<B> {
    inner: B,
    tracking: Tracking,
}

impl<B> TrackedBody<B> {
    pub fn new(inner: B, tracking: Tracking) -> Self {
        Self { inner, tracking }
    }

    pub fn transferred(&self) -> u64 {
        self.tracking.size()
    }
}

impl StreamTracker {
    pub fn wrap_body<B>(&self, body: B, parent: &opentelemetry::Context) -> TrackedBody<B> {
        TrackedBody::new(body, self.track(parent))
    }
}

impl<B> Body for TrackedBody<B>
where
    B: Body + Unpin,
    B::Error: std::fmt::Display,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        this.tracking.start();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.tracking.add(data.remaining() as u64);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.tracking.fail(&e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.tracking.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::meter::testing::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full, StreamBody};

    #[tokio::test]
    async fn test_collect_counts_bytes() {
        let (meter, snap) = debugging_meter();
        let tracker = StreamTracker::reader(
            "http.client.response.read.",
            Some(&meter),
            None,
            Vec::new(),
            Vec::new(),
        );
        let body = tracker.wrap_body(Full::new(Bytes::from_static(b"foo bar")), &opentelemetry::Context::new());
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"foo bar");
        assert_eq!(counter_total(&snap, "http.client.response.read.size"), 7);
    }

    #[tokio::test]
    async fn test_body_error_is_tracked() {
        let (meter, snap) = debugging_meter();
        let tracker = StreamTracker::reader("", Some(&meter), None, Vec::new(), Vec::new());
        let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"abc"))),
            Err(std::io::Error::other("upstream closed")),
        ];
        let stream = StreamBody::new(futures_util::stream::iter(frames));
        let body = tracker.wrap_body(stream, &opentelemetry::Context::new());
        assert!(body.collect().await.is_err());
        assert_eq!(counter_total(&snap, "read.size"), 3);
        assert_eq!(counter_total(&snap, "read.errors"), 1);
    }
}
