//! Response body of tracked requests.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Buf;
use http_body::{Body, Frame, SizeHint};

use super::tracking::RequestTracking;

/// Response body counting the bytes written to the client. The request is
/// reported when the body ends or fails.
#[derive(Debug)]
pub struct ServerBody<B> {
    inner: B,
    tracking: Option<RequestTracking>,
}

impl<B> ServerBody<B> {
    pub fn new(inner: B, tracking: RequestTracking) -> Self {
        Self {
            inner,
            tracking: Some(tracking),
        }
    }

    /// Body of a request nobody tracks.
    pub fn untracked(inner: B) -> Self {
        Self {
            inner,
            tracking: None,
        }
    }

    pub fn tracking(&self) -> Option<&RequestTracking> {
        self.tracking.as_ref()
    }
}

impl<B> Body for ServerBody<B>
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
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        let Some(tracking) = &this.tracking else {
            return polled;
        };
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    tracking.add_written(data.remaining() as u64);
                }
            }
            Poll::Ready(Some(Err(e))) => {
                tracking.write_failed(e);
                tracking.finish();
            }
            Poll::Ready(None) => {
                tracking.finish();
            }
            Poll::Pending => {}
        }
        polled
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
    use crate::config::resolver::ConfigResolver;
    use crate::config::schema::ConfigData;
    use crate::http::server::tracking::ServerTracker;
    use crate::observability::handle::testing::recording_handle;
    use crate::observability::meter::testing::*;
    use bytes::Bytes;
    use http::Request;
    use http_body_util::{BodyExt, Full, StreamBody};
    use std::sync::Arc;

    fn tracking() -> (RequestTracking, MetricsProbe) {
        let (handle, snap, _spans) = recording_handle();
        let tracker = ServerTracker::new(&ConfigResolver::new(ConfigData::default()), &Arc::new(handle));
        let req = Request::get("/users").body(()).unwrap();
        (tracker.start(&req), snap)
    }

    #[tokio::test]
    async fn test_end_of_body_reports_size() {
        let (tracking, snap) = tracking();
        let body = ServerBody::new(Full::new(Bytes::from_static(b"hello")), tracking);
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello");
        assert_eq!(histogram_samples(&snap, "http.server.response.size"), vec![5.0]);
    }

    #[tokio::test]
    async fn test_body_error_reports_once() {
        let (tracking, snap) = tracking();
        let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"ab"))),
            Err(std::io::Error::other("client went away")),
        ];
        let stream = StreamBody::new(futures_util::stream::iter(frames));
        let body = ServerBody::new(stream, tracking.clone());
        assert!(body.collect().await.is_err());
        assert!(tracking.is_finished());
        drop(tracking);
        assert_eq!(histogram_samples(&snap, "http.server.response.size"), vec![2.0]);
    }

    #[tokio::test]
    async fn test_untracked_body_passes_through() {
        let body = ServerBody::untracked(Full::new(Bytes::from_static(b"ok")));
        assert!(body.tracking().is_none());
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"ok");
    }
}
