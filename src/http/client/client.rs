//! Instrumented HTTP client.

use std::fmt;

use bytes::Bytes;
use http::{Request, Response};
use http_body::Body;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::context::{ContextError, RequestContext};
use crate::http::client::connector::{ConnectionPhases, TcpConnector, TrackedConnector};
use crate::http::client::tracker::RoundTripTracker;
use crate::io::body::TrackedBody;
use crate::io::tracking::StreamTracker;
use crate::pipeline::outcome::BoxError;

pub type ClientConnector = TrackedConnector<HttpsConnector<TcpConnector>>;

/// Response body of an [`InstrumentedClient`].
pub type ClientBody = TrackedBody<Incoming>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Context(#[from] ContextError),

    #[error("request failed: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
}

/// hyper-util client reporting every round trip through a
/// [`RoundTripTracker`].
///
/// Without a tracker requests go straight to the inner client.
#[derive(Clone)]
pub struct InstrumentedClient<B = Full<Bytes>> {
    client: Client<ClientConnector, B>,
    tracker: Option<RoundTripTracker>,
    passthrough_body: StreamTracker,
}

impl<B> fmt::Debug for InstrumentedClient<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedClient")
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl<B> InstrumentedClient<B>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    /// HTTP/1 and HTTP/2 client over the tracked connector, trusting the
    /// platform's root certificates for https.
    pub fn new(tracker: Option<RoundTripTracker>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(TrackedConnector::native_roots());
        Self::with_client(client, tracker)
    }

    /// Same, verifying https servers against `tls`.
    pub fn with_tls_config(tls: rustls::ClientConfig, tracker: Option<RoundTripTracker>) -> Self {
        let connector = TrackedConnector::with_tls_config(tls);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self::with_client(client, tracker)
    }

    pub fn with_client(client: Client<ClientConnector, B>, tracker: Option<RoundTripTracker>) -> Self {
        Self {
            client,
            tracker,
            passthrough_body: StreamTracker::reader("", None, None, Vec::new(), Vec::new()),
        }
    }

    pub fn tracker(&self) -> Option<&RoundTripTracker> {
        self.tracker.as_ref()
    }

    /// Send `req` on behalf of `cx`.
    ///
    /// The call gives up when `cx` is canceled or its deadline passes.
    pub async fn request(
        &self,
        cx: &RequestContext,
        req: Request<B>,
    ) -> Result<Response<ClientBody>, ClientError> {
        let Some(tracker) = &self.tracker else {
            let resp = cx.run(self.client.request(req)).await??;
            let parent = cx.otel().clone();
            return Ok(resp.map(|body| self.passthrough_body.wrap_body(body, &parent)));
        };

        let mut round_trip = tracker.start(cx, &req);
        let (mut parts, body) = req.into_parts();
        parts.headers = round_trip.outbound_headers(&parts.headers);
        let req = Request::from_parts(parts, body);

        let sent = self.client.request(req);
        let result = if tracker.wants_connection_phases() {
            let phases = round_trip.phases().clone();
            round_trip
                .context()
                .run(ConnectionPhases::scope(phases, sent))
                .await
        } else {
            round_trip.context().run(sent).await
        };

        let resp = match result {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                let err = ClientError::from(e);
                round_trip.finish_error(&err);
                return Err(err);
            }
            Err(e) => {
                let err = ClientError::from(e);
                round_trip.finish_error(&err);
                return Err(err);
            }
        };
        round_trip.phases().mark_first_byte();
        round_trip.finish_response(&resp);
        let parent = round_trip.context().otel().clone();
        let body_tracker = tracker.body_tracker();
        Ok(resp.map(|body| body_tracker.wrap_body(body, &parent)))
    }
}
