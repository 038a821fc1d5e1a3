//! Tower layer tracking every inbound request.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use http::{Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use tower::{Layer, Service};

use super::body::ServerBody;
use super::tracking::RequestTracking;
use crate::observability::registry::Registry;

/// Wraps services with [`ServerTracking`].
///
/// The tracker of the registry's current generation is used for each
/// request, so reloads apply to the next request.
#[derive(Debug, Clone)]
pub struct ServerTrackingLayer {
    registry: Arc<Registry>,
}

impl ServerTrackingLayer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl<S> Layer<S> for ServerTrackingLayer {
    type Service = ServerTracking<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ServerTracking {
            registry: self.registry.clone(),
            inner,
        }
    }
}

/// Service tracking inbound requests.
///
/// Tracked requests carry their [`RequestTracking`](super::RequestTracking)
/// in the extensions, plus a [`HijackHandle`](super::HijackHandle) when
/// the connection can be upgraded.
#[derive(Debug, Clone)]
pub struct ServerTracking<S> {
    registry: Arc<Registry>,
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ServerTracking<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display + Send + 'static,
    ResBody: 'static,
{
    type Response = Response<ServerBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let tracker = self.registry.snapshot().server_tracker();
        if !tracker.is_active() || tracker.skips(req.uri().path()) {
            let fut = self.inner.call(req);
            return Box::pin(async move { Ok(fut.await?.map(ServerBody::untracked)) });
        }

        let tracking = tracker.start(&req);
        if req.extensions().get::<OnUpgrade>().is_some() {
            req.extensions_mut().insert(tracking.hijack_handle());
        }
        req.extensions_mut().insert(tracking.clone());

        let fut = self.inner.call(req);
        Box::pin(async move {
            let pending = PendingResponse(Some(tracking.clone()));
            let result = fut.await;
            pending.disarm();
            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    tracking.write_header(StatusCode::INTERNAL_SERVER_ERROR, &http::HeaderMap::new());
                    tracking.write_failed(&e);
                    tracking.finish();
                    return Err(e);
                }
            };
            tracking.write_header(resp.status(), resp.headers());
            if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
                tracking.hijack_handle().hijack();
            }
            Ok(resp.map(|body| ServerBody::new(body, tracking)))
        })
    }
}

/// Aborts the tracking if the response future is dropped before the
/// inner service answered.
struct PendingResponse(Option<RequestTracking>);

impl PendingResponse {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(tracking) = self.0.take() {
            tracking.abort();
        }
    }
}
