//! Pipeline stage shapes: the request and response a stage sees and the
//! callable every stage implements.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

use crate::context::{ContextError, RequestContext};
use crate::pipeline::outcome::{BoxError, MultiError};

/// Request as it travels through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Response produced by a stage.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Every backend involved answered successfully.
    pub is_complete: bool,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            is_complete: true,
            body: body.into(),
        }
    }

    pub fn incomplete(mut self) -> Self {
        self.is_complete = false;
        self
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0}")]
    Context(#[from] ContextError),

    #[error("{0}")]
    Multi(#[from] MultiError),

    #[error("backend {backend} failed: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BoxError,
    },

    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    pub fn backend(backend: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Backend {
            backend: backend.into(),
            source: source.into(),
        }
    }
}

pub type ProxyResult = Result<ProxyResponse, ProxyError>;

/// One stage of the pipeline.
pub type Proxy = Arc<dyn Fn(RequestContext, ProxyRequest) -> BoxFuture<'static, ProxyResult> + Send + Sync>;

/// Box an async closure into a [`Proxy`].
pub fn proxy_fn<F, Fut>(f: F) -> Proxy
where
    F: Fn(RequestContext, ProxyRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ProxyResult> + Send + 'static,
{
    Arc::new(
        move |cx: RequestContext, req: ProxyRequest| -> BoxFuture<'static, ProxyResult> {
            Box::pin(f(cx, req))
        },
    )
}
