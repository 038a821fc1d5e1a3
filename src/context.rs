//! Per-request context: trace context, deadline and cancellation.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a request context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Context carried through the pipeline for one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    otel: opentelemetry::Context,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// Empty trace context, no deadline, not canceled.
    pub fn new() -> Self {
        Self {
            otel: opentelemetry::Context::new(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_otel(otel: opentelemetry::Context) -> Self {
        Self {
            otel,
            ..Self::new()
        }
    }

    pub fn otel(&self) -> &opentelemetry::Context {
        &self.otel
    }

    /// Nested context for a stage: same deadline, different trace
    /// context. Canceling `self` cancels the child, not the other way
    /// around.
    pub fn with_otel(&self, otel: opentelemetry::Context) -> Self {
        Self {
            otel,
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Why the context is done, if it is. Cancellation wins.
    pub fn err(&self) -> Option<ContextError> {
        if self.is_canceled() {
            Some(ContextError::Canceled)
        } else if self.deadline_exceeded() {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves when the context is canceled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Run `fut` unless the context finishes first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}
