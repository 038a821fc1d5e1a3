//! Outcome classification of a finished unit of work.
//!
//! Errors are inspected through their `source()` chain, so a
//! cancellation wrapped by a transport or proxy error is still seen as a
//! cancellation.

use std::error::Error;
use std::fmt;
use std::io;

use crate::context::{ContextError, RequestContext};

pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Errors gathered from a fan-out call, one per failed backend.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<BoxError>,
}

impl MultiError {
    pub fn new(errors: Vec<BoxError>) -> Self {
        Self { errors }
    }

    pub fn push(&mut self, err: impl Into<BoxError>) {
        self.errors.push(err.into());
    }

    pub fn errors(&self) -> &[BoxError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} backend error(s)", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{err}")?;
        }
        Ok(())
    }
}

impl Error for MultiError {}

/// `err` followed by every error in its source chain.
pub fn chain<'a>(err: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(err), |e: &&'a (dyn Error + 'static)| (*e).source())
}

pub fn is_canceled(err: &(dyn Error + 'static)) -> bool {
    chain(err).any(|e| matches!(e.downcast_ref::<ContextError>(), Some(ContextError::Canceled)))
}

/// Deadline exceeded, an elapsed tokio timeout or a timed out I/O call.
pub fn is_timeout(err: &(dyn Error + 'static)) -> bool {
    chain(err).any(|e| {
        matches!(e.downcast_ref::<ContextError>(), Some(ContextError::DeadlineExceeded))
            || e.is::<tokio::time::error::Elapsed>()
            || e
                .downcast_ref::<io::Error>()
                .is_some_and(|io| io.kind() == io::ErrorKind::TimedOut)
    })
}

/// First [`MultiError`] found in the chain of `err`.
pub fn find_multi<'a>(err: &'a (dyn Error + 'static)) -> Option<&'a MultiError> {
    chain(err).find_map(|e| e.downcast_ref::<MultiError>())
}

/// How a unit of work ended. All flags false means success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub canceled: bool,
    pub failed: bool,
    pub timed_out: bool,
}

impl Outcome {
    pub const SUCCESS: Outcome = Outcome {
        canceled: false,
        failed: false,
        timed_out: false,
    };

    /// Classification of an outbound round trip.
    ///
    /// A cancellation, of the error or of the caller's context, is never a
    /// failure. A timeout is both a failure and a timeout.
    pub fn round_trip(err: Option<&(dyn Error + 'static)>, cx: Option<&RequestContext>) -> Self {
        let Some(err) = err else {
            return Self::SUCCESS;
        };
        let ctx_err = cx.and_then(RequestContext::err);
        if is_canceled(err) || ctx_err == Some(ContextError::Canceled) {
            return Self {
                canceled: true,
                ..Self::SUCCESS
            };
        }
        if is_timeout(err) || ctx_err == Some(ContextError::DeadlineExceeded) {
            return Self {
                failed: true,
                timed_out: true,
                ..Self::SUCCESS
            };
        }
        Self {
            failed: true,
            ..Self::SUCCESS
        }
    }

    /// Classification of a pipeline stage.
    ///
    /// When the error gathers the errors of several backends, the stage is
    /// canceled only if every one of them is a cancellation.
    pub fn stage(err: Option<&(dyn Error + 'static)>, cx: Option<&RequestContext>) -> Self {
        let Some(err) = err else {
            return Self::SUCCESS;
        };
        let canceled = match find_multi(err) {
            Some(multi) if !multi.is_empty() => multi.errors().iter().all(|e| is_canceled(e.as_ref())),
            _ => is_canceled(err) || cx.is_some_and(RequestContext::is_canceled),
        };
        Self {
            canceled,
            failed: !canceled,
            timed_out: !canceled && is_timeout(err),
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("backend call failed")]
    struct Wrapped(#[source] ContextError);

    #[test]
    fn test_success() {
        assert!(Outcome::round_trip(None, None).is_success());
        assert!(Outcome::stage(None, None).is_success());
    }

    #[test]
    fn test_canceled_is_not_failed() {
        let err = Wrapped(ContextError::Canceled);
        let outcome = Outcome::round_trip(Some(&err), None);
        assert!(outcome.canceled);
        assert!(!outcome.failed);
        assert!(!outcome.timed_out);
    }

    #[test]
    fn test_deadline_is_failed_and_timed_out() {
        let err = Wrapped(ContextError::DeadlineExceeded);
        let outcome = Outcome::round_trip(Some(&err), None);
        assert_eq!(
            outcome,
            Outcome {
                canceled: false,
                failed: true,
                timed_out: true
            }
        );
    }

    #[test]
    fn test_context_cancel_wins_over_plain_error() {
        let cx = RequestContext::new();
        cx.cancel();
        let err = io::Error::other("connection reset");
        let outcome = Outcome::round_trip(Some(&err), Some(&cx));
        assert!(outcome.canceled);
        assert!(!outcome.failed);
    }

    #[test]
    fn test_io_timeout() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "read timed out");
        assert!(Outcome::round_trip(Some(&err), None).timed_out);
    }

    #[test]
    fn test_multi_error_all_canceled() {
        let multi = MultiError::new(vec![
            Box::new(ContextError::Canceled) as BoxError,
            Box::new(Wrapped(ContextError::Canceled)) as BoxError,
        ]);
        let outcome = Outcome::stage(Some(&multi), None);
        assert!(outcome.canceled);
        assert!(!outcome.failed);
    }

    #[test]
    fn test_multi_error_partially_canceled_is_failed() {
        let mut multi = MultiError::default();
        multi.push(ContextError::Canceled);
        multi.push(io::Error::other("boom"));
        let outcome = Outcome::stage(Some(&multi), None);
        assert!(!outcome.canceled);
        assert!(outcome.failed);
        assert_eq!(multi.to_string(), "2 backend error(s): context canceled; boom");
    }
}
