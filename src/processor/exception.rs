//! Last-resort handling of dispatch failures.
//!
//! When a dispatch cycle fails, the [`QueueProcessor`](super::QueueProcessor)
//! hands the failure to an [`ExceptionHandler`]. The handler decides whether
//! the failure is [`Disposition::Handled`] (the transport is told the message
//! was processed) or [`Disposition::Unhandled`] (the failure is reported to the
//! transport, which applies its own redelivery policy).

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{Envelope, processor::DispatchError, processor::RawMessage};

/// Outcome of an [`ExceptionHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The failure was dealt with and must not be re-raised.
    Handled,
    /// The failure falls through to the next handler, or to the transport.
    Unhandled,
}

/// A failed dispatch cycle.
#[derive(Debug)]
pub struct Failure<'a> {
    /// `None` when the failure happened before an envelope could be built
    /// (for example, the body did not deserialize).
    pub envelope: Option<&'a Envelope>,
    /// Message as received from the transport.
    pub message: &'a RawMessage,
    /// What went wrong.
    pub error: &'a DispatchError,
}

/// Handler of last resort for dispatch failures.
#[async_trait]
pub trait ExceptionHandler: Send + Sync {
    /// Decide whether `failure` is suppressed.
    async fn handle(&self, failure: &Failure<'_>, cancel: &CancellationToken) -> Disposition;
}

#[async_trait]
impl<T> ExceptionHandler for Arc<T>
where
    T: ExceptionHandler + ?Sized,
{
    async fn handle(&self, failure: &Failure<'_>, cancel: &CancellationToken) -> Disposition {
        (**self).handle(failure, cancel).await
    }
}

/// Ordered chain of exception handlers.
///
/// Handlers are consulted in order until one returns
/// [`Disposition::Handled`]; the remaining ones are skipped. An empty chain,
/// which is also the default, never suppresses a failure.
#[derive(Clone, Default)]
pub struct CompositeExceptionHandler {
    handlers: Vec<Arc<dyn ExceptionHandler>>,
}

impl CompositeExceptionHandler {
    /// Create a chain consulted in iteration order.
    pub fn new(handlers: impl IntoIterator<Item = Arc<dyn ExceptionHandler>>) -> Self {
        Self {
            handlers: handlers.into_iter().collect(),
        }
    }

    /// Number of handlers in the chain.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the chain is empty, in which case nothing is suppressed.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl FromIterator<Arc<dyn ExceptionHandler>> for CompositeExceptionHandler {
    fn from_iter<I: IntoIterator<Item = Arc<dyn ExceptionHandler>>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Debug for CompositeExceptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeExceptionHandler")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[async_trait]
impl ExceptionHandler for CompositeExceptionHandler {
    async fn handle(&self, failure: &Failure<'_>, cancel: &CancellationToken) -> Disposition {
        for (index, handler) in self.handlers.iter().enumerate() {
            if handler.handle(failure, cancel).await == Disposition::Handled {
                tracing::debug!(index, "Failure handled by exception handler");
                return Disposition::Handled;
            }
        }
        Disposition::Unhandled
    }
}

/// Logs every failure with `tracing` and lets it fall through.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingExceptionHandler;

#[async_trait]
impl ExceptionHandler for LoggingExceptionHandler {
    async fn handle(&self, failure: &Failure<'_>, _cancel: &CancellationToken) -> Disposition {
        tracing::error!(
            error = %failure.error,
            message_id = ?failure.message.message_id,
            deserialized = failure.envelope.is_some(),
            "Message dispatch failed",
        );
        Disposition::Unhandled
    }
}

/// [`ExceptionHandler`] built from a closure. See [`exception_fn`].
#[derive(Clone)]
pub struct ExceptionFn<F> {
    f: F,
}

/// Build an [`ExceptionHandler`] from a synchronous closure.
pub fn exception_fn<F>(f: F) -> ExceptionFn<F>
where
    F: Fn(&Failure<'_>) -> Disposition + Send + Sync,
{
    ExceptionFn { f }
}

impl<F> fmt::Debug for ExceptionFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionFn")
            .field("f", &std::any::type_name::<F>())
            .finish()
    }
}

#[async_trait]
impl<F> ExceptionHandler for ExceptionFn<F>
where
    F: Fn(&Failure<'_>) -> Disposition + Send + Sync,
{
    async fn handle(&self, failure: &Failure<'_>, _cancel: &CancellationToken) -> Disposition {
        (self.f)(failure)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn counting(
        calls: &Arc<AtomicUsize>,
        disposition: Disposition,
    ) -> Arc<dyn ExceptionHandler> {
        let calls = Arc::clone(calls);
        Arc::new(exception_fn(move |_failure| {
            calls.fetch_add(1, Ordering::SeqCst);
            disposition
        }))
    }

    fn failure_parts() -> (RawMessage, DispatchError) {
        (
            RawMessage::new("{}").with_message_id("m-1"),
            DispatchError::handler("boom".into()),
        )
    }

    #[tokio::test]
    async fn test_empty_chain_never_suppresses() {
        let (message, error) = failure_parts();
        let failure = Failure {
            envelope: None,
            message: &message,
            error: &error,
        };

        let disposition = CompositeExceptionHandler::default()
            .handle(&failure, &CancellationToken::new())
            .await;

        assert_eq!(disposition, Disposition::Unhandled);
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_handled() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let chain = CompositeExceptionHandler::new([
            counting(&first, Disposition::Unhandled),
            counting(&second, Disposition::Handled),
            counting(&third, Disposition::Handled),
        ]);
        let (message, error) = failure_parts();
        let failure = Failure {
            envelope: None,
            message: &message,
            error: &error,
        };

        let disposition = chain.handle(&failure, &CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Handled);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chain_falls_through_when_nobody_handles() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = Arc::clone(&seen);
        let chain = CompositeExceptionHandler::new([
            Arc::new(LoggingExceptionHandler) as Arc<dyn ExceptionHandler>,
            Arc::new(exception_fn(move |failure| {
                seen_in_handler
                    .lock()
                    .unwrap()
                    .push(failure.message.message_id.clone());
                Disposition::Unhandled
            })),
            counting(&calls, Disposition::Unhandled),
        ]);
        let (message, error) = failure_parts();
        let failure = Failure {
            envelope: None,
            message: &message,
            error: &error,
        };

        let disposition = chain.handle(&failure, &CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Unhandled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![Some("m-1".to_owned())]);
    }
}
