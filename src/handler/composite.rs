use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{Envelope, handler::MessageHandler};

/// Presents an ordered list of handlers as a single handler.
///
/// Every handler sees every envelope exactly once, in construction order,
/// regardless of what its siblings did: a failing handler never prevents the
/// handlers after it from running. Failures are collected and, if there is at
/// least one, reported together as an [`AggregateError`].
///
/// Handlers run one after the other, never in parallel. The cancellation token
/// is handed to each of them unchanged; the composite itself does not stop
/// between handlers when it fires.
///
/// The handler list is fixed at construction and the composite keeps no state
/// between dispatches, so one instance can serve concurrent dispatches.
#[derive(Clone, Default)]
pub struct CompositeMessageHandler {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl CompositeMessageHandler {
    /// Create a composite that runs `handlers` in iteration order.
    pub fn new(handlers: impl IntoIterator<Item = Arc<dyn MessageHandler>>) -> Self {
        Self {
            handlers: handlers.into_iter().collect(),
        }
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the composite has no handlers.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl FromIterator<Arc<dyn MessageHandler>> for CompositeMessageHandler {
    fn from_iter<I: IntoIterator<Item = Arc<dyn MessageHandler>>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Debug for CompositeMessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeMessageHandler")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[async_trait]
impl MessageHandler for CompositeMessageHandler {
    #[tracing::instrument(skip_all)]
    async fn handle(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError> {
        let mut errors = Vec::new();

        for (index, handler) in self.handlers.iter().enumerate() {
            if let Err(error) = handler.handle(envelope, cancel).await {
                tracing::debug!(index, %error, "Message handler failed");
                errors.push(error);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError { errors }.into())
        }
    }
}

/// Failure of one or more handlers of a [`CompositeMessageHandler`].
///
/// Holds every individual failure in handler order. A failure that is itself
/// an `AggregateError` (from a nested composite) is kept as a single entry.
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<tower::BoxError>,
}

impl AggregateError {
    /// Individual failures, in the order of the handlers that produced them.
    pub fn errors(&self) -> &[tower::BoxError] {
        &self.errors
    }

    /// Take the collected failures.
    pub fn into_errors(self) -> Vec<tower::BoxError> {
        self.errors
    }

    /// Number of failed handlers.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether no failure was collected.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} message handler(s) failed", self.errors.len())?;
        for (index, error) in self.errors.iter().enumerate() {
            write!(f, "; [{index}] {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|err| err.as_ref() as &(dyn std::error::Error + 'static))
    }
}
