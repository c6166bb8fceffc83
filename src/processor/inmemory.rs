use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::processor::{DeliveryCallback, DispatchError, QueueClient, RawMessage};

/// In-memory queue client for testing or local pipelines.
///
/// Messages are pushed explicitly with [`deliver`](InMemoryQueue::deliver),
/// which runs the registered callback and returns its outcome the way a real
/// client would turn it into an acknowledgement. Clones share the same
/// subscription, so a test can keep one clone while the processor owns
/// another.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<QueueInner>>,
}

#[derive(Default)]
struct QueueInner {
    callback: Option<Arc<dyn DeliveryCallback>>,
    closed: bool,
}

impl InMemoryQueue {
    /// Push one message to the subscribed callback.
    ///
    /// Fails without dispatching when nobody subscribed yet or the queue was
    /// closed.
    #[tracing::instrument(skip_all)]
    pub async fn deliver(&self, message: RawMessage) -> Result<(), InMemoryQueueError> {
        let callback = {
            let inner = self.inner.lock().await;
            if inner.closed {
                return Err(InMemoryQueueError::closed());
            }
            inner
                .callback
                .clone()
                .ok_or_else(InMemoryQueueError::not_subscribed)?
        };

        callback
            .on_message(message)
            .await
            .map_err(InMemoryQueueError::rejected)
    }

    /// Whether a callback is currently registered.
    pub async fn is_subscribed(&self) -> bool {
        self.inner.lock().await.callback.is_some()
    }

    /// Whether the queue was closed.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    type Error = InMemoryQueueError;

    async fn subscribe(&self, callback: Arc<dyn DeliveryCallback>) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(InMemoryQueueError::closed());
        }
        if inner.callback.is_some() {
            return Err(InMemoryQueueError::already_subscribed());
        }
        inner.callback = Some(callback);
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.callback = None;
        Ok(())
    }
}

/// Error type for `InMemoryQueue` operations.
#[derive(Debug)]
pub struct InMemoryQueueError {
    kind: InMemoryQueueErrorKind,
}

/// `InMemoryQueue` errors kind.
#[derive(Debug)]
pub enum InMemoryQueueErrorKind {
    /// Nothing subscribed to the queue yet.
    NotSubscribed,
    /// The queue already has a subscriber.
    AlreadySubscribed,
    /// The queue was closed.
    Closed,
    /// The callback reported a failed delivery.
    Rejected(DispatchError),
}

impl InMemoryQueueError {
    fn not_subscribed() -> Self {
        Self {
            kind: InMemoryQueueErrorKind::NotSubscribed,
        }
    }

    fn already_subscribed() -> Self {
        Self {
            kind: InMemoryQueueErrorKind::AlreadySubscribed,
        }
    }

    fn closed() -> Self {
        Self {
            kind: InMemoryQueueErrorKind::Closed,
        }
    }

    fn rejected(error: DispatchError) -> Self {
        Self {
            kind: InMemoryQueueErrorKind::Rejected(error),
        }
    }

    /// Get the error kind.
    pub fn kind(&self) -> &InMemoryQueueErrorKind {
        &self.kind
    }

    /// The dispatch error, when the callback failed the delivery.
    pub fn dispatch_error(&self) -> Option<&DispatchError> {
        match &self.kind {
            InMemoryQueueErrorKind::Rejected(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for InMemoryQueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryQueueErrorKind::NotSubscribed => write!(f, "No callback subscribed"),
            InMemoryQueueErrorKind::AlreadySubscribed => {
                write!(f, "A callback is already subscribed")
            }
            InMemoryQueueErrorKind::Closed => write!(f, "Queue is closed"),
            InMemoryQueueErrorKind::Rejected(err) => write!(f, "Delivery failed: {err}"),
        }
    }
}

impl std::error::Error for InMemoryQueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            InMemoryQueueErrorKind::Rejected(err) => Some(err),
            _ => None,
        }
    }
}
