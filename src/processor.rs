//! Queue processing bridge.
//!
//! This module adapts a push-style queue client into the envelope/handler
//! pipeline. For every raw message the client pushes, a
//! [`QueueProcessor`]:
//!
//! - Deserializes the body with its [`Serializer`]
//! - Builds an [`Envelope`] from the payload and the transport metadata
//! - Runs its [`MessageHandler`] (commonly a
//!   [`CompositeMessageHandler`](crate::CompositeMessageHandler))
//! - Reports success, or hands the failure to its [`ExceptionHandler`] and
//!   reports whatever that decides
//!
//! The processor runs until a [`CancellationToken`] owned by the caller fires.
//! It then closes the client so no new messages arrive. Dispatches already in
//! progress are left to finish on their own.

pub mod exception;
mod hook;
mod inmemory;

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    envelope::Headers,
    handler::MessageHandler,
    processor::exception::{CompositeExceptionHandler, Disposition, ExceptionHandler, Failure},
    serializer::Serializer,
};

pub use hook::{DefaultProcessorHook, ProcessorHook};
pub use inmemory::{InMemoryQueue, InMemoryQueueError, InMemoryQueueErrorKind};

/// Message as pushed by the queue client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    /// Serialized message body.
    pub body: String,
    /// Transport message identifier, if the transport has one.
    pub message_id: Option<String>,
    /// Partition or session key, if the transport has one.
    pub partition_key: Option<String>,
    /// Application properties set by the producer.
    pub properties: HashMap<String, String>,
}

impl RawMessage {
    /// Create a message with the given body and no metadata.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Set the transport message identifier.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Set the partition or session key.
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Add one application property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Envelope headers carrying this message's transport metadata.
    fn headers(&self) -> Headers {
        let mut headers = Headers::new().with_metadata_map(self.properties.clone());
        if let Some(id) = &self.message_id {
            headers = headers.with_message_id(id.clone());
        }
        if let Some(key) = &self.partition_key {
            headers = headers.with_partition_key(key.clone());
        }
        headers
    }
}

/// Callback a queue client invokes for each message it receives.
///
/// `Ok` tells the client to acknowledge the message; `Err` tells it the
/// delivery failed, and the client applies its own redelivery or
/// dead-lettering policy.
#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    /// Run one dispatch cycle for `message`.
    async fn on_message(&self, message: RawMessage) -> Result<(), DispatchError>;
}

/// Push-style queue client.
///
/// The client owns its receive loop, acknowledgement, retry counts and
/// dead-lettering. It may invoke the callback for several messages
/// concurrently.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Start pushing messages to `callback`.
    async fn subscribe(&self, callback: Arc<dyn DeliveryCallback>) -> Result<(), Self::Error>;

    /// Stop pushing messages. No callback starts after this returns.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// Lifecycle of a [`QueueProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    /// Built, not yet subscribed.
    Idle = 0,
    /// Subscribed; every pushed message starts a dispatch cycle.
    Active = 1,
    /// The cancellation token fired; the client is being closed.
    ShuttingDown = 2,
    /// Terminal; no further messages are accepted.
    Closed = 3,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Active,
            2 => Self::ShuttingDown,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ProcessorState::Idle as u8))
    }

    fn get(&self) -> ProcessorState {
        ProcessorState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ProcessorState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ProcessorState, to: ProcessorState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct Shared {
    handler: Arc<dyn MessageHandler>,
    serializer: Arc<dyn Serializer>,
    exception_handler: Arc<dyn ExceptionHandler>,
    hook: Arc<dyn ProcessorHook>,
    state: StateCell,
}

/// Bridge between a [`QueueClient`] and a [`MessageHandler`].
///
/// The processor holds no per-message state, so the client may run any number
/// of dispatch cycles concurrently. Cloning is cheap and clones share the same
/// lifecycle.
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use postmaster::{
///     CompositeMessageHandler, InMemoryQueue, MessageHandler, QueueProcessor,
///     handler::handler_fn, serializer::JsonSerializer,
/// };
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), postmaster::ProcessorRunError> {
/// let handlers = CompositeMessageHandler::new([
///     Arc::new(handler_fn(|_envelope, _cancel| async { Ok(()) })) as Arc<dyn MessageHandler>,
/// ]);
/// let processor = QueueProcessor::builder(handlers, JsonSerializer::<String>::new()).build();
///
/// processor.run(InMemoryQueue::default(), CancellationToken::new()).await
/// # }
/// ```
#[derive(Clone)]
pub struct QueueProcessor {
    shared: Arc<Shared>,
}

impl QueueProcessor {
    /// Start building a processor around a handler and a serializer.
    pub fn builder<H, Z>(handler: H, serializer: Z) -> QueueProcessorBuilder
    where
        H: MessageHandler + 'static,
        Z: Serializer + 'static,
    {
        QueueProcessorBuilder {
            handler: Arc::new(handler),
            serializer: Arc::new(serializer),
            exception_handler: Arc::new(CompositeExceptionHandler::default()),
            hook: Arc::new(DefaultProcessorHook),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessorState {
        self.shared.state.get()
    }

    /// Run the processor.
    ///
    /// The processor:
    /// - Subscribes to the queue client
    /// - Dispatches every pushed message while active
    /// - Closes the client once `cancel` fires
    ///
    /// `cancel` is also handed to every handler invocation so handlers can
    /// stop cooperatively. If it has already fired, the processor closes
    /// without subscribing.
    #[tracing::instrument(skip_all)]
    pub async fn run<C>(
        &self,
        client: C,
        cancel: CancellationToken,
    ) -> Result<(), ProcessorRunError>
    where
        C: QueueClient,
    {
        if cancel.is_cancelled() {
            if self.shared.state.transition(ProcessorState::Idle, ProcessorState::Closed) {
                self.shared.hook.on_closed();
                return Ok(());
            }
            return Err(ProcessorRunError::already_started());
        }

        if !self.shared.state.transition(ProcessorState::Idle, ProcessorState::Active) {
            return Err(ProcessorRunError::already_started());
        }

        self.shared.hook.on_startup();

        let callback = Arc::new(Dispatcher {
            shared: Arc::clone(&self.shared),
            cancel: cancel.clone(),
        });
        if let Err(e) = client.subscribe(callback).await {
            self.shared.state.set(ProcessorState::Closed);
            self.shared.hook.on_closed();
            return Err(ProcessorRunError::subscribe(e.into()));
        }

        cancel.cancelled().await;

        self.shared.state.set(ProcessorState::ShuttingDown);
        self.shared.hook.on_shutdown();

        let closed = client.close().await;

        self.shared.state.set(ProcessorState::Closed);
        self.shared.hook.on_closed();

        closed.map_err(|e| ProcessorRunError::close(e.into()))
    }
}

impl fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Builder for creating a [`QueueProcessor`].
///
/// Without further configuration, failures are never suppressed (the
/// exception handler is an empty [`CompositeExceptionHandler`]) and lifecycle
/// events are logged by [`DefaultProcessorHook`].
pub struct QueueProcessorBuilder {
    handler: Arc<dyn MessageHandler>,
    serializer: Arc<dyn Serializer>,
    exception_handler: Arc<dyn ExceptionHandler>,
    hook: Arc<dyn ProcessorHook>,
}

impl QueueProcessorBuilder {
    /// Set the exception handler consulted when a dispatch fails.
    pub fn exception_handler<E>(mut self, exception_handler: E) -> Self
    where
        E: ExceptionHandler + 'static,
    {
        self.exception_handler = Arc::new(exception_handler);
        self
    }

    /// Replace the lifecycle hook.
    pub fn hook<HK>(mut self, hook: HK) -> Self
    where
        HK: ProcessorHook + 'static,
    {
        self.hook = Arc::new(hook);
        self
    }

    /// Build the processor. It starts in [`ProcessorState::Idle`].
    pub fn build(self) -> QueueProcessor {
        QueueProcessor {
            shared: Arc::new(Shared {
                handler: self.handler,
                serializer: self.serializer,
                exception_handler: self.exception_handler,
                hook: self.hook,
                state: StateCell::new(),
            }),
        }
    }
}

/// The callback registered with the queue client for one run.
struct Dispatcher {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn fail(
        &self,
        envelope: Option<&Envelope>,
        message: &RawMessage,
        error: DispatchError,
    ) -> Result<(), DispatchError> {
        self.shared.hook.on_message_failed(&error);

        let failure = Failure {
            envelope,
            message,
            error: &error,
        };
        match self
            .shared
            .exception_handler
            .handle(&failure, &self.cancel)
            .await
        {
            Disposition::Handled => {
                self.shared.hook.on_failure_suppressed(&error);
                Ok(())
            }
            Disposition::Unhandled => Err(error),
        }
    }
}

#[async_trait]
impl DeliveryCallback for Dispatcher {
    #[tracing::instrument(skip_all, fields(message_id = ?message.message_id))]
    async fn on_message(&self, message: RawMessage) -> Result<(), DispatchError> {
        if self.shared.state.get() != ProcessorState::Active {
            self.shared.hook.on_message_rejected(&message);
            return Err(DispatchError::closed());
        }

        self.shared.hook.on_message_received(&message);

        let payload = match self.shared.serializer.deserialize(&message.body) {
            Ok(payload) => payload,
            Err(e) => return self.fail(None, &message, DispatchError::deserialize(e)).await,
        };

        let envelope = Envelope::new(message.headers(), payload);

        match self.shared.handler.handle(&envelope, &self.cancel).await {
            Ok(()) => {
                self.shared.hook.on_message_completed(&envelope);
                Ok(())
            }
            Err(e) => {
                self.fail(Some(&envelope), &message, DispatchError::handler(e))
                    .await
            }
        }
    }
}

/// Error reported to the queue client when a dispatch cycle fails.
#[derive(Debug)]
pub struct DispatchError {
    context: SpanTrace,
    kind: DispatchErrorKind,
}

/// Classification of dispatch failures.
#[derive(Debug)]
pub enum DispatchErrorKind {
    /// The body could not be deserialized; no handler ran.
    Deserialize(tower::BoxError),
    /// The message handler failed. For a composite handler this is an
    /// [`AggregateError`](crate::AggregateError).
    Handler(tower::BoxError),
    /// The processor is no longer active.
    Closed,
}

impl DispatchError {
    /// Create a deserialization error.
    pub fn deserialize(err: tower::BoxError) -> Self {
        Self::with_kind(DispatchErrorKind::Deserialize(err))
    }

    /// Create a handler failure error.
    pub fn handler(err: tower::BoxError) -> Self {
        Self::with_kind(DispatchErrorKind::Handler(err))
    }

    /// Create the error reported when the processor is not active.
    pub fn closed() -> Self {
        Self::with_kind(DispatchErrorKind::Closed)
    }

    fn with_kind(kind: DispatchErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// Get the dispatch error kind.
    pub fn kind(&self) -> &DispatchErrorKind {
        &self.kind
    }

    /// Error returned by the message handler, if that is what failed.
    pub fn handler_error(&self) -> Option<&tower::BoxError> {
        match &self.kind {
            DispatchErrorKind::Handler(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DispatchErrorKind::Deserialize(err) => writeln!(f, "Deserialize error: {err}"),
            DispatchErrorKind::Handler(err) => writeln!(f, "Handler error: {err}"),
            DispatchErrorKind::Closed => writeln!(f, "Queue processor is not active"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchErrorKind::Deserialize(err) => Some(err.as_ref()),
            DispatchErrorKind::Handler(err) => Some(err.as_ref()),
            DispatchErrorKind::Closed => None,
        }
    }
}

/// Error returned when the processor run fails.
#[derive(Debug)]
pub struct ProcessorRunError {
    context: SpanTrace,
    kind: ProcessorRunErrorKind,
}

/// Classification of processor runtime errors.
#[derive(Debug)]
pub enum ProcessorRunErrorKind {
    /// `run` was called on a processor that already ran.
    AlreadyStarted,
    /// The queue client refused the subscription.
    Subscribe(tower::BoxError),
    /// The queue client failed to close.
    Close(tower::BoxError),
}

impl ProcessorRunError {
    fn already_started() -> Self {
        Self::with_kind(ProcessorRunErrorKind::AlreadyStarted)
    }

    fn subscribe(error: tower::BoxError) -> Self {
        Self::with_kind(ProcessorRunErrorKind::Subscribe(error))
    }

    fn close(error: tower::BoxError) -> Self {
        Self::with_kind(ProcessorRunErrorKind::Close(error))
    }

    fn with_kind(kind: ProcessorRunErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// Get the run error kind.
    pub fn kind(&self) -> &ProcessorRunErrorKind {
        &self.kind
    }
}

impl fmt::Display for ProcessorRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ProcessorRunErrorKind::AlreadyStarted => {
                writeln!(f, "Queue processor already started")
            }
            ProcessorRunErrorKind::Subscribe(err) => writeln!(f, "Subscribe error: {err}"),
            ProcessorRunErrorKind::Close(err) => writeln!(f, "Close error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ProcessorRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ProcessorRunErrorKind::AlreadyStarted => None,
            ProcessorRunErrorKind::Subscribe(err) => Some(err.as_ref()),
            ProcessorRunErrorKind::Close(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{handler::handler_fn, serializer::JsonSerializer};

    fn processor(calls: &Arc<AtomicUsize>) -> QueueProcessor {
        let calls = Arc::clone(calls);
        QueueProcessor::builder(
            handler_fn(move |_envelope, _cancel| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }),
            JsonSerializer::<u32>::new(),
        )
        .build()
    }

    #[test]
    fn test_raw_message_metadata_becomes_headers() {
        let message = RawMessage::new("1")
            .with_message_id("m-1")
            .with_partition_key("session-9")
            .with_property("origin", "billing");

        let headers = message.headers();

        assert_eq!(headers.message_id(), Some("m-1"));
        assert_eq!(headers.partition_key(), Some("session-9"));
        assert_eq!(headers.get("origin"), Some("billing"));
    }

    #[test]
    fn test_state_transitions_are_exclusive() {
        let cell = StateCell::new();

        assert!(cell.transition(ProcessorState::Idle, ProcessorState::Active));
        assert!(!cell.transition(ProcessorState::Idle, ProcessorState::Active));
        assert_eq!(cell.get(), ProcessorState::Active);
    }

    #[tokio::test]
    async fn test_already_cancelled_run_closes_without_subscribing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let processor = processor(&calls);
        let queue = InMemoryQueue::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        processor.run(queue.clone(), cancel).await.unwrap();

        assert_eq!(processor.state(), ProcessorState::Closed);
        assert!(!queue.is_subscribed().await);
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let processor = processor(&calls);
        let cancel = CancellationToken::new();
        cancel.cancel();
        processor
            .run(InMemoryQueue::default(), cancel.clone())
            .await
            .unwrap();

        let err = processor
            .run(InMemoryQueue::default(), cancel)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ProcessorRunErrorKind::AlreadyStarted));
    }

    #[tokio::test]
    async fn test_dispatch_after_close_is_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let processor = processor(&calls);
        let dispatcher = Dispatcher {
            shared: Arc::clone(&processor.shared),
            cancel: CancellationToken::new(),
        };
        processor.shared.state.set(ProcessorState::Closed);

        let err = dispatcher.on_message(RawMessage::new("1")).await.unwrap_err();

        assert!(matches!(err.kind(), DispatchErrorKind::Closed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
