//! Send contract and sender backends.
//!
//! This module defines the outbound half of the pipeline: sending one
//! [`Envelope`] or a batch of them through a backend, with an explicit
//! [`CancellationToken`].
//!
//! The transport is built around Tower's `Service` abstraction, enabling
//! middleware composition (serialization, tracing, timeouts, etc.) while
//! keeping sender implementations backend-agnostic. Services see a
//! [`SendRequest`]: the envelope together with the caller's token, so every
//! layer and finally the backend observe the same cancellation signal.
//!
//! ## Key components
//!
//! - [`Sender`]: Trait implemented by concrete sender backends
//! - [`SenderExt`]: Convenience forms that request no cancellation
//! - [`Transport`]: Tower-compatible wrapper that is itself a [`Sender`]
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

pub mod layers;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::Envelope;

pub use inmemory::InMemory;

/// Trait implemented by message buses.
///
/// A sender is responsible for delivering an [`Envelope`] to an external
/// system (a broker, a queue, an in-memory channel, ...).
///
/// Both operations take the cancellation signal explicitly. Callers that do
/// not care about cancellation use the [`SenderExt`] forms, which pass
/// [`no_cancellation`].
#[async_trait::async_trait]
pub trait Sender<H, M>: Send {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Send an envelope using the underlying transport.
    async fn send(
        &mut self,
        envelope: Envelope<H, M>,
        cancel: CancellationToken,
    ) -> Result<(), Self::Error>;

    /// Send a homogeneous batch of envelopes.
    async fn send_batch(
        &mut self,
        envelopes: Vec<Envelope<H, M>>,
        cancel: CancellationToken,
    ) -> Result<(), Self::Error>;
}

/// The "cancellation never requested" signal.
///
/// Returns a fresh token that nothing else holds, so it can never fire.
pub fn no_cancellation() -> CancellationToken {
    CancellationToken::new()
}

/// Forms of the [`Sender`] operations without a cancellation argument.
///
/// Each method is exactly the full form called with [`no_cancellation`]: the
/// envelopes are passed through untouched and the future returned by the
/// sender is handed back as-is.
pub trait SenderExt<H, M>: Sender<H, M> {
    /// [`Sender::send`] without cancellation support.
    fn send_uncancellable<'a>(
        &'a mut self,
        envelope: Envelope<H, M>,
    ) -> BoxFuture<'a, Result<(), Self::Error>>
    where
        H: 'a,
        M: 'a,
    {
        self.send(envelope, no_cancellation())
    }

    /// [`Sender::send_batch`] without cancellation support.
    fn send_batch_uncancellable<'a>(
        &'a mut self,
        envelopes: Vec<Envelope<H, M>>,
    ) -> BoxFuture<'a, Result<(), Self::Error>>
    where
        H: 'a,
        M: 'a,
    {
        self.send_batch(envelopes, no_cancellation())
    }
}

impl<H, M, S> SenderExt<H, M> for S where S: Sender<H, M> + ?Sized {}

/// Request handled by the services inside a [`Transport`].
///
/// The token is the one the caller passed to [`Sender::send`], unchanged.
pub type SendRequest<H, M> = (Envelope<H, M>, CancellationToken);

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` wraps an underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Supports Tower middleware via layers
/// - Refuses to start a send once the cancellation token fired
/// - Hands the token down the stack with every envelope
///
/// A send already in flight is never dropped when the token fires; the
/// backend decides how to react to it.
///
/// Typically constructed from a concrete [`Sender`] implementation.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    ///
    /// The sender will be wrapped in a [`SenderService`] to make it
    /// Tower-compatible.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    async fn call<H, M>(
        service: S,
        envelope: Envelope<H, M>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>
    where
        S: Service<SendRequest<H, M>>,
        S::Error: Into<tower::BoxError>,
    {
        if cancel.is_cancelled() {
            return Err(TransportError::cancelled());
        }

        service
            .oneshot((envelope, cancel.clone()))
            .await
            .map(|_| ())
            .map_err(|e| {
                // Layers may already report a classified transport error.
                let err: tower::BoxError = e.into();
                match err.downcast::<TransportError>() {
                    Ok(err) => *err,
                    Err(err) => TransportError::sender(err),
                }
            })
    }
}

#[async_trait::async_trait]
impl<H, M, S> Sender<H, M> for Transport<S>
where
    H: Send + 'static,
    M: Send + 'static,
    S: Service<SendRequest<H, M>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<tower::BoxError>,
{
    type Error = TransportError;

    #[tracing::instrument(skip_all)]
    async fn send(
        &mut self,
        envelope: Envelope<H, M>,
        cancel: CancellationToken,
    ) -> Result<(), Self::Error> {
        Self::call(self.service.clone(), envelope, &cancel).await
    }

    #[tracing::instrument(skip_all, fields(batch_size = envelopes.len()))]
    async fn send_batch(
        &mut self,
        envelopes: Vec<Envelope<H, M>>,
        cancel: CancellationToken,
    ) -> Result<(), Self::Error> {
        for envelope in envelopes {
            Self::call(self.service.clone(), envelope, &cancel).await?;
        }
        Ok(())
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the sender backend.
    Sender(tower::BoxError),
    /// Errors related to serialization or deserialization.
    Serde(tower::BoxError),
    /// The cancellation token had fired before the send started.
    Cancelled,
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: tower::BoxError) -> Self {
        Self::with_kind(TransportErrorKind::Sender(err))
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: tower::BoxError) -> Self {
        Self::with_kind(TransportErrorKind::Serde(err))
    }

    /// Create a cancellation error.
    pub fn cancelled() -> Self {
        Self::with_kind(TransportErrorKind::Cancelled)
    }

    fn with_kind(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// Get the transport error kind.
    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    /// Whether the send was refused because the token had fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Cancelled)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            TransportErrorKind::Cancelled => writeln!(f, "Send cancelled"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
            TransportErrorKind::Cancelled => None,
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
///
/// The backend is called with the token carried by the request.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<H, M, D> Service<SendRequest<H, M>> for SenderService<D>
where
    H: Send + 'static,
    M: Send + 'static,
    D: Sender<H, M> + Clone + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, (envelope, cancel): SendRequest<H, M>) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move { sender.send(envelope, cancel).await.map_err(Into::into) })
    }
}

/// Serialized message body produced by [`layers::SerializeLayer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload(String);

impl RawPayload {
    /// Body as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Body as UTF-8 bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Take the body out as an owned string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for RawPayload {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    /// Records every call and answers with a numbered outcome so a caller can
    /// tell which underlying call produced what it got back.
    #[derive(Clone, Default)]
    struct RecordingBus {
        calls: Arc<AtomicUsize>,
        tokens: Arc<Mutex<Vec<CancellationToken>>>,
        batches: Arc<Mutex<Vec<Vec<Envelope<&'static str, u32>>>>>,
    }

    #[derive(Debug, PartialEq)]
    struct CallNumber(usize);

    impl std::fmt::Display for CallNumber {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "call #{}", self.0)
        }
    }

    impl std::error::Error for CallNumber {}

    #[async_trait::async_trait]
    impl Sender<&'static str, u32> for RecordingBus {
        type Error = CallNumber;

        async fn send(
            &mut self,
            envelope: Envelope<&'static str, u32>,
            cancel: CancellationToken,
        ) -> Result<(), Self::Error> {
            self.send_batch(vec![envelope], cancel).await
        }

        async fn send_batch(
            &mut self,
            envelopes: Vec<Envelope<&'static str, u32>>,
            cancel: CancellationToken,
        ) -> Result<(), Self::Error> {
            self.tokens.lock().unwrap().push(cancel);
            self.batches.lock().unwrap().push(envelopes);
            Err(CallNumber(self.calls.fetch_add(1, Ordering::SeqCst)))
        }
    }

    #[tokio::test]
    async fn test_send_uncancellable_delegates_untouched() {
        let mut bus = RecordingBus::default();
        let envelope = Envelope::new("orders", 7u32);

        let outcome = bus.send_uncancellable(envelope.clone()).await;

        assert_eq!(outcome, Err(CallNumber(0)));
        assert_eq!(bus.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*bus.batches.lock().unwrap(), vec![vec![envelope]]);
        let tokens = bus.tokens.lock().unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(!tokens[0].is_cancelled());
    }

    #[tokio::test]
    async fn test_send_batch_uncancellable_matches_full_form() {
        let mut bus = RecordingBus::default();

        let short = bus.send_batch_uncancellable(Vec::new()).await;
        let full = bus.send_batch(Vec::new(), no_cancellation()).await;

        assert_eq!(short, Err(CallNumber(0)));
        assert_eq!(full, Err(CallNumber(1)));
        let batches = bus.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(Vec::is_empty));
        assert!(bus.tokens.lock().unwrap().iter().all(|t| !t.is_cancelled()));
    }

    #[tokio::test]
    async fn test_transport_records_sent_envelopes() {
        let memory = InMemory::<&'static str, u32>::default();
        let mut transport = Transport::new(memory.clone());

        transport
            .send(Envelope::new("a", 1u32), no_cancellation())
            .await
            .unwrap();
        transport
            .send_batch_uncancellable(vec![Envelope::new("b", 2u32), Envelope::new("c", 3u32)])
            .await
            .unwrap();

        let sent = memory.sent_messages().await;
        let headers: Vec<_> = sent.iter().map(|e| *e.headers()).collect();
        assert_eq!(headers, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_transport_observes_cancelled_token() {
        let memory = InMemory::<&'static str, u32>::default();
        let mut transport = Transport::new(memory.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transport
            .send(Envelope::new("a", 1u32), cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(memory.sent_messages().await.is_empty());
    }

    /// Backend that stays in flight until released and reports what its
    /// token looked like when it finished.
    #[derive(Clone, Default)]
    struct SlowBus {
        started: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Sender<&'static str, u32> for SlowBus {
        type Error = std::io::Error;

        async fn send(
            &mut self,
            envelope: Envelope<&'static str, u32>,
            cancel: CancellationToken,
        ) -> Result<(), Self::Error> {
            self.send_batch(vec![envelope], cancel).await
        }

        async fn send_batch(
            &mut self,
            _envelopes: Vec<Envelope<&'static str, u32>>,
            cancel: CancellationToken,
        ) -> Result<(), Self::Error> {
            self.log.lock().unwrap().push("started".to_owned());
            self.started.notify_one();
            self.release.notified().await;
            self.log
                .lock()
                .unwrap()
                .push(format!("finished, cancelled={}", cancel.is_cancelled()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transport_lets_in_flight_send_finish_after_cancel() {
        let bus = SlowBus::default();
        let mut transport = Transport::new(bus.clone());
        let cancel = CancellationToken::new();

        let send = tokio::spawn({
            let cancel = cancel.clone();
            async move { transport.send(Envelope::new("a", 1u32), cancel).await }
        });
        bus.started.notified().await;
        cancel.cancel();
        bus.release.notify_one();

        send.await.unwrap().unwrap();
        assert_eq!(
            *bus.log.lock().unwrap(),
            vec!["started", "finished, cancelled=true"]
        );
    }

    #[tokio::test]
    async fn test_transport_wraps_backend_errors() {
        let mut transport = Transport::new(RecordingBus::default());

        let err = transport
            .send(Envelope::new("a", 1u32), no_cancellation())
            .await
            .unwrap_err();

        match err.kind() {
            TransportErrorKind::Sender(inner) => assert_eq!(inner.to_string(), "call #0"),
            other => panic!("unexpected error kind: {other:?}"),
        }
    }
}
