//! Message handler abstractions.
//!
//! A [`MessageHandler`] processes one [`Envelope`], possibly asynchronously,
//! possibly failing. Handlers that only understand one message shape implement
//! [`Handles`] instead and are adapted with [`typed`].
//!
//! ## Key components
//!
//! - [`MessageHandler`]: untyped handler over opaque payloads
//! - [`Handles`]: typed handler over a [`ReceivedEnvelope`]
//! - [`Typed`]: adapter from [`Handles`] to [`MessageHandler`]
//! - [`HandlerFn`]: adapter from a closure to [`MessageHandler`]
//! - [`CompositeMessageHandler`]: ordered fan-out with failure aggregation

mod composite;

use std::{any::Any, fmt, future::Future, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, ReceivedEnvelope};

pub use composite::{AggregateError, CompositeMessageHandler};

/// Processes one envelope.
///
/// Implementations may suspend while awaiting downstream work. Cancellation is
/// cooperative: a handler should observe `cancel` at its own suspension points
/// but is not required to abort immediately. A handler signals failure by
/// returning an error and must not swallow failures it does not handle.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one envelope.
    async fn handle(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError>;
}

#[async_trait]
impl<T> MessageHandler for Arc<T>
where
    T: MessageHandler + ?Sized,
{
    async fn handle(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError> {
        (**self).handle(envelope, cancel).await
    }
}

#[async_trait]
impl<T> MessageHandler for Box<T>
where
    T: MessageHandler + ?Sized,
{
    async fn handle(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError> {
        (**self).handle(envelope, cancel).await
    }
}

/// Typed handler for messages of type `T`.
///
/// Same contract as [`MessageHandler`], but the payload has already been
/// projected to `T`. Adapt it with [`typed`] to put it in a composite.
#[async_trait]
pub trait Handles<T>: Send + Sync {
    /// Process one envelope whose message is a `T`.
    async fn handle(
        &self,
        envelope: &ReceivedEnvelope<T>,
        cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError>;
}

/// [`MessageHandler`] adapter for a [`Handles<T>`] implementation.
///
/// Envelopes whose payload is not a `T` are not this handler's concern: they
/// are skipped and reported as success so that sibling handlers in a
/// composite still see the envelope and no failure is recorded.
pub struct Typed<T, H> {
    handler: H,
    _message: PhantomData<fn() -> T>,
}

/// Adapt a typed handler into a [`MessageHandler`].
pub fn typed<T, H>(handler: H) -> Typed<T, H>
where
    H: Handles<T>,
{
    Typed {
        handler,
        _message: PhantomData,
    }
}

impl<T, H> Typed<T, H> {
    /// Access the wrapped handler.
    pub fn get_ref(&self) -> &H {
        &self.handler
    }
}

impl<T, H: fmt::Debug> fmt::Debug for Typed<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Typed")
            .field("message", &std::any::type_name::<T>())
            .field("handler", &self.handler)
            .finish()
    }
}

#[async_trait]
impl<T, H> MessageHandler for Typed<T, H>
where
    T: Any + Send + Sync,
    H: Handles<T>,
{
    async fn handle(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError> {
        match ReceivedEnvelope::<T>::try_from(envelope) {
            Ok(received) => self.handler.handle(&received, cancel).await,
            Err(mismatch) => {
                tracing::trace!(%mismatch, "Skipping typed handler");
                Ok(())
            }
        }
    }
}

/// [`MessageHandler`] built from a closure. See [`handler_fn`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Build a [`MessageHandler`] from an async closure.
///
/// The closure receives a cheap clone of the envelope and of the cancellation
/// token so the returned future can own them.
///
/// ```rust
/// use postmaster::handler::handler_fn;
///
/// let handler = handler_fn(|envelope, _cancel| async move {
///     tracing::info!(headers = ?envelope.headers(), "Got a message");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Envelope, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send,
{
    HandlerFn { f }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn")
            .field("f", &std::any::type_name::<F>())
            .finish()
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Envelope, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send,
{
    async fn handle(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError> {
        (self.f)(envelope.clone(), cancel.clone()).await
    }
}
