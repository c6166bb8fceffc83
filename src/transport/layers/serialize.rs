use std::{future::Future, pin::Pin, sync::Arc};

use tower::{Layer, Service};

use crate::{
    Envelope,
    envelope::Payload,
    serializer::Serializer,
    transport::{RawPayload, SendRequest, TransportError},
};

/// Tower `Service` wrapper that serializes opaque payloads.
///
/// Converts an `Envelope<H, Payload>` into an `Envelope<H, RawPayload>` with
/// the configured [`Serializer`] before passing it to the inner service.
/// Serialization failures are reported as [`TransportError::serde`]. The
/// cancellation token travels on to the inner service untouched.
pub struct SerializeService<T, Z: ?Sized> {
    inner: T,
    serializer: Arc<Z>,
}

impl<T: Clone, Z: ?Sized> Clone for SerializeService<T, Z> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

impl<T, H, Z> Service<SendRequest<H, Payload>> for SerializeService<T, Z>
where
    H: Send + 'static,
    Z: Serializer + ?Sized + 'static,
    T: Service<SendRequest<H, RawPayload>> + Clone + Send + 'static,
    <T as Service<SendRequest<H, RawPayload>>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, (req, cancel): SendRequest<H, Payload>) -> Self::Future {
        let serialized = self.serializer.serialize(req.message());
        // The inner service was driven to readiness, take it and leave a clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let body = serialized.map_err(TransportError::serde)?;
            let (headers, _) = req.into_parts();
            let envelope = Envelope::new(headers, RawPayload::from(body));

            inner.call((envelope, cancel)).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies [`SerializeService`] to a service stack.
pub struct SerializeLayer<Z: ?Sized> {
    serializer: Arc<Z>,
}

impl<Z: Serializer> SerializeLayer<Z> {
    /// Create the layer around a serializer.
    pub fn new(serializer: Z) -> Self {
        Self {
            serializer: Arc::new(serializer),
        }
    }
}

impl<Z: ?Sized> SerializeLayer<Z> {
    /// Build the layer around an already shared serializer.
    pub fn from_arc(serializer: Arc<Z>) -> Self {
        Self { serializer }
    }
}

impl<S, Z: ?Sized> Layer<S> for SerializeLayer<Z> {
    type Service = SerializeService<S, Z>;

    fn layer(&self, service: S) -> Self::Service {
        SerializeService {
            inner: service,
            serializer: Arc::clone(&self.serializer),
        }
    }
}
