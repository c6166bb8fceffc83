//! Message containers used by the dispatch pipeline.
//!
//! An [`Envelope`] bundles a message payload together with its headers. The
//! pipeline treats the payload as opaque: handlers that only understand one
//! message shape view it through a [`ReceivedEnvelope`].

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

/// Message container used by the sending and receiving pipelines.
///
/// `Envelope` is immutable once constructed: it exposes its parts through
/// read-only accessors and can only be taken apart by value with
/// [`into_parts`](Envelope::into_parts).
///
/// ## Design
///
/// - `H` represents message metadata (routing keys, correlation IDs, ...)
/// - `M` represents the actual message payload
///
/// The receiving side always uses the defaults, [`Headers`] and [`Payload`].
///
/// ## Example
///
/// ```rust
/// use postmaster::{Envelope, Headers, Payload};
///
/// let envelope = Envelope::new(Headers::new().with_partition_key("user-7"), Payload::new(42u32));
/// assert_eq!(envelope.message().downcast_ref::<u32>(), Some(&42));
///
/// // or, from a tuple
/// let envelope: Envelope<_, _> = ("user.created", 42).into();
/// assert_eq!(*envelope.headers(), "user.created");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H = Headers, M = Payload> {
    headers: H,
    message: M,
}

impl<H, M> Envelope<H, M> {
    /// Create an envelope from its headers and message.
    pub fn new(headers: H, message: M) -> Self {
        Self { headers, message }
    }

    /// Message metadata.
    pub fn headers(&self) -> &H {
        &self.headers
    }

    /// Message payload.
    pub fn message(&self) -> &M {
        &self.message
    }

    /// Split the envelope back into headers and message.
    pub fn into_parts(self) -> (H, M) {
        (self.headers, self.message)
    }
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope::new(value.0, value.1)
    }
}

/// Routing metadata carried next to a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    message_id: Option<String>,
    partition_key: Option<String>,
    metadata: HashMap<String, String>,
}

impl Headers {
    /// Create empty headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport message identifier.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Set the routing/partition key.
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Add a single metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace the whole metadata map.
    pub fn with_metadata_map(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Transport message identifier, if one was set.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Routing/partition key, if one was set.
    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    /// All metadata entries.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Look up one metadata entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Opaque message object.
///
/// The payload has reference semantics: cloning a `Payload` shares the same
/// underlying value. The pipeline never inspects it; typed handlers recover the
/// concrete type with [`downcast_ref`](Payload::downcast_ref) or
/// [`downcast`](Payload::downcast).
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Payload {
    /// Wrap a message value.
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an already shared message value.
    pub fn from_arc<T>(value: Arc<T>) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            value,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Name of the concrete type stored in this payload.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the payload holds a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Borrow the payload as a `T`, if that is what it holds.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Get a shared handle to the payload as a `T`.
    pub fn downcast<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        Arc::clone(&self.value).downcast::<T>().ok()
    }

    /// Whether both payloads point at the same message object.
    pub fn ptr_eq(&self, other: &Payload) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Payload equality is identity: two payloads are equal when they share the
/// same message object.
impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

/// Typed, read-only view of an [`Envelope`] whose payload is known to be a `T`.
///
/// Built with `ReceivedEnvelope::try_from(&envelope)`, which fails with a
/// [`TypeMismatchError`] when the payload holds another type.
#[derive(Debug)]
pub struct ReceivedEnvelope<T> {
    headers: Headers,
    message: Arc<T>,
}

impl<T> ReceivedEnvelope<T> {
    /// Headers of the envelope this was narrowed from.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The typed message.
    pub fn message(&self) -> &T {
        &self.message
    }

    /// Shared handle to the typed message.
    pub fn shared_message(&self) -> Arc<T> {
        Arc::clone(&self.message)
    }
}

impl<T> Clone for ReceivedEnvelope<T> {
    fn clone(&self) -> Self {
        Self {
            headers: self.headers.clone(),
            message: Arc::clone(&self.message),
        }
    }
}

impl<T> TryFrom<&Envelope> for ReceivedEnvelope<T>
where
    T: Any + Send + Sync,
{
    type Error = TypeMismatchError;

    fn try_from(envelope: &Envelope) -> Result<Self, Self::Error> {
        let message = envelope
            .message()
            .downcast::<T>()
            .ok_or_else(|| TypeMismatchError::new::<T>(envelope.message()))?;

        Ok(Self {
            headers: envelope.headers().clone(),
            message,
        })
    }
}

/// Returned when a payload cannot be viewed as the requested type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMismatchError {
    expected: &'static str,
    found: &'static str,
}

impl TypeMismatchError {
    pub(crate) fn new<T>(payload: &Payload) -> Self {
        Self {
            expected: std::any::type_name::<T>(),
            found: payload.type_name(),
        }
    }

    /// Type that was requested.
    pub fn expected(&self) -> &'static str {
        self.expected
    }

    /// Type actually stored in the payload.
    pub fn found(&self) -> &'static str {
        self.found
    }
}

impl fmt::Display for TypeMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "payload type mismatch: expected {}, found {}",
            self.expected, self.found
        )
    }
}

impl std::error::Error for TypeMismatchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct OrderPlaced {
        id: u64,
    }

    #[test]
    fn test_received_envelope_projects_matching_payload() {
        let envelope = Envelope::new(
            Headers::new().with_partition_key("orders-1"),
            Payload::new(OrderPlaced { id: 9 }),
        );

        let received = ReceivedEnvelope::<OrderPlaced>::try_from(&envelope).unwrap();

        assert_eq!(received.message(), &OrderPlaced { id: 9 });
        assert_eq!(received.headers().partition_key(), Some("orders-1"));
    }

    #[test]
    fn test_received_envelope_rejects_other_payload_type() {
        let envelope = Envelope::new(Headers::new(), Payload::new("not an order"));

        let err = ReceivedEnvelope::<OrderPlaced>::try_from(&envelope).unwrap_err();

        assert!(err.expected().ends_with("OrderPlaced"));
        assert_eq!(err.found(), std::any::type_name::<&str>());
    }

    #[test]
    fn test_payload_has_reference_semantics() {
        let payload = Payload::new(OrderPlaced { id: 1 });
        let copy = payload.clone();

        assert!(payload.ptr_eq(&copy));
        assert_eq!(payload, copy);
        assert_ne!(payload, Payload::new(OrderPlaced { id: 1 }));

        let a = payload.downcast::<OrderPlaced>().unwrap();
        let b = copy.downcast::<OrderPlaced>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_headers_metadata() {
        let headers = Headers::new()
            .with_message_id("m-1")
            .with_metadata("tenant", "acme");

        assert_eq!(headers.message_id(), Some("m-1"));
        assert_eq!(headers.get("tenant"), Some("acme"));
        assert_eq!(headers.get("missing"), None);
        assert_eq!(headers.partition_key(), None);
    }
}
