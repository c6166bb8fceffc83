//! Serializer boundary.
//!
//! The pipeline only relies on the [`Serializer`] contract: turning an opaque
//! [`Payload`] into a string body and back. Both directions are fallible black
//! boxes. [`JsonSerializer`] is the `serde_json` binding for one message type.

use std::{any::Any, fmt, marker::PhantomData};

use serde::{Serialize, de::DeserializeOwned};

use crate::envelope::{Payload, TypeMismatchError};

/// Converts messages to and from their transport body.
pub trait Serializer: Send + Sync {
    /// Serialize a message into a body string.
    fn serialize(&self, message: &Payload) -> Result<String, tower::BoxError>;

    /// Deserialize a body string into a message.
    fn deserialize(&self, body: &str) -> Result<Payload, tower::BoxError>;
}

impl<T> Serializer for std::sync::Arc<T>
where
    T: Serializer + ?Sized,
{
    fn serialize(&self, message: &Payload) -> Result<String, tower::BoxError> {
        (**self).serialize(message)
    }

    fn deserialize(&self, body: &str) -> Result<Payload, tower::BoxError> {
        (**self).deserialize(body)
    }
}

/// JSON serializer for messages of type `T`.
///
/// Serializing a payload that does not hold a `T` fails with a
/// [`TypeMismatchError`].
pub struct JsonSerializer<T> {
    _message: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    /// Create a serializer for `T`.
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSerializer")
            .field("message", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Serializer for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned + Any + Send + Sync,
{
    fn serialize(&self, message: &Payload) -> Result<String, tower::BoxError> {
        let value = message
            .downcast_ref::<T>()
            .ok_or_else(|| TypeMismatchError::new::<T>(message))?;
        Ok(serde_json::to_string(value)?)
    }

    fn deserialize(&self, body: &str) -> Result<Payload, tower::BoxError> {
        let value: T = serde_json::from_str(body)?;
        Ok(Payload::new(value))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Invoice {
        number: u32,
        customer: String,
    }

    #[test]
    fn test_deserialize_produces_typed_payload() {
        let serializer = JsonSerializer::<Invoice>::new();

        let payload = serializer
            .deserialize(r#"{"number":12,"customer":"acme"}"#)
            .unwrap();

        assert_eq!(
            payload.downcast_ref::<Invoice>(),
            Some(&Invoice {
                number: 12,
                customer: "acme".to_owned(),
            })
        );
    }

    #[test]
    fn test_deserialize_rejects_malformed_body() {
        let serializer = JsonSerializer::<Invoice>::new();

        assert!(serializer.deserialize("{not json").is_err());
        assert!(serializer.deserialize(r#"{"number":"twelve"}"#).is_err());
    }

    #[test]
    fn test_serialize_rejects_foreign_payload() {
        let serializer = JsonSerializer::<Invoice>::new();

        let err = serializer.serialize(&Payload::new(5u64)).unwrap_err();

        let mismatch = err.downcast_ref::<TypeMismatchError>().unwrap();
        assert_eq!(mismatch.found(), "u64");
    }

    #[test]
    fn test_serialize_writes_json() {
        let serializer = JsonSerializer::<Invoice>::new();
        let payload = Payload::new(Invoice {
            number: 3,
            customer: "globex".to_owned(),
        });

        assert_eq!(
            serializer.serialize(&payload).unwrap(),
            r#"{"number":3,"customer":"globex"}"#
        );
    }
}
