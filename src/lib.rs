#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod envelope;
pub mod handler;
pub mod processor;
pub mod serializer;
pub mod transport;

#[doc(inline)]
pub use envelope::{Envelope, Headers, Payload, ReceivedEnvelope, TypeMismatchError};

#[doc(inline)]
pub use handler::{AggregateError, CompositeMessageHandler, Handles, MessageHandler, typed};

#[doc(inline)]
pub use processor::{
    DefaultProcessorHook, DispatchError, DispatchErrorKind, InMemoryQueue, ProcessorHook,
    ProcessorRunError, ProcessorRunErrorKind, ProcessorState, QueueClient, QueueProcessor,
    RawMessage,
    exception::{CompositeExceptionHandler, Disposition, ExceptionHandler, Failure},
};

#[doc(inline)]
pub use transport::{
    SendRequest, Sender, SenderExt, Transport, TransportError, TransportErrorKind,
    no_cancellation,
};
