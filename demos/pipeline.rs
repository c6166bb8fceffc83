use std::{sync::Arc, time::Duration};

use postmaster::{
    CompositeMessageHandler, Envelope, ExceptionHandler, Handles, Headers, InMemoryQueue,
    MessageHandler, Payload, QueueProcessor, RawMessage, ReceivedEnvelope, SenderExt,
    handler::handler_fn,
    processor::exception::{CompositeExceptionHandler, LoggingExceptionHandler},
    serializer::JsonSerializer,
    transport::{InMemory, RawPayload, Transport, layers::SerializeLayer},
    typed,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Greeting {
    id: u32,
    text: String,
}

struct PrintGreeting;

#[async_trait::async_trait]
impl Handles<Greeting> for PrintGreeting {
    async fn handle(
        &self,
        envelope: &ReceivedEnvelope<Greeting>,
        _cancel: &CancellationToken,
    ) -> Result<(), tower::BoxError> {
        let greeting = envelope.message();
        tracing::info!(id = greeting.id, text = %greeting.text, "Greeting received");
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    // Every fifth greeting fails in the second handler; the first still sees it.
    let handlers = CompositeMessageHandler::new([
        Arc::new(typed(PrintGreeting)) as Arc<dyn MessageHandler>,
        Arc::new(handler_fn(|envelope: Envelope, _cancel| async move {
            match envelope.message().downcast_ref::<Greeting>() {
                Some(greeting) if greeting.id % 5 == 0 => {
                    Err(format!("greeting {} is unlucky", greeting.id).into())
                }
                _ => Ok(()),
            }
        })) as Arc<dyn MessageHandler>,
    ]);

    let processor = QueueProcessor::builder(handlers, JsonSerializer::<Greeting>::new())
        .exception_handler(CompositeExceptionHandler::new([
            Arc::new(LoggingExceptionHandler) as Arc<dyn ExceptionHandler>,
        ]))
        .build();

    let queue = InMemoryQueue::default();
    let processor_handle = tokio::spawn({
        let (processor, queue, cancel) = (processor.clone(), queue.clone(), cancel.clone());
        async move { processor.run(queue, cancel).await.unwrap() }
    });

    // Producer side: serialize greetings through a transport into memory, then
    // push the bodies to the queue as a broker would.
    let outbound = InMemory::<Headers, RawPayload>::default();
    let mut transport = Transport::new(outbound.clone())
        .layer(SerializeLayer::new(JsonSerializer::<Greeting>::new()));

    let cancel_producer = cancel.clone();
    let producer_handle = tokio::spawn(async move {
        let mut id = 0;
        while !cancel_producer.is_cancelled() {
            let greeting = Greeting {
                id,
                text: "Hello".to_owned(),
            };
            let headers = Headers::new().with_message_id(id.to_string());
            transport
                .send_uncancellable(Envelope::new(headers, Payload::new(greeting)))
                .await
                .expect("Failed to send greeting");

            for envelope in outbound.sent_messages().await {
                let (headers, body) = envelope.into_parts();
                let mut message = RawMessage::new(body.into_string());
                if let Some(id) = headers.message_id() {
                    message = message.with_message_id(id);
                }
                if let Err(error) = queue.deliver(message).await {
                    tracing::warn!(%error, "Queue did not acknowledge the message");
                }
            }

            id += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    tokio::try_join!(cancel_handle, processor_handle, producer_handle).unwrap();
}
