use std::{marker::PhantomData, sync::Arc};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{Envelope, transport::Sender};

/// In-memory message bus for testing or local pipelines.
///
/// Every envelope "sent" is appended to a queue shared by all clones, so a
/// test can keep one clone and inspect what the code under test sent through
/// another.
///
/// ## Type Parameters
///
/// - `H`: type of the message headers
/// - `M`: type of the message payload
pub struct InMemory<H, M> {
    sent: Arc<Mutex<Vec<Envelope<H, M>>>>,
    _marker: PhantomData<fn() -> (H, M)>,
}

impl<H, M> InMemory<H, M> {
    /// Return all envelopes sent so far and clear the queue.
    pub async fn sent_messages(&self) -> Vec<Envelope<H, M>> {
        let mut sent = self.sent.lock().await;
        std::mem::take(&mut *sent)
    }
}

impl<H, M> Clone for InMemory<H, M> {
    fn clone(&self) -> Self {
        Self {
            sent: Arc::clone(&self.sent),
            _marker: PhantomData,
        }
    }
}

impl<H, M> Default for InMemory<H, M> {
    fn default() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<H, M> Sender<H, M> for InMemory<H, M>
where
    H: std::fmt::Debug + Send + 'static,
    M: std::fmt::Debug + Send + 'static,
{
    type Error = std::io::Error;

    /// "Send" a message by appending it to the in-memory queue.
    #[tracing::instrument(skip_all)]
    async fn send(
        &mut self,
        envelope: Envelope<H, M>,
        cancel: CancellationToken,
    ) -> Result<(), Self::Error> {
        self.send_batch(vec![envelope], cancel).await
    }

    #[tracing::instrument(skip_all)]
    async fn send_batch(
        &mut self,
        envelopes: Vec<Envelope<H, M>>,
        cancel: CancellationToken,
    ) -> Result<(), Self::Error> {
        if cancel.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "send cancelled",
            ));
        }

        let mut sent = self.sent.lock().await;
        for envelope in envelopes {
            tracing::info!(
                headers = ?envelope.headers(),
                msg = ?envelope.message(),
                "Message sent to in-memory queue",
            );
            sent.push(envelope);
        }
        Ok(())
    }
}
