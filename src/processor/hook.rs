use crate::{
    Envelope,
    processor::{DispatchError, RawMessage},
};

/// Hook trait for observing queue processor lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical uses are logging and metrics. A hook only observes: it cannot
/// change the outcome of a dispatch.
pub trait ProcessorHook: Send + Sync {
    /// Called before the processor subscribes to its queue client.
    fn on_startup(&self);

    /// Called when the cancellation token fires, before the client is closed.
    fn on_shutdown(&self);

    /// Called once the processor reached its terminal state.
    fn on_closed(&self);

    /// Called when a dispatch cycle starts.
    fn on_message_received(&self, message: &RawMessage);

    /// Called when a message arrives while the processor is not active.
    fn on_message_rejected(&self, message: &RawMessage);

    /// Called after the handler succeeded.
    fn on_message_completed(&self, envelope: &Envelope);

    /// Called before a failure is handed to the exception handler.
    fn on_message_failed(&self, error: &DispatchError);

    /// Called when the exception handler suppressed a failure.
    fn on_failure_suppressed(&self, error: &DispatchError);
}

/// Default processor hook implementation.
///
/// Logs lifecycle events using `tracing`. Per-message outcomes, failures
/// included, are logged at `debug` only: reporting a failure is left to the
/// queue client and to whatever exception handlers were configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProcessorHook;

impl ProcessorHook for DefaultProcessorHook {
    fn on_startup(&self) {
        tracing::info!("Queue processor is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Queue processor is shutting down");
    }

    fn on_closed(&self) {
        tracing::info!("Queue processor closed");
    }

    fn on_message_received(&self, message: &RawMessage) {
        tracing::debug!(message_id = ?message.message_id, "Message received");
    }

    fn on_message_rejected(&self, message: &RawMessage) {
        tracing::debug!(
            message_id = ?message.message_id,
            "Message rejected, processor is not active",
        );
    }

    fn on_message_completed(&self, _envelope: &Envelope) {
        tracing::debug!("Message processed successfully");
    }

    fn on_message_failed(&self, error: &DispatchError) {
        tracing::debug!(%error, "Message processing failed");
    }

    fn on_failure_suppressed(&self, error: &DispatchError) {
        tracing::debug!(%error, "Message failure handled by exception handler");
    }
}
