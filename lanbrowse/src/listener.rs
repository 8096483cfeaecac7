use tokio::sync::mpsc;
use shared::types::Event;

/// Event sink for a session. Called on the session's processing path, so it
/// must not block.
pub trait Listener: Send + Sync + 'static {
    fn on_event(&self, event: Event);
}

impl Listener for flume::Sender<Event> {
    fn on_event(&self, event: Event) {
        if let Err(e) = self.try_send(event) {
            tracing::warn!("Dropping event, listener unavailable: {}", e);
        }
    }
}

impl Listener for mpsc::UnboundedSender<Event> {
    fn on_event(&self, event: Event) {
        if self.send(event).is_err() {
            tracing::warn!("Dropping event, listener closed");
        }
    }
}
