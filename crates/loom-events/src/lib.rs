mod log;
mod store;

pub use log::{EventLog, EventLogIter, parse_record_name, record_name};
pub use store::{FileRecordStore, InMemoryRecordStore, RecordStore};

use loom_protocol::Event;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Broadcast fan-out of events to live subscribers (WebSocket clients).
#[derive(Clone, Debug)]
pub struct EventStreamHub {
    sender: broadcast::Sender<Event>,
}

impl EventStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
