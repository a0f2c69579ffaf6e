use std::io::{self, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use loom_protocol::{Event, EventKind};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

/// Observer notified once per event, in registration order.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Ordered list of callbacks. A panicking callback is logged and skipped so
/// the remaining callbacks still see the event.
#[derive(Default)]
pub struct CallbackChain {
    callbacks: RwLock<Vec<EventCallback>>,
}

impl CallbackChain {
    pub fn new(callbacks: Vec<EventCallback>) -> Self {
        Self {
            callbacks: RwLock::new(callbacks),
        }
    }

    pub fn push(&self, callback: EventCallback) {
        self.callbacks.write().push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        let callbacks = self.callbacks.read().clone();
        for (position, callback) in callbacks.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(
                    position,
                    event_id = %event.id,
                    kind = event.kind.name(),
                    "event callback panicked"
                );
            }
        }
    }
}

impl std::fmt::Debug for CallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackChain")
            .field("callbacks", &self.len())
            .finish()
    }
}

/// Writes one human-readable line per event. State pushes are skipped.
pub struct Visualizer {
    out: Mutex<Box<dyn Write + Send>>,
}

impl Visualizer {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn render(&self, event: &Event) {
        if matches!(event.kind, EventKind::StateUpdate(_)) {
            return;
        }
        let mut out = self.out.lock();
        if let Err(error) = writeln!(out, "{}", event.visualize()).and_then(|()| out.flush()) {
            debug!(%error, "visualizer write failed");
        }
    }

    pub fn into_callback(self) -> EventCallback {
        let visualizer = Arc::new(self);
        Arc::new(move |event: &Event| visualizer.render(event))
    }
}

impl std::fmt::Debug for Visualizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Visualizer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use loom_protocol::{ConversationStateUpdateEvent, Event};
    use parking_lot::Mutex;
    use serde_json::json;

    use super::{CallbackChain, EventCallback, Visualizer};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn panicking_callback_does_not_starve_later_ones() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first: EventCallback = Arc::new(|event: &Event| {
            if !event.id.as_str().is_empty() {
                panic!("callback failure");
            }
        });
        let sink = Arc::clone(&seen);
        let second: EventCallback = Arc::new(move |event: &Event| sink.lock().push(event.id.clone()));
        let chain = CallbackChain::new(vec![first, second]);

        let event = Event::user_message("hi");
        chain.dispatch(&event);
        assert_eq!(seen.lock().as_slice(), &[event.id]);
    }

    #[test]
    fn visualizer_skips_state_updates() {
        let buffer = SharedBuffer::default();
        let visualizer = Visualizer::new(buffer.clone());
        visualizer.render(&Event::user_message("hello there"));
        visualizer.render(&Event::state_update(ConversationStateUpdateEvent::field(
            "agent_status",
            json!("running"),
        )));

        let text = String::from_utf8_lossy(&buffer.0.lock()).into_owned();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("user: hello there"));
    }
}
