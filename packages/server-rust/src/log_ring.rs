//! Bounded in-memory log ring backing the `getlog`/`clearlog` controls (spec
//! §4.10, §6.4 "setdebug"/"getvar"). A [`tracing_subscriber::Layer`] pushes
//! every formatted event into the ring; older lines fall off once capacity
//! is reached.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub struct LogRing {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { lines: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot of every retained line, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap().clear();
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// A [`tracing_subscriber::Layer`] that mirrors every event into a
/// [`LogRing`], independent of whatever formatting layer also renders logs
/// to stdout/JSON.
pub struct LogRingLayer {
    ring: std::sync::Arc<LogRing>,
}

impl LogRingLayer {
    #[must_use]
    pub fn new(ring: std::sync::Arc<LogRing>) -> Self {
        Self { ring }
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        } else if !self.0.is_empty() {
            self.0.push_str(&format!(" {}={value:?}", field.name()));
        }
    }
}

impl<S> Layer<S> for LogRingLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        let line = format!("{} {}: {}", event.metadata().level(), event.metadata().target(), visitor.0);
        self.ring.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_beyond_capacity_drops_oldest() {
        let ring = LogRing::new(2);
        ring.push("a".into());
        ring.push("b".into());
        ring.push("c".into());
        assert_eq!(ring.snapshot(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn clear_empties_the_ring() {
        let ring = LogRing::new(4);
        ring.push("a".into());
        ring.clear();
        assert!(ring.snapshot().is_empty());
    }

    #[test]
    fn layer_captures_tracing_events() {
        use tracing_subscriber::prelude::*;

        let ring = std::sync::Arc::new(LogRing::new(16));
        let subscriber = tracing_subscriber::registry().with(LogRingLayer::new(ring.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("hello from the ring");
        });
        let lines = ring.snapshot();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("hello from the ring"));
    }
}
