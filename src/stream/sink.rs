//! Pluggable event sinks.
//!
//! Sinks observe every event appended to the hub, for bridging to external
//! transports (SSE, websockets, log files). Concrete transports are out of
//! scope; the crate ships the two sinks the tests and examples need.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

use super::event::StreamEvent;

/// Error from a sink's handling of an event.
#[derive(Debug, Error)]
#[error("sink error: {0}")]
pub struct SinkError(pub String);

/// Observer of the event log.
pub trait EventSink: Send {
    fn handle(&mut self, event: &StreamEvent) -> Result<(), SinkError>;
}

/// Forwards events into a flume channel, e.g. toward an SSE writer task.
pub struct ChannelSink {
    tx: flume::Sender<StreamEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: flume::Sender<StreamEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &StreamEvent) -> Result<(), SinkError> {
        self.tx
            .send(event.clone())
            .map_err(|e| SinkError(e.to_string()))
    }
}

/// Captures events in memory, for tests and diagnostics.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything captured so far.
    #[must_use]
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &StreamEvent) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
