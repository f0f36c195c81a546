//! Resumable event log with blocking reads.
//!
//! The hub is an append-only log with a monotonic index, not a
//! callback-style emitter: producers append, consumers poll a cursor and
//! park on a [`Notify`] when they catch up. This makes streams resumable —
//! a consumer that reconnects with its last seen id receives exactly the
//! suffix — and keeps slow consumers from blocking the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::timeout;

use super::event::{StreamEvent, StreamMode, StreamPayload};
use super::sink::EventSink;

/// Error returned when emitting into a closed hub.
#[derive(Debug, Error)]
#[error("stream hub closed")]
pub struct StreamClosed;

#[derive(Default)]
struct HubState {
    events: Vec<StreamEvent>,
    sinks: Vec<Box<dyn EventSink>>,
}

/// Shared event log for one runner.
pub struct StreamHub {
    state: Mutex<HubState>,
    notify: Notify,
    closed: AtomicBool,
}

impl StreamHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Append an event, assigning the next monotonic id.
    pub fn emit(&self, payload: StreamPayload) -> Result<u64, StreamClosed> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamClosed);
        }
        let id;
        {
            let mut state = self.state.lock();
            id = state.events.len() as u64 + 1;
            let event = StreamEvent { id, payload };
            for sink in &mut state.sinks {
                if let Err(err) = sink.handle(&event) {
                    tracing::warn!(target: "stepgraph::stream", %err, "event sink failed");
                }
            }
            state.events.push(event);
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Attach a sink that observes every subsequent event.
    pub fn add_sink(&self, sink: Box<dyn EventSink>) {
        self.state.lock().sinks.push(sink);
    }

    /// Mark the log complete; readers drain the remainder and then stop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe from just after `last_event_id` (or the start), restricted
    /// to `modes` (empty = all modes).
    #[must_use]
    pub fn subscribe(
        self: &Arc<Self>,
        last_event_id: Option<u64>,
        modes: Vec<StreamMode>,
    ) -> EventStream {
        EventStream {
            hub: Arc::clone(self),
            cursor: last_event_id.unwrap_or(0),
            modes,
        }
    }

    /// A lightweight producer handle for nodes and the loop.
    #[must_use]
    pub fn sender(self: &Arc<Self>) -> StreamSender {
        StreamSender {
            hub: Arc::clone(self),
        }
    }

    fn next_after(&self, cursor: u64, modes: &[StreamMode]) -> Option<StreamEvent> {
        let state = self.state.lock();
        state
            .events
            .iter()
            .skip(cursor as usize)
            .find(|e| modes.is_empty() || modes.contains(&e.payload.mode()))
            .cloned()
    }
}

/// Cloneable emit handle handed to the loop and node contexts.
#[derive(Clone)]
pub struct StreamSender {
    hub: Arc<StreamHub>,
}

impl StreamSender {
    pub fn emit(&self, payload: StreamPayload) -> Result<u64, StreamClosed> {
        self.hub.emit(payload)
    }
}

impl std::fmt::Debug for StreamSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSender").finish()
    }
}

/// Consumer cursor over the hub's log.
pub struct EventStream {
    hub: Arc<StreamHub>,
    cursor: u64,
    modes: Vec<StreamMode>,
}

impl EventStream {
    /// Wait for the next matching event; `None` once the hub is closed and
    /// the log is drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.hub.next_after(self.cursor, &self.modes) {
                self.cursor = event.id;
                return Some(event);
            }
            // No matching event past the cursor: once the hub is closed,
            // none can arrive.
            if self.hub.is_closed() {
                return None;
            }
            // Register interest before re-checking to avoid a lost wakeup.
            let notified = self.hub.notify.notified();
            if let Some(event) = self.hub.next_after(self.cursor, &self.modes) {
                self.cursor = event.id;
                return Some(event);
            }
            if self.hub.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// As `recv`, bounded by `duration`; `None` on timeout or closure.
    pub async fn recv_timeout(&mut self, duration: Duration) -> Option<StreamEvent> {
        timeout(duration, self.recv()).await.ok().flatten()
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        let event = self.hub.next_after(self.cursor, &self.modes)?;
        self.cursor = event.id;
        Some(event)
    }

    /// The id of the last event delivered; feed back into
    /// [`StreamHub::subscribe`] to resume.
    #[must_use]
    pub fn last_event_id(&self) -> u64 {
        self.cursor
    }

    /// Drain everything currently in the log without waiting.
    pub fn drain(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.try_recv() {
            out.push(event);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn custom(n: &str) -> StreamPayload {
        StreamPayload::Custom {
            node: n.to_string(),
            payload: json!(null),
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_resumable() {
        let hub = StreamHub::new();
        hub.emit(custom("a")).unwrap();
        hub.emit(custom("b")).unwrap();
        hub.emit(custom("c")).unwrap();

        let mut stream = hub.subscribe(Some(1), vec![]);
        let e2 = stream.recv().await.unwrap();
        assert_eq!(e2.id, 2);
        let e3 = stream.recv().await.unwrap();
        assert_eq!(e3.id, 3);
        assert_eq!(stream.last_event_id(), 3);
    }

    #[tokio::test]
    async fn recv_waits_for_producer() {
        let hub = StreamHub::new();
        let mut stream = hub.subscribe(None, vec![]);
        let producer = Arc::clone(&hub);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.emit(custom("late")).unwrap();
            producer.close();
        });
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn mode_filter_skips_other_modes() {
        let hub = StreamHub::new();
        hub.emit(custom("a")).unwrap();
        hub.emit(StreamPayload::Debug {
            step: 0,
            event: "noise".into(),
            payload: json!(null),
        })
        .unwrap();
        hub.emit(custom("b")).unwrap();
        hub.close();

        let mut stream = hub.subscribe(None, vec![StreamMode::Custom]);
        let mut seen = Vec::new();
        while let Some(e) = stream.recv().await {
            seen.push(e.id);
        }
        assert_eq!(seen, vec![1, 3]);
    }

    #[tokio::test]
    async fn recv_timeout_expires() {
        let hub = StreamHub::new();
        let mut stream = hub.subscribe(None, vec![]);
        let got = stream.recv_timeout(Duration::from_millis(5)).await;
        assert!(got.is_none());
    }

    #[test]
    fn emit_after_close_fails() {
        let hub = StreamHub::new();
        hub.close();
        assert!(hub.emit(custom("x")).is_err());
    }
}
