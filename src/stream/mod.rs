//! Streaming: multiplexed, resumable event delivery.
//!
//! The engine emits a stream of mode-tagged events per step. `values` and
//! `updates` are emitted strictly after a step's writes commit;
//! `messages` and `custom` interleave with execution as nodes produce them.
//! Consumers subscribe to one or several modes and can resume after a
//! disconnect by passing the last event id they observed.

pub mod event;
pub mod hub;
pub mod sink;

pub use event::{StreamEvent, StreamMode, StreamPayload};
pub use hub::{EventStream, StreamClosed, StreamHub, StreamSender};
pub use sink::{ChannelSink, EventSink, MemorySink, SinkError};
