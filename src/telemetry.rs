//! Tracing setup and event rendering helpers.

use std::sync::Once;

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::stream::{StreamEvent, StreamPayload};

static INIT: Once = Once::new();

/// Install the crate's default tracing subscriber: env-filtered fmt output
/// plus span-trace capture for diagnostic reports. Safe to call more than
/// once; later calls are no-ops.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("stepgraph=info"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(ErrorLayer::default())
            .try_init();
    });
}

/// One-line human rendering of a stream event, for log sinks and CLIs.
#[must_use]
pub fn render_event(event: &StreamEvent) -> String {
    match &event.payload {
        StreamPayload::Values { step, values } => {
            format!("#{} [values step={step}] {} fields", event.id, values.len())
        }
        StreamPayload::Updates { step, updates } => {
            let nodes: Vec<&str> = updates.keys().map(String::as_str).collect();
            format!("#{} [updates step={step}] {nodes:?}", event.id)
        }
        StreamPayload::Messages { node, message } => {
            format!("#{} [messages {node}] {message}", event.id)
        }
        StreamPayload::Debug {
            step,
            event: name,
            ..
        } => format!("#{} [debug step={step}] {name}", event.id),
        StreamPayload::Custom { node, payload } => {
            format!("#{} [custom {node}] {payload}", event.id)
        }
    }
}
