//! Stream multiplexing and resumability.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use stepgraph::graphs::GraphBuilder;
use stepgraph::node::{Node, NodeContext, NodeError, NodeOutput};
use stepgraph::runtimes::RuntimeConfig;
use stepgraph::stream::{StreamMode, StreamPayload};
use stepgraph::App;

use common::*;

fn increment_app() -> App {
    GraphBuilder::new(io_schema())
        .add_node(
            "one",
            Increment {
                from: "input",
                to: "output",
            },
        )
        .set_entry("one")
        .add_terminal_edge("one")
        .compile()
        .unwrap()
}

#[tokio::test]
async fn updates_mode_yields_one_event_per_step() {
    let app = increment_app();
    let (mut stream, handle) =
        app.stream(json!(2), RuntimeConfig::new(), vec![StreamMode::Updates]);

    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    handle.await.unwrap().unwrap();

    assert_eq!(events.len(), 1);
    match &events[0].payload {
        StreamPayload::Updates { updates, .. } => {
            assert_eq!(updates.len(), 1);
            assert_eq!(
                updates["one"],
                vec![("output".to_string(), json!(3))]
            );
        }
        other => panic!("expected updates payload, got {other:?}"),
    }
}

#[tokio::test]
async fn values_mode_reports_aggregated_state() {
    let app = increment_app();
    let (mut stream, handle) =
        app.stream(json!(2), RuntimeConfig::new(), vec![StreamMode::Values]);

    let mut last = None;
    while let Some(event) = stream.recv().await {
        last = Some(event);
    }
    handle.await.unwrap().unwrap();

    match last.expect("at least one values event").payload {
        StreamPayload::Values { values, .. } => {
            assert_eq!(values["input"], json!(2));
            assert_eq!(values["output"], json!(3));
        }
        other => panic!("expected values payload, got {other:?}"),
    }
}

/// Emits a custom payload mid-run.
struct Progress;

#[async_trait]
impl Node for Progress {
    async fn run(&self, _input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        ctx.write_custom(json!({"progress": 0.5}));
        ctx.emit_message(json!({"role": "assistant", "content": "working"}));
        Ok(NodeOutput::write("output", json!("done")))
    }
}

#[tokio::test]
async fn custom_and_message_events_interleave_with_execution() {
    let app = GraphBuilder::new(io_schema())
        .add_node("progress", Progress)
        .set_entry("progress")
        .add_terminal_edge("progress")
        .compile()
        .unwrap();

    let (mut stream, handle) = app.stream(
        json!("go"),
        RuntimeConfig::new(),
        vec![StreamMode::Custom, StreamMode::Messages, StreamMode::Updates],
    );

    let mut modes = Vec::new();
    while let Some(event) = stream.recv().await {
        modes.push(event.payload.mode());
    }
    handle.await.unwrap().unwrap();

    assert!(modes.contains(&StreamMode::Custom));
    assert!(modes.contains(&StreamMode::Messages));
    // updates land after the in-step emissions of the same superstep
    assert_eq!(*modes.last().unwrap(), StreamMode::Updates);
}

#[tokio::test]
async fn reconnecting_consumer_receives_suffix() {
    let app = increment_app();
    let config = RuntimeConfig::new()
        .with_stream_modes(vec![StreamMode::Updates, StreamMode::Values]);
    let runner =
        stepgraph::runtimes::AppRunner::new(Arc::new(app), config);
    let hub = runner.stream_hub();

    let mut first = hub.subscribe(None, vec![]);
    runner
        .run(stepgraph::runtimes::GraphInput::Start(json!(2)))
        .await
        .unwrap();

    // Read one event, drop the consumer, reconnect with its cursor.
    let seen = first.recv().await.expect("first event");
    let cursor = seen.id;
    drop(first);

    let mut reconnected = hub.subscribe(Some(cursor), vec![]);
    let mut rest = Vec::new();
    while let Some(event) = reconnected.recv().await {
        rest.push(event.id);
    }
    assert!(!rest.is_empty());
    assert!(rest.iter().all(|id| *id > cursor));
}
