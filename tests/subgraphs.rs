//! Nested graphs: namespace inheritance, result propagation, interrupts
//! through the boundary, and parent-addressed commands.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use stepgraph::checkpoint::{CheckpointSaver, InMemorySaver};
use stepgraph::control::Command;
use stepgraph::graphs::GraphBuilder;
use stepgraph::node::{Node, NodeContext, NodeError, NodeOutput};
use stepgraph::runtimes::{GraphOutput, RuntimeConfig};
use stepgraph::App;

use common::*;

fn child_app(saver: Arc<InMemorySaver>) -> App {
    GraphBuilder::new(io_schema())
        .add_node(
            "inner",
            Increment {
                from: "input",
                to: "output",
            },
        )
        .set_entry("inner")
        .add_terminal_edge("inner")
        .with_saver(saver)
        .compile()
        .unwrap()
}

#[tokio::test]
async fn subgraph_result_lands_in_parent_state() {
    let saver = Arc::new(InMemorySaver::new());
    let parent = GraphBuilder::new(io_schema())
        .add_node("child", child_app(Arc::clone(&saver)).into_node())
        .set_entry("child")
        .add_terminal_edge("child")
        .with_saver(Arc::clone(&saver) as Arc<dyn CheckpointSaver>)
        .compile()
        .unwrap();

    let out = parent
        .invoke(json!(2), RuntimeConfig::new().with_thread_id("t1"))
        .await
        .unwrap();
    assert_eq!(out.values().unwrap()["output"], json!(3));
}

/// Child node that asks for approval before writing.
struct NeedsApproval;

#[async_trait]
impl Node for NeedsApproval {
    async fn run(&self, _input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let answer = ctx.interrupt(json!("approve?"))?;
        Ok(NodeOutput::write("output", answer))
    }
}

#[tokio::test]
async fn interrupt_bubbles_through_subgraph_and_resumes() {
    let saver = Arc::new(InMemorySaver::new());
    let child = GraphBuilder::new(io_schema())
        .add_node("gate", NeedsApproval)
        .set_entry("gate")
        .add_terminal_edge("gate")
        .with_saver(Arc::clone(&saver) as Arc<dyn CheckpointSaver>)
        .compile()
        .unwrap();
    let parent = GraphBuilder::new(io_schema())
        .add_node("child", child.into_node())
        .set_entry("child")
        .add_terminal_edge("child")
        .with_saver(Arc::clone(&saver) as Arc<dyn CheckpointSaver>)
        .compile()
        .unwrap();

    let config = RuntimeConfig::new().with_thread_id("t1");
    let out = parent.invoke(json!("start"), config.clone()).await.unwrap();
    match out {
        GraphOutput::Interrupted(interrupts) => {
            assert_eq!(interrupts[0].value, json!("approve?"));
        }
        GraphOutput::Complete(_) => panic!("expected suspension from the child"),
    }

    let out = parent
        .invoke(Command::resume(json!("granted")), config)
        .await
        .unwrap();
    assert_eq!(out.values().unwrap()["output"], json!("granted"));
}

/// Child node that defers the decision to the enclosing graph.
struct Escalate;

#[async_trait]
impl Node for Escalate {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::Command(
            Command::new()
                .with_update("output", json!("escalated"))
                .with_parent_graph(),
        ))
    }
}

#[tokio::test]
async fn parent_command_is_caught_at_the_boundary() {
    let saver = Arc::new(InMemorySaver::new());
    let child = GraphBuilder::new(io_schema())
        .add_node("escalate", Escalate)
        .set_entry("escalate")
        .add_terminal_edge("escalate")
        .with_saver(Arc::clone(&saver) as Arc<dyn CheckpointSaver>)
        .compile()
        .unwrap();
    let parent = GraphBuilder::new(io_schema())
        .add_node("child", child.into_node())
        .set_entry("child")
        .add_terminal_edge("child")
        .with_saver(Arc::clone(&saver) as Arc<dyn CheckpointSaver>)
        .compile()
        .unwrap();

    let out = parent
        .invoke(json!("go"), RuntimeConfig::new().with_thread_id("t1"))
        .await
        .unwrap();
    assert_eq!(
        out.values().unwrap()["output"],
        json!("escalated"),
        "the parent applies the bubbled update"
    );
}
