//! Reusable node implementations for integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use stepgraph::control::{Command, SendPacket};
use stepgraph::node::{Node, NodeContext, NodeError, NodeOutput};

/// Reads an integer out of `from` and writes `from + 1` to `to`.
pub struct Increment {
    pub from: &'static str,
    pub to: &'static str,
}

#[async_trait]
impl Node for Increment {
    async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let n = input[self.from]
            .as_i64()
            .ok_or(NodeError::MissingInput { what: self.from })?;
        Ok(NodeOutput::write(self.to, json!(n + 1)))
    }
}

/// Appends a fixed entry to the `log` topic.
pub struct AppendLog(pub &'static str);

#[async_trait]
impl Node for AppendLog {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::write("log", json!(self.0)))
    }
}

/// Adds `input` to the running `total` and reports the new total on
/// `output`. Fails fast when asked to add the poison value.
pub struct Accumulate {
    pub fail_on: Option<i64>,
}

#[async_trait]
impl Node for Accumulate {
    async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let n = input["input"]
            .as_i64()
            .ok_or(NodeError::MissingInput { what: "input" })?;
        if self.fail_on == Some(n) {
            return Err(NodeError::ValidationFailed(format!("poison input {n}")));
        }
        let total = input["total"].as_i64().unwrap_or(0);
        Ok(NodeOutput::updates(vec![
            ("total".to_string(), json!(n)),
            ("output".to_string(), json!(total + n)),
        ]))
    }
}

/// Logs its marker and fans out two sends to `target`.
pub struct FanOutTwice {
    pub marker: &'static str,
    pub target: &'static str,
}

#[async_trait]
impl Node for FanOutTwice {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::Command(
            Command::new()
                .with_update("log", json!(self.marker))
                .with_goto(SendPacket::new(self.target, json!("first")))
                .with_goto(SendPacket::new(self.target, json!("second"))),
        ))
    }
}

/// Suspends with a fixed prompt and writes the answer to `output`.
pub struct AskHuman {
    pub prompt: &'static str,
}

#[async_trait]
impl Node for AskHuman {
    async fn run(&self, _input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let answer = ctx.interrupt(json!(self.prompt))?;
        Ok(NodeOutput::write("output", answer))
    }
}

/// Counts executions and logs its marker; used to assert that completed
/// tasks are not re-run across a resume.
pub struct CountedLog {
    pub marker: &'static str,
    pub counter: Arc<AtomicUsize>,
}

#[async_trait]
impl Node for CountedLog {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(NodeOutput::write("log", json!(self.marker)))
    }
}

/// Fails a configured number of times, then succeeds.
pub struct Flaky {
    pub remaining_failures: Arc<AtomicUsize>,
}

#[async_trait]
impl Node for Flaky {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let before = self.remaining_failures.load(Ordering::SeqCst);
        if before > 0 {
            self.remaining_failures.store(before - 1, Ordering::SeqCst);
            return Err(NodeError::Other("transient failure".to_string()));
        }
        Ok(NodeOutput::write("output", json!("recovered")))
    }
}

/// Doubles the argument it was called with; for dynamic-call tests.
pub struct Doubler;

#[async_trait]
impl Node for Doubler {
    async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let n = input.as_i64().ok_or(NodeError::MissingInput { what: "arg" })?;
        Ok(NodeOutput::return_value(json!(n * 2)))
    }
}

/// Awaits two dynamic children and sums their results.
pub struct CallsDoubler;

#[async_trait]
impl Node for CallsDoubler {
    async fn run(&self, _input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let a = ctx.call("doubler", json!(2)).await?;
        let b = ctx.call("doubler", json!(3)).await?;
        let sum = a.as_i64().unwrap_or(0) + b.as_i64().unwrap_or(0);
        Ok(NodeOutput::write("output", json!(sum)))
    }
}

/// Writes the configured channel unconditionally; for multi-writer tests.
pub struct WriteConst {
    pub channel: &'static str,
    pub value: i64,
}

#[async_trait]
impl Node for WriteConst {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::write(self.channel, json!(self.value)))
    }
}
