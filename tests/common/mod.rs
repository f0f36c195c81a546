#![allow(dead_code)]

pub mod nodes;

pub use nodes::*;

use stepgraph::channels::{sum_aggregate, Channel};
use stepgraph::graphs::StateSchema;

/// `{input, output}` — the minimal two-slot state.
pub fn io_schema() -> StateSchema {
    StateSchema::new()
        .field("input", Channel::last_value())
        .field("output", Channel::last_value())
}

/// `{input, inbox, output}` — a two-stage pipeline state.
pub fn pipeline_schema() -> StateSchema {
    io_schema().field("inbox", Channel::last_value())
}

/// `{input, total, output}` — checkpointed accumulator state.
pub fn accumulator_schema() -> StateSchema {
    StateSchema::new()
        .field("input", Channel::last_value())
        .field("total", sum_aggregate())
        .field("output", Channel::last_value())
}

/// `{input, log}` — an append-only trace of node activity.
pub fn log_schema() -> StateSchema {
    StateSchema::new()
        .field("input", Channel::last_value())
        .field("log", Channel::topic(false, true))
}
