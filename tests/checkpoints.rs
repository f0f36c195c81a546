//! Checkpoint lineage: history, monotonicity, time travel, isolation.

mod common;

use std::sync::Arc;

use serde_json::json;
use stepgraph::checkpoint::{CheckpointSaver, InMemorySaver, ListOptions};
use stepgraph::graphs::GraphBuilder;
use stepgraph::runtimes::RuntimeConfig;
use stepgraph::App;

use common::*;

fn accumulator_app(saver: Arc<InMemorySaver>) -> App {
    GraphBuilder::new(accumulator_schema())
        .add_node("add", Accumulate { fail_on: None })
        .set_entry("add")
        .add_terminal_edge("add")
        .with_saver(saver)
        .compile()
        .unwrap()
}

#[tokio::test]
async fn history_is_newest_first_with_monotonic_steps() {
    let saver = Arc::new(InMemorySaver::new());
    let app = accumulator_app(Arc::clone(&saver));
    let config = RuntimeConfig::new().with_thread_id("t1");

    app.invoke(json!(2), config.clone()).await.unwrap();
    app.invoke(json!(3), config.clone()).await.unwrap();

    let history = app
        .get_state_history(&config, ListOptions::default())
        .await
        .unwrap();
    assert!(history.len() >= 4, "two invocations leave input+loop pairs");

    // Newest first, steps strictly decreasing by one, ids time-ordered.
    for pair in history.windows(2) {
        assert_eq!(pair[0].metadata.step, pair[1].metadata.step + 1);
        assert!(pair[0].config.checkpoint_id > pair[1].config.checkpoint_id);
    }
    // Each checkpoint links to its parent.
    assert_eq!(
        history[0].parent_config.as_ref().unwrap().checkpoint_id,
        history[1].config.checkpoint_id
    );
}

#[tokio::test]
async fn max_channel_version_never_decreases() {
    let saver = Arc::new(InMemorySaver::new());
    let app = accumulator_app(Arc::clone(&saver));
    let config = RuntimeConfig::new().with_thread_id("t1");
    app.invoke(json!(1), config.clone()).await.unwrap();
    app.invoke(json!(2), config.clone()).await.unwrap();

    let history = app
        .get_state_history(&config, ListOptions::default())
        .await
        .unwrap();
    let mut maxima: Vec<_> = Vec::new();
    for view in history.iter().rev() {
        let tuple = saver
            .get_tuple(&view.config)
            .await
            .unwrap()
            .expect("checkpoint exists");
        maxima.push(tuple.checkpoint.max_channel_version().cloned());
    }
    for pair in maxima.windows(2) {
        assert!(pair[1] >= pair[0], "versions must not regress: {maxima:?}");
    }
}

#[tokio::test]
async fn time_travel_forks_from_pinned_checkpoint() {
    let saver = Arc::new(InMemorySaver::new());
    let app = accumulator_app(Arc::clone(&saver));
    let config = RuntimeConfig::new().with_thread_id("t1");

    app.invoke(json!(2), config.clone()).await.unwrap();
    let after_first = app.get_state(&config).await.unwrap().unwrap();
    app.invoke(json!(3), config.clone()).await.unwrap();

    // Re-run from the checkpoint taken after the first invocation.
    let pinned = config
        .clone()
        .with_checkpoint_id(after_first.config.checkpoint_id.unwrap());
    let out = app.invoke(json!(10), pinned).await.unwrap();
    assert_eq!(
        out.values().unwrap()["total"],
        json!(12),
        "fork resumes from total=2, not total=5"
    );
}

#[tokio::test]
async fn update_state_writes_as_node() {
    let saver = Arc::new(InMemorySaver::new());
    let app = accumulator_app(Arc::clone(&saver));
    let config = RuntimeConfig::new().with_thread_id("t1");

    app.invoke(json!(2), config.clone()).await.unwrap();
    let stored = app
        .update_state(&config, vec![("total".to_string(), json!(100))], None)
        .await
        .unwrap();
    assert!(stored.checkpoint_id.is_some());

    let state = app.get_state(&config).await.unwrap().unwrap();
    assert_eq!(state.values["total"], json!(102), "aggregate folds the patch");

    let out = app.invoke(json!(1), config).await.unwrap();
    assert_eq!(out.values().unwrap()["total"], json!(103));
}

#[tokio::test]
async fn bulk_update_applies_supersteps_in_order() {
    let saver = Arc::new(InMemorySaver::new());
    let app = accumulator_app(Arc::clone(&saver));
    let config = RuntimeConfig::new().with_thread_id("t1");

    app.invoke(json!(1), config.clone()).await.unwrap();
    app.bulk_update_state(
        &config,
        vec![
            vec![(None, vec![("total".to_string(), json!(10))])],
            vec![(None, vec![("total".to_string(), json!(20))])],
        ],
    )
    .await
    .unwrap();

    let state = app.get_state(&config).await.unwrap().unwrap();
    assert_eq!(state.values["total"], json!(31));
}

#[tokio::test]
async fn threads_do_not_share_state() {
    let saver = Arc::new(InMemorySaver::new());
    let app = accumulator_app(Arc::clone(&saver));

    let (a, b) = tokio::join!(
        app.invoke(json!(2), RuntimeConfig::new().with_thread_id("a")),
        app.invoke(json!(7), RuntimeConfig::new().with_thread_id("b")),
    );
    assert_eq!(a.unwrap().values().unwrap()["total"], json!(2));
    assert_eq!(b.unwrap().values().unwrap()["total"], json!(7));
}

#[tokio::test]
async fn metadata_filter_narrows_history() {
    let saver = Arc::new(InMemorySaver::new());
    let app = accumulator_app(Arc::clone(&saver));
    let config = RuntimeConfig::new().with_thread_id("t1");
    app.invoke(json!(1), config.clone()).await.unwrap();

    let inputs = app
        .get_state_history(
            &config,
            ListOptions {
                filter: Some(json!({"source": "input"})),
                ..ListOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(!inputs.is_empty());
    assert!(inputs
        .iter()
        .all(|v| matches!(
            v.metadata.source,
            stepgraph::checkpoint::CheckpointSource::Input
        )));
}
