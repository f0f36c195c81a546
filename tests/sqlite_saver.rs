//! Durable checkpointing through the SQLite saver.

#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;

use serde_json::json;
use stepgraph::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    ListOptions, PendingWrite, SqliteSaver,
};
use stepgraph::graphs::GraphBuilder;
use stepgraph::runtimes::RuntimeConfig;
use uuid::Uuid;

use common::*;

async fn temp_saver() -> (tempfile::TempDir, Arc<SqliteSaver>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("graph.db").display()
    );
    let saver = SqliteSaver::connect(&url).await.expect("connect");
    (dir, Arc::new(saver))
}

#[tokio::test]
async fn put_get_roundtrip() {
    let (_dir, saver) = temp_saver().await;
    let config = CheckpointConfig::new("t1");

    let mut checkpoint = Checkpoint::empty();
    checkpoint
        .channel_versions
        .insert("c".into(), stepgraph::types::ChannelVersion::Int(3));
    let id = checkpoint.id;

    let stored = saver
        .put(
            &config,
            checkpoint,
            CheckpointMetadata::new(CheckpointSource::Input, -1),
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(stored.checkpoint_id, Some(id));

    let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
    assert_eq!(tuple.checkpoint.id, id);
    assert_eq!(
        tuple.checkpoint.channel_versions["c"],
        stepgraph::types::ChannelVersion::Int(3)
    );
}

#[tokio::test]
async fn writes_survive_and_deduplicate() {
    let (_dir, saver) = temp_saver().await;
    let config = CheckpointConfig::new("t1");
    let stored = saver
        .put(
            &config,
            Checkpoint::empty(),
            CheckpointMetadata::new(CheckpointSource::Input, -1),
            Default::default(),
        )
        .await
        .unwrap();

    let task = Uuid::new_v4();
    let write = PendingWrite {
        task_id: task,
        channel: "out".to_string(),
        value: json!([1, 2, 3]),
        idx: 0,
    };
    saver
        .put_writes(&stored, vec![write.clone()], task)
        .await
        .unwrap();
    // at-least-once delivery: the duplicate row is ignored
    saver.put_writes(&stored, vec![write], task).await.unwrap();

    let tuple = saver.get_tuple(&stored).await.unwrap().unwrap();
    assert_eq!(tuple.pending_writes.len(), 1);
    assert_eq!(tuple.pending_writes[0].value, json!([1, 2, 3]));
}

#[tokio::test]
async fn list_is_newest_first_and_filters() {
    let (_dir, saver) = temp_saver().await;
    let config = CheckpointConfig::new("t1");
    let mut head = config.clone();
    for step in 0..3 {
        head = saver
            .put(
                &head,
                Checkpoint::empty(),
                CheckpointMetadata::new(CheckpointSource::Loop, step),
                Default::default(),
            )
            .await
            .unwrap();
    }

    let all = saver.list(&config, &ListOptions::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].metadata.step, 2);
    assert_eq!(
        all[1].parent_config.as_ref().unwrap().checkpoint_id,
        all[2].config.checkpoint_id
    );

    let filtered = saver
        .list(
            &config,
            &ListOptions {
                filter: Some(json!({"step": 1})),
                ..ListOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
}

#[tokio::test]
async fn thread_delete_and_copy() {
    let (_dir, saver) = temp_saver().await;
    let config = CheckpointConfig::new("src");
    saver
        .put(
            &config,
            Checkpoint::empty(),
            CheckpointMetadata::new(CheckpointSource::Input, -1),
            Default::default(),
        )
        .await
        .unwrap();

    saver.copy_thread("src", "dst").await.unwrap();
    assert!(saver
        .get_tuple(&CheckpointConfig::new("dst"))
        .await
        .unwrap()
        .is_some());

    saver.delete_thread("src").await.unwrap();
    assert!(saver.get_tuple(&config).await.unwrap().is_none());
    assert!(saver
        .get_tuple(&CheckpointConfig::new("dst"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn graph_resumes_from_sqlite_across_app_instances() {
    let (_dir, saver) = temp_saver().await;
    let build = |saver: Arc<SqliteSaver>| {
        GraphBuilder::new(accumulator_schema())
            .add_node("add", Accumulate { fail_on: None })
            .set_entry("add")
            .add_terminal_edge("add")
            .with_saver(saver)
            .compile()
            .unwrap()
    };

    let config = RuntimeConfig::new().with_thread_id("t1");
    let first = build(Arc::clone(&saver));
    let out = first.invoke(json!(2), config.clone()).await.unwrap();
    assert_eq!(out.values().unwrap()["total"], json!(2));
    drop(first);

    // A fresh app over the same database continues the thread.
    let second = build(saver);
    let out = second.invoke(json!(3), config).await.unwrap();
    assert_eq!(out.values().unwrap()["total"], json!(5));
}
