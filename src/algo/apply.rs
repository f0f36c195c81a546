//! Deterministic write commit.
//!
//! `apply_writes` is the only place channels are mutated. It runs on the
//! single loop fiber after the superstep's tasks settle, applying task
//! writes in a canonical order so the same inputs always produce the same
//! channel states and version bumps.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::channels::{Channel, ChannelError};
use crate::checkpoint::Checkpoint;
use crate::control::SendPacket;
use crate::types::{is_reserved, NextVersion, TASKS};

use super::prepare::TaskPath;

/// One settled task as the commit consumes it.
#[derive(Clone, Debug)]
pub struct CommittedTask {
    pub name: String,
    pub path: TaskPath,
    pub triggers: Vec<String>,
    pub writes: Vec<(String, Value)>,
}

/// What a commit produced.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// Channels whose version advanced this step.
    pub updated_channels: FxHashSet<String>,
    /// Sends queued by this step's writes, FIFO.
    pub new_sends: Vec<SendPacket>,
}

/// Apply the writes of one superstep.
///
/// The procedure, in order: sort tasks by path; record version witnesses in
/// `versions_seen`; consume trigger channels; group and apply writes per
/// channel (queuing `TASKS` writes as sends); notify still-available
/// channels of the step boundary; and, when nothing further can fire,
/// release the after-finish channels.
pub fn apply_writes(
    checkpoint: &mut Checkpoint,
    channels: &mut FxHashMap<String, Channel>,
    tasks: &[CommittedTask],
    next_version: &NextVersion,
    trigger_to_nodes: &FxHashMap<String, Vec<String>>,
) -> Result<CommitOutcome, ChannelError> {
    let mut tasks: Vec<&CommittedTask> = tasks.iter().collect();
    tasks.sort_by(|a, b| a.path.cmp(&b.path));

    // Version witness: each task observed its triggers at their pre-commit
    // versions.
    for task in &tasks {
        for trigger in &task.triggers {
            if let Some(version) = checkpoint.channel_versions.get(trigger).cloned() {
                checkpoint
                    .seen_mut(&task.name)
                    .insert(trigger.clone(), version);
            }
        }
    }

    // All bumps within one commit share a single new version.
    let new_version = next_version(checkpoint.max_channel_version());

    let mut outcome = CommitOutcome::default();

    // Consume the trigger channels the tasks fired on.
    let mut consumed: Vec<&String> = tasks
        .iter()
        .flat_map(|t| t.triggers.iter())
        .filter(|c| !is_reserved(c))
        .collect();
    consumed.sort();
    consumed.dedup();
    for name in consumed {
        if let Some(channel) = channels.get_mut(name) {
            if channel.is_available() && channel.consume() {
                checkpoint
                    .channel_versions
                    .insert(name.clone(), new_version.clone());
            }
        }
    }

    // Group writes by channel, preserving task order within each group.
    let mut grouped: Vec<(String, Vec<Value>)> = Vec::new();
    for task in &tasks {
        for (channel, value) in &task.writes {
            if channel == TASKS {
                match serde_json::from_value::<SendPacket>(value.clone()) {
                    Ok(send) => outcome.new_sends.push(send),
                    Err(err) => {
                        tracing::warn!(
                            target: "stepgraph::algo",
                            node = %task.name,
                            %err,
                            "discarding malformed send packet"
                        );
                    }
                }
                continue;
            }
            if is_reserved(channel) {
                continue;
            }
            match grouped.iter_mut().find(|(name, _)| name == channel) {
                Some((_, values)) => values.push(value.clone()),
                None => grouped.push((channel.clone(), vec![value.clone()])),
            }
        }
    }

    for (name, values) in grouped {
        let Some(channel) = channels.get_mut(&name) else {
            tracing::warn!(
                target: "stepgraph::algo",
                channel = %name,
                "skipping write to channel with no readers"
            );
            continue;
        };
        if channel.update(&name, values)? && channel.is_tracked() {
            checkpoint
                .channel_versions
                .insert(name.clone(), new_version.clone());
            outcome.updated_channels.insert(name);
        }
    }

    // Step boundary: notify one-shot channels that a new step happened.
    let bump_step = tasks.iter().any(|t| !t.triggers.is_empty());
    if bump_step {
        let mut names: Vec<String> = channels.keys().cloned().collect();
        names.sort();
        for name in names {
            if outcome.updated_channels.contains(&name) {
                continue;
            }
            let channel = channels
                .get_mut(&name)
                .ok_or_else(|| ChannelError::empty(&name))?;
            if channel.is_available() && channel.update(&name, Vec::new())? && channel.is_tracked()
            {
                checkpoint
                    .channel_versions
                    .insert(name.clone(), new_version.clone());
            }
        }
    }

    // If nothing updated can fire another task and no sends are queued, the
    // superstep tree is finished: release the after-finish channels.
    let will_fire = outcome
        .updated_channels
        .iter()
        .any(|c| trigger_to_nodes.contains_key(c));
    if !will_fire && outcome.new_sends.is_empty() {
        let mut names: Vec<String> = channels.keys().cloned().collect();
        names.sort();
        for name in names {
            let channel = channels
                .get_mut(&name)
                .ok_or_else(|| ChannelError::empty(&name))?;
            if channel.finish() && channel.is_tracked() {
                checkpoint
                    .channel_versions
                    .insert(name.clone(), new_version.clone());
                outcome.updated_channels.insert(name);
            }
        }
    }

    Ok(outcome)
}
