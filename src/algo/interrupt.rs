//! Static interrupt gating.

use crate::checkpoint::Checkpoint;
use crate::types::INTERRUPT;

use super::prepare::Task;

/// Which nodes an `interrupt_before` / `interrupt_after` setting matches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InterruptNodes {
    /// Never suspend.
    #[default]
    Never,
    /// Suspend on any non-hidden node.
    All,
    /// Suspend on these nodes only.
    Names(Vec<String>),
}

impl InterruptNodes {
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            InterruptNodes::Never => false,
            InterruptNodes::All => !task.hidden,
            InterruptNodes::Names(names) => names.iter().any(|n| n == &task.name),
        }
    }
}

/// Decide whether the loop should suspend at this boundary.
///
/// True iff some channel has advanced past the versions recorded under the
/// interrupt sentinel AND some prepared task matches the configured node
/// set. After reporting, the loop writes the current versions into the
/// sentinel entry so a resume does not re-fire on the same state.
#[must_use]
pub fn should_interrupt(
    checkpoint: &Checkpoint,
    interrupt_nodes: &InterruptNodes,
    tasks: &[Task],
) -> bool {
    if *interrupt_nodes == InterruptNodes::Never {
        return false;
    }
    let seen = checkpoint.versions_seen.get(INTERRUPT);
    let any_newer = checkpoint
        .channel_versions
        .iter()
        .any(|(channel, version)| match seen.and_then(|s| s.get(channel)) {
            Some(observed) => version > observed,
            None => true,
        });
    any_newer && tasks.iter().any(|t| interrupt_nodes.matches(t))
}

/// Record the current channel versions under the interrupt sentinel.
pub fn mark_interrupt_seen(checkpoint: &mut Checkpoint) {
    let versions = checkpoint.channel_versions.clone();
    checkpoint
        .versions_seen
        .insert(INTERRUPT.to_string(), versions);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelVersion, TaskKind};
    use serde_json::json;
    use uuid::Uuid;

    fn dummy_task(name: &str, hidden: bool) -> Task {
        Task {
            id: Uuid::new_v4(),
            name: name.to_string(),
            input: json!(null),
            kind: TaskKind::Pull,
            path: (
                TaskKind::Pull.as_str().to_string(),
                "t".to_string(),
                name.to_string(),
            ),
            triggers: vec!["t".to_string()],
            hidden,
            resume: vec![],
            recorded_writes: None,
        }
    }

    #[test]
    fn fires_once_per_state() {
        let mut cp = Checkpoint::empty();
        cp.channel_versions
            .insert("c".into(), ChannelVersion::Int(1));
        let tasks = vec![dummy_task("agent", false)];
        let nodes = InterruptNodes::Names(vec!["agent".to_string()]);

        assert!(should_interrupt(&cp, &nodes, &tasks));
        mark_interrupt_seen(&mut cp);
        assert!(!should_interrupt(&cp, &nodes, &tasks), "same state must not re-fire");

        cp.channel_versions
            .insert("c".into(), ChannelVersion::Int(2));
        assert!(should_interrupt(&cp, &nodes, &tasks));
    }

    #[test]
    fn all_skips_hidden_tasks() {
        let mut cp = Checkpoint::empty();
        cp.channel_versions
            .insert("c".into(), ChannelVersion::Int(1));
        assert!(!should_interrupt(
            &cp,
            &InterruptNodes::All,
            &[dummy_task("internal", true)]
        ));
        assert!(should_interrupt(
            &cp,
            &InterruptNodes::All,
            &[dummy_task("visible", false)]
        ));
    }

    #[test]
    fn never_matches_nothing() {
        let mut cp = Checkpoint::empty();
        cp.channel_versions
            .insert("c".into(), ChannelVersion::Int(1));
        assert!(!should_interrupt(
            &cp,
            &InterruptNodes::Never,
            &[dummy_task("agent", false)]
        ));
    }
}
