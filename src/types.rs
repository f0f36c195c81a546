//! Core types shared across the stepgraph engine.
//!
//! This module defines the fundamental vocabulary of the execution engine:
//! reserved channel names and sentinels, the totally ordered
//! [`ChannelVersion`], and the PUSH/PULL task discriminators.
//!
//! For runtime execution types (thread ids, run status), see
//! [`crate::runtimes`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Reserved channel carrying queued [`SendPacket`](crate::control::SendPacket)s.
pub const TASKS: &str = "__tasks__";
/// Reserved pseudo-channel recording interrupt payloads in pending writes.
pub const INTERRUPT: &str = "__interrupt__";
/// Reserved pseudo-channel carrying resume values back into interrupted tasks.
pub const RESUME: &str = "__resume__";
/// Reserved pseudo-channel carrying a task's return value to a dynamic caller.
pub const RETURN: &str = "__return__";
/// Reserved pseudo-channel marking a task that failed after retries.
pub const ERROR: &str = "__error__";
/// Reserved sentinel write for a task that completed without writes.
pub const NO_WRITES: &str = "__no_writes__";
/// Task-kind discriminator for dynamically dispatched (Send) tasks.
pub const PUSH: &str = "__push__";
/// Task-kind discriminator for subscription-triggered tasks.
pub const PULL: &str = "__pull__";
/// Virtual entry node.
pub const START: &str = "__start__";
/// Virtual terminal node.
pub const END: &str = "__end__";
/// Self-reference sentinel for a node's own channel.
pub const SELF: &str = "__self__";
/// Channel holding the previous return value of a functional entrypoint.
pub const PREVIOUS: &str = "__previous__";

/// Separator between namespace segments of nested graphs.
pub const NS_SEP: &str = "|";

/// Task id used for writes not attributable to any task (e.g. state patches
/// applied through `update_state`).
pub const NULL_TASK_ID: Uuid = Uuid::nil();

/// All names a user-declared channel may not take.
pub const RESERVED: &[&str] = &[
    TASKS, INTERRUPT, RESUME, RETURN, ERROR, NO_WRITES, PUSH, PULL, START, END, SELF, PREVIOUS,
];

/// Returns `true` if `name` is reserved for engine use.
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

/// A channel version witness.
///
/// Versions are totally ordered so the engine can compute
/// `max(channel_versions)` and decide whether a node has seen a channel's
/// latest write. The default version generator produces integers; custom
/// generators may produce strings (compared lexicographically). A single
/// thread never mixes the two; when a mixed comparison does occur, integers
/// order before strings so the result is still deterministic.
///
/// # Examples
///
/// ```
/// use stepgraph::types::ChannelVersion;
///
/// let a = ChannelVersion::Int(2);
/// let b = ChannelVersion::Int(10);
/// assert!(a < b);
///
/// let s1 = ChannelVersion::Str("0002".into());
/// let s2 = ChannelVersion::Str("0010".into());
/// assert!(s1 < s2);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelVersion {
    Int(u64),
    Str(String),
}

impl ChannelVersion {
    /// The version assigned to a channel the first time it is written.
    #[must_use]
    pub fn initial() -> Self {
        ChannelVersion::Int(1)
    }

    /// Default generator: numeric successor of the current maximum.
    #[must_use]
    pub fn next(current_max: Option<&ChannelVersion>) -> Self {
        match current_max {
            Some(ChannelVersion::Int(n)) => ChannelVersion::Int(n + 1),
            // String versions are opaque to the default generator; callers
            // supplying string versions must also supply their own generator.
            Some(ChannelVersion::Str(_)) | None => ChannelVersion::Int(1),
        }
    }
}

impl Ord for ChannelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChannelVersion::Int(a), ChannelVersion::Int(b)) => a.cmp(b),
            (ChannelVersion::Str(a), ChannelVersion::Str(b)) => a.cmp(b),
            (ChannelVersion::Int(_), ChannelVersion::Str(_)) => Ordering::Less,
            (ChannelVersion::Str(_), ChannelVersion::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for ChannelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChannelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelVersion::Int(n) => write!(f, "{n}"),
            ChannelVersion::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for ChannelVersion {
    fn from(n: u64) -> Self {
        ChannelVersion::Int(n)
    }
}

/// Function that produces the next version given the current maximum across
/// all channels. Stored on the compiled app so deployments can swap in a
/// custom scheme (e.g. zero-padded strings) without touching the engine.
pub type NextVersion =
    std::sync::Arc<dyn Fn(Option<&ChannelVersion>) -> ChannelVersion + Send + Sync>;

/// The two ways a task can come into existence in a superstep.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Dynamically dispatched via a queued `SendPacket`.
    Push,
    /// Selected because a trigger channel advanced past the node's seen version.
    Pull,
}

impl TaskKind {
    /// Wire discriminator used in task-id derivation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Push => PUSH,
            TaskKind::Pull => PULL,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_is_numeric_for_ints() {
        assert!(ChannelVersion::Int(2) < ChannelVersion::Int(10));
        assert!(ChannelVersion::Int(10) > ChannelVersion::Int(9));
    }

    #[test]
    fn version_ordering_is_lexicographic_for_strings() {
        let a = ChannelVersion::Str("00000002.x".into());
        let b = ChannelVersion::Str("00000010.a".into());
        assert!(a < b);
    }

    #[test]
    fn mixed_versions_order_ints_first() {
        assert!(ChannelVersion::Int(u64::MAX) < ChannelVersion::Str(String::new()));
    }

    #[test]
    fn default_next_version_increments() {
        let v = ChannelVersion::next(Some(&ChannelVersion::Int(4)));
        assert_eq!(v, ChannelVersion::Int(5));
        assert_eq!(ChannelVersion::next(None), ChannelVersion::Int(1));
    }

    #[test]
    fn reserved_names_are_rejected() {
        assert!(is_reserved(TASKS));
        assert!(is_reserved(START));
        assert!(!is_reserved("messages"));
    }
}
