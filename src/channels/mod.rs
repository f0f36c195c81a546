//! Channel-based state storage.
//!
//! A channel is a named, typed mailbox with a reduction rule — the unit of
//! inter-node communication. Channels are mutated only inside the commit
//! phase of a superstep; tasks buffer their writes and never touch channels
//! directly.
//!
//! The nine variants are modelled as one tagged enum rather than a trait
//! hierarchy: reducers are first-class function values stored in the variant,
//! and the engine dispatches over the tag. This keeps channels cheap to
//! clone (copy-on-write between the read and write halves of a superstep)
//! and trivially serializable.
//!
//! # Contract
//!
//! - [`Channel::update`] folds a batch of incoming values, reporting whether
//!   the state observably changed;
//! - [`Channel::get`] returns the readable value or [`ChannelError::Empty`];
//! - [`Channel::consume`] marks the value as read (ephemeral variants clear);
//! - [`Channel::finish`] fires once when no further step will run, releasing
//!   the `*AfterFinish` variants;
//! - [`Channel::checkpoint`] / [`Channel::restore`] serialize and rebuild the
//!   internal state ([`Channel::Untracked`] opts out).

pub mod aggregate;
pub mod barrier;
pub mod errors;
pub mod ephemeral;
pub mod last_value;
mod snapshot;
pub mod topic;

pub use aggregate::{BinaryOperator, BinaryOperatorAggregate, ZeroFn};
pub use barrier::{NamedBarrier, NamedBarrierAfterFinish};
pub use ephemeral::{AnyValue, EphemeralValue, UntrackedValue};
pub use errors::ChannelError;
pub use last_value::{LastValue, LastValueAfterFinish};
pub use topic::Topic;

use serde_json::Value;
use std::sync::Arc;

/// A typed mailbox with a reduction rule.
///
/// See the module docs for the contract. Construct through the named
/// constructors; the variant fixes both the storage shape and the update
/// semantics.
#[derive(Clone, Debug)]
pub enum Channel {
    LastValue(LastValue),
    LastValueAfterFinish(LastValueAfterFinish),
    Topic(Topic),
    Aggregate(BinaryOperatorAggregate),
    Barrier(NamedBarrier),
    BarrierAfterFinish(NamedBarrierAfterFinish),
    Ephemeral(EphemeralValue),
    Any(AnyValue),
    Untracked(UntrackedValue),
}

impl Channel {
    /// Holds at most one value per superstep; concurrent writes fail.
    #[must_use]
    pub fn last_value() -> Self {
        Channel::LastValue(LastValue::default())
    }

    /// As `last_value`, readable only after the invocation finishes.
    #[must_use]
    pub fn last_value_after_finish() -> Self {
        Channel::LastValueAfterFinish(LastValueAfterFinish::default())
    }

    /// Collects values written during a superstep.
    #[must_use]
    pub fn topic(unique: bool, accumulate: bool) -> Self {
        Channel::Topic(Topic::new(unique, accumulate))
    }

    /// Folds incoming values with `op`, starting from `zero()`.
    #[must_use]
    pub fn aggregate(op: BinaryOperator, zero: ZeroFn) -> Self {
        Channel::Aggregate(BinaryOperatorAggregate::new(op, zero))
    }

    /// Releases once every member of `names` has contributed.
    #[must_use]
    pub fn barrier(names: impl IntoIterator<Item = String>) -> Self {
        Channel::Barrier(NamedBarrier::new(names))
    }

    /// Barrier whose delivery waits for `finish`.
    #[must_use]
    pub fn barrier_after_finish(names: impl IntoIterator<Item = String>) -> Self {
        Channel::BarrierAfterFinish(NamedBarrierAfterFinish::new(names))
    }

    /// Single-step visibility; cleared at the next step boundary.
    #[must_use]
    pub fn ephemeral() -> Self {
        Channel::Ephemeral(EphemeralValue::default())
    }

    /// As `ephemeral`, but tolerating multiple writers per step (last
    /// wins). This is the storage behind node trigger slots, where several
    /// tasks may fire the same target in one superstep.
    #[must_use]
    pub fn ephemeral_unguarded() -> Self {
        Channel::Ephemeral(EphemeralValue::new(false))
    }

    /// Last-writer-wins slot that tolerates concurrent writes.
    #[must_use]
    pub fn any_value() -> Self {
        Channel::Any(AnyValue::default())
    }

    /// Read-through slot excluded from checkpointing and versioning.
    #[must_use]
    pub fn untracked() -> Self {
        Channel::Untracked(UntrackedValue::default())
    }

    /// Fold `values` into the channel state.
    ///
    /// Returns `Ok(true)` iff the state observably changed; version bumps key
    /// off this.
    pub fn update(&mut self, name: &str, values: Vec<Value>) -> Result<bool, ChannelError> {
        match self {
            Channel::LastValue(c) => c.update(name, values),
            Channel::LastValueAfterFinish(c) => c.update(name, values),
            Channel::Topic(c) => c.update(name, values),
            Channel::Aggregate(c) => c.update(name, values),
            Channel::Barrier(c) => c.update(name, values),
            Channel::BarrierAfterFinish(c) => c.update(name, values),
            Channel::Ephemeral(c) => c.update(name, values),
            Channel::Any(c) => c.update(name, values),
            Channel::Untracked(c) => c.update(name, values),
        }
    }

    /// The currently readable value.
    pub fn get(&self, name: &str) -> Result<Value, ChannelError> {
        match self {
            Channel::LastValue(c) => c.get(name),
            Channel::LastValueAfterFinish(c) => c.get(name),
            Channel::Topic(c) => c.get(name),
            Channel::Aggregate(c) => c.get(name),
            Channel::Barrier(c) => c.get(name),
            Channel::BarrierAfterFinish(c) => c.get(name),
            Channel::Ephemeral(c) => c.get(name),
            Channel::Any(c) => c.get(name),
            Channel::Untracked(c) => c.get(name),
        }
    }

    /// Mark the current value as consumed by a reader.
    pub fn consume(&mut self) -> bool {
        match self {
            Channel::LastValueAfterFinish(c) => c.consume(),
            Channel::Topic(c) => c.consume(),
            Channel::Barrier(c) => c.consume(),
            Channel::BarrierAfterFinish(c) => c.consume(),
            Channel::Ephemeral(c) => c.consume(),
            Channel::LastValue(_) | Channel::Aggregate(_) | Channel::Any(_) | Channel::Untracked(_) => {
                false
            }
        }
    }

    /// Notify the channel that no further step will run in this invocation.
    pub fn finish(&mut self) -> bool {
        match self {
            Channel::LastValueAfterFinish(c) => c.finish(),
            Channel::BarrierAfterFinish(c) => c.finish(),
            _ => false,
        }
    }

    /// Whether [`Channel::get`] would succeed.
    #[must_use]
    pub fn is_available(&self) -> bool {
        match self {
            Channel::LastValue(c) => c.is_available(),
            Channel::LastValueAfterFinish(c) => c.is_available(),
            Channel::Topic(c) => c.is_available(),
            Channel::Aggregate(c) => c.is_available(),
            Channel::Barrier(c) => c.is_available(),
            Channel::BarrierAfterFinish(c) => c.is_available(),
            Channel::Ephemeral(c) => c.is_available(),
            Channel::Any(c) => c.is_available(),
            Channel::Untracked(c) => c.is_available(),
        }
    }

    /// Serialize internal state. `None` for untracked channels, which do not
    /// participate in checkpointing.
    #[must_use]
    pub fn checkpoint(&self) -> Option<Value> {
        match self {
            Channel::LastValue(c) => Some(c.checkpoint()),
            Channel::LastValueAfterFinish(c) => Some(c.checkpoint()),
            Channel::Topic(c) => Some(c.checkpoint()),
            Channel::Aggregate(c) => Some(c.checkpoint()),
            Channel::Barrier(c) => Some(c.checkpoint()),
            Channel::BarrierAfterFinish(c) => Some(c.checkpoint()),
            Channel::Ephemeral(c) => Some(c.checkpoint()),
            Channel::Any(c) => Some(c.checkpoint()),
            Channel::Untracked(_) => None,
        }
    }

    /// Rebuild a channel of the same kind from a snapshot. `self` acts as the
    /// prototype carrying reducers and declared name sets.
    pub fn restore(&self, name: &str, snapshot: Value) -> Result<Channel, ChannelError> {
        Ok(match self {
            Channel::LastValue(_) => Channel::LastValue(LastValue::restore(name, snapshot)?),
            Channel::LastValueAfterFinish(_) => {
                Channel::LastValueAfterFinish(LastValueAfterFinish::restore(name, snapshot)?)
            }
            Channel::Topic(c) => Channel::Topic(c.restore(name, snapshot)?),
            Channel::Aggregate(c) => Channel::Aggregate(c.restore(name, snapshot)?),
            Channel::Barrier(c) => Channel::Barrier(c.restore(name, snapshot)?),
            Channel::BarrierAfterFinish(c) => {
                Channel::BarrierAfterFinish(c.restore(name, snapshot)?)
            }
            Channel::Ephemeral(c) => Channel::Ephemeral(c.restore(name, snapshot)?),
            Channel::Any(_) => Channel::Any(AnyValue::restore(name, snapshot)?),
            Channel::Untracked(_) => Channel::Untracked(UntrackedValue::default()),
        })
    }

    /// Untracked channels are excluded from persistence and version bumps.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        !matches!(self, Channel::Untracked(_))
    }
}

/// Convenience constructor for an integer-sum aggregate, common enough in
/// tests and counters to warrant a shorthand.
#[must_use]
pub fn sum_aggregate() -> Channel {
    Channel::aggregate(
        Arc::new(|a, b| {
            serde_json::json!(a.as_i64().unwrap_or_default() + b.as_i64().unwrap_or_default())
        }),
        Arc::new(|| serde_json::json!(0)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_covers_all_variants() {
        let mut channels = vec![
            Channel::last_value(),
            Channel::last_value_after_finish(),
            Channel::topic(false, true),
            sum_aggregate(),
            Channel::barrier(["n".to_string()]),
            Channel::barrier_after_finish(["n".to_string()]),
            Channel::ephemeral(),
            Channel::any_value(),
            Channel::untracked(),
        ];
        for ch in &mut channels {
            // the barrier variants only accept declared names
            let value = if matches!(ch, Channel::Barrier(_) | Channel::BarrierAfterFinish(_)) {
                json!("n")
            } else {
                json!(1)
            };
            ch.update("c", vec![value]).unwrap();
        }
    }

    #[test]
    fn checkpoint_restore_roundtrip() {
        let mut ch = Channel::topic(false, true);
        ch.update("t", vec![json!("a")]).unwrap();
        let snap = ch.checkpoint().unwrap();
        let restored = ch.restore("t", snap).unwrap();
        assert_eq!(restored.get("t").unwrap(), json!(["a"]));
    }

    #[test]
    fn untracked_is_excluded_from_checkpoint() {
        let mut ch = Channel::untracked();
        ch.update("u", vec![json!(5)]).unwrap();
        assert!(ch.checkpoint().is_none());
        assert!(!ch.is_tracked());
    }
}
