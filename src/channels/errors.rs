//! Error types for channel operations.

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by channel reads, updates, and restores.
#[derive(Debug, Error, Diagnostic)]
pub enum ChannelError {
    /// A reader asked for a value on a channel that has not produced one.
    ///
    /// Handled locally during task input assembly; an empty channel causes
    /// the task to be skipped rather than the step to fail.
    #[error("channel `{channel}` is empty")]
    #[diagnostic(
        code(stepgraph::channels::empty),
        help("The channel has not been written yet, or its value was consumed.")
    )]
    Empty { channel: String },

    /// Writes violated the channel's arity or shape contract.
    ///
    /// Fatal to the step: the offending channel and a description of the
    /// rejected values are surfaced to the caller.
    #[error("invalid update for channel `{channel}`: {message}")]
    #[diagnostic(
        code(stepgraph::channels::invalid_update),
        help(
            "Check that at most one task writes to this channel per superstep, \
             or switch the channel to an accumulating variant."
        )
    )]
    InvalidUpdate { channel: String, message: String },

    /// A persisted snapshot could not be restored into this channel kind.
    #[error("cannot restore channel `{channel}` from snapshot: {message}")]
    #[diagnostic(
        code(stepgraph::channels::restore),
        help("The snapshot shape does not match the declared channel kind.")
    )]
    Restore { channel: String, message: String },
}

impl ChannelError {
    pub(crate) fn empty(channel: impl Into<String>) -> Self {
        ChannelError::Empty {
            channel: channel.into(),
        }
    }

    pub(crate) fn invalid_update(channel: impl Into<String>, message: impl Into<String>) -> Self {
        ChannelError::InvalidUpdate {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub(crate) fn restore(channel: impl Into<String>, message: impl Into<String>) -> Self {
        ChannelError::Restore {
            channel: channel.into(),
            message: message.into(),
        }
    }
}
