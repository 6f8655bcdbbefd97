//! Error taxonomy for the rendezvous engine (spec.md §7).
//!
//! Two distinct error families exist: [`ConfigError`] for invariant
//! violations caught eagerly at construction time (caller bugs), and
//! [`ChannelError`] for the outcomes of a submitted read/write/choice,
//! surfaced exclusively through the operation's future — never thrown out of
//! the submission call itself.

/// Raised eagerly when channel/broadcast construction parameters violate an
/// invariant from spec.md §6.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_pending_readers ({max_pending_readers}) must be >= max(minimum_readers, initial_barrier) ({floor})")]
    ReaderCapacityBelowBarrier {
        max_pending_readers: usize,
        floor: usize,
    },

    #[error("SelectPolicy::Fair requires a stateful rotation and is not valid for an ad-hoc external choice")]
    FairPolicyNotSupported,
}

/// The exhaustive error taxonomy a pending channel operation can resolve
/// with (spec.md §7). `UserException` carries the opaque error returned by a
/// caller-supplied offer or commit callback; it is never suppressed.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The target channel is, or became, retired (spec.md §4.2 "Retirement").
    #[error("channel is retired")]
    Retired,

    /// The operation's deadline elapsed before a rendezvous occurred.
    #[error("operation timed out")]
    Timeout,

    /// The operation (or one evicted by it) exceeded queue capacity under a
    /// non-accommodating overflow policy.
    #[error("queue overflow")]
    Overflow,

    /// The operation's offer declined before a match — typically because a
    /// sibling in an external choice committed first.
    #[error("operation cancelled")]
    Cancelled,

    /// Bubbled out of a user-supplied offer or commit callback.
    #[error("user callback failed: {0}")]
    UserException(Box<dyn std::error::Error + Send + Sync>),
}

impl ChannelError {
    pub fn user<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        ChannelError::UserException(Box::new(err))
    }

    /// Builds a `UserException` from a rendered message rather than the
    /// original error, for the one case where the same failure must be
    /// reported to two independent completion promises and the original
    /// `Box<dyn Error>` cannot be cloned.
    pub(crate) fn user_msg(message: String) -> Self {
        #[derive(Debug, thiserror::Error)]
        #[error("{0}")]
        struct UserMessage(String);

        ChannelError::UserException(Box::new(UserMessage(message)))
    }
}

impl PartialEq for ChannelError {
    fn eq(&self, other: &Self) -> bool {
        use ChannelError::*;
        match (self, other) {
            (Retired, Retired) | (Timeout, Timeout) | (Overflow, Overflow) | (Cancelled, Cancelled) => true,
            (UserException(a), UserException(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}
