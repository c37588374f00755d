//! Error taxonomy of the pipeline.
//!
//! Every failure carries an [`ErrorKind`], and every kind carries the
//! [`RetryPolicy`] the caller should apply. Collaborator failures surface as
//! [`StoreError`] and are always [`ErrorKind::TransientInfra`].

use std::time::Duration;

use pixelwar_types::{CellCoord, MessageId, PaintOutcome};

/// Classification of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed coordinate, color or user id. Rejected synchronously.
    Validation,
    /// The user's cooldown is active.
    RateLimit,
    /// The cell lock was busy for the whole wait timeout.
    Contention,
    /// A lock, cache, queue or durable store was unreachable.
    TransientInfra,
    /// The durable record and the ranking ledger diverged.
    Consistency,
}

/// What the caller should do after a failure of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retrying the same input cannot succeed.
    DoNotRetry,
    /// Retry once the given delay has elapsed.
    RetryAfter(Duration),
    /// Retry immediately or with exponential backoff.
    RetryWithBackoff,
    /// Leave it to the broker's redelivery (durable path).
    Redeliver,
}

impl ErrorKind {
    /// Default retry policy of this kind. Rate limits carry their own delay,
    /// see [`PaintError::retry_policy`].
    pub const fn retry_policy(self) -> RetryPolicy {
        match self {
            Self::Validation | Self::Consistency => RetryPolicy::DoNotRetry,
            Self::RateLimit | Self::Contention | Self::TransientInfra => {
                RetryPolicy::RetryWithBackoff
            }
        }
    }
}

/// A collaborator (lock provider, key-value store, queue broker, durable
/// store, pub/sub transport) failed or returned something unusable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backing service could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backing service returned data that could not be decoded.
    #[error("corrupt store data: {0}")]
    Corrupt(String),

    /// The operation did not complete within its deadline.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Always [`ErrorKind::TransientInfra`].
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::TransientInfra
    }
}

/// Fast-path failure returned synchronously to the writer.
#[derive(Debug, thiserror::Error)]
pub enum PaintError {
    /// The request failed validation.
    #[error("invalid paint request: {0}")]
    Validation(String),

    /// The user is cooling down.
    #[error("cooldown active for another {remaining:?}")]
    RateLimited {
        /// Time left in the cooldown window.
        remaining: Duration,
    },

    /// The cell stayed locked for the whole wait timeout.
    #[error("cell {cell} is busy")]
    Contention {
        /// The contended cell.
        cell: CellCoord,
    },

    /// A collaborator failed.
    #[error(transparent)]
    Infra(#[from] StoreError),
}

impl PaintError {
    /// Classification of this failure.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Contention { .. } => ErrorKind::Contention,
            Self::Infra(_) => ErrorKind::TransientInfra,
        }
    }

    /// Retry policy attached to this failure.
    pub const fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::RateLimited { remaining } => RetryPolicy::RetryAfter(*remaining),
            other => other.kind().retry_policy(),
        }
    }

    /// The wire outcome reported to the writer, or `None` for validation
    /// failures (reported as a client error instead).
    pub fn outcome(&self) -> Option<PaintOutcome> {
        match self {
            Self::Validation(_) => None,
            Self::RateLimited { remaining } => Some(PaintOutcome::Cooldown {
                remaining_seconds: whole_seconds_ceil(*remaining),
            }),
            Self::Contention { .. } => Some(PaintOutcome::Busy),
            Self::Infra(_) => Some(PaintOutcome::Failed),
        }
    }
}

/// Round a remaining duration up to whole seconds, never below one.
pub fn whole_seconds_ceil(remaining: Duration) -> u64 {
    let secs = remaining.as_secs();
    let rounded = if remaining.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    };
    rounded.max(1)
}

/// Durable-path failure for a single message.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The payload is not a well-formed update message. Dropped.
    #[error("unparseable update message: {0}")]
    Parse(String),

    /// The message parsed but its content is unusable (e.g. non-finite
    /// coordinates). Dropped.
    #[error("invalid update message: {0}")]
    Invalid(String),

    /// The durable store failed before anything was applied. Redelivered.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Optimistic writes kept losing races on the same cell. Redelivered.
    #[error("gave up on cell {cell} after {attempts} conflicting writes")]
    Conflict {
        /// The contended cell.
        cell: CellCoord,
        /// Number of attempts made.
        attempts: u32,
    },
}

impl WorkerError {
    /// Whether the message should be discarded rather than redelivered.
    pub const fn is_poison(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::Invalid(_))
    }

    /// Retry policy attached to this failure.
    pub const fn retry_policy(&self) -> RetryPolicy {
        if self.is_poison() {
            RetryPolicy::DoNotRetry
        } else {
            RetryPolicy::Redeliver
        }
    }
}

/// The durable record changed but the ranking ledger update did not fully
/// apply (or the reverse). Logged, never surfaced to the writer,
/// and repaired by reconciliation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("ledger diverged from durable record at {cell} (message {message_id:?}): {detail}")]
pub struct ConsistencyWarning {
    /// Cell whose record was written.
    pub cell: CellCoord,
    /// Message that produced the write.
    pub message_id: Option<MessageId>,
    /// The ledger failure.
    pub detail: String,
}

impl ConsistencyWarning {
    /// Always [`ErrorKind::Consistency`].
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Consistency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_follow_kind() {
        let busy = PaintError::Contention {
            cell: CellCoord::new(1, 2),
        };
        assert_eq!(busy.outcome(), Some(PaintOutcome::Busy));
        assert_eq!(busy.retry_policy(), RetryPolicy::RetryWithBackoff);

        let failed = PaintError::from(StoreError::Unavailable(String::from("down")));
        assert_eq!(failed.kind(), ErrorKind::TransientInfra);
        assert_eq!(failed.outcome(), Some(PaintOutcome::Failed));

        let invalid = PaintError::Validation(String::from("bad color"));
        assert_eq!(invalid.outcome(), None);
        assert_eq!(invalid.retry_policy(), RetryPolicy::DoNotRetry);
    }

    #[test]
    fn rate_limit_reports_whole_seconds() {
        let err = PaintError::RateLimited {
            remaining: Duration::from_millis(2300),
        };
        assert_eq!(
            err.outcome(),
            Some(PaintOutcome::Cooldown { remaining_seconds: 3 })
        );
        assert_eq!(
            err.retry_policy(),
            RetryPolicy::RetryAfter(Duration::from_millis(2300))
        );
    }

    #[test]
    fn sub_second_remainder_never_reports_zero() {
        assert_eq!(whole_seconds_ceil(Duration::from_millis(1)), 1);
        assert_eq!(whole_seconds_ceil(Duration::ZERO), 1);
        assert_eq!(whole_seconds_ceil(Duration::from_secs(4)), 4);
    }

    #[test]
    fn poison_messages_are_not_redelivered() {
        assert!(WorkerError::Parse(String::from("eof")).is_poison());
        assert_eq!(
            WorkerError::Store(StoreError::Timeout(Duration::from_secs(1))).retry_policy(),
            RetryPolicy::Redeliver
        );
    }
}
