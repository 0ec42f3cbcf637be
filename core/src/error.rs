//! Error types shared by every communication component.
//!
//! Failures fall into two classes:
//!
//! - **Soft**: not enough free space or data in a ring channel, or a completion
//!   queue that has not drained yet. These are never errors; operations report
//!   them as `Ok(false)` and the caller simply retries on a later step.
//! - **Fatal**: everything else. A misconfigured capacity, too few notification
//!   ids for the computed topology, or any transport failure. There is no
//!   partial-failure recovery on the fabric, so the host loop is expected to
//!   terminate (see [`OrAbort`]).

use crate::transport::{Rank, TransportError};
use thiserror::Error;

/// Error type for the communication layer.
#[derive(Error, Debug)]
pub enum CommError {
    /// The underlying one-sided transport reported a failure.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// A ring pointer plus one must fit into a notification value.
    #[error("Ring capacity {capacity} exceeds the notification range (max {max})")]
    CapacityExceedsNotificationRange { capacity: usize, max: u32 },

    /// A ring needs at least one usable slot plus the reserved one.
    #[error("Ring capacity must be at least 2 elements, got {0}")]
    CapacityTooSmall(usize),

    /// The topology needs more notification ids than the transport provides.
    #[error("Topology needs {needed} notification ids from base {base}, transport provides {available}")]
    NotificationIdsExhausted {
        base: u32,
        needed: usize,
        available: usize,
    },

    #[error("Branching factor must be at least 2, got {0}")]
    InvalidBranchingFactor(usize),

    #[error("Rank {rank} is outside a cluster of {num_ranks} ranks")]
    RankOutOfRange { rank: Rank, num_ranks: usize },

    /// One side of a tree edge has no matching counterpart at the peer.
    #[error("Asymmetric topology: rank {rank} has an edge to rank {peer} that the peer does not mirror")]
    AsymmetricTopology { rank: Rank, peer: Rank },

    /// The element count of a buffer does not match what the channel expects.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A blob can never fit into a ring that keeps one slot empty.
    #[error("Blob of {count} elements exceeds ring capacity {capacity} minus the reserved slot")]
    BlobExceedsCapacity { count: usize, capacity: usize },

    /// A version counter grew past what a notification value can carry.
    #[error("Version {0} cannot be encoded as a notification value")]
    VersionOverflow(u64),

    /// Registered memory could not be viewed as the requested element type.
    #[error("Segment layout error: {0}")]
    Layout(String),

    /// Model updates can only originate at the broadcast root.
    #[error("Rank {0} receives the model from a parent and cannot publish updates")]
    NotRoot(Rank),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, CommError>;

/// Terminates the process on a fatal communication error.
///
/// The fabric is all-or-nothing: once a one-sided operation fails there is no
/// defined state to resume from, so the polling loop logs the error and aborts.
pub trait OrAbort<T> {
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for Result<T> {
    fn or_abort(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(error = %err, "fatal communication error");
                std::process::abort()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_converts() {
        let err: CommError = TransportError::InvalidQueue { queue: 9, queues: 4 }.into();
        assert!(matches!(err, CommError::Transport(_)));
        assert!(err.to_string().contains("queue 9"));
    }

    #[test]
    fn test_capacity_message() {
        let err = CommError::CapacityExceedsNotificationRange {
            capacity: 300,
            max: 255,
        };
        assert_eq!(
            err.to_string(),
            "Ring capacity 300 exceeds the notification range (max 255)"
        );
    }

    #[test]
    fn test_or_abort_passes_values_through() {
        let ok: Result<u32> = Ok(7);
        assert_eq!(ok.or_abort(), 7);
    }
}
