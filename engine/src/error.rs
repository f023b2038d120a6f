//! Error types for the scoring engine
//!
//! Rejections a submitter is expected to see (cooldown, busy, unknown action)
//! are reported as data in [`crate::pipeline::SubmitOutcome`]; the types here
//! cover failures of the components themselves.

use shared::{ActionId, UserId};
use thiserror::Error;

/// Errors raised while building an action catalog snapshot
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Action id must not be empty")]
    EmptyActionId,

    #[error("Action {0} has a zero reward")]
    ZeroReward(ActionId),

    #[error("Action {0} is defined more than once")]
    DuplicateAction(ActionId),
}

/// Errors raised by the rank index
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RankError {
    /// Secondary lookup and ordered tree disagree about a user
    #[error("Rank index inconsistent for user {0}")]
    Inconsistent(UserId),
}

/// Errors raised by an individual fraud rule
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FraudError {
    #[error("Fraud rule {rule} failed: {detail}")]
    RuleFailed { rule: &'static str, detail: String },
}

/// Errors raised by an audit log backend
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit record encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Audit frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("Audit writer is closed")]
    Closed,
}

/// Errors returned by engine operations other than `submit`
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    #[error("Adjustment of {delta} would take user {user_id} below zero (score {score})")]
    InvalidAdjustment {
        user_id: UserId,
        delta: i64,
        score: u64,
    },

    #[error("Timed out waiting for the lock of user {0}")]
    Busy(UserId),

    #[error("Score overflow for user {0}")]
    Overflow(UserId),

    #[error("Reservation missing for user {0}")]
    ReservationLost(UserId),

    #[error(transparent)]
    Rank(#[from] RankError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}
