//! Scheduler error types.

use thiserror::Error;

use waterhack_state::{DemandId, DemandStatus};

use crate::session::SessionState;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The submission is malformed; the caller must correct and resubmit.
    #[error("invalid demand: {0}")]
    InvalidDemand(String),

    #[error("invalid field: {0}")]
    InvalidField(String),

    /// Not an edge of the demand lifecycle. Nothing was changed.
    #[error("illegal transition for demand {id}: {from} -> {to}")]
    IllegalTransition {
        id: DemandId,
        from: DemandStatus,
        to: DemandStatus,
    },

    /// The canal is held by another delivery. Retry on a later tick.
    #[error("canal busy: delivering demand {0}")]
    ResourceBusy(DemandId),

    #[error("demand {id} cannot be cancelled while {status}")]
    NotCancellable { id: DemandId, status: DemandStatus },

    #[error("demand not found: {0}")]
    DemandNotFound(DemandId),

    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("field {0} already exists")]
    FieldExists(String),

    #[error("no active delivery session")]
    NoActiveSession,

    #[error("cannot {action} a {state} session")]
    IllegalSessionState {
        state: SessionState,
        action: &'static str,
    },

    #[error("nothing to start: {0}")]
    NothingToStart(String),

    /// Persisted state breaks the single-delivery rule. Requires a resync.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("state store error: {0}")]
    State(#[from] waterhack_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
