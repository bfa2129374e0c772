use thiserror::Error;

/// Errors the scheduler can surface to its caller.
///
/// Per-entry membership failures (`MEMBERSHIP_DECODE_FAILED`,
/// `DUPLICATE_BACKEND_ID`) are *not* represented here: those are logged and
/// skipped by the membership tracker rather than propagated, since a single
/// malformed topic entry must never abort an otherwise-healthy delta.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("no executors available in the current backend snapshot")]
    NoExecutors,

    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    #[error("request pool resolution failed: {0}")]
    PoolResolutionFailed(String),

    #[error("internal scheduler error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn malformed_plan(msg: impl Into<String>) -> Self {
        Self::MalformedPlan(msg.into())
    }
}
