use std::{fmt, time::Duration};

use thiserror::Error;

use super::{DocumentId, MapperId};

#[derive(Debug, Error)]
pub enum MrError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("map function failed on {document}")]
    MapFunction {
        document: DocumentId,
        #[source]
        source: anyhow::Error,
    },

    #[error("reduce function failed in bucket {bucket}")]
    ReduceFunction {
        bucket: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("upstream task {mapper} failed")]
    UpstreamTaskFailed { mapper: MapperId },

    #[error("transient worker error: {0}")]
    TransientWorker(String),

    #[error("task exceeded its {0:?} deadline")]
    TaskTimeout(Duration),

    #[error("job cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl MrError {
    pub fn invalid(message: impl Into<String>) -> Self {
        MrError::InvalidArgument(message.into())
    }

    /// Whether the coordinator may re-run the task with the same inputs.
    pub fn is_transient(&self) -> bool {
        matches!(self, MrError::TransientWorker(_) | MrError::TaskTimeout(_))
    }
}

pub type MrResult<T> = Result<T, MrError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Rejected before any task was dispatched.
    Rejected,
    TaskFailed,
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::Rejected => "rejected",
            FailureReason::TaskFailed => "task failed",
            FailureReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal failure of a job, carrying the first fatal error.
#[derive(Debug, Error)]
#[error("job failed ({reason}): {error}")]
pub struct JobFailure {
    pub reason: FailureReason,
    #[source]
    pub error: MrError,
}

impl JobFailure {
    pub fn new(reason: FailureReason, error: MrError) -> Self {
        JobFailure { reason, error }
    }
}
