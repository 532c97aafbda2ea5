use foundation::JobId;
use runtime::{JobFailure, JobState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {job_id} is {state}, result not ready")]
    NotReady { job_id: JobId, state: JobState },
    #[error("job {job_id} is already {state}")]
    NotCancellable { job_id: JobId, state: JobState },
    #[error("job {job_id} failed: {failure}")]
    JobFailed { job_id: JobId, failure: JobFailure },
    #[error("job {0} was cancelled")]
    Cancelled(JobId),
    #[error("render queue full ({max_pending} pending)")]
    QueueFull { max_pending: usize },
    #[error("render queue is shutting down")]
    ShuttingDown,
}

impl RenderError {
    /// Short machine-readable code for wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            RenderError::Validation(_) => "validationError",
            RenderError::NotFound(_) => "notFound",
            RenderError::NotReady { .. } => "notReady",
            RenderError::NotCancellable { .. } => "notCancellable",
            RenderError::JobFailed { failure, .. } => failure.reason(),
            RenderError::Cancelled(_) => "cancelled",
            RenderError::QueueFull { .. } => "queueFull",
            RenderError::ShuttingDown => "shuttingDown",
        }
    }
}
