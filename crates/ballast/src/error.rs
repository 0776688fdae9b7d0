//! Error taxonomy shared by every storage backend and runnable.
//!
//! Mirrors the `SafeErrorCategory`/`Categorizable` split the core event layer
//! uses: permanent failures are rendered straight into a `FailedExecution`
//! and never retried automatically, while transient ones are logged and the
//! poller just tries again next cycle.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a [`crate::store::JobStore`] implementation or a runnable
/// built on top of one.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("class_name `{0}` does not resolve to a registered callable")]
    UnknownJobClass(String),

    #[error("job {job_id} failed: {source}")]
    JobFailure {
        job_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("process {0} was pruned as dead; its claimed executions were failed")]
    ProcessPruned(Uuid),

    #[error("claimed execution {0} had no owning process")]
    ProcessMissing(Uuid),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("enqueue failed: {0}")]
    Enqueue(#[source] anyhow::Error),

    #[error("pidfile {path} is owned by a live supervisor (pid {pid})")]
    PidfileContention { path: String, pid: i32 },

    #[error("storage backend error: {0}")]
    Database(#[source] anyhow::Error),
}

impl QueueError {
    /// Failures that represent a permanent, non-retryable outcome for the
    /// job itself (as opposed to infrastructure noise the poller should just
    /// shrug off and retry on the next cycle).
    pub fn is_job_permanent(&self) -> bool {
        matches!(self, QueueError::UnknownJobClass(_))
    }
}

/// Whether an operator should expect a retry of a [`FailedExecution`] to
/// plausibly succeed. Recorded alongside the error text so operators and
/// dashboards can tell "flaky" from "will never work" failures apart; the
/// retry action itself is available for either kind.
///
/// [`FailedExecution`]: crate::types::FailedExecution
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    NonRetryable,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::NonRetryable => "non_retryable",
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
