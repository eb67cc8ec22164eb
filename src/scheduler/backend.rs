//! The capabilities a cluster backend must provide.

use async_trait::async_trait;

use super::job::{JobHandle, JobStatus, LogChunk, SubmissionRequest};
use crate::error::BackendError;

/// A cluster scheduler that can run submitted jobs.
///
/// Implementations are treated as read-only by the completion monitor, so
/// several monitors may poll the same handle concurrently.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Creates exactly one remote job.
    async fn create_job(&self, request: &SubmissionRequest) -> Result<JobHandle, BackendError>;

    /// Returns the current status of a job.
    ///
    /// Jobs that are queued, running, or not yet visible report `Pending`.
    async fn get_status(&self, handle: &JobHandle) -> Result<JobStatus, BackendError>;

    /// Returns log bytes written at or after `since_offset`.
    async fn get_logs(&self, handle: &JobHandle, since_offset: u64)
        -> Result<LogChunk, BackendError>;

    /// Requests cancellation of a job. Never called automatically.
    async fn cancel(&self, handle: &JobHandle) -> Result<(), BackendError>;
}
