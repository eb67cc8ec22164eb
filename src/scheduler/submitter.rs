//! Job submission.
//!
//! The submitter validates a [`JobSpec`], translates it into a
//! [`SubmissionRequest`] and makes a single `create_job` call. It never
//! retries: retry policy belongs to the backend through `JobSpec::retries`,
//! and the caller decides whether a failed submission is worth repeating.

use std::sync::Arc;

use tracing::{error, info};

use super::backend::ClusterBackend;
use super::job::{JobHandle, JobSpec, SubmissionRequest};
use crate::error::SubmitError;
use crate::metrics;

/// Submits sharded jobs to a cluster backend.
pub struct JobSubmitter {
    backend: Arc<dyn ClusterBackend>,
}

impl JobSubmitter {
    /// Creates a submitter for the given backend.
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self { backend }
    }

    /// Validates the spec and renders the request without submitting it.
    pub fn prepare(&self, spec: &JobSpec) -> Result<SubmissionRequest, SubmitError> {
        spec.validate().inspect_err(|_| metrics::record_submission("invalid"))?;
        Ok(spec.to_request())
    }

    /// Submits `spec` as one remote job.
    ///
    /// Every call creates a new job, even for an identical spec.
    ///
    /// # Errors
    ///
    /// - `SubmitError::InvalidJobSpec` if validation fails; the backend is not contacted
    /// - `SubmitError::Submission` if the backend call fails
    pub async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SubmitError> {
        let request = self.prepare(spec)?;

        info!(
            backend = self.backend.name(),
            job = %spec.name,
            shards = request.tasks.len(),
            gpus = spec.gpus,
            nodes = spec.nodes,
            priority = %spec.priority,
            preemptible = spec.preemptible,
            "Submitting job"
        );

        match self.backend.create_job(&request).await {
            Ok(handle) => {
                metrics::record_submission("submitted");
                info!(backend = self.backend.name(), handle = %handle, "Job submitted");
                Ok(handle)
            }
            Err(cause) => {
                metrics::record_submission("failed");
                error!(backend = self.backend.name(), error = %cause, "Job submission failed");
                Err(SubmitError::Submission { cause })
            }
        }
    }

    /// Returns the backend this submitter talks to.
    pub fn backend(&self) -> &Arc<dyn ClusterBackend> {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::planner::{plan, StageTemplate};
    use crate::scheduler::job::{JobStatus, LogChunk};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every request and returns a numbered handle, or fails.
    struct RecordingBackend {
        requests: Mutex<Vec<SubmissionRequest>>,
        fail: bool,
    }

    impl RecordingBackend {
        fn new(fail: bool) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                fail,
            }
        }

        fn submitted(&self) -> usize {
            self.requests.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl ClusterBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn create_job(&self, request: &SubmissionRequest) -> Result<JobHandle, BackendError> {
            if self.fail {
                return Err(BackendError::Unauthorized("bad token".to_string()));
            }
            let mut requests = self.requests.lock().expect("lock");
            requests.push(request.clone());
            Ok(JobHandle::new(format!("job-{}", requests.len())))
        }

        async fn get_status(&self, _handle: &JobHandle) -> Result<JobStatus, BackendError> {
            Ok(JobStatus::Pending)
        }

        async fn get_logs(&self, _handle: &JobHandle, since: u64) -> Result<LogChunk, BackendError> {
            Ok(LogChunk {
                data: Vec::new(),
                next_offset: since,
            })
        }

        async fn cancel(&self, _handle: &JobHandle) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn spec() -> JobSpec {
        let shards = plan(10, 2, &[StageTemplate::new("echo {{ start }}")]).expect("plan");
        JobSpec::new("test-job", "busybox", shards).with_cluster("local")
    }

    #[tokio::test]
    async fn test_submit_creates_job_each_call() {
        let backend = Arc::new(RecordingBackend::new(false));
        let submitter = JobSubmitter::new(backend.clone());

        let first = submitter.submit(&spec()).await.expect("submit");
        let second = submitter.submit(&spec()).await.expect("submit");

        assert_eq!(first.as_str(), "job-1");
        assert_eq!(second.as_str(), "job-2");
        assert_eq!(backend.submitted(), 2);
    }

    #[tokio::test]
    async fn test_invalid_spec_never_reaches_backend() {
        let backend = Arc::new(RecordingBackend::new(false));
        let submitter = JobSubmitter::new(backend.clone());

        let err = submitter.submit(&spec().with_gpus(0)).await.unwrap_err();

        assert!(matches!(err, SubmitError::InvalidJobSpec(_)));
        assert_eq!(backend.submitted(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_is_not_retried() {
        let backend = Arc::new(RecordingBackend::new(true));
        let submitter = JobSubmitter::new(backend.clone());

        let err = submitter.submit(&spec()).await.unwrap_err();

        assert!(matches!(
            err,
            SubmitError::Submission {
                cause: BackendError::Unauthorized(_)
            }
        ));
        assert_eq!(backend.submitted(), 0);
    }

    #[test]
    fn test_prepare_renders_request() {
        let submitter = JobSubmitter::new(Arc::new(RecordingBackend::new(false)));
        let request = submitter.prepare(&spec()).expect("prepare");

        assert_eq!(request.name, "test-job");
        assert_eq!(request.tasks.len(), 2);
        assert_eq!(submitter.backend().name(), "recording");
    }
}
