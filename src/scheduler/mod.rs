//! Cluster job submission.
//!
//! - **ClusterBackend**: the operations a scheduler must support
//! - **JobSpec**: shard pipelines plus scheduling metadata
//! - **JobSubmitter**: validates a spec and creates exactly one remote job
//! - **HttpBackend** / **LocalBackend**: concrete backends
//!
//! # Example
//!
//! ```rust,ignore
//! use shard_launch::scheduler::{HttpBackend, JobSpec, JobSubmitter, Priority};
//! use std::sync::Arc;
//!
//! let backend = Arc::new(HttpBackend::new("https://cluster.example.com/api", token)?);
//! let spec = JobSpec::new("rejection-sampling", "ghcr.io/acme/trainer:latest", pipelines)
//!     .with_cluster("pool-a")
//!     .with_gpus(8)
//!     .with_priority(Priority::High)
//!     .with_preemptible(true);
//!
//! let handle = JobSubmitter::new(backend).submit(&spec).await?;
//! ```

pub mod backend;
pub mod http;
pub mod job;
pub mod local;
pub mod submitter;

pub use backend::ClusterBackend;
pub use http::HttpBackend;
pub use job::{
    JobHandle, JobSpec, JobStatus, LogChunk, Priority, SecretRef, SubmissionRequest, TaskRequest,
};
pub use local::LocalBackend;
pub use submitter::JobSubmitter;
