//! shard-launch: sharded job submission and completion monitoring.
//!
//! This library splits a workload into contiguous shards, renders a chained
//! command pipeline per shard, submits all shards as one cluster job, and
//! watches the job until it succeeds, fails, or times out.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod planner;
pub mod scheduler;

// Re-export commonly used types
pub use config::LaunchConfig;
pub use error::{BackendError, ConfigError, MonitorError, PlanError, SubmitError};
pub use monitor::{CompletionMonitor, MonitorState, Outcome, WatchOptions};
pub use planner::{ShardPipeline, ShardPlanner, ShardRange, StageTemplate};
pub use scheduler::{ClusterBackend, JobHandle, JobSpec, JobStatus, JobSubmitter};
