//! Error types for shard-launch operations.
//!
//! Defines error types for each subsystem:
//! - Shard planning and stage template rendering
//! - Job spec validation and submission
//! - Cluster backend queries
//! - Completion monitoring
//! - Launch configuration loading

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while planning shards.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Invalid shard config: {total_items} items cannot be split into {shard_count} shards")]
    InvalidShardConfig { total_items: u64, shard_count: u64 },

    #[error("At least one stage template is required")]
    NoStages,

    #[error("Stage {stage} has an empty command template")]
    EmptyStage { stage: usize },

    #[error("Failed to render output path for shard {shard}: {source}")]
    OutputTemplate {
        shard: u64,
        #[source]
        source: tera::Error,
    },

    #[error("Failed to render stage {stage} for shard {shard}: {source}")]
    Template {
        shard: u64,
        stage: usize,
        #[source]
        source: tera::Error,
    },
}

/// Errors that can occur when talking to a cluster backend.
///
/// Inside the completion monitor these are treated as transient query
/// errors: logged and recovered on the next tick.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Failed to parse backend response: {0}")]
    Parse(String),

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Failed to spawn shard process: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while submitting a job.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid job spec: {0}")]
    InvalidJobSpec(String),

    #[error("Job submission failed: {cause}")]
    Submission {
        #[source]
        cause: BackendError,
    },
}

/// Errors that end a watch without a terminal outcome.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Watch of job '{handle}' cancelled after {elapsed:?}")]
    Cancelled { handle: String, elapsed: Duration },

    #[error("Invalid watch options: {0}")]
    InvalidOptions(String),
}

/// Errors that can occur while loading launch configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error reading '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
