//! Job definitions for cluster submission.
//!
//! This module defines the types exchanged with a cluster backend:
//!
//! - `JobSpec`: shard pipelines plus scheduling metadata
//! - `SubmissionRequest`: the task-array form a backend receives
//! - `JobHandle`: the opaque identifier a backend returns
//! - `JobStatus` / `LogChunk`: what the completion monitor polls

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SubmitError;
use crate::planner::{ShardPipeline, ShardRange};

/// Default maximum number of backend-side retries for a job.
const DEFAULT_RETRIES: u32 = 0;

/// Env vars set on every task by `to_request`; users may not define them.
pub const RESERVED_ENV_VARS: [&str; 4] =
    ["SHARD_INDEX", "SHARD_START", "SHARD_END", "SHARD_COUNT"];

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid env name regex"));

static JOB_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("Invalid job name regex"));

/// Opaque identifier issued by the scheduler for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    /// Wraps a backend-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scheduling priority class requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!(
                "unknown priority '{}': expected low, normal, high or urgent",
                other
            )),
        }
    }
}

/// Reference to a secret held by the backend. Never a raw secret value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Everything needed to submit one sharded job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name shown by the scheduler.
    pub name: String,
    /// Optional free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Candidate cluster pools; the scheduler picks one.
    pub clusters: Vec<String>,
    /// Container image reference.
    pub image: String,
    /// GPUs per task.
    pub gpus: u32,
    /// Nodes per task.
    pub nodes: u32,
    /// Priority class.
    pub priority: Priority,
    /// Whether the scheduler may evict the job.
    pub preemptible: bool,
    /// Budget account charged for the job.
    pub budget: String,
    /// Workspace the job is created in.
    pub workspace: String,
    /// Env var name -> secret reference.
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretRef>,
    /// Env var name -> literal value.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Retries the backend may perform on failure.
    pub retries: u32,
    /// One pipeline per shard.
    pub shards: Vec<ShardPipeline>,
}

impl JobSpec {
    /// Creates a job spec with one GPU, one node and normal priority.
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        shards: Vec<ShardPipeline>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            clusters: Vec::new(),
            image: image.into(),
            gpus: 1,
            nodes: 1,
            priority: Priority::default(),
            preemptible: false,
            budget: String::new(),
            workspace: String::new(),
            secrets: BTreeMap::new(),
            env: BTreeMap::new(),
            retries: DEFAULT_RETRIES,
            shards,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a candidate cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.clusters.push(cluster.into());
        self
    }

    pub fn with_clusters(mut self, clusters: impl IntoIterator<Item = String>) -> Self {
        self.clusters.extend(clusters);
        self
    }

    pub fn with_gpus(mut self, gpus: u32) -> Self {
        self.gpus = gpus;
        self
    }

    pub fn with_nodes(mut self, nodes: u32) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_preemptible(mut self, preemptible: bool) -> Self {
        self.preemptible = preemptible;
        self
    }

    pub fn with_budget(mut self, budget: impl Into<String>) -> Self {
        self.budget = budget.into();
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Exposes a backend secret as the env var `name`.
    pub fn with_secret(mut self, name: impl Into<String>, reference: SecretRef) -> Self {
        self.secrets.insert(name.into(), reference);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Checks the spec before anything is sent to a backend.
    ///
    /// # Errors
    ///
    /// Returns `SubmitError::InvalidJobSpec` describing the first problem found.
    pub fn validate(&self) -> Result<(), SubmitError> {
        let invalid = |msg: String| Err(SubmitError::InvalidJobSpec(msg));

        if !JOB_NAME.is_match(&self.name) {
            return invalid(format!(
                "job name '{}' must start with an alphanumeric character and contain only \
                 alphanumerics, '.', '_' or '-'",
                self.name
            ));
        }
        if self.gpus == 0 {
            return invalid("gpu count must be positive".to_string());
        }
        if self.nodes == 0 {
            return invalid("node count must be positive".to_string());
        }
        if self.image.trim().is_empty() {
            return invalid("container image must not be empty".to_string());
        }
        if self.clusters.is_empty() || self.clusters.iter().any(|c| c.trim().is_empty()) {
            return invalid("at least one non-empty cluster is required".to_string());
        }
        if self.shards.is_empty() {
            return invalid("job has no shards".to_string());
        }
        if let Some(shard) = self.shards.iter().find(|s| s.stages.is_empty()) {
            return invalid(format!("{} has no stages", shard.task_name()));
        }

        for name in self.env.keys().chain(self.secrets.keys()) {
            if !ENV_NAME.is_match(name) {
                return invalid(format!("'{}' is not a valid environment variable name", name));
            }
        }
        if let Some(name) = self
            .env
            .keys()
            .chain(self.secrets.keys())
            .find(|k| RESERVED_ENV_VARS.contains(&k.as_str()))
        {
            return invalid(format!("'{}' is reserved for the shard range", name));
        }
        if let Some(name) = self.secrets.keys().find(|k| self.env.contains_key(*k)) {
            return invalid(format!("'{}' is set both as an env var and a secret", name));
        }
        if let Some((name, _)) = self.secrets.iter().find(|(_, r)| r.as_str().trim().is_empty()) {
            return invalid(format!("secret '{}' has an empty reference", name));
        }

        Ok(())
    }

    /// Translates the spec into the task-array form sent to the backend.
    ///
    /// Each shard becomes one task whose command runs the shard's chained
    /// stages under `bash -c`. Tasks also receive `SHARD_INDEX`,
    /// `SHARD_START`, `SHARD_END` and `SHARD_COUNT` in their environment.
    pub fn to_request(&self) -> SubmissionRequest {
        let shard_count = self.shards.len();
        let tasks = self
            .shards
            .iter()
            .map(|shard| {
                let mut env = self.env.clone();
                let values = [
                    shard.range.index.to_string(),
                    shard.range.start.to_string(),
                    shard.range.end.to_string(),
                    shard_count.to_string(),
                ];
                for (name, value) in RESERVED_ENV_VARS.iter().zip(values) {
                    env.insert(name.to_string(), value);
                }

                TaskRequest {
                    name: shard.task_name(),
                    image: self.image.clone(),
                    command: vec![
                        "bash".to_string(),
                        "-c".to_string(),
                        shard.command_line(),
                    ],
                    env,
                    secrets: self
                        .secrets
                        .iter()
                        .map(|(name, reference)| (name.clone(), reference.as_str().to_string()))
                        .collect(),
                    resources: TaskResources {
                        gpu_count: self.gpus,
                    },
                    replicas: self.nodes,
                    constraints: TaskConstraints {
                        cluster: self.clusters.clone(),
                    },
                    context: TaskContext {
                        priority: self.priority,
                        preemptible: self.preemptible,
                    },
                    shard: shard.range,
                }
            })
            .collect();

        SubmissionRequest {
            name: self.name.clone(),
            description: self.description.clone(),
            budget: self.budget.clone(),
            workspace: self.workspace.clone(),
            retries: self.retries,
            tasks,
        }
    }
}

/// Wire form of a job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub budget: String,
    pub workspace: String,
    pub retries: u32,
    pub tasks: Vec<TaskRequest>,
}

/// One task of a submission: a single shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub resources: TaskResources,
    pub replicas: u32,
    pub constraints: TaskConstraints,
    pub context: TaskContext,
    pub shard: ShardRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResources {
    pub gpu_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConstraints {
    pub cluster: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub priority: Priority,
    pub preemptible: bool,
}

/// Status of a job as reported by the backend.
///
/// A job that is queued, running, or not yet visible to the backend is
/// `Pending`; there is no separate "not found" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Exited { exit_code: i32 },
}

impl JobStatus {
    /// Returns the exit code once the job has finished.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            JobStatus::Pending => None,
            JobStatus::Exited { exit_code } => Some(*exit_code),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.exit_code().is_some()
    }
}

/// Log bytes returned by a backend, plus the offset to resume from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogChunk {
    /// Bytes starting at the requested offset.
    pub data: Vec<u8>,
    /// Offset just past the last byte in `data`.
    pub next_offset: u64,
}
