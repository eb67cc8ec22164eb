//! Launch configuration.
//!
//! A launch is described by a YAML file:
//!
//! ```yaml
//! name: tulu-rejection-sampling
//! backend:
//!   kind: http
//!   api_base: https://cluster.example.com/api
//!   token_env: CLUSTER_API_TOKEN
//! job:
//!   clusters: [pool-a, pool-b]
//!   image: ghcr.io/acme/trainer:latest
//!   gpus: 8
//!   priority: high
//!   preemptible: true
//!   budget: acme/research
//!   workspace: acme/rs
//!   secrets: { HF_TOKEN: alice_HF_TOKEN }
//!   env: { HF_HOME: /cache }
//! shards:
//!   total_items: 1000
//!   count: 4
//!   output_dir: /output
//!   vars: { model: olmo-7b }
//! stages:
//!   - name: generate
//!     command: python generate.py --start {{ start }} --end {{ end }} --out {{ output }}
//!   - name: score
//!     command: python score.py --in {{ output }}
//! watch:
//!   poll_interval_secs: 30
//!   max_wait_secs: 86400
//! ```
//!
//! Values from the file may be overridden by environment variables:
//!
//! - `SHARD_LAUNCH_IMAGE`: Container image
//! - `SHARD_LAUNCH_CLUSTERS`: Comma-separated candidate clusters
//! - `SHARD_LAUNCH_GPUS`: GPUs per task
//! - `SHARD_LAUNCH_NODES`: Nodes per task
//! - `SHARD_LAUNCH_PRIORITY`: low, normal, high or urgent
//! - `SHARD_LAUNCH_PREEMPTIBLE`: Boolean preemptible flag
//! - `SHARD_LAUNCH_BUDGET`: Budget account
//! - `SHARD_LAUNCH_WORKSPACE`: Workspace
//! - `SHARD_LAUNCH_RETRIES`: Backend retries
//! - `SHARD_LAUNCH_POLL_INTERVAL_SECS`: Monitor poll interval
//! - `SHARD_LAUNCH_MAX_WAIT_SECS`: Monitor deadline
//! - `SHARD_LAUNCH_API_BASE`: Switches to the HTTP backend at this URL

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BackendError, ConfigError};
use crate::monitor::WatchOptions;
use crate::planner::{ShardPipeline, ShardPlanner, StageTemplate, DEFAULT_OUTPUT_TEMPLATE};
use crate::scheduler::{ClusterBackend, HttpBackend, JobSpec, LocalBackend, Priority, SecretRef};

/// Default env var holding the HTTP backend's bearer token.
const DEFAULT_TOKEN_ENV: &str = "SHARD_LAUNCH_API_TOKEN";

/// Which backend jobs are submitted to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Http {
        api_base: String,
        #[serde(default = "default_token_env")]
        token_env: String,
        #[serde(default = "default_request_timeout_secs")]
        request_timeout_secs: u64,
    },
    #[default]
    Local,
}

impl BackendConfig {
    /// Whether jobs live inside the submitting process.
    ///
    /// Such jobs die with the process and cannot be watched or cancelled
    /// from another invocation.
    pub fn is_in_process(&self) -> bool {
        matches!(self, BackendConfig::Local)
    }
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Scheduling metadata for the submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub clusters: Vec<String>,
    pub image: String,
    #[serde(default = "default_one")]
    pub gpus: u32,
    #[serde(default = "default_one")]
    pub nodes: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub preemptible: bool,
    #[serde(default)]
    pub budget: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub retries: u32,
    /// Env var name -> secret reference.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_one() -> u32 {
    1
}

/// How the workload is split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub total_items: u64,
    pub count: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_output_template")]
    pub output_template: String,
    /// Extra variables available to stage templates.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

fn default_output_dir() -> String {
    "/output".to_string()
}

fn default_output_template() -> String {
    DEFAULT_OUTPUT_TEMPLATE.to_string()
}

/// Completion monitor timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    crate::monitor::DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_max_wait_secs() -> u64 {
    crate::monitor::DEFAULT_MAX_WAIT.as_secs()
}

/// Everything needed to plan, submit and watch one launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub backend: BackendConfig,
    pub job: JobConfig,
    pub shards: ShardConfig,
    pub stages: Vec<StageTemplate>,
    #[serde(default)]
    pub watch: WatchConfig,
}

impl LaunchConfig {
    /// Loads a config file, applies environment overrides and validates it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// override has an invalid value, or validation fails.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut config = Self::from_yaml_str(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        debug!(path = %path.display(), name = %config.name, "Loaded launch config");
        Ok(config)
    }

    /// Parses a config without applying overrides or validating.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Applies `SHARD_LAUNCH_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("SHARD_LAUNCH_IMAGE") {
            self.job.image = val;
        }

        if let Some(val) = lookup("SHARD_LAUNCH_CLUSTERS") {
            self.job.clusters = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(val) = lookup("SHARD_LAUNCH_GPUS") {
            self.job.gpus = parse_env_value(&val, "SHARD_LAUNCH_GPUS")?;
        }

        if let Some(val) = lookup("SHARD_LAUNCH_NODES") {
            self.job.nodes = parse_env_value(&val, "SHARD_LAUNCH_NODES")?;
        }

        if let Some(val) = lookup("SHARD_LAUNCH_PRIORITY") {
            self.job.priority = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "SHARD_LAUNCH_PRIORITY".to_string(),
                message,
            })?;
        }

        if let Some(val) = lookup("SHARD_LAUNCH_PREEMPTIBLE") {
            self.job.preemptible = parse_env_bool(&val, "SHARD_LAUNCH_PREEMPTIBLE")?;
        }

        if let Some(val) = lookup("SHARD_LAUNCH_BUDGET") {
            self.job.budget = val;
        }

        if let Some(val) = lookup("SHARD_LAUNCH_WORKSPACE") {
            self.job.workspace = val;
        }

        if let Some(val) = lookup("SHARD_LAUNCH_RETRIES") {
            self.job.retries = parse_env_value(&val, "SHARD_LAUNCH_RETRIES")?;
        }

        if let Some(val) = lookup("SHARD_LAUNCH_POLL_INTERVAL_SECS") {
            self.watch.poll_interval_secs =
                parse_env_value(&val, "SHARD_LAUNCH_POLL_INTERVAL_SECS")?;
        }

        if let Some(val) = lookup("SHARD_LAUNCH_MAX_WAIT_SECS") {
            self.watch.max_wait_secs = parse_env_value(&val, "SHARD_LAUNCH_MAX_WAIT_SECS")?;
        }

        if let Some(val) = lookup("SHARD_LAUNCH_API_BASE") {
            self.backend = match std::mem::take(&mut self.backend) {
                BackendConfig::Http {
                    token_env,
                    request_timeout_secs,
                    ..
                } => BackendConfig::Http {
                    api_base: val,
                    token_env,
                    request_timeout_secs,
                },
                BackendConfig::Local => BackendConfig::Http {
                    api_base: val,
                    token_env: default_token_env(),
                    request_timeout_secs: default_request_timeout_secs(),
                },
            };
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// Job-level invariants are checked again by the submitter; this catches
    /// mistakes before any planning happens.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "name cannot be empty".to_string(),
            ));
        }

        if self.job.image.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "job.image cannot be empty".to_string(),
            ));
        }

        if self.job.gpus == 0 {
            return Err(ConfigError::ValidationFailed(
                "job.gpus must be greater than 0".to_string(),
            ));
        }

        if self.job.nodes == 0 {
            return Err(ConfigError::ValidationFailed(
                "job.nodes must be greater than 0".to_string(),
            ));
        }

        if self.shards.count == 0 || self.shards.total_items < self.shards.count {
            return Err(ConfigError::ValidationFailed(format!(
                "shards.total_items ({}) must be at least shards.count ({}), which must be positive",
                self.shards.total_items, self.shards.count
            )));
        }

        if self.stages.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one stage is required".to_string(),
            ));
        }

        if self.watch.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "watch.poll_interval_secs must be greater than 0".to_string(),
            ));
        }

        if let BackendConfig::Http { ref api_base, .. } = self.backend {
            if !(api_base.starts_with("http://") || api_base.starts_with("https://")) {
                return Err(ConfigError::ValidationFailed(format!(
                    "backend.api_base must be an http(s) URL, got '{}'",
                    api_base
                )));
            }
        }

        Ok(())
    }

    /// Builds the shard planner described by `shards`.
    pub fn planner(&self) -> ShardPlanner {
        ShardPlanner::new(self.shards.total_items, self.shards.count)
            .with_output_dir(self.shards.output_dir.clone())
            .with_output_template(self.shards.output_template.clone())
            .with_vars(self.shards.vars.clone())
    }

    /// Builds the job spec for already-planned shard pipelines.
    pub fn job_spec(&self, shards: Vec<ShardPipeline>) -> JobSpec {
        let mut spec = JobSpec::new(&self.name, &self.job.image, shards)
            .with_clusters(self.job.clusters.clone())
            .with_gpus(self.job.gpus)
            .with_nodes(self.job.nodes)
            .with_priority(self.job.priority)
            .with_preemptible(self.job.preemptible)
            .with_budget(&self.job.budget)
            .with_workspace(&self.job.workspace)
            .with_retries(self.job.retries);

        if let Some(ref description) = self.description {
            spec = spec.with_description(description);
        }
        for (name, value) in &self.job.env {
            spec = spec.with_env(name, value);
        }
        for (name, reference) in &self.job.secrets {
            spec = spec.with_secret(name, SecretRef::new(reference));
        }
        spec
    }

    /// Monitor timing from the `watch` section.
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions::new(
            Duration::from_secs(self.watch.poll_interval_secs),
            Duration::from_secs(self.watch.max_wait_secs),
        )
    }

    /// Instantiates the configured backend.
    ///
    /// The HTTP backend reads its bearer token from the env var named by
    /// `token_env`; a missing token is allowed for unauthenticated APIs.
    pub fn build_backend(&self) -> Result<Arc<dyn ClusterBackend>, BackendError> {
        match self.backend {
            BackendConfig::Http {
                ref api_base,
                ref token_env,
                request_timeout_secs,
            } => {
                let token = std::env::var(token_env).ok();
                let backend = HttpBackend::with_timeout(
                    api_base.clone(),
                    token,
                    Duration::from_secs(request_timeout_secs),
                )?;
                Ok(Arc::new(backend))
            }
            BackendConfig::Local => Ok(Arc::new(LocalBackend::new())),
        }
    }
}

/// Parse an override value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an override value as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
