//! Backend that runs shards as local processes.
//!
//! Each task of a submission is spawned as its own process, so shards run
//! concurrently just as they would on a cluster. Output from all shards is
//! interleaved into one in-memory log, each line prefixed with the task
//! name. Output is kept as raw bytes; it need not be UTF-8. Secrets are resolved from the launching process's environment,
//! using the secret reference as the variable name.
//!
//! The job stays `Pending` until every shard has exited. Its exit code is the
//! first non-zero shard exit code in shard order, or 0. A shard killed by a
//! signal reports `128 + signal`, as a shell would.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::ClusterBackend;
use super::job::{JobHandle, JobStatus, LogChunk, SubmissionRequest, TaskRequest};
use crate::error::BackendError;

/// Exit code recorded for a shard killed by `cancel`.
const CANCELLED_EXIT_CODE: i32 = 137;

/// Exit code recorded when a shard could not be spawned or waited on.
const SPAWN_FAILED_EXIT_CODE: i32 = 127;

/// Shared state of one local job.
struct LocalJob {
    log: Mutex<Vec<u8>>,
    exit_codes: Mutex<Vec<Option<i32>>>,
    cancel_tx: broadcast::Sender<()>,
}

impl LocalJob {
    fn append_line(&self, task: &str, line: &[u8]) {
        if let Ok(mut log) = self.log.lock() {
            log.extend_from_slice(format!("[{}] ", task).as_bytes());
            log.extend_from_slice(line);
            log.push(b'\n');
        }
    }

    fn record_exit(&self, shard: usize, code: i32) {
        if let Ok(mut codes) = self.exit_codes.lock() {
            codes[shard] = Some(code);
        }
    }

    fn status(&self) -> JobStatus {
        let codes = match self.exit_codes.lock() {
            Ok(codes) => codes.clone(),
            Err(_) => return JobStatus::Pending,
        };
        if codes.iter().any(Option::is_none) {
            return JobStatus::Pending;
        }
        let exit_code = codes.into_iter().flatten().find(|c| *c != 0).unwrap_or(0);
        JobStatus::Exited { exit_code }
    }
}

/// Runs submitted jobs on the local machine.
#[derive(Default)]
pub struct LocalBackend {
    jobs: Mutex<HashMap<String, Arc<LocalJob>>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn job(&self, handle: &JobHandle) -> Result<Arc<LocalJob>, BackendError> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.get(handle.as_str()).cloned())
            .ok_or_else(|| BackendError::JobNotFound(handle.to_string()))
    }
}

fn build_command(task: &TaskRequest) -> Result<Command, BackendError> {
    let (program, args) = task
        .command
        .split_first()
        .ok_or_else(|| BackendError::Spawn(format!("{} has an empty command", task.name)))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(&task.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (name, reference) in &task.secrets {
        match std::env::var(reference) {
            Ok(value) => {
                command.env(name, value);
            }
            Err(_) => warn!(
                task = %task.name,
                secret = %name,
                "Secret reference not found in local environment"
            ),
        }
    }

    Ok(command)
}

fn forward_output<R>(job: Arc<LocalJob>, task: String, stream: Option<R>) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = stream?;
    Some(tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => job.append_line(&task, line.strip_suffix(b"\n").unwrap_or(&line[..])),
                Err(e) => {
                    warn!(task = %task, error = %e, "Failed to read shard output");
                    break;
                }
            }
        }
    }))
}

/// Exit code of a finished shard; signal deaths map to `128 + signal`.
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

async fn run_task(
    job: Arc<LocalJob>,
    shard: usize,
    task: TaskRequest,
    mut cancel_rx: broadcast::Receiver<()>,
) {
    let mut child = match build_command(&task).and_then(|mut c| {
        c.spawn()
            .map_err(|e| BackendError::Spawn(format!("{}: {}", task.name, e)))
    }) {
        Ok(child) => child,
        Err(e) => {
            warn!(task = %task.name, error = %e, "Failed to start shard");
            job.append_line(&task.name, e.to_string().as_bytes());
            job.record_exit(shard, SPAWN_FAILED_EXIT_CODE);
            return;
        }
    };

    let forwarders = [
        forward_output(Arc::clone(&job), task.name.clone(), child.stdout.take()),
        forward_output(Arc::clone(&job), task.name.clone(), child.stderr.take()),
    ];

    let (code, cancelled) = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => (exit_code_of(status), false),
            Err(e) => {
                warn!(task = %task.name, error = %e, "Failed to wait for shard");
                (SPAWN_FAILED_EXIT_CODE, false)
            }
        },
        _ = cancel_rx.recv() => {
            if let Err(e) = child.kill().await {
                warn!(task = %task.name, error = %e, "Failed to kill shard");
            }
            (CANCELLED_EXIT_CODE, true)
        }
    };

    // All output must be in the log before the shard counts as exited.
    // Orphaned children of a killed shard may hold its pipes open, so a
    // cancelled shard drops whatever is still buffered.
    for forwarder in forwarders.into_iter().flatten() {
        if cancelled {
            forwarder.abort();
        } else {
            let _ = forwarder.await;
        }
    }

    debug!(task = %task.name, exit_code = code, "Shard exited");
    job.record_exit(shard, code);
}

#[async_trait]
impl ClusterBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn create_job(&self, request: &SubmissionRequest) -> Result<JobHandle, BackendError> {
        let handle = JobHandle::new(format!("local-{}", Uuid::new_v4()));
        let (cancel_tx, _) = broadcast::channel(1);
        let job = Arc::new(LocalJob {
            log: Mutex::new(Vec::new()),
            exit_codes: Mutex::new(vec![None; request.tasks.len()]),
            cancel_tx,
        });

        self.jobs
            .lock()
            .map_err(|_| BackendError::Spawn("job table lock poisoned".to_string()))?
            .insert(handle.as_str().to_string(), Arc::clone(&job));

        // Subscribe before spawning so a cancel issued right after this
        // returns reaches every shard.
        for (shard, task) in request.tasks.iter().enumerate() {
            let cancel_rx = job.cancel_tx.subscribe();
            tokio::spawn(run_task(Arc::clone(&job), shard, task.clone(), cancel_rx));
        }

        info!(handle = %handle, tasks = request.tasks.len(), "Started local job");
        Ok(handle)
    }

    async fn get_status(&self, handle: &JobHandle) -> Result<JobStatus, BackendError> {
        Ok(self.job(handle)?.status())
    }

    async fn get_logs(&self, handle: &JobHandle, since_offset: u64) -> Result<LogChunk, BackendError> {
        let job = self.job(handle)?;
        let log = job
            .log
            .lock()
            .map_err(|_| BackendError::Parse("log buffer lock poisoned".to_string()))?;

        let start = (since_offset as usize).min(log.len());
        Ok(LogChunk {
            data: log[start..].to_vec(),
            next_offset: log.len() as u64,
        })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), BackendError> {
        let job = self.job(handle)?;
        // No receivers means every shard has already exited.
        let _ = job.cancel_tx.send(());
        info!(handle = %handle, "Cancelled local job");
        Ok(())
    }
}
