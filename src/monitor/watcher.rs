//! The completion-monitor polling loop.
//!
//! Each tick the monitor:
//!
//! 1. checks whether the caller cancelled the watch
//! 2. fetches log bytes past `last_log_offset` and hands them to the callback
//! 3. queries job status once
//!
//! A terminal status ends the loop at once (after one last log fetch so
//! output written just before exit is not lost). Otherwise the monitor
//! sleeps one fixed interval and tries again, until `max_wait` has elapsed.
//! Failed queries are logged and treated as a pending tick; they never
//! extend the deadline. Every query is bounded by the time left before the
//! deadline, so a backend that stops answering still ends in `Timeout`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::clock::{Clock, TokioClock};
use super::state::{MonitorState, Outcome};
use crate::error::MonitorError;
use crate::metrics;
use crate::scheduler::{ClusterBackend, JobHandle, JobStatus, LogChunk};

/// Default interval between status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default deadline for a watch.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Timing parameters of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Fixed interval between ticks.
    pub poll_interval: Duration,
    /// Hard deadline measured from the start of the watch.
    pub max_wait: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl WatchOptions {
    pub fn new(poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            poll_interval,
            max_wait,
        }
    }

    fn validate(&self) -> Result<(), MonitorError> {
        if self.poll_interval.is_zero() {
            return Err(MonitorError::InvalidOptions(
                "poll interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Watches one job at a time until it reaches a terminal outcome.
///
/// Each monitor keeps its own log offset, so several monitors may watch the
/// same handle without coordinating.
pub struct CompletionMonitor {
    backend: Arc<dyn ClusterBackend>,
    options: WatchOptions,
    clock: Arc<dyn Clock>,
    cancel_rx: Option<broadcast::Receiver<()>>,
}

impl CompletionMonitor {
    /// Creates a monitor using the tokio clock.
    pub fn new(backend: Arc<dyn ClusterBackend>, options: WatchOptions) -> Self {
        Self {
            backend,
            options,
            clock: Arc::new(TokioClock::new()),
            cancel_rx: None,
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stops the watch when a message arrives (or the sender is dropped).
    pub fn with_cancellation(mut self, cancel_rx: broadcast::Receiver<()>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    pub fn options(&self) -> &WatchOptions {
        &self.options
    }

    /// Watches `handle` from the beginning of its log.
    ///
    /// # Errors
    ///
    /// - `MonitorError::Cancelled` if the caller cancelled the watch
    /// - `MonitorError::InvalidOptions` for a zero poll interval
    pub async fn watch<F>(
        &mut self,
        handle: &JobHandle,
        on_log_chunk: F,
    ) -> Result<MonitorState, MonitorError>
    where
        F: FnMut(&[u8]) + Send,
    {
        self.watch_from(MonitorState::new(handle.clone()), on_log_chunk)
            .await
    }

    /// Watches starting from an existing state, typically to resume log
    /// delivery at `state.last_log_offset`.
    pub async fn watch_from<F>(
        &mut self,
        mut state: MonitorState,
        mut on_log_chunk: F,
    ) -> Result<MonitorState, MonitorError>
    where
        F: FnMut(&[u8]) + Send,
    {
        self.options.validate()?;

        let started = self.clock.now();
        info!(
            handle = %state.handle,
            backend = self.backend.name(),
            poll_interval = ?self.options.poll_interval,
            max_wait = ?self.options.max_wait,
            "Watching job"
        );

        loop {
            self.check_cancelled(&state)?;

            let budget = self.remaining(started);
            self.poll_logs(&mut state, &mut on_log_chunk, budget).await;

            state.status_queries += 1;
            metrics::record_status_query();
            let budget = self.remaining(started);
            let status = self
                .bounded(budget, self.backend.get_status(&state.handle))
                .await;
            match status {
                Some(Ok(JobStatus::Exited { exit_code })) => {
                    state.outcome = Outcome::from_exit_code(exit_code);
                    // The final drain may outlive the deadline by one interval.
                    let budget = self.remaining(started).max(self.options.poll_interval);
                    self.poll_logs(&mut state, &mut on_log_chunk, budget).await;
                    state.elapsed = self.clock.now().saturating_sub(started);
                    return Ok(self.finish(state));
                }
                Some(Ok(JobStatus::Pending)) => {
                    debug!(handle = %state.handle, tick = state.status_queries, "Job still pending");
                }
                None => {
                    state.transient_errors += 1;
                    metrics::record_transient_error("status");
                    warn!(
                        handle = %state.handle,
                        tick = state.status_queries,
                        "Status query did not answer before the deadline"
                    );
                }
                Some(Err(e)) => {
                    state.transient_errors += 1;
                    metrics::record_transient_error("status");
                    warn!(
                        handle = %state.handle,
                        tick = state.status_queries,
                        error = %e,
                        "Status query failed, will retry next tick"
                    );
                }
            }

            state.elapsed = self.clock.now().saturating_sub(started);
            if state.elapsed >= self.options.max_wait {
                state.outcome = Outcome::Timeout;
                return Ok(self.finish(state));
            }

            let remaining = self.options.max_wait - state.elapsed;
            self.clock
                .sleep(self.options.poll_interval.min(remaining))
                .await;
        }
    }

    fn check_cancelled(&mut self, state: &MonitorState) -> Result<(), MonitorError> {
        let Some(rx) = self.cancel_rx.as_mut() else {
            return Ok(());
        };
        match rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                info!(handle = %state.handle, "Watch cancelled by caller");
                Err(MonitorError::Cancelled {
                    handle: state.handle.to_string(),
                    elapsed: state.elapsed,
                })
            }
            // A lagged receiver has missed at least one cancel message.
            Err(broadcast::error::TryRecvError::Lagged(_)) => Err(MonitorError::Cancelled {
                handle: state.handle.to_string(),
                elapsed: state.elapsed,
            }),
            Err(broadcast::error::TryRecvError::Empty) => Ok(()),
        }
    }

    /// Time left before the deadline.
    fn remaining(&self, started: Duration) -> Duration {
        let elapsed = self.clock.now().saturating_sub(started);
        self.options.max_wait.saturating_sub(elapsed)
    }

    /// Runs `query` unless `budget` passes on the monitor's clock first.
    async fn bounded<T>(&self, budget: Duration, query: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            biased;
            value = query => Some(value),
            _ = self.clock.sleep(budget) => None,
        }
    }

    async fn poll_logs<F>(&self, state: &mut MonitorState, on_log_chunk: &mut F, budget: Duration)
    where
        F: FnMut(&[u8]) + Send,
    {
        let query = self.backend.get_logs(&state.handle, state.last_log_offset);
        let result = self.bounded(budget, query).await;
        match result {
            Some(Ok(chunk)) => {
                let delivered = deliver_new_bytes(state, &chunk, on_log_chunk);
                if delivered > 0 {
                    metrics::record_log_bytes(delivered as u64);
                }
            }
            None => {
                state.transient_errors += 1;
                metrics::record_transient_error("logs");
                warn!(
                    handle = %state.handle,
                    offset = state.last_log_offset,
                    "Log query did not answer before the deadline"
                );
            }
            Some(Err(e)) => {
                state.transient_errors += 1;
                metrics::record_transient_error("logs");
                warn!(
                    handle = %state.handle,
                    offset = state.last_log_offset,
                    error = %e,
                    "Log query failed, will retry next tick"
                );
            }
        }
    }

    fn finish(&self, state: MonitorState) -> MonitorState {
        metrics::record_outcome(state.outcome.label());
        info!(
            handle = %state.handle,
            outcome = %state.outcome,
            elapsed = ?state.elapsed,
            status_queries = state.status_queries,
            transient_errors = state.transient_errors,
            "Watch finished"
        );
        state
    }
}

/// Hands the callback only the bytes past `state.last_log_offset`.
///
/// `chunk` was requested at `state.last_log_offset` and ends at
/// `chunk.next_offset`. If the backend returned bytes from before the
/// requested offset they are trimmed; if it returned fewer bytes than its
/// offset claims, the offset only advances past what was delivered, so the
/// rest is requested again next tick. Returns the number of bytes delivered.
fn deliver_new_bytes<F>(state: &mut MonitorState, chunk: &LogChunk, on_log_chunk: &mut F) -> usize
where
    F: FnMut(&[u8]),
{
    if chunk.next_offset <= state.last_log_offset || chunk.data.is_empty() {
        return 0;
    }

    let fresh = (chunk.next_offset - state.last_log_offset) as usize;
    let data = if chunk.data.len() > fresh {
        &chunk.data[chunk.data.len() - fresh..]
    } else {
        &chunk.data[..]
    };

    on_log_chunk(data);
    state.last_log_offset += data.len() as u64;
    data.len()
}

/// Watches `handle` on `backend` with the tokio clock and no cancellation.
pub async fn watch<F>(
    backend: Arc<dyn ClusterBackend>,
    handle: &JobHandle,
    poll_interval: Duration,
    max_wait: Duration,
    on_log_chunk: F,
) -> Result<MonitorState, MonitorError>
where
    F: FnMut(&[u8]) + Send,
{
    CompletionMonitor::new(backend, WatchOptions::new(poll_interval, max_wait))
        .watch(handle, on_log_chunk)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &[u8], next_offset: u64) -> LogChunk {
        LogChunk {
            data: data.to_vec(),
            next_offset,
        }
    }

    fn deliver(state: &mut MonitorState, c: &LogChunk) -> Vec<u8> {
        let mut out = Vec::new();
        deliver_new_bytes(state, c, &mut |bytes: &[u8]| out.extend_from_slice(bytes));
        out
    }

    #[test]
    fn test_deliver_advances_offset() {
        let mut state = MonitorState::new(JobHandle::new("j"));

        assert_eq!(deliver(&mut state, &chunk(b"hello ", 6)), b"hello ");
        assert_eq!(deliver(&mut state, &chunk(b"world", 11)), b"world");
        assert_eq!(state.last_log_offset, 11);
    }

    #[test]
    fn test_deliver_trims_overlap() {
        let mut state = MonitorState::new(JobHandle::new("j")).with_log_offset(6);

        // Backend resent everything from the start of the log.
        assert_eq!(deliver(&mut state, &chunk(b"hello world", 11)), b"world");
        assert_eq!(state.last_log_offset, 11);
    }

    #[test]
    fn test_deliver_short_chunk_does_not_skip_bytes() {
        let mut state = MonitorState::new(JobHandle::new("j"));

        // Offset claims 10 bytes but only 4 arrived.
        assert_eq!(deliver(&mut state, &chunk(b"abcd", 10)), b"abcd");
        assert_eq!(state.last_log_offset, 4);
    }

    #[test]
    fn test_deliver_ignores_stale_or_empty_chunks() {
        let mut state = MonitorState::new(JobHandle::new("j")).with_log_offset(8);

        assert!(deliver(&mut state, &chunk(b"old", 8)).is_empty());
        assert!(deliver(&mut state, &chunk(b"", 12)).is_empty());
        assert_eq!(state.last_log_offset, 8);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let options = WatchOptions::new(Duration::ZERO, Duration::from_secs(1));
        assert!(matches!(
            options.validate(),
            Err(MonitorError::InvalidOptions(_))
        ));
        assert!(WatchOptions::default().validate().is_ok());
    }
}
