//! Chunked batch execution with per-item outcomes
//!
//! Targets are split into consecutive chunks. Items inside a chunk run
//! concurrently; chunks run one after another. Every item contributes
//! exactly one outcome: a failing item is recorded and never aborts its
//! siblings or later chunks.

use std::future::Future;
use std::ops::Range;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::errors::{AppError, AppResult};

/// One failed target and the failure's message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure<T> {
    pub target: T,
    pub error: String,
}

/// Aggregate outcome of a batch
///
/// `success_count + failure_count` always equals the number of targets.
/// Failures keep input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult<T> {
    pub success_count: usize,
    pub failure_count: usize,
    pub failures: Vec<BatchFailure<T>>,
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            failures: Vec::new(),
        }
    }
}

/// Runs one operation over many targets in bounded-concurrency chunks
#[derive(Debug, Clone, Default)]
pub struct BatchExecutor {
    item_timeout: Option<Duration>,
}

impl BatchExecutor {
    /// `item_timeout` bounds each item; a timed-out item counts as failed
    pub fn new(item_timeout: Option<Duration>) -> Self {
        Self { item_timeout }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let timeout = (config.batch_item_timeout_ms > 0)
            .then(|| Duration::from_millis(config.batch_item_timeout_ms));
        Self::new(timeout)
    }

    /// Apply `op` to every target
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` only when `chunk_size` is zero. Per-item
    /// failures are reported in the result, never returned.
    pub async fn run<T, F, Fut>(
        &self,
        targets: &[T],
        chunk_size: usize,
        op: F,
    ) -> AppResult<BatchResult<T>>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = AppResult<()>>,
    {
        let ranges = chunk_ranges(targets.len(), chunk_size)?;
        let mut result = BatchResult::default();

        for (chunk_idx, range) in ranges.into_iter().enumerate() {
            debug!(
                chunk = chunk_idx,
                start = range.start,
                len = range.len(),
                "dispatching batch chunk"
            );
            let chunk = &targets[range];
            let outcomes = join_all(chunk.iter().map(|t| self.run_item(op(t.clone())))).await;

            for (target, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => result.success_count += 1,
                    Err(e) => {
                        warn!(chunk = chunk_idx, error = %e, "batch item failed");
                        result.failure_count += 1;
                        result.failures.push(BatchFailure {
                            target: target.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        Ok(result)
    }

    async fn run_item<Fut>(&self, fut: Fut) -> AppResult<()>
    where
        Fut: Future<Output = AppResult<()>>,
    {
        match self.item_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                Err(AppError::Timeout(format!(
                    "item did not complete within {} ms",
                    limit.as_millis()
                )))
            }),
            None => fut.await,
        }
    }
}

/// Consecutive index ranges of at most `chunk_size` covering `0..len`
///
/// # Errors
///
/// Returns `InvalidInput` if `chunk_size` is zero.
pub fn chunk_ranges(len: usize, chunk_size: usize) -> AppResult<Vec<Range<usize>>> {
    if chunk_size == 0 {
        return Err(AppError::invalid("chunk size must be at least 1"));
    }
    Ok((0..len)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(len))
        .collect())
}
