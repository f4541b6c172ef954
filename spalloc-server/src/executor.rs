/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Bounded task execution with failure aggregation.
//!
//! [`WorkerPool::submit`] spawns every task at once but lets at most `limit`
//! of them run; [`TaskHandle::join`] waits for all of them and either returns
//! their results in submission order or every failure at once.  One failing
//! board never hides another's failure.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::info;

// ── Failures ──────────────────────────────────────────────────────────────────

/// Why one task did not produce a value.
#[derive(Debug)]
pub enum TaskFailure<E> {
    Failed { index: usize, error: E },
    Panicked { index: usize, message: String },
}

impl<E> TaskFailure<E> {
    pub fn index(&self) -> usize {
        match self {
            TaskFailure::Failed { index, .. } | TaskFailure::Panicked { index, .. } => *index,
        }
    }
}

impl<E: fmt::Display> fmt::Display for TaskFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::Failed { index, error } => write!(f, "task {} failed: {}", index, error),
            TaskFailure::Panicked { index, message } => {
                write!(f, "task {} panicked: {}", index, message)
            }
        }
    }
}

/// Every failure of a batch; the earliest submitted one is `primary`.
#[derive(Debug)]
pub struct AggregateError<E> {
    pub primary: TaskFailure<E>,
    pub suppressed: Vec<TaskFailure<E>>,
}

impl<E> AggregateError<E> {
    pub fn len(&self) -> usize {
        1 + self.suppressed.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskFailure<E>> {
        std::iter::once(&self.primary).chain(self.suppressed.iter())
    }
}

impl<E: fmt::Display> fmt::Display for AggregateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        if !self.suppressed.is_empty() {
            write!(f, " (and {} more failure(s))", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AggregateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.primary {
            TaskFailure::Failed { error, .. } => Some(error),
            TaskFailure::Panicked { .. } => None,
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────────

/// Results of a submitted batch.
pub struct TaskHandle<T, E> {
    handles: Vec<JoinHandle<Result<T, E>>>,
}

impl<T, E> TaskHandle<T, E> {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every task, keeping each outcome in submission order.
    pub async fn settle(self) -> Vec<Result<T, TaskFailure<E>>> {
        let mut outcomes = Vec::with_capacity(self.handles.len());
        for (index, handle) in self.handles.into_iter().enumerate() {
            outcomes.push(match handle.await {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(error)) => Err(TaskFailure::Failed { index, error }),
                Err(join) => Err(TaskFailure::Panicked {
                    index,
                    message: panic_message(join),
                }),
            });
        }
        outcomes
    }

    /// Wait for every task.
    pub async fn join(self) -> Result<Vec<T>, AggregateError<E>> {
        let mut values = Vec::with_capacity(self.handles.len());
        let mut failures = Vec::new();
        for outcome in self.settle().await {
            match outcome {
                Ok(v) => values.push(v),
                Err(failure) => failures.push(failure),
            }
        }
        let mut failures = failures.into_iter();
        match failures.next() {
            None => Ok(values),
            Some(primary) => Err(AggregateError {
                primary,
                suppressed: failures.collect(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl WorkerPool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Start every task; at most `limit` run at once.
    pub fn submit<T, E, F>(&self, tasks: impl IntoIterator<Item = F>) -> TaskHandle<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let handles = tasks
            .into_iter()
            .map(|task| {
                let permits = Arc::clone(&self.permits);
                tokio::spawn(async move {
                    // The semaphore is never closed.
                    let _permit = permits.acquire_owned().await;
                    task.await
                })
            })
            .collect();
        TaskHandle { handles }
    }
}

/// Run every task concurrently with no bound.
pub async fn run_all<T, E, F>(tasks: impl IntoIterator<Item = F>) -> Result<Vec<T>, AggregateError<E>>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let handles = tasks.into_iter().map(tokio::spawn).collect();
    TaskHandle { handles }.join().await
}

// ── Progress ──────────────────────────────────────────────────────────────────

/// Shared completion counter that logs every 10 %.
#[derive(Debug, Clone)]
pub struct Progress {
    label: Arc<str>,
    total: usize,
    done: Arc<AtomicUsize>,
}

impl Progress {
    pub fn new(label: &str, total: usize) -> Self {
        Self {
            label: Arc::from(label),
            total,
            done: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Count one item; returns the percentage when a 10 % step was crossed.
    pub fn step(&self) -> Option<usize> {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        if self.total == 0 {
            return None;
        }
        let before = (done - 1) * 10 / self.total;
        let after = done * 10 / self.total;
        if after > before {
            let percent = (after * 10).min(100);
            info!(task = %self.label, done, total = self.total, percent, "progress");
            Some(percent)
        } else {
            None
        }
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
