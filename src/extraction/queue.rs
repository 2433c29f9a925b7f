//! Debounced per-user extraction jobs.
//!
//! `signal(user)` starts (or extends) a quiet window; the job runs only once
//! the window passes with no further signals, so bursts collapse into one
//! run scheduled after the last signal. At most one run is in flight per
//! user; a signal arriving mid-run schedules exactly one follow-up.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ExtractionStats;
use crate::error::MaisonError;
use crate::store::now_ms;

#[async_trait]
pub trait ExtractionRunner: Send + Sync {
    async fn run(&self, user_id: &str) -> Result<ExtractionStats, MaisonError>;
}

/// Bounded diagnostic record of a job that exhausted its attempts.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub user_id: String,
    pub error: String,
    pub at: i64,
}

const FAILED_TAIL_CAP: usize = 32;

enum JobState {
    Waiting { deadline: Instant },
    Running { resignal: bool },
}

struct QueueInner {
    jobs: Mutex<HashMap<String, JobState>>,
    failed: Mutex<VecDeque<FailedJob>>,
    runner: Arc<dyn ExtractionRunner>,
    debounce: Duration,
    attempts: usize,
}

#[derive(Clone)]
pub struct ExtractionQueue {
    inner: Arc<QueueInner>,
}

impl ExtractionQueue {
    pub fn new(runner: Arc<dyn ExtractionRunner>, debounce: Duration, attempts: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                jobs: Mutex::new(HashMap::new()),
                failed: Mutex::new(VecDeque::new()),
                runner,
                debounce,
                attempts: attempts.max(1),
            }),
        }
    }

    /// Submit (or extend) the debounced job for this user.
    pub fn signal(&self, user_id: &str) {
        let deadline = Instant::now() + self.inner.debounce;
        let mut jobs = self.inner.jobs.lock();
        match jobs.get_mut(user_id) {
            Some(JobState::Waiting { deadline: d }) => {
                *d = deadline;
                debug!(user_id, "extraction signal extends debounce window");
            }
            Some(JobState::Running { resignal }) => {
                *resignal = true;
                debug!(user_id, "extraction signal queued behind running job");
            }
            None => {
                jobs.insert(user_id.to_string(), JobState::Waiting { deadline });
                let inner = self.inner.clone();
                let user = user_id.to_string();
                tokio::spawn(async move { waiter(inner, user).await });
            }
        }
    }

    /// Users with a job waiting or running.
    pub fn depth(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    pub fn failed_tail(&self) -> Vec<FailedJob> {
        self.inner.failed.lock().iter().cloned().collect()
    }

    pub fn is_healthy(&self) -> bool {
        // No separate worker process to probe; health is being able to take
        // the job table lock.
        let _ = self.inner.jobs.lock();
        true
    }

    /// Wait for outstanding jobs to finish, up to `timeout`.
    /// Returns true if the queue drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.depth() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }
}

async fn waiter(inner: Arc<QueueInner>, user_id: String) {
    loop {
        // Debounce: sleep until the deadline stops moving.
        loop {
            let deadline = {
                let mut jobs = inner.jobs.lock();
                match jobs.get(&user_id) {
                    Some(JobState::Waiting { deadline }) => {
                        let deadline = *deadline;
                        if Instant::now() >= deadline {
                            jobs.insert(user_id.clone(), JobState::Running { resignal: false });
                            break;
                        }
                        deadline
                    }
                    _ => return,
                }
            };
            tokio::time::sleep_until(deadline).await;
        }

        let result = (|| inner.runner.run(&user_id))
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(1000))
                    .with_max_times(inner.attempts - 1),
            )
            .notify(|err, dur| {
                warn!(user_id = %user_id, error = %err, retry_after = ?dur, "extraction attempt failed, retrying");
            })
            .await;

        match result {
            Ok(stats) => {
                if stats.messages_marked > 0 || stats.facts > 0 {
                    info!(
                        user_id = %user_id,
                        facts = stats.facts,
                        added = stats.added,
                        updated = stats.updated,
                        deleted = stats.deleted,
                        unchanged = stats.unchanged,
                        marked = stats.messages_marked,
                        "extraction complete"
                    );
                }
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "extraction failed after retries");
                let mut failed = inner.failed.lock();
                failed.push_back(FailedJob {
                    user_id: user_id.clone(),
                    error: e.to_string(),
                    at: now_ms(),
                });
                while failed.len() > FAILED_TAIL_CAP {
                    failed.pop_front();
                }
            }
        }

        // A signal that arrived mid-run gets one fresh debounce cycle.
        let mut jobs = inner.jobs.lock();
        match jobs.get(&user_id) {
            Some(JobState::Running { resignal: true }) => {
                jobs.insert(
                    user_id.clone(),
                    JobState::Waiting { deadline: Instant::now() + inner.debounce },
                );
            }
            _ => {
                jobs.remove(&user_id);
                return;
            }
        }
    }
}
