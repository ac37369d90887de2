use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use prospector_core::{JobKey, JobStatus};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::job::ProspectPipeline;
use crate::store::{ClaimOutcome, JobScope, StoreError};

type TaskOutput = (JobKey, Result<Result<JobStatus, StoreError>, String>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    pub claimed: usize,
    pub lost: usize,
}

/// Bounded-concurrency poller. Every spawned job is tracked in a `JoinSet`
/// and a panicking job is recorded as a failed attempt.
pub struct WorkerLoop {
    pipeline: Arc<ProspectPipeline>,
    scope: JobScope,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerLoop {
    pub fn new(pipeline: Arc<ProspectPipeline>, concurrency: usize, poll_interval: Duration) -> Self {
        Self {
            pipeline,
            scope: JobScope::AllTenants,
            concurrency: concurrency.max(1),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn with_scope(mut self, scope: JobScope) -> Self {
        self.scope = scope;
        self
    }

    /// Polls until `shutdown` resolves, then stops claiming and drains
    /// in-flight jobs.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            concurrency = self.concurrency,
            poll_ms = self.poll_interval.as_millis() as u64,
            "worker loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown requested; draining in-flight jobs");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.settle(joined).await;
                    continue;
                }
                _ = ticker.tick() => {}
            }

            if let Err(err) = self.tick(&mut tasks).await {
                warn!(error = %err, "worker tick failed");
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.settle(joined).await;
        }
        info!("worker loop stopped");
    }

    /// One tick followed by waiting for every job it started.
    pub async fn run_once(&self) -> Result<TickReport, StoreError> {
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let report = self.tick(&mut tasks).await?;
        while let Some(joined) = tasks.join_next().await {
            self.settle(joined).await;
        }
        Ok(report)
    }

    /// Reaps finished jobs, then claims until the in-flight ceiling is hit or
    /// nothing claimable remains.
    async fn tick(&self, tasks: &mut JoinSet<TaskOutput>) -> Result<TickReport, StoreError> {
        while let Some(joined) = tasks.try_join_next() {
            self.settle(joined).await;
        }

        let store = self.pipeline.store();
        let mut report = TickReport::default();
        let mut exclude: Vec<JobKey> = Vec::new();

        while tasks.len() < self.concurrency {
            let Some(key) = store.pick_next(self.scope, &exclude).await? else {
                break;
            };
            match store.claim(key).await? {
                ClaimOutcome::Claimed(job) => {
                    report.claimed += 1;
                    let pipeline = self.pipeline.clone();
                    tasks.spawn(async move {
                        let outcome = AssertUnwindSafe(pipeline.process(job))
                            .catch_unwind()
                            .await
                            .map_err(panic_message);
                        (key, outcome)
                    });
                }
                ClaimOutcome::NotClaimable => {
                    debug!(job = %key, "lost claim race");
                    report.lost += 1;
                    exclude.push(key);
                }
            }
        }

        if report.claimed > 0 || report.lost > 0 {
            debug!(claimed = report.claimed, lost = report.lost, in_flight = tasks.len(), "tick");
        }
        Ok(report)
    }

    async fn settle(&self, joined: Result<TaskOutput, JoinError>) {
        let (key, outcome) = match joined {
            Ok(output) => output,
            Err(err) => {
                error!(error = %err, "worker task aborted");
                return;
            }
        };
        match outcome {
            Ok(Ok(status)) => debug!(job = %key, %status, "job settled"),
            Ok(Err(err)) => error!(job = %key, error = %err, "could not record job outcome"),
            Err(message) => {
                error!(job = %key, panic = %message, "job task panicked");
                let text = format!("worker task panicked: {message}");
                if let Err(err) = self.pipeline.store().mark_failed(key, &text).await {
                    error!(job = %key, error = %err, "could not record panic as failure");
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
