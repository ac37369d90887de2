use std::sync::Arc;

use prospector_core::{NewProspectJob, ProspectJob};
use tracing::info;

use crate::config::WorkerConfig;
use crate::quota::QuotaGuard;
use crate::store::JobStore;
use crate::PipelineError;

/// Validates and enqueues new jobs. Quota is checked here as well as at
/// processing time, so an obviously over-budget request never reaches the
/// queue.
#[derive(Clone)]
pub struct JobSubmitter {
    store: Arc<dyn JobStore>,
    quota: QuotaGuard,
    max_job_size: i32,
    max_attempts: i32,
}

impl JobSubmitter {
    pub fn new(store: Arc<dyn JobStore>, config: &WorkerConfig) -> Self {
        Self {
            quota: QuotaGuard::new(store.clone(), config.daily_quota),
            store,
            max_job_size: config.max_job_size,
            max_attempts: config.max_attempts,
        }
    }

    pub fn max_job_size(&self) -> i32 {
        self.max_job_size
    }

    pub async fn submit(&self, new_job: NewProspectJob) -> Result<ProspectJob, PipelineError> {
        let new_job = normalize_request(new_job, self.max_job_size)?;
        self.quota
            .check_quota(new_job.tenant_id, i64::from(new_job.size), None)
            .await?;
        let job = self.store.create_job(new_job, self.max_attempts).await?;
        info!(job = %job.key(), size = job.size, providers = ?job.providers, "job queued");
        Ok(job)
    }
}

/// Trims the prompt and provider ids, drops repeated providers, and enforces
/// `1 <= size <= max_job_size`.
pub fn normalize_request(
    mut new_job: NewProspectJob,
    max_job_size: i32,
) -> Result<NewProspectJob, PipelineError> {
    new_job.prompt = new_job.prompt.trim().to_string();
    if new_job.prompt.is_empty() {
        return Err(PipelineError::Invalid("prompt must not be empty".into()));
    }
    if new_job.size < 1 || new_job.size > max_job_size {
        return Err(PipelineError::Invalid(format!(
            "size must be between 1 and {max_job_size}"
        )));
    }

    let mut providers: Vec<String> = Vec::with_capacity(new_job.providers.len());
    for id in new_job.providers.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        if !providers.iter().any(|p| p == id) {
            providers.push(id.to_string());
        }
    }
    if providers.is_empty() {
        return Err(PipelineError::Invalid("at least one provider is required".into()));
    }
    new_job.providers = providers;
    Ok(new_job)
}
