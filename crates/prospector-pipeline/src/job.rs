use std::sync::Arc;

use prospector_core::{Candidate, EventLevel, JobStatus, ProspectJob};
use prospector_providers::ProviderSet;
use serde_json::json;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bulk::{BulkLeadWriter, BulkWriterBridge};
use crate::dedup::DedupEngine;
use crate::enrich::EnrichmentStep;
use crate::quota::QuotaGuard;
use crate::store::{Completion, JobStore, LeadDirectory, StoreError};
use crate::PipelineError;

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub daily_quota: i64,
    pub page_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            daily_quota: 500,
            page_size: 25,
        }
    }
}

/// Drives one claimed job through its stages:
/// quota, provider pages, dedup, enrichment, bulk write.
pub struct ProspectPipeline {
    store: Arc<dyn JobStore>,
    quota: QuotaGuard,
    providers: ProviderSet,
    dedup: DedupEngine,
    enrichment: EnrichmentStep,
    bulk: BulkWriterBridge,
    page_size: usize,
}

impl ProspectPipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        leads: Arc<dyn LeadDirectory>,
        providers: ProviderSet,
        bulk_writer: Arc<dyn BulkLeadWriter>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            quota: QuotaGuard::new(store.clone(), settings.daily_quota),
            store,
            providers,
            dedup: DedupEngine::new(leads),
            enrichment: EnrichmentStep::disabled(),
            bulk: BulkWriterBridge::new(bulk_writer),
            page_size: settings.page_size.max(1),
        }
    }

    pub fn with_enrichment(mut self, enrichment: EnrichmentStep) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Runs one attempt of a job the caller has already claimed and records
    /// the outcome. Stage failures become job failures; only store errors
    /// surface to the caller.
    pub async fn process(&self, job: ProspectJob) -> Result<JobStatus, StoreError> {
        let key = job.key();
        let span = info_span!(
            "prospect_job",
            tenant_id = job.tenant_id,
            job_id = %job.id,
            attempt = job.attempts
        );
        async move {
            match self.execute(&job).await {
                Ok(completion) => {
                    let status = self.store.mark_done(key, completion).await?;
                    info!(%status, "job attempt finished");
                    Ok(status)
                }
                Err(err) => {
                    warn!(error = %err, "job attempt failed");
                    let status = self.store.mark_failed(key, &err.to_string()).await?;
                    if status == JobStatus::Queued {
                        info!(attempts = job.attempts, max_attempts = job.max_attempts, "job requeued");
                    }
                    Ok(status)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, job: &ProspectJob) -> Result<Completion, PipelineError> {
        let key = job.key();
        self.quota
            .check_quota(job.tenant_id, i64::from(job.size), Some(job.id))
            .await?;

        let candidates = self.fetch_candidates(job).await?;
        let total = count(candidates.len());
        self.store.record_fetched(key, total).await?;
        self.store
            .append_event(
                key,
                EventLevel::Info,
                &format!("Fetched {total} candidates"),
                json!({ "total_candidates": total, "providers": job.providers }),
            )
            .await?;

        let outcome = self.dedup.partition(job.tenant_id, candidates).await?;
        let unique = count(outcome.unique.len());
        let duplicates = count(outcome.duplicates.len());
        self.store.record_deduped(key, unique, duplicates).await?;
        self.store
            .append_event(
                key,
                EventLevel::Info,
                &format!("Deduplicated to {unique} unique"),
                json!({ "deduped_candidates": unique, "duplicate_count": duplicates }),
            )
            .await?;

        let candidates = if self.enrichment.is_enabled() {
            let (enriched, report) = self.enrichment.enrich(outcome.unique).await;
            self.store
                .append_event(
                    key,
                    EventLevel::Debug,
                    &format!("Enriched {} candidates", report.enriched),
                    json!({
                        "looked_up": report.looked_up,
                        "enriched": report.enriched,
                        "failed": report.failed,
                    }),
                )
                .await?;
            enriched
        } else {
            outcome.unique
        };

        let written = self
            .bulk
            .write_candidates(key, job.actor_id, &candidates)
            .await?;
        Ok(Completion {
            inserted_count: written.written_count,
            import_job_id: written.import_ref,
        })
    }

    /// Pages through the job's providers in order until `size` candidates are
    /// collected. A provider is done when it returns no cursor or a short page.
    async fn fetch_candidates(&self, job: &ProspectJob) -> Result<Vec<Candidate>, PipelineError> {
        let target = usize::try_from(job.size).unwrap_or(0);
        let mut collected: Vec<Candidate> = Vec::with_capacity(target);

        for provider_id in &job.providers {
            if collected.len() >= target {
                break;
            }
            let client = self.providers.client_for(provider_id)?;
            let mut cursor: Option<String> = None;
            loop {
                let remaining = target.saturating_sub(collected.len());
                if remaining == 0 {
                    break;
                }
                let page_size = self.page_size.min(remaining);
                let page = client
                    .search_page(&job.prompt, &job.filters, page_size, cursor.as_deref())
                    .await?;
                let short = page.candidates.len() < page_size;
                debug!(
                    provider = provider_id.as_str(),
                    received = page.candidates.len(),
                    page_size,
                    "provider page"
                );
                collected.extend(page.candidates);
                match page.next_cursor {
                    Some(next) if !short => cursor = Some(next),
                    _ => break,
                }
            }
        }

        collected.truncate(target);
        Ok(collected)
    }
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
