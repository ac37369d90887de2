//! Prospecting job pipeline: job store, quota, dedup, enrichment, bulk
//! import, and the worker loop that drives them.

use std::sync::Arc;

use anyhow::{Context, Result};
use prospector_fetch::{HttpClientConfig, HttpFetcher};
use prospector_providers::{EnrichmentClient, HttpEnrichmentClient, ProviderError, ProviderRegistry};
use thiserror::Error;
use tracing::{info, warn};

pub mod bulk;
pub mod config;
pub mod dedup;
pub mod enrich;
pub mod job;
pub mod memory;
pub mod pg;
pub mod quota;
pub mod store;
pub mod submit;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use bulk::{BulkLeadWriter, BulkWriteError, BulkWriterBridge, HttpBulkLeadWriter};
pub use config::WorkerConfig;
pub use dedup::{DedupEngine, DedupOutcome};
pub use enrich::EnrichmentStep;
pub use job::{PipelineSettings, ProspectPipeline};
pub use memory::MemoryJobStore;
pub use pg::PgJobStore;
pub use quota::QuotaGuard;
pub use store::{
    CancelOutcome, ClaimOutcome, JobListFilter, JobScope, JobStore, LeadDirectory, StoreError,
};
pub use submit::JobSubmitter;
pub use worker::{TickReport, WorkerLoop};

pub const CRATE_NAME: &str = "prospector-pipeline";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("daily quota exceeded: {used} of {cap} used, {requested} requested")]
    QuotaExceeded { used: i64, cap: i64, requested: i64 },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    BulkWrite(#[from] BulkWriteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid job request: {0}")]
    Invalid(String),
}

pub async fn connect_store(config: &WorkerConfig) -> Result<Arc<PgJobStore>> {
    let max_connections = u32::try_from(config.concurrency * 2 + 2).unwrap_or(u32::MAX);
    let store = PgJobStore::connect(&config.database_url, max_connections)
        .await
        .context("connecting to DATABASE_URL")?;
    Ok(Arc::new(store))
}

/// Wires providers, enrichment and the lead-import writer from config.
pub fn build_pipeline<S>(config: &WorkerConfig, store: Arc<S>) -> Result<ProspectPipeline>
where
    S: JobStore + LeadDirectory + 'static,
{
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?);

    let registry = ProviderRegistry::load(config.providers_file())?;
    let providers = registry.build(http.clone(), &config.workspace_root)?;

    let bulk_url = config
        .bulk_writer_url
        .as_deref()
        .context("PROSPECTOR_BULK_WRITER_URL must be set to run jobs")?;
    let writer = Arc::new(HttpBulkLeadWriter::new(
        bulk_url,
        config.bulk_writer_api_key.clone(),
        http.clone(),
    ));

    let enrichment_client = config.enrichment_url.as_deref().map(|url| {
        Arc::new(HttpEnrichmentClient::new(
            url,
            config.enrichment_api_key.clone(),
            http.clone(),
        )) as Arc<dyn EnrichmentClient>
    });
    if enrichment_client.is_none() {
        info!("PROSPECTOR_ENRICHMENT_URL unset; enrichment disabled");
    }

    let settings = PipelineSettings {
        daily_quota: config.daily_quota,
        page_size: config.page_size,
    };
    Ok(
        ProspectPipeline::new(store.clone(), store, providers, writer, settings).with_enrichment(
            EnrichmentStep::new(enrichment_client, config.enrich_concurrency),
        ),
    )
}

/// Entry point for `prospector-cli work`.
pub async fn run_worker_from_env(once: bool) -> Result<Option<TickReport>> {
    let config = WorkerConfig::from_env();
    let store = connect_store(&config).await?;
    let pipeline = Arc::new(build_pipeline(&config, store)?);
    let worker = WorkerLoop::new(pipeline, config.concurrency, config.poll_interval);

    if once {
        let report = worker.run_once().await?;
        return Ok(Some(report));
    }

    worker
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "could not listen for ctrl-c; running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(None)
}
