//! Hand-off of final candidates to the lead-import service.

use std::sync::Arc;

use async_trait::async_trait;
use prospector_core::{ActorId, Candidate, JobKey, TenantId};
use prospector_fetch::{sha256_hex, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const IMPORT_SOURCE: &str = "prospecting";

#[derive(Debug, Error)]
pub enum BulkWriteError {
    #[error("lead import request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("serializing lead rows: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("lead import rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadRow {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub source: String,
}

impl From<&Candidate> for LeadRow {
    fn from(candidate: &Candidate) -> Self {
        Self {
            name: candidate.name.clone(),
            email: candidate.email.clone(),
            phone: candidate.phone.clone(),
            company: candidate.company.clone(),
            title: candidate.title.clone(),
            source: candidate.source.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkImportRequest {
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    pub auto_enrich: bool,
    pub source: String,
    pub rows: Vec<LeadRow>,
    #[serde(skip)]
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct BulkImportReceipt {
    #[serde(alias = "id")]
    pub import_id: String,
    #[serde(default)]
    pub inserted: i64,
    #[serde(default)]
    pub duplicates: i64,
    #[serde(default)]
    pub failed: i64,
}

/// The lead-import collaborator. Implementations must treat a repeated
/// idempotency key as the same import.
#[async_trait]
pub trait BulkLeadWriter: Send + Sync {
    async fn submit(&self, request: &BulkImportRequest) -> Result<BulkImportReceipt, BulkWriteError>;
}

/// `POST {base_url}/imports` on the lead-import service.
pub struct HttpBulkLeadWriter {
    base_url: String,
    api_key: Option<String>,
    http: Arc<HttpFetcher>,
}

impl HttpBulkLeadWriter {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
        }
    }
}

#[async_trait]
impl BulkLeadWriter for HttpBulkLeadWriter {
    async fn submit(&self, request: &BulkImportRequest) -> Result<BulkImportReceipt, BulkWriteError> {
        let url = format!("{}/imports", self.base_url);
        let receipt: BulkImportReceipt = self
            .http
            .post_json(
                "bulk-writer",
                &url,
                self.api_key.as_deref(),
                request,
                Some(&request.idempotency_key),
            )
            .await?;
        if receipt.import_id.trim().is_empty() {
            return Err(BulkWriteError::Rejected(
                "lead import returned no import id".to_string(),
            ));
        }
        Ok(receipt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWriteResult {
    pub import_ref: Option<String>,
    pub written_count: i32,
}

#[derive(Clone)]
pub struct BulkWriterBridge {
    writer: Arc<dyn BulkLeadWriter>,
}

impl BulkWriterBridge {
    pub fn new(writer: Arc<dyn BulkLeadWriter>) -> Self {
        Self { writer }
    }

    pub async fn write_candidates(
        &self,
        key: JobKey,
        actor_id: ActorId,
        candidates: &[Candidate],
    ) -> Result<BulkWriteResult, BulkWriteError> {
        if candidates.is_empty() {
            return Ok(BulkWriteResult {
                import_ref: None,
                written_count: 0,
            });
        }

        let request = build_request(key, actor_id, candidates)?;
        let receipt = self.writer.submit(&request).await?;
        let written_count = clamp_written(receipt.inserted, candidates.len());
        info!(
            job = %key,
            import_id = %receipt.import_id,
            inserted = receipt.inserted,
            duplicates = receipt.duplicates,
            failed = receipt.failed,
            "lead import accepted"
        );
        Ok(BulkWriteResult {
            import_ref: Some(receipt.import_id),
            written_count,
        })
    }
}

/// The idempotency key hashes the job id with the serialized rows, so a
/// retried attempt producing the same rows maps to the same import.
pub fn build_request(
    key: JobKey,
    actor_id: ActorId,
    candidates: &[Candidate],
) -> Result<BulkImportRequest, BulkWriteError> {
    let rows: Vec<LeadRow> = candidates.iter().map(LeadRow::from).collect();
    let mut material = key.job_id.as_bytes().to_vec();
    material.extend(serde_json::to_vec(&rows)?);
    Ok(BulkImportRequest {
        tenant_id: key.tenant_id,
        actor_id,
        auto_enrich: false,
        source: IMPORT_SOURCE.to_string(),
        rows,
        idempotency_key: sha256_hex(&material),
    })
}

fn clamp_written(inserted: i64, candidates: usize) -> i32 {
    let ceiling = i32::try_from(candidates).unwrap_or(i32::MAX);
    i32::try_from(inserted.max(0)).unwrap_or(i32::MAX).min(ceiling)
}
