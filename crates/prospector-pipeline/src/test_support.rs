//! Fakes shared by the pipeline's unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use prospector_core::{Candidate, NewProspectJob, ProspectFilters, TenantId};
use prospector_providers::{
    EnrichmentClient, EnrichmentMatch, ProviderClient, ProviderError, ProviderPage,
};

use crate::bulk::{BulkImportReceipt, BulkImportRequest, BulkLeadWriter, BulkWriteError};

pub fn new_job(tenant_id: TenantId, size: i32) -> NewProspectJob {
    NewProspectJob {
        tenant_id,
        actor_id: 42,
        prompt: "finance leaders in Berlin".to_string(),
        size,
        providers: vec!["scripted".to_string()],
        filters: ProspectFilters::default(),
    }
}

pub fn person(i: usize) -> Candidate {
    Candidate::new(
        "scripted",
        Some(format!("Person {i}")),
        Some(format!("person{i}@example.com")),
        Some(format!("+1 555 010 {i:04}")),
        None,
        None,
    )
}

/// Provider that serves generated people, `page_len` per page, until
/// `available` have been handed out.
pub struct ScriptedProvider {
    id: String,
    available: usize,
    page_len: Option<usize>,
    fail: bool,
    calls: AtomicUsize,
    page_sizes: Mutex<Vec<usize>>,
}

impl ScriptedProvider {
    pub fn new(id: &str, available: usize) -> Self {
        Self {
            id: id.to_string(),
            available,
            page_len: None,
            fail: false,
            calls: AtomicUsize::new(0),
            page_sizes: Mutex::new(Vec::new()),
        }
    }

    /// Caps every page at `len` regardless of the requested size.
    pub fn with_page_len(mut self, len: usize) -> Self {
        self.page_len = Some(len);
        self
    }

    pub fn failing(id: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(id, 0)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn page_sizes(&self) -> Vec<usize> {
        self.page_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn search_page(
        &self,
        _query: &str,
        _filters: &ProspectFilters,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<ProviderPage, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.page_sizes.lock().unwrap().push(page_size);
        if self.fail {
            return Err(ProviderError::Message(format!("{} is down", self.id)));
        }
        let offset: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let len = self.page_len.unwrap_or(page_size);
        let end = (offset + len).min(self.available);
        let candidates = (offset..end).map(person).collect();
        Ok(ProviderPage {
            candidates,
            next_cursor: (end < self.available).then(|| end.to_string()),
        })
    }
}

#[derive(Default)]
pub struct ScriptedEnrichment {
    matches: HashMap<String, Option<EnrichmentMatch>>,
    failures: Vec<String>,
    calls: AtomicUsize,
}

impl ScriptedEnrichment {
    pub fn with_match(mut self, email: &str, title: Option<&str>, company: Option<&str>) -> Self {
        self.matches.insert(
            email.to_string(),
            Some(EnrichmentMatch {
                title: title.map(str::to_string),
                company: company.map(str::to_string),
            }),
        );
        self
    }

    pub fn with_failure(mut self, email: &str) -> Self {
        self.failures.push(email.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentClient for ScriptedEnrichment {
    async fn lookup(&self, email: &str) -> Result<Option<EnrichmentMatch>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures.iter().any(|f| f == email) {
            return Err(ProviderError::Message("enrichment unavailable".into()));
        }
        Ok(self.matches.get(email).cloned().flatten())
    }
}

/// Bulk writer that records every request and reports all rows inserted,
/// or a fixed count when configured.
#[derive(Default)]
pub struct RecordingBulkWriter {
    requests: Mutex<Vec<BulkImportRequest>>,
    inserted: Option<i64>,
    fail: bool,
}

impl RecordingBulkWriter {
    pub fn inserting(mut self, inserted: i64) -> Self {
        self.inserted = Some(inserted);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<BulkImportRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BulkLeadWriter for RecordingBulkWriter {
    async fn submit(&self, request: &BulkImportRequest) -> Result<BulkImportReceipt, BulkWriteError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        if self.fail {
            return Err(BulkWriteError::Rejected("import service unavailable".into()));
        }
        Ok(BulkImportReceipt {
            import_id: format!("import-{}", requests.len()),
            inserted: self.inserted.unwrap_or(request.rows.len() as i64),
            duplicates: 0,
            failed: 0,
        })
    }
}
