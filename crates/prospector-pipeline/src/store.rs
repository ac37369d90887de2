//! Job Store contract shared by the Postgres and in-memory backends.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prospector_core::{
    ActorId, EventLevel, JobKey, JobStatus, NewProspectJob, ProspectEvent, ProspectJob, TenantId,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result of an atomic claim attempt. Losing a race is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(ProspectJob),
    NotClaimable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    NotCancelable(JobStatus),
    NotFound,
}

/// Which tenants a worker polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobScope {
    #[default]
    AllTenants,
    Tenant(TenantId),
}

impl JobScope {
    pub fn tenant(&self) -> Option<TenantId> {
        match self {
            JobScope::AllTenants => None,
            JobScope::Tenant(id) => Some(*id),
        }
    }

    pub fn includes(&self, tenant_id: TenantId) -> bool {
        self.tenant().map_or(true, |id| id == tenant_id)
    }
}

/// Filter for job listings. Each field maps to exactly one column; nothing
/// else is filterable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub actor_id: Option<ActorId>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl Default for JobListFilter {
    fn default() -> Self {
        Self {
            status: None,
            actor_id: None,
            created_after: None,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterColumn {
    Status,
    ActorId,
    CreatedAt,
}

impl FilterColumn {
    pub fn column(&self) -> &'static str {
        match self {
            FilterColumn::Status => "status",
            FilterColumn::ActorId => "actor_id",
            FilterColumn::CreatedAt => "created_at",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterCriterion {
    Equals(FilterColumn, FilterValue),
    After(FilterColumn, DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Text(String),
    BigInt(i64),
}

impl JobListFilter {
    pub fn criteria(&self) -> Vec<FilterCriterion> {
        let mut out = Vec::new();
        if let Some(status) = self.status {
            out.push(FilterCriterion::Equals(
                FilterColumn::Status,
                FilterValue::Text(status.as_str().to_string()),
            ));
        }
        if let Some(actor_id) = self.actor_id {
            out.push(FilterCriterion::Equals(
                FilterColumn::ActorId,
                FilterValue::BigInt(actor_id),
            ));
        }
        if let Some(after) = self.created_after {
            out.push(FilterCriterion::After(FilterColumn::CreatedAt, after));
        }
        out
    }

    pub fn clamped_limit(&self) -> i64 {
        self.limit.clamp(1, 500)
    }

    pub fn matches(&self, job: &ProspectJob) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.actor_id.map_or(true, |a| job.actor_id == a)
            && self.created_after.map_or(true, |t| job.created_at > t)
    }
}

/// Identifiers already present among a tenant's leads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingIdentifiers {
    pub emails: HashSet<String>,
    pub phones: HashSet<String>,
}

/// Final write of a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub inserted_count: i32,
    pub import_job_id: Option<String>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(
        &self,
        new_job: NewProspectJob,
        max_attempts: i32,
    ) -> Result<ProspectJob, StoreError>;

    async fn get_job(&self, key: JobKey) -> Result<Option<ProspectJob>, StoreError>;

    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        filter: &JobListFilter,
    ) -> Result<Vec<ProspectJob>, StoreError>;

    /// Events in ascending time order, optionally only those after `since`.
    async fn list_events(
        &self,
        key: JobKey,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ProspectEvent>, StoreError>;

    async fn cancel_job(&self, key: JobKey) -> Result<CancelOutcome, StoreError>;

    /// Oldest queued job in scope, skipping `exclude`. Takes no locks.
    async fn pick_next(
        &self,
        scope: JobScope,
        exclude: &[JobKey],
    ) -> Result<Option<JobKey>, StoreError>;

    /// Atomically moves a claimable job to `running` and logs "Job started".
    async fn claim(&self, key: JobKey) -> Result<ClaimOutcome, StoreError>;

    async fn append_event(
        &self,
        key: JobKey,
        level: EventLevel,
        message: &str,
        payload: JsonValue,
    ) -> Result<(), StoreError>;

    async fn record_fetched(&self, key: JobKey, total_candidates: i32) -> Result<(), StoreError>;

    async fn record_deduped(
        &self,
        key: JobKey,
        deduped_candidates: i32,
        duplicate_count: i32,
    ) -> Result<(), StoreError>;

    /// Marks a running job `done` and logs a success event. Returns the
    /// job's status afterwards, which stays `canceled` if the job was
    /// canceled mid-flight.
    async fn mark_done(&self, key: JobKey, completion: Completion) -> Result<JobStatus, StoreError>;

    /// Fails the current attempt and logs an error event. The job goes back
    /// to `queued` while attempts remain, otherwise it is terminally `failed`.
    async fn mark_failed(&self, key: JobKey, error_text: &str) -> Result<JobStatus, StoreError>;

    /// Sum of `size` over the tenant's jobs created on the store's current
    /// UTC day.
    async fn quota_usage(
        &self,
        tenant_id: TenantId,
        exclude_job: Option<Uuid>,
    ) -> Result<i64, StoreError>;

    async fn daily_cap_override(&self, tenant_id: TenantId) -> Result<Option<i64>, StoreError>;
}

/// Read-only view of the tenant's persisted leads.
#[async_trait]
pub trait LeadDirectory: Send + Sync {
    /// Returns which of the given normalized emails/phones already exist.
    async fn existing_identifiers(
        &self,
        tenant_id: TenantId,
        emails: &[String],
        phones: &[String],
    ) -> Result<ExistingIdentifiers, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_criteria_only_emit_allow_listed_columns() {
        let filter = JobListFilter {
            status: Some(JobStatus::Failed),
            actor_id: Some(7),
            created_after: None,
            limit: 10,
        };
        let columns = filter
            .criteria()
            .into_iter()
            .map(|c| match c {
                FilterCriterion::Equals(col, _) | FilterCriterion::After(col, _) => col.column(),
            })
            .collect::<Vec<_>>();
        assert_eq!(columns, vec!["status", "actor_id"]);
    }

    #[test]
    fn list_limit_is_clamped() {
        let mut filter = JobListFilter::default();
        filter.limit = 0;
        assert_eq!(filter.clamped_limit(), 1);
        filter.limit = 10_000;
        assert_eq!(filter.clamped_limit(), 500);
    }

    #[test]
    fn scope_includes_matching_tenants_only() {
        assert!(JobScope::AllTenants.includes(4));
        assert!(JobScope::Tenant(4).includes(4));
        assert!(!JobScope::Tenant(4).includes(5));
    }
}
