//! In-process Job Store for tests and local runs without Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prospector_core::{
    normalize_email, normalize_phone, EventLevel, JobKey, JobStatus, NewProspectJob,
    ProspectEvent, ProspectJob, TenantId,
};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::pg::completion_message;
use crate::store::{
    CancelOutcome, ClaimOutcome, Completion, ExistingIdentifiers, JobListFilter, JobScope,
    JobStore, LeadDirectory, StoreError,
};

#[derive(Debug, Clone)]
struct LeadIdentity {
    tenant_id: TenantId,
    email: Option<String>,
    phone: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    // Insertion order doubles as creation order.
    jobs: Vec<ProspectJob>,
    events: Vec<ProspectEvent>,
    next_event_id: i64,
    leads: Vec<LeadIdentity>,
    caps: HashMap<TenantId, i64>,
}

impl State {
    fn job_mut(&mut self, key: JobKey) -> Option<&mut ProspectJob> {
        self.jobs.iter_mut().find(|j| j.key() == key)
    }

    fn push_event(&mut self, key: JobKey, level: EventLevel, message: &str, payload: JsonValue) {
        self.next_event_id += 1;
        self.events.push(ProspectEvent {
            id: self.next_event_id,
            job_id: key.job_id,
            tenant_id: key.tenant_id,
            created_at: Utc::now(),
            level,
            message: message.to_string(),
            payload,
        });
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an existing lead for duplicate detection.
    pub async fn seed_lead(&self, tenant_id: TenantId, email: Option<&str>, phone: Option<&str>) {
        self.state.lock().await.leads.push(LeadIdentity {
            tenant_id,
            email: email.and_then(normalize_email),
            phone: phone.and_then(normalize_phone),
        });
    }

    pub async fn set_daily_cap(&self, tenant_id: TenantId, daily_cap: i64) {
        self.state.lock().await.caps.insert(tenant_id, daily_cap);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(
        &self,
        new_job: NewProspectJob,
        max_attempts: i32,
    ) -> Result<ProspectJob, StoreError> {
        let job = ProspectJob {
            id: Uuid::new_v4(),
            tenant_id: new_job.tenant_id,
            actor_id: new_job.actor_id,
            prompt: new_job.prompt,
            size: new_job.size,
            providers: new_job.providers,
            filters: new_job.filters,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            error_text: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            total_candidates: 0,
            deduped_candidates: 0,
            duplicate_count: 0,
            inserted_count: 0,
            import_job_id: None,
        };
        let mut state = self.state.lock().await;
        state.jobs.push(job.clone());
        state.push_event(
            job.key(),
            EventLevel::Info,
            "Job queued",
            json!({ "size": job.size, "providers": job.providers }),
        );
        Ok(job)
    }

    async fn get_job(&self, key: JobKey) -> Result<Option<ProspectJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().find(|j| j.key() == key).cloned())
    }

    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        filter: &JobListFilter,
    ) -> Result<Vec<ProspectJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .rev()
            .filter(|j| j.tenant_id == tenant_id && filter.matches(j))
            .take(filter.clamped_limit() as usize)
            .cloned()
            .collect())
    }

    async fn list_events(
        &self,
        key: JobKey,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ProspectEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.tenant_id == key.tenant_id && e.job_id == key.job_id)
            .filter(|e| since.map_or(true, |t| e.created_at > t))
            .take(limit.clamp(1, 1000) as usize)
            .cloned()
            .collect())
    }

    async fn cancel_job(&self, key: JobKey) -> Result<CancelOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.job_mut(key) else {
            return Ok(CancelOutcome::NotFound);
        };
        if !job.status.is_cancelable() {
            return Ok(CancelOutcome::NotCancelable(job.status));
        }
        job.status = JobStatus::Canceled;
        job.finished_at = Some(Utc::now());
        state.push_event(key, EventLevel::Info, "Job canceled", json!({}));
        Ok(CancelOutcome::Canceled)
    }

    async fn pick_next(
        &self,
        scope: JobScope,
        exclude: &[JobKey],
    ) -> Result<Option<JobKey>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Queued && scope.includes(j.tenant_id))
            .map(ProspectJob::key)
            .find(|k| !exclude.contains(k)))
    }

    async fn claim(&self, key: JobKey) -> Result<ClaimOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.job_mut(key) else {
            return Ok(ClaimOutcome::NotClaimable);
        };
        if !job.is_claimable() {
            return Ok(ClaimOutcome::NotClaimable);
        }
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.started_at = Some(Utc::now());
        job.finished_at = None;
        job.error_text = None;
        let claimed = job.clone();
        state.push_event(
            key,
            EventLevel::Info,
            "Job started",
            json!({ "attempt": claimed.attempts, "max_attempts": claimed.max_attempts }),
        );
        Ok(ClaimOutcome::Claimed(claimed))
    }

    async fn append_event(
        &self,
        key: JobKey,
        level: EventLevel,
        message: &str,
        payload: JsonValue,
    ) -> Result<(), StoreError> {
        self.state.lock().await.push_event(key, level, message, payload);
        Ok(())
    }

    async fn record_fetched(&self, key: JobKey, total_candidates: i32) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.job_mut(key).filter(|j| j.status == JobStatus::Running) {
            job.total_candidates = total_candidates;
        }
        Ok(())
    }

    async fn record_deduped(
        &self,
        key: JobKey,
        deduped_candidates: i32,
        duplicate_count: i32,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.job_mut(key).filter(|j| j.status == JobStatus::Running) {
            job.deduped_candidates = deduped_candidates;
            job.duplicate_count = duplicate_count;
        }
        Ok(())
    }

    async fn mark_done(&self, key: JobKey, completion: Completion) -> Result<JobStatus, StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .job_mut(key)
            .ok_or_else(|| StoreError::Corrupt(format!("job {key} vanished")))?;
        if job.status != JobStatus::Running {
            let status = job.status;
            state.push_event(
                key,
                EventLevel::Debug,
                "Attempt finished after the job left running; result not recorded",
                json!({ "status": status.as_str(), "import_job_id": completion.import_job_id }),
            );
            return Ok(status);
        }
        job.status = JobStatus::Done;
        job.finished_at = Some(Utc::now());
        job.inserted_count = completion.inserted_count;
        job.import_job_id = completion.import_job_id.clone();
        state.push_event(
            key,
            EventLevel::Success,
            &completion_message(&completion),
            json!({
                "import_job_id": completion.import_job_id,
                "inserted_count": completion.inserted_count,
            }),
        );
        Ok(JobStatus::Done)
    }

    async fn mark_failed(&self, key: JobKey, error_text: &str) -> Result<JobStatus, StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .job_mut(key)
            .ok_or_else(|| StoreError::Corrupt(format!("job {key} vanished")))?;
        let (status, payload) = if job.status == JobStatus::Running {
            let requeue = job.has_attempts_left();
            job.status = if requeue {
                JobStatus::Queued
            } else {
                JobStatus::Failed
            };
            job.finished_at = (!requeue).then(Utc::now);
            job.error_text = Some(error_text.to_string());
            (
                job.status,
                json!({
                    "attempt": job.attempts,
                    "max_attempts": job.max_attempts,
                    "requeued": requeue,
                }),
            )
        } else {
            (
                job.status,
                json!({ "status": job.status.as_str(), "requeued": false }),
            )
        };
        state.push_event(key, EventLevel::Error, error_text, payload);
        Ok(status)
    }

    async fn quota_usage(
        &self,
        tenant_id: TenantId,
        exclude_job: Option<Uuid>,
    ) -> Result<i64, StoreError> {
        let day = Utc::now().date_naive();
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|j| j.tenant_id == tenant_id && j.created_at.date_naive() == day)
            .filter(|j| exclude_job != Some(j.id))
            .map(|j| i64::from(j.size))
            .sum())
    }

    async fn daily_cap_override(&self, tenant_id: TenantId) -> Result<Option<i64>, StoreError> {
        Ok(self.state.lock().await.caps.get(&tenant_id).copied())
    }
}

#[async_trait]
impl LeadDirectory for MemoryJobStore {
    async fn existing_identifiers(
        &self,
        tenant_id: TenantId,
        emails: &[String],
        phones: &[String],
    ) -> Result<ExistingIdentifiers, StoreError> {
        let state = self.state.lock().await;
        let mut out = ExistingIdentifiers::default();
        for lead in state.leads.iter().filter(|l| l.tenant_id == tenant_id) {
            if let Some(email) = lead.email.as_ref().filter(|e| emails.contains(e)) {
                out.emails.insert(email.clone());
            }
            if let Some(phone) = lead.phone.as_ref().filter(|p| phones.contains(p)) {
                out.phones.insert(phone.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::new_job;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let store = Arc::new(MemoryJobStore::new());
        let job = store.create_job(new_job(1, 10), 3).await.unwrap();

        let (a, b) = tokio::join!(store.claim(job.key()), store.claim(job.key()));
        let wins = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
            .count();
        assert_eq!(wins, 1);

        let stored = store.get_job(job.key()).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn failure_requeues_until_the_ceiling() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(1, 10), 2).await.unwrap();
        let key = job.key();

        assert!(matches!(store.claim(key).await.unwrap(), ClaimOutcome::Claimed(_)));
        assert_eq!(store.mark_failed(key, "boom").await.unwrap(), JobStatus::Queued);
        let requeued = store.get_job(key).await.unwrap().unwrap();
        assert_eq!(requeued.finished_at, None);
        assert_eq!(requeued.error_text.as_deref(), Some("boom"));

        assert!(matches!(store.claim(key).await.unwrap(), ClaimOutcome::Claimed(_)));
        assert_eq!(store.mark_failed(key, "boom again").await.unwrap(), JobStatus::Failed);
        let failed = store.get_job(key).await.unwrap().unwrap();
        assert!(failed.finished_at.is_some());
        assert_eq!(failed.attempts, 2);

        assert_eq!(store.claim(key).await.unwrap(), ClaimOutcome::NotClaimable);
        assert_eq!(store.pick_next(JobScope::AllTenants, &[]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancel_is_final_for_later_writes() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(1, 10), 3).await.unwrap();
        let key = job.key();
        store.claim(key).await.unwrap();

        assert_eq!(store.cancel_job(key).await.unwrap(), CancelOutcome::Canceled);
        let status = store
            .mark_done(
                key,
                Completion {
                    inserted_count: 3,
                    import_job_id: Some("imp".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Canceled);
        assert_eq!(
            store.cancel_job(key).await.unwrap(),
            CancelOutcome::NotCancelable(JobStatus::Canceled)
        );
        assert_eq!(
            store.cancel_job(JobKey::new(1, Uuid::new_v4())).await.unwrap(),
            CancelOutcome::NotFound
        );
        let stored = store.get_job(key).await.unwrap().unwrap();
        assert_eq!(stored.import_job_id, None);
    }

    #[tokio::test]
    async fn pick_next_is_oldest_first_and_honors_scope_and_exclusions() {
        let store = MemoryJobStore::new();
        let a = store.create_job(new_job(1, 1), 3).await.unwrap();
        let b = store.create_job(new_job(2, 1), 3).await.unwrap();
        let c = store.create_job(new_job(1, 1), 3).await.unwrap();

        assert_eq!(
            store.pick_next(JobScope::AllTenants, &[]).await.unwrap(),
            Some(a.key())
        );
        assert_eq!(
            store.pick_next(JobScope::AllTenants, &[a.key()]).await.unwrap(),
            Some(b.key())
        );
        assert_eq!(
            store.pick_next(JobScope::Tenant(1), &[a.key()]).await.unwrap(),
            Some(c.key())
        );
    }

    #[tokio::test]
    async fn events_are_ascending_and_filterable_by_time() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(1, 1), 3).await.unwrap();
        let key = job.key();
        store.claim(key).await.unwrap();
        store
            .append_event(key, EventLevel::Info, "Fetched 0 candidates", json!({}))
            .await
            .unwrap();

        let all = store.list_events(key, None, 100).await.unwrap();
        let messages: Vec<_> = all.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["Job queued", "Job started", "Fetched 0 candidates"]);
        assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let later = store
            .list_events(key, Some(all[0].created_at - chrono::Duration::seconds(1)), 2)
            .await
            .unwrap();
        assert_eq!(later.len(), 2);
    }

    #[tokio::test]
    async fn list_jobs_is_newest_first_and_filtered() {
        let store = MemoryJobStore::new();
        let first = store.create_job(new_job(1, 1), 3).await.unwrap();
        let second = store.create_job(new_job(1, 1), 3).await.unwrap();
        store.create_job(new_job(2, 1), 3).await.unwrap();
        store.cancel_job(first.key()).await.unwrap();

        let all = store.list_jobs(1, &JobListFilter::default()).await.unwrap();
        assert_eq!(
            all.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );

        let canceled = store
            .list_jobs(
                1,
                &JobListFilter {
                    status: Some(JobStatus::Canceled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].id, first.id);
    }
}
