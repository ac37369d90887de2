//! Postgres Job Store. Claiming relies on `FOR UPDATE SKIP LOCKED`, so any
//! number of worker processes can share one database.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prospector_core::{
    EventLevel, JobKey, JobStatus, NewProspectJob, ProspectEvent, ProspectFilters, ProspectJob,
    TenantId,
};
use serde_json::{json, Value as JsonValue};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::store::{
    CancelOutcome, ClaimOutcome, Completion, ExistingIdentifiers, FilterCriterion, FilterValue,
    JobListFilter, JobScope, JobStore, LeadDirectory, StoreError,
};

const JOB_COLUMNS: &str = "tenant_id, id, actor_id, prompt, size, providers, filters, status, \
     attempts, max_attempts, error_text, created_at, started_at, finished_at, total_candidates, \
     deduped_candidates, duplicate_count, inserted_count, import_job_id";

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(2))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn current_status(&self, key: JobKey) -> Result<Option<JobStatus>, StoreError> {
        let row = sqlx::query("SELECT status FROM prospect_jobs WHERE tenant_id = $1 AND id = $2")
            .bind(key.tenant_id)
            .bind(key.job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_status(&r.try_get::<String, _>("status")?))
            .transpose()
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("job status: {e}")))
}

fn job_from_row(row: &PgRow) -> Result<ProspectJob, StoreError> {
    let filters: Json<ProspectFilters> = row.try_get("filters")?;
    Ok(ProspectJob {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        actor_id: row.try_get("actor_id")?,
        prompt: row.try_get("prompt")?,
        size: row.try_get("size")?,
        providers: row.try_get("providers")?,
        filters: filters.0,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        error_text: row.try_get("error_text")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        total_candidates: row.try_get("total_candidates")?,
        deduped_candidates: row.try_get("deduped_candidates")?,
        duplicate_count: row.try_get("duplicate_count")?,
        inserted_count: row.try_get("inserted_count")?,
        import_job_id: row.try_get("import_job_id")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<ProspectEvent, StoreError> {
    let level: String = row.try_get("level")?;
    Ok(ProspectEvent {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        tenant_id: row.try_get("tenant_id")?,
        created_at: row.try_get("created_at")?,
        level: level
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("event level: {e}")))?,
        message: row.try_get("message")?,
        payload: row.try_get("payload")?,
    })
}

async fn insert_event<'e, E: PgExecutor<'e>>(
    exe: E,
    key: JobKey,
    level: EventLevel,
    message: &str,
    payload: JsonValue,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO prospect_events (tenant_id, job_id, level, message, payload)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(key.tenant_id)
    .bind(key.job_id)
    .bind(level.as_str())
    .bind(message)
    .bind(payload)
    .execute(exe)
    .await?;
    Ok(())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(
        &self,
        new_job: NewProspectJob,
        max_attempts: i32,
    ) -> Result<ProspectJob, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO prospect_jobs \
                 (tenant_id, id, actor_id, prompt, size, providers, filters, max_attempts) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(new_job.tenant_id)
            .bind(Uuid::new_v4())
            .bind(new_job.actor_id)
            .bind(&new_job.prompt)
            .bind(new_job.size)
            .bind(&new_job.providers)
            .bind(Json(&new_job.filters))
            .bind(max_attempts.max(1))
            .fetch_one(&mut *tx)
            .await?;
        let job = job_from_row(&row)?;
        insert_event(
            &mut *tx,
            job.key(),
            EventLevel::Info,
            "Job queued",
            json!({ "size": job.size, "providers": job.providers }),
        )
        .await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn get_job(&self, key: JobKey) -> Result<Option<ProspectJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM prospect_jobs WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(key.tenant_id)
            .bind(key.job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        filter: &JobListFilter,
    ) -> Result<Vec<ProspectJob>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {JOB_COLUMNS} FROM prospect_jobs WHERE tenant_id = "
        ));
        qb.push_bind(tenant_id);
        for criterion in filter.criteria() {
            match criterion {
                FilterCriterion::Equals(column, value) => {
                    qb.push(" AND ").push(column.column()).push(" = ");
                    match value {
                        FilterValue::Text(text) => qb.push_bind(text),
                        FilterValue::BigInt(n) => qb.push_bind(n),
                    };
                }
                FilterCriterion::After(column, at) => {
                    qb.push(" AND ").push(column.column()).push(" > ").push_bind(at);
                }
            }
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(filter.clamped_limit());

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_events(
        &self,
        key: JobKey,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<ProspectEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, job_id, created_at, level, message, payload
              FROM prospect_events
             WHERE tenant_id = $1
               AND job_id = $2
               AND ($3::timestamptz IS NULL OR created_at > $3)
             ORDER BY created_at ASC, id ASC
             LIMIT $4
            "#,
        )
        .bind(key.tenant_id)
        .bind(key.job_id)
        .bind(since)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self), fields(job = %key))]
    async fn cancel_job(&self, key: JobKey) -> Result<CancelOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE prospect_jobs
               SET status = 'canceled',
                   finished_at = now()
             WHERE tenant_id = $1
               AND id = $2
               AND status IN ('queued', 'running')
            RETURNING status
            "#,
        )
        .bind(key.tenant_id)
        .bind(key.job_id)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            tx.rollback().await?;
            return Ok(match self.current_status(key).await? {
                Some(status) => CancelOutcome::NotCancelable(status),
                None => CancelOutcome::NotFound,
            });
        }

        insert_event(&mut *tx, key, EventLevel::Info, "Job canceled", json!({})).await?;
        tx.commit().await?;
        Ok(CancelOutcome::Canceled)
    }

    async fn pick_next(
        &self,
        scope: JobScope,
        exclude: &[JobKey],
    ) -> Result<Option<JobKey>, StoreError> {
        let excluded: Vec<Uuid> = exclude.iter().map(|k| k.job_id).collect();
        let row = sqlx::query(
            r#"
            SELECT tenant_id, id
              FROM prospect_jobs
             WHERE status = 'queued'
               AND ($1::bigint IS NULL OR tenant_id = $1)
               AND NOT (id = ANY($2))
             ORDER BY created_at ASC, id ASC
             LIMIT 1
            "#,
        )
        .bind(scope.tenant())
        .bind(&excluded)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<JobKey, StoreError> {
            Ok(JobKey::new(r.try_get("tenant_id")?, r.try_get("id")?))
        })
        .transpose()
    }

    #[instrument(skip(self), fields(job = %key))]
    async fn claim(&self, key: JobKey) -> Result<ClaimOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Rows held by another worker's transaction are skipped, not waited on.
        let locked = sqlx::query(
            r#"
            SELECT id
              FROM prospect_jobs
             WHERE tenant_id = $1
               AND id = $2
               AND (status = 'queued' OR (status = 'failed' AND attempts < max_attempts))
             FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(key.tenant_id)
        .bind(key.job_id)
        .fetch_optional(&mut *tx)
        .await?;

        if locked.is_none() {
            tx.rollback().await?;
            debug!("job not claimable");
            return Ok(ClaimOutcome::NotClaimable);
        }

        let sql = format!(
            "UPDATE prospect_jobs \
                SET status = 'running', \
                    attempts = attempts + 1, \
                    started_at = now(), \
                    finished_at = NULL, \
                    error_text = NULL \
              WHERE tenant_id = $1 AND id = $2 \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(key.tenant_id)
            .bind(key.job_id)
            .fetch_one(&mut *tx)
            .await?;
        let job = job_from_row(&row)?;

        insert_event(
            &mut *tx,
            key,
            EventLevel::Info,
            "Job started",
            json!({ "attempt": job.attempts, "max_attempts": job.max_attempts }),
        )
        .await?;
        tx.commit().await?;
        Ok(ClaimOutcome::Claimed(job))
    }

    async fn append_event(
        &self,
        key: JobKey,
        level: EventLevel,
        message: &str,
        payload: JsonValue,
    ) -> Result<(), StoreError> {
        insert_event(&self.pool, key, level, message, payload).await
    }

    async fn record_fetched(&self, key: JobKey, total_candidates: i32) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE prospect_jobs
               SET total_candidates = $3
             WHERE tenant_id = $1 AND id = $2 AND status = 'running'
            "#,
        )
        .bind(key.tenant_id)
        .bind(key.job_id)
        .bind(total_candidates)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_deduped(
        &self,
        key: JobKey,
        deduped_candidates: i32,
        duplicate_count: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE prospect_jobs
               SET deduped_candidates = $3,
                   duplicate_count = $4
             WHERE tenant_id = $1 AND id = $2 AND status = 'running'
            "#,
        )
        .bind(key.tenant_id)
        .bind(key.job_id)
        .bind(deduped_candidates)
        .bind(duplicate_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, completion), fields(job = %key))]
    async fn mark_done(&self, key: JobKey, completion: Completion) -> Result<JobStatus, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE prospect_jobs
               SET status = 'done',
                   finished_at = now(),
                   inserted_count = $3,
                   import_job_id = $4
             WHERE tenant_id = $1 AND id = $2 AND status = 'running'
            RETURNING status
            "#,
        )
        .bind(key.tenant_id)
        .bind(key.job_id)
        .bind(completion.inserted_count)
        .bind(completion.import_job_id.as_deref())
        .fetch_optional(&mut *tx)
        .await?;

        let status = match updated {
            Some(_) => {
                insert_event(
                    &mut *tx,
                    key,
                    EventLevel::Success,
                    &completion_message(&completion),
                    json!({
                        "import_job_id": completion.import_job_id,
                        "inserted_count": completion.inserted_count,
                    }),
                )
                .await?;
                JobStatus::Done
            }
            None => {
                let current = sqlx::query(
                    "SELECT status FROM prospect_jobs WHERE tenant_id = $1 AND id = $2",
                )
                .bind(key.tenant_id)
                .bind(key.job_id)
                .fetch_one(&mut *tx)
                .await?;
                let status = parse_status(&current.try_get::<String, _>("status")?)?;
                insert_event(
                    &mut *tx,
                    key,
                    EventLevel::Debug,
                    "Attempt finished after the job left running; result not recorded",
                    json!({ "status": status.as_str(), "import_job_id": completion.import_job_id }),
                )
                .await?;
                status
            }
        };
        tx.commit().await?;
        Ok(status)
    }

    #[instrument(skip(self), fields(job = %key))]
    async fn mark_failed(&self, key: JobKey, error_text: &str) -> Result<JobStatus, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE prospect_jobs
               SET status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'failed' END,
                   finished_at = CASE WHEN attempts < max_attempts THEN NULL ELSE now() END,
                   error_text = $3
             WHERE tenant_id = $1 AND id = $2 AND status = 'running'
            RETURNING status, attempts, max_attempts
            "#,
        )
        .bind(key.tenant_id)
        .bind(key.job_id)
        .bind(error_text)
        .fetch_optional(&mut *tx)
        .await?;

        let (status, payload) = match updated {
            Some(row) => {
                let status = parse_status(&row.try_get::<String, _>("status")?)?;
                let attempts: i32 = row.try_get("attempts")?;
                let max_attempts: i32 = row.try_get("max_attempts")?;
                (
                    status,
                    json!({
                        "attempt": attempts,
                        "max_attempts": max_attempts,
                        "requeued": status == JobStatus::Queued,
                    }),
                )
            }
            None => {
                let current = sqlx::query(
                    "SELECT status FROM prospect_jobs WHERE tenant_id = $1 AND id = $2",
                )
                .bind(key.tenant_id)
                .bind(key.job_id)
                .fetch_one(&mut *tx)
                .await?;
                let status = parse_status(&current.try_get::<String, _>("status")?)?;
                (status, json!({ "status": status.as_str(), "requeued": false }))
            }
        };

        insert_event(&mut *tx, key, EventLevel::Error, error_text, payload).await?;
        tx.commit().await?;
        Ok(status)
    }

    async fn quota_usage(
        &self,
        tenant_id: TenantId,
        exclude_job: Option<Uuid>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            WITH today AS (
                SELECT date_trunc('day', now() AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS start
            )
            SELECT COALESCE(SUM(size), 0)::BIGINT AS used
              FROM prospect_jobs, today
             WHERE tenant_id = $1
               AND created_at >= today.start
               AND created_at < today.start + interval '1 day'
               AND ($2::uuid IS NULL OR id <> $2)
            "#,
        )
        .bind(tenant_id)
        .bind(exclude_job)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("used")?)
    }

    async fn daily_cap_override(&self, tenant_id: TenantId) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT daily_cap FROM prospect_tenant_quotas WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get("daily_cap")).transpose().map_err(Into::into)
    }
}

#[async_trait]
impl LeadDirectory for PgJobStore {
    async fn existing_identifiers(
        &self,
        tenant_id: TenantId,
        emails: &[String],
        phones: &[String],
    ) -> Result<ExistingIdentifiers, StoreError> {
        if emails.is_empty() && phones.is_empty() {
            return Ok(ExistingIdentifiers::default());
        }
        let rows = sqlx::query(
            r#"
            SELECT lower(btrim(email)) AS email, phone_normalized
              FROM leads
             WHERE tenant_id = $1
               AND (lower(btrim(email)) = ANY($2) OR phone_normalized = ANY($3))
            "#,
        )
        .bind(tenant_id)
        .bind(emails)
        .bind(phones)
        .fetch_all(&self.pool)
        .await?;

        let wanted_emails: HashSet<&str> = emails.iter().map(String::as_str).collect();
        let wanted_phones: HashSet<&str> = phones.iter().map(String::as_str).collect();
        let mut out = ExistingIdentifiers::default();
        for row in rows {
            let email: Option<String> = row.try_get("email")?;
            let phone: Option<String> = row.try_get("phone_normalized")?;
            if let Some(email) = email.filter(|e| wanted_emails.contains(e.as_str())) {
                out.emails.insert(email);
            }
            if let Some(phone) = phone.filter(|p| wanted_phones.contains(p.as_str())) {
                out.phones.insert(phone);
            }
        }
        Ok(out)
    }
}

pub(crate) fn completion_message(completion: &Completion) -> String {
    match &completion.import_job_id {
        Some(import) => format!(
            "Completed: import {import}, inserted {}",
            completion.inserted_count
        ),
        None => format!("Completed: nothing to import, inserted {}", completion.inserted_count),
    }
}
