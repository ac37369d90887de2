//! Core domain model for Prospector prospecting jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "prospector-core";

pub type TenantId = i64;
pub type ActorId = i64;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Tenant-scoped job address. Job ids are only unique within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub tenant_id: TenantId,
    pub job_id: Uuid,
}

impl JobKey {
    pub fn new(tenant_id: TenantId, job_id: Uuid) -> Self {
        Self { tenant_id, job_id }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.job_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Canceled)
    }

    pub fn is_cancelable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown value `{0}`")]
pub struct UnknownVariant(pub String);

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Optional structured filters forwarded to providers alongside the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProspectFilters {
    #[serde(default)]
    pub titles: Vec<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
}

impl ProspectFilters {
    pub fn is_empty(&self) -> bool {
        self.titles.is_empty() && self.country.is_none() && self.industry.is_none()
    }
}

/// Submission payload for a new job. Callers validate before handing it over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProspectJob {
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    pub prompt: String,
    pub size: i32,
    pub providers: Vec<String>,
    #[serde(default)]
    pub filters: ProspectFilters,
}

/// Persisted state of one prospecting request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProspectJob {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    pub prompt: String,
    pub size: i32,
    pub providers: Vec<String>,
    pub filters: ProspectFilters,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_candidates: i32,
    pub deduped_candidates: i32,
    pub duplicate_count: i32,
    pub inserted_count: i32,
    pub import_job_id: Option<String>,
}

impl ProspectJob {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.tenant_id, self.id)
    }

    /// Whether a failed attempt may go back to the queue.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_claimable(&self) -> bool {
        match self.status {
            JobStatus::Queued => true,
            JobStatus::Failed => self.has_attempts_left(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Success,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Success => "success",
            EventLevel::Error => "error",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventLevel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(EventLevel::Debug),
            "info" => Ok(EventLevel::Info),
            "success" => Ok(EventLevel::Success),
            "error" => Ok(EventLevel::Error),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Append-only audit row attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProspectEvent {
    pub id: i64,
    pub job_id: Uuid,
    pub tenant_id: TenantId,
    pub created_at: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
    pub payload: JsonValue,
}

/// Normalized prospect record flowing between pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Candidate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub phone_normalized: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub source: String,
}

impl Candidate {
    /// Builds a candidate, normalizing contact identifiers and dropping blank fields.
    pub fn new(
        source: impl Into<String>,
        name: Option<String>,
        email: Option<String>,
        phone: Option<String>,
        company: Option<String>,
        title: Option<String>,
    ) -> Self {
        let phone = phone.and_then(non_blank);
        Self {
            name: name.and_then(non_blank),
            email: email.as_deref().and_then(normalize_email),
            phone_normalized: phone.as_deref().and_then(normalize_phone),
            phone,
            company: company.and_then(non_blank),
            title: title.and_then(non_blank),
            source: source.into(),
        }
    }

    pub fn normalized_email(&self) -> Option<String> {
        self.email.as_deref().and_then(normalize_email)
    }

    pub fn normalized_phone(&self) -> Option<String> {
        self.phone_normalized
            .clone()
            .or_else(|| self.phone.as_deref().and_then(normalize_phone))
    }
}

/// Per-tenant daily volume snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQuota {
    pub tenant_id: TenantId,
    pub daily_cap: i64,
    pub used: i64,
}

impl TenantQuota {
    pub fn remaining(&self) -> i64 {
        (self.daily_cap - self.used).max(0)
    }

    pub fn allows(&self, requested: i64) -> bool {
        self.used.saturating_add(requested) <= self.daily_cap
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}

/// Trimmed, lower-cased email; `None` when blank.
pub fn normalize_email(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Digits only, keeping a leading `+`; `None` when no digits remain.
pub fn normalize_phone(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    if trimmed.starts_with('+') {
        Some(format!("+{digits}"))
    } else {
        Some(digits)
    }
}
