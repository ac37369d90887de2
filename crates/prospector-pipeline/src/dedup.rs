use std::collections::BTreeSet;
use std::sync::Arc;

use prospector_core::{Candidate, TenantId};

use crate::store::{ExistingIdentifiers, LeadDirectory, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    pub unique: Vec<Candidate>,
    pub duplicates: Vec<Candidate>,
}

impl DedupOutcome {
    pub fn total(&self) -> usize {
        self.unique.len() + self.duplicates.len()
    }
}

/// Splits candidates into new and already-known leads by exact normalized
/// email or phone. Duplicates inside one batch are not collapsed here; the
/// bulk writer handles those.
#[derive(Clone)]
pub struct DedupEngine {
    leads: Arc<dyn LeadDirectory>,
}

impl DedupEngine {
    pub fn new(leads: Arc<dyn LeadDirectory>) -> Self {
        Self { leads }
    }

    pub async fn partition(
        &self,
        tenant_id: TenantId,
        candidates: Vec<Candidate>,
    ) -> Result<DedupOutcome, StoreError> {
        if candidates.is_empty() {
            return Ok(DedupOutcome::default());
        }
        let emails: Vec<String> = candidates
            .iter()
            .filter_map(Candidate::normalized_email)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let phones: Vec<String> = candidates
            .iter()
            .filter_map(Candidate::normalized_phone)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let existing = self
            .leads
            .existing_identifiers(tenant_id, &emails, &phones)
            .await?;
        Ok(classify(candidates, &existing))
    }
}

pub fn is_duplicate(candidate: &Candidate, existing: &ExistingIdentifiers) -> bool {
    let email_hit = candidate
        .normalized_email()
        .is_some_and(|e| existing.emails.contains(&e));
    let phone_hit = candidate
        .normalized_phone()
        .is_some_and(|p| existing.phones.contains(&p));
    email_hit || phone_hit
}

pub fn classify(candidates: Vec<Candidate>, existing: &ExistingIdentifiers) -> DedupOutcome {
    let (duplicates, unique): (Vec<Candidate>, Vec<Candidate>) = candidates
        .into_iter()
        .partition(|c| is_duplicate(c, existing));
    DedupOutcome { unique, duplicates }
}
