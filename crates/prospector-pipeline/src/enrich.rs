use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use prospector_core::Candidate;
use prospector_providers::{EnrichmentClient, EnrichmentMatch};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnrichmentReport {
    pub looked_up: usize,
    pub enriched: usize,
    pub failed: usize,
}

/// Best-effort secondary lookup. Only empty `title`/`company` are filled and
/// a failed lookup leaves its candidate untouched.
#[derive(Clone)]
pub struct EnrichmentStep {
    client: Option<Arc<dyn EnrichmentClient>>,
    concurrency: usize,
}

enum Lookup {
    Skipped,
    Found(Option<EnrichmentMatch>),
    Failed,
}

impl EnrichmentStep {
    pub fn new(client: Option<Arc<dyn EnrichmentClient>>, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, 1)
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Returns the candidates in input order alongside what happened.
    pub async fn enrich(&self, candidates: Vec<Candidate>) -> (Vec<Candidate>, EnrichmentReport) {
        let Some(client) = self.client.clone() else {
            return (candidates, EnrichmentReport::default());
        };

        // Collected before streaming so the returned future stays `Send`.
        let emails: Vec<Option<String>> = candidates
            .iter()
            .map(|candidate| {
                let wanted = candidate.title.is_none() || candidate.company.is_none();
                candidate.email.clone().filter(|_| wanted)
            })
            .collect();

        let lookups: Vec<Lookup> = stream::iter(emails)
            .map(move |email| {
                let client = client.clone();
                async move {
                    let Some(email) = email else {
                        return Lookup::Skipped;
                    };
                    match client.lookup(&email).await {
                        Ok(found) => Lookup::Found(found),
                        Err(err) => {
                            debug!(%email, error = %err, "enrichment lookup failed");
                            Lookup::Failed
                        }
                    }
                }
            })
            .buffered(self.concurrency)
        .collect()
        .await;

        let mut report = EnrichmentReport::default();
        let enriched = candidates
            .into_iter()
            .zip(lookups)
            .map(|(mut candidate, lookup)| {
                match lookup {
                    Lookup::Skipped => {}
                    Lookup::Failed => {
                        report.looked_up += 1;
                        report.failed += 1;
                    }
                    Lookup::Found(found) => {
                        report.looked_up += 1;
                        if let Some(found) = found {
                            if fill_missing(&mut candidate, found) {
                                report.enriched += 1;
                            }
                        }
                    }
                }
                candidate
            })
            .collect();
        (enriched, report)
    }
}

/// Copies non-blank fields from `found` into empty slots. Returns whether
/// anything changed.
pub fn fill_missing(candidate: &mut Candidate, found: EnrichmentMatch) -> bool {
    let mut changed = false;
    if candidate.title.is_none() {
        if let Some(title) = found.title.filter(|t| !t.trim().is_empty()) {
            candidate.title = Some(title.trim().to_string());
            changed = true;
        }
    }
    if candidate.company.is_none() {
        if let Some(company) = found.company.filter(|c| !c.trim().is_empty()) {
            candidate.company = Some(company.trim().to_string());
            changed = true;
        }
    }
    changed
}
