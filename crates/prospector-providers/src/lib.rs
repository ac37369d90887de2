//! Provider + enrichment client contracts and their HTTP/fixture implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use prospector_core::{Candidate, ProspectFilters};
use prospector_fetch::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "prospector-providers";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {provider}: {source}")]
    Fetch {
        provider: String,
        #[source]
        source: FetchError,
    },
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("provider `{0}` is disabled")]
    Disabled(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One page of normalized search results.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderPage {
    pub candidates: Vec<Candidate>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn search_page(
        &self,
        query: &str,
        filters: &ProspectFilters,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<ProviderPage, ProviderError>;
}

/// Fields a secondary lookup may contribute to a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnrichmentMatch {
    pub title: Option<String>,
    pub company: Option<String>,
}

#[async_trait]
pub trait EnrichmentClient: Send + Sync {
    /// `Ok(None)` when the service knows nothing about the address.
    async fn lookup(&self, email: &str) -> Result<Option<EnrichmentMatch>, ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrganizationRecord {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PhoneRecord {
    #[serde(default)]
    pub raw_number: Option<String>,
    #[serde(default)]
    pub sanitized_number: Option<String>,
}

/// Raw person shape as returned by people-search APIs. Vendors disagree on
/// naming, so most fields accept aliases.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersonRecord {
    #[serde(default, alias = "name")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, alias = "work_email")]
    pub email: Option<String>,
    #[serde(default, alias = "mobile_phone")]
    pub phone: Option<String>,
    #[serde(default)]
    pub phone_numbers: Vec<PhoneRecord>,
    #[serde(default, alias = "job_title", alias = "headline")]
    pub title: Option<String>,
    #[serde(default, alias = "company_name", alias = "organization_name")]
    pub company: Option<String>,
    #[serde(default)]
    pub organization: Option<OrganizationRecord>,
}

impl PersonRecord {
    fn display_name(&self) -> Option<String> {
        if let Some(full) = self.full_name.as_deref().map(str::trim) {
            if !full.is_empty() {
                return Some(full.to_string());
            }
        }
        let joined = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    fn best_phone(&self) -> Option<String> {
        self.phone.clone().or_else(|| {
            self.phone_numbers
                .iter()
                .find_map(|p| p.sanitized_number.clone().or_else(|| p.raw_number.clone()))
        })
    }

    fn best_company(&self) -> Option<String> {
        self.company
            .clone()
            .or_else(|| self.organization.as_ref().and_then(|o| o.name.clone()))
    }

    pub fn into_candidate(self, source: &str) -> Candidate {
        Candidate::new(
            source,
            self.display_name(),
            self.email.clone(),
            self.best_phone(),
            self.best_company(),
            self.title.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize)]
struct PeopleSearchRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "no_titles")]
    titles: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    country: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    industry: Option<&'a str>,
    page_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
}

fn no_titles(titles: &&[String]) -> bool {
    titles.is_empty()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PeopleSearchResponse {
    #[serde(default, alias = "results", alias = "data")]
    pub people: Vec<PersonRecord>,
    #[serde(default, alias = "next_page_token")]
    pub next_cursor: Option<String>,
}

/// JSON people-search API: `POST {base_url}/people/search`.
pub struct PeopleSearchProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    http: Arc<HttpFetcher>,
}

impl PeopleSearchProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
        }
    }
}

#[async_trait]
impl ProviderClient for PeopleSearchProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn search_page(
        &self,
        query: &str,
        filters: &ProspectFilters,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<ProviderPage, ProviderError> {
        let request = PeopleSearchRequest {
            query,
            titles: &filters.titles,
            country: filters.country.as_deref(),
            industry: filters.industry.as_deref(),
            page_size,
            cursor,
        };
        let url = format!("{}/people/search", self.base_url);
        let response: PeopleSearchResponse = self
            .http
            .post_json(&self.id, &url, self.api_key.as_deref(), &request, None)
            .await
            .map_err(|source| ProviderError::Fetch {
                provider: self.id.clone(),
                source,
            })?;

        Ok(ProviderPage {
            candidates: response
                .people
                .into_iter()
                .map(|p| p.into_candidate(&self.id))
                .collect(),
            next_cursor: response.next_cursor.filter(|c| !c.trim().is_empty()),
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FixturePage {
    #[serde(default)]
    pub people: Vec<PersonRecord>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FixtureFile {
    #[serde(default)]
    pub pages: Vec<FixturePage>,
}

/// Serves pre-captured pages from disk. Stored pages are read as one
/// sequence and the cursor is a record offset into it, so any page size
/// walks every record exactly once.
pub struct FixtureProvider {
    id: String,
    records: Vec<PersonRecord>,
}

impl FixtureProvider {
    pub fn new(id: impl Into<String>, pages: Vec<FixturePage>) -> Self {
        Self {
            id: id.into(),
            records: pages.into_iter().flat_map(|page| page.people).collect(),
        }
    }

    pub fn load(id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: FixtureFile =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(id, file.pages))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ProviderClient for FixtureProvider {
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
        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| ProviderError::Message(format!("invalid fixture cursor `{c}`")))?,
            None => 0,
        };
        let end = offset.saturating_add(page_size.max(1)).min(self.records.len());
        let Some(slice) = self.records.get(offset..end) else {
            return Ok(ProviderPage::default());
        };
        Ok(ProviderPage {
            candidates: slice
                .iter()
                .cloned()
                .map(|p| p.into_candidate(&self.id))
                .collect(),
            next_cursor: (end < self.records.len()).then(|| end.to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct EnrichRequest<'a> {
    email: &'a str,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct EnrichResponse {
    #[serde(default)]
    person: Option<PersonRecord>,
}

/// Secondary lookup service: `POST {base_url}/people/enrich`.
pub struct HttpEnrichmentClient {
    base_url: String,
    api_key: Option<String>,
    http: Arc<HttpFetcher>,
}

impl HttpEnrichmentClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
        }
    }
}

#[async_trait]
impl EnrichmentClient for HttpEnrichmentClient {
    async fn lookup(&self, email: &str) -> Result<Option<EnrichmentMatch>, ProviderError> {
        let url = format!("{}/people/enrich", self.base_url);
        let result: Result<EnrichResponse, FetchError> = self
            .http
            .post_json("enrichment", &url, self.api_key.as_deref(), &EnrichRequest { email }, None)
            .await;
        let response = match result {
            Ok(response) => response,
            Err(err) if err.status() == Some(404) => return Ok(None),
            Err(source) => {
                return Err(ProviderError::Fetch {
                    provider: "enrichment".to_string(),
                    source,
                })
            }
        };
        Ok(response.person.map(|person| EnrichmentMatch {
            company: person.best_company(),
            title: person.title,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    PeopleSearch,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub enabled: bool,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
}

/// Declared providers, loaded from `providers.yaml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderRegistry {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl ProviderRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Instantiates every declared provider. Disabled entries are remembered
    /// so lookups can tell "disabled" from "unknown".
    pub fn build(&self, http: Arc<HttpFetcher>, workspace_root: &Path) -> Result<ProviderSet> {
        let mut set = ProviderSet::default();
        for config in &self.providers {
            if !config.enabled {
                set.disabled.push(config.id.clone());
                continue;
            }
            let client: Arc<dyn ProviderClient> = match config.kind {
                ProviderKind::PeopleSearch => {
                    let base_url = config.base_url.clone().with_context(|| {
                        format!("provider {} is people_search but has no base_url", config.id)
                    })?;
                    let api_key = config.api_key_env.as_deref().and_then(|var| {
                        let key = std::env::var(var).ok();
                        if key.is_none() {
                            warn!(provider = %config.id, env = var, "provider API key env var is unset");
                        }
                        key
                    });
                    Arc::new(PeopleSearchProvider::new(
                        config.id.clone(),
                        base_url,
                        api_key,
                        http.clone(),
                    ))
                }
                ProviderKind::Fixture => {
                    let rel = config.fixture_path.clone().unwrap_or_else(|| {
                        PathBuf::from("fixtures")
                            .join("providers")
                            .join(&config.id)
                            .join("pages.json")
                    });
                    Arc::new(FixtureProvider::load(
                        config.id.clone(),
                        workspace_root.join(rel),
                    )?)
                }
            };
            set.insert(client);
        }
        Ok(set)
    }
}

/// Instantiated providers keyed by id.
#[derive(Clone, Default)]
pub struct ProviderSet {
    clients: BTreeMap<String, Arc<dyn ProviderClient>>,
    disabled: Vec<String>,
}

impl ProviderSet {
    pub fn insert(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.provider_id().to_string(), client);
    }

    pub fn with(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.insert(client);
        self
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn client_for(&self, provider_id: &str) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        if let Some(client) = self.clients.get(provider_id) {
            return Ok(client.clone());
        }
        if self.disabled.iter().any(|id| id == provider_id) {
            return Err(ProviderError::Disabled(provider_id.to_string()));
        }
        Err(ProviderError::UnknownProvider(provider_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::routing::post;
    use axum::{http::StatusCode, Json, Router};
    use prospector_fetch::HttpClientConfig;
    use serde_json::{json, Value};

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(5),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[test]
    fn heterogeneous_person_shapes_normalize_to_candidates() {
        let apollo_like: PersonRecord = serde_json::from_value(json!({
            "first_name": "Grace",
            "last_name": "Hopper",
            "email": " Grace@Navy.MIL ",
            "phone_numbers": [{ "raw_number": "+1 (202) 555-0101" }],
            "organization": { "name": "US Navy" },
            "headline": "Rear Admiral"
        }))
        .unwrap();
        let flat: PersonRecord = serde_json::from_value(json!({
            "name": "Ada Lovelace",
            "work_email": "ada@engine.io",
            "mobile_phone": "020 7946 0000",
            "company_name": "Analytical Engines",
            "job_title": "CFO"
        }))
        .unwrap();

        let a = apollo_like.into_candidate("x");
        assert_eq!(a.name.as_deref(), Some("Grace Hopper"));
        assert_eq!(a.email.as_deref(), Some("grace@navy.mil"));
        assert_eq!(a.phone_normalized.as_deref(), Some("+12025550101"));
        assert_eq!(a.company.as_deref(), Some("US Navy"));
        assert_eq!(a.title.as_deref(), Some("Rear Admiral"));
        assert_eq!(a.source, "x");

        let b = flat.into_candidate("y");
        assert_eq!(b.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(b.phone_normalized.as_deref(), Some("02079460000"));
        assert_eq!(b.company.as_deref(), Some("Analytical Engines"));
        assert_eq!(b.title.as_deref(), Some("CFO"));
    }

    #[tokio::test]
    async fn fixture_provider_pages_by_record_offset() {
        let provider = FixtureProvider::load(
            "demo",
            workspace_root().join("fixtures/providers/demo/pages.json"),
        )
        .unwrap();
        let filters = ProspectFilters::default();

        let all = provider.search_page("q", &filters, 50, None).await.unwrap();
        assert_eq!(all.candidates.len(), provider.len());
        assert!(all.next_cursor.is_none());

        let first = provider.search_page("q", &filters, 3, None).await.unwrap();
        assert_eq!(first.candidates.len(), 3);
        assert_eq!(first.next_cursor.as_deref(), Some("3"));

        let past_end = provider.search_page("q", &filters, 3, Some("99")).await.unwrap();
        assert!(past_end.candidates.is_empty());
        assert!(past_end.next_cursor.is_none());

        assert!(provider.search_page("q", &filters, 3, Some("abc")).await.is_err());
    }

    #[tokio::test]
    async fn small_page_size_still_serves_every_fixture_record() {
        let provider = FixtureProvider::load(
            "demo",
            workspace_root().join("fixtures/providers/demo/pages.json"),
        )
        .unwrap();
        let filters = ProspectFilters::default();

        let mut emails = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = provider
                .search_page("q", &filters, 2, cursor.as_deref())
                .await
                .unwrap();
            assert!(page.candidates.len() <= 2);
            emails.extend(page.candidates.into_iter().filter_map(|c| c.email));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(provider.len(), 8);
        assert_eq!(emails.len(), 8);
        assert_eq!(emails[5], "samir@gearline.example");
        assert_eq!(emails[7], "kwame@steelpoint.example");
    }

    #[tokio::test]
    async fn people_search_forwards_filters_and_reads_cursor() {
        let base = spawn_server(Router::new().route(
            "/people/search",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["query"], "finance leaders");
                assert_eq!(body["titles"], json!(["CFO"]));
                assert_eq!(body["country"], "DE");
                assert_eq!(body["page_size"], 2);
                Json(json!({
                    "people": [
                        { "name": "A", "email": "a@x.io" },
                        { "name": "B", "email": "b@x.io" }
                    ],
                    "next_cursor": "page-2"
                }))
            }),
        ))
        .await;

        let provider = PeopleSearchProvider::new("x", base, Some("k".into()), fetcher());
        let filters = ProspectFilters {
            titles: vec!["CFO".into()],
            country: Some("DE".into()),
            industry: None,
        };
        let page = provider
            .search_page("finance leaders", &filters, 2, None)
            .await
            .unwrap();
        assert_eq!(page.candidates.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
    }

    #[tokio::test]
    async fn people_search_surfaces_non_2xx_as_fetch_error() {
        let base = spawn_server(Router::new().route(
            "/people/search",
            post(|| async { StatusCode::UNAUTHORIZED }),
        ))
        .await;
        let provider = PeopleSearchProvider::new("x", base, None, fetcher());
        let err = provider
            .search_page("q", &ProspectFilters::default(), 10, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Fetch { .. }));
    }

    #[tokio::test]
    async fn enrichment_treats_404_as_no_match() {
        let base = spawn_server(
            Router::new().route("/people/enrich", post(|| async { StatusCode::NOT_FOUND })),
        )
        .await;
        let client = HttpEnrichmentClient::new(base, None, fetcher());
        assert_eq!(client.lookup("nobody@x.io").await.unwrap(), None);
    }

    #[tokio::test]
    async fn enrichment_maps_title_and_company() {
        let base = spawn_server(Router::new().route(
            "/people/enrich",
            post(|| async {
                Json(json!({
                    "person": { "title": "VP Finance", "organization": { "name": "Acme" } }
                }))
            }),
        ))
        .await;
        let client = HttpEnrichmentClient::new(base, None, fetcher());
        let found = client.lookup("a@acme.io").await.unwrap().unwrap();
        assert_eq!(found.title.as_deref(), Some("VP Finance"));
        assert_eq!(found.company.as_deref(), Some("Acme"));
    }

    #[test]
    fn registry_distinguishes_disabled_from_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = dir.path().join("pages.json");
        fs::write(&fixture, r#"{ "pages": [ { "people": [] } ] }"#).unwrap();
        let yaml = format!(
            r#"
providers:
  - id: local
    enabled: true
    kind: fixture
    fixture_path: {}
  - id: remote
    enabled: false
    kind: people_search
    base_url: https://people.example.com
"#,
            fixture.display()
        );
        let registry = ProviderRegistry::from_yaml_str(&yaml).unwrap();
        let set = registry.build(fetcher(), dir.path()).unwrap();

        assert_eq!(set.ids().collect::<Vec<_>>(), vec!["local"]);
        assert!(set.client_for("local").is_ok());
        assert!(matches!(set.client_for("remote"), Err(ProviderError::Disabled(_))));
        assert!(matches!(
            set.client_for("nope"),
            Err(ProviderError::UnknownProvider(_))
        ));
    }

    #[test]
    fn people_search_without_base_url_is_rejected() {
        let registry = ProviderRegistry::from_yaml_str(
            "providers:\n  - id: broken\n    enabled: true\n    kind: people_search\n",
        )
        .unwrap();
        assert!(registry.build(fetcher(), Path::new(".")).is_err());
    }
}
