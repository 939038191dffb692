//! Snapshot provider contract and the Scholar HTML provider.

mod parse;

use anyhow::Context;
use async_trait::async_trait;
use gsync_core::{PublicationDetail, ScrapeSnapshot};
use gsync_storage::{FetchedResponse, HttpClientConfig, HttpError, HttpFetcher};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub use parse::{
    parse_profile_page, parse_publication_date, parse_publication_page, scholar_publication_id,
    ParseError, MIN_PUBLICATION_YEAR,
};

pub const CRATE_NAME: &str = "gsync-adapters";

pub const DEFAULT_BASE_URL: &str = "https://scholar.google.com";

const BLOCK_PHRASES: [&str; 2] = ["unusual traffic", "please show you're not a robot"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network error or timeout; the subject is skipped for this run.
    #[error("fetch of {url} failed: {message}")]
    Transient { url: String, message: String },
    /// The source refused service; a cooldown must follow.
    #[error("blocked while fetching {url}: {reason}")]
    Blocked { url: String, reason: String },
    #[error("malformed page at {url}: {message}")]
    Malformed { url: String, message: String },
}

impl FetchError {
    pub fn malformed(url: impl Into<String>, err: ParseError) -> Self {
        Self::Malformed {
            url: url.into(),
            message: err.to_string(),
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Source of scrape snapshots for subjects and their publications.
///
/// Implementations hold a single stateful session; calls are never made
/// concurrently.
#[async_trait]
pub trait SnapshotProvider: Send {
    async fn fetch_profile(&mut self, scholar_id: &str) -> Result<ScrapeSnapshot, FetchError>;

    async fn fetch_publication(&mut self, url: &str) -> Result<PublicationDetail, FetchError>;

    /// Discards the current session and starts a fresh one.
    async fn restart(&mut self) -> anyhow::Result<()>;
}

/// The kind of page a request expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Profile,
    Publication,
}

impl PageKind {
    /// Element present on every genuine page of this kind.
    pub fn anchor(self) -> &'static str {
        match self {
            Self::Profile => "#gsc_a_b",
            Self::Publication => "#gsc_oci_table",
        }
    }
}

fn has_anchor(body: &str, css: &str) -> bool {
    Selector::parse(css)
        .map(|sel| Html::parse_document(body).select(&sel).next().is_some())
        .unwrap_or(false)
}

/// Returns why a fetched page looks like a block page, if it does.
///
/// Block phrases only count on pages missing the anchor element for `kind`,
/// so a publication titled after one of them is still a normal page.
pub fn detect_block(final_url: &str, body: &str, kind: PageKind) -> Option<String> {
    if final_url.contains("/sorry") {
        return Some(format!("redirected to {final_url}"));
    }
    if has_anchor(body, kind.anchor()) {
        return None;
    }
    let lowered = body.to_lowercase();
    BLOCK_PHRASES
        .iter()
        .find(|phrase| lowered.contains(*phrase))
        .map(|phrase| format!("page mentions \"{phrase}\""))
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: Url,
    pub page_size: usize,
    /// Upper bound on profile pages requested for one subject.
    pub max_pages: usize,
    pub http: HttpClientConfig,
}

impl ProviderConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            page_size: 100,
            max_pages: 50,
            http: HttpClientConfig::default(),
        }
    }
}

/// Fetches Scholar profile and publication pages over one HTTP session.
#[derive(Debug)]
pub struct ScholarHtmlProvider {
    config: ProviderConfig,
    http: HttpFetcher,
}

impl ScholarHtmlProvider {
    pub fn new(config: ProviderConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(&config.http).context("creating scholar session")?;
        Ok(Self { config, http })
    }

    pub fn profile_url(&self, scholar_id: &str, cstart: usize) -> Result<Url, FetchError> {
        let mut url = self
            .config
            .base_url
            .join("/citations")
            .map_err(|e| FetchError::Malformed {
                url: self.config.base_url.to_string(),
                message: e.to_string(),
            })?;
        url.query_pairs_mut()
            .append_pair("user", scholar_id)
            .append_pair("hl", "en")
            .append_pair("cstart", &cstart.to_string())
            .append_pair("pagesize", &self.config.page_size.to_string());
        Ok(url)
    }

    async fn fetch_page(&self, url: &str, kind: PageKind) -> Result<FetchedResponse, FetchError> {
        match self.http.fetch_text(url).await {
            Ok(response) => match detect_block(&response.final_url, &response.body, kind) {
                Some(reason) => Err(FetchError::Blocked {
                    url: response.final_url,
                    reason,
                }),
                None => Ok(response),
            },
            Err(HttpError::HttpStatus { status, url }) if status == 429 || url.contains("/sorry") => {
                Err(FetchError::Blocked {
                    url,
                    reason: format!("http status {status}"),
                })
            }
            Err(err) => Err(FetchError::Transient {
                url: url.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

#[async_trait]
impl SnapshotProvider for ScholarHtmlProvider {
    async fn fetch_profile(&mut self, scholar_id: &str) -> Result<ScrapeSnapshot, FetchError> {
        let page_size = self.config.page_size.max(1);
        let mut snapshot = ScrapeSnapshot::default();

        for page in 0..self.config.max_pages {
            let url = self.profile_url(scholar_id, page * page_size)?;
            let response = self.fetch_page(url.as_str(), PageKind::Profile).await?;
            let parsed = parse_profile_page(&response.body, &self.config.base_url)
                .map_err(|e| FetchError::malformed(url.as_str(), e))?;

            let rows = parsed.publications.len();
            debug!(scholar_id, page, rows, "parsed profile page");
            if page == 0 {
                snapshot.citation_graph = parsed.citation_graph;
                snapshot.stats_rows = parsed.stats_rows;
            }
            snapshot.publications.extend(parsed.publications);
            if rows < page_size {
                return Ok(snapshot);
            }
        }

        warn!(
            scholar_id,
            max_pages = self.config.max_pages,
            "profile paging stopped at page limit"
        );
        Ok(snapshot)
    }

    async fn fetch_publication(&mut self, url: &str) -> Result<PublicationDetail, FetchError> {
        let response = self.fetch_page(url, PageKind::Publication).await?;
        parse_publication_page(&response.body).map_err(|e| FetchError::malformed(url, e))
    }

    async fn restart(&mut self) -> anyhow::Result<()> {
        self.http = HttpFetcher::new(&self.config.http).context("recreating scholar session")?;
        info!("scholar session recreated");
        Ok(())
    }
}
