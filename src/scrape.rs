//! Full-text scraping capability.
//!
//! One interface, [`Scraper::scrape_for_fulltext`], implemented by strategy
//! values selected by a page's source tag. Scrapers fetch through a
//! [`PageCache`], so the caching layer (or a test double) sits behind a
//! single `get(url)` call.
//!
//! The HTML heuristics are deliberately small: a response that is itself a
//! PDF, a `citation_pdf_url` meta tag, and a Creative Commons link for the
//! license.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ScrapeConfig;
use crate::error::ScrapeError;
use crate::rules::normalize_license;

/// A fetched response.
#[derive(Debug, Clone, Default)]
pub struct CachedResponse {
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn is_pdf(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("application/pdf"))
            .unwrap_or(false)
            || self.body.starts_with(b"%PDF")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP GET with whatever caching the implementation chooses.
#[async_trait]
pub trait PageCache: Send + Sync {
    async fn get(&self, url: &str) -> Result<CachedResponse, ScrapeError>;
}

/// Uncached fetches straight over reqwest.
pub struct HttpPageCache {
    client: reqwest::Client,
}

impl HttpPageCache {
    pub fn new(config: &ScrapeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageCache for HttpPageCache {
    async fn get(&self, url: &str) -> Result<CachedResponse, ScrapeError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScrapeError::transport(url, e))?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|e| ScrapeError::transport(url, e))?
            .to_vec();

        Ok(CachedResponse {
            status,
            url: final_url,
            content_type,
            body,
        })
    }
}

/// What a scrape found. Not open when both URLs are empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeResult {
    pub pdf_url: Option<String>,
    pub metadata_url: Option<String>,
    pub license: Option<String>,
    /// Provenance for publisher scrapes; repository matches get theirs later.
    pub evidence: Option<String>,
}

impl ScrapeResult {
    pub fn is_open(&self) -> bool {
        self.pdf_url.is_some() || self.metadata_url.is_some()
    }
}

/// Which scraping strategy a page gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTag {
    /// A publisher landing page (the DOI target).
    Publisher,
    /// A repository record page from a harvest.
    Repository,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Publisher => "publisher",
            SourceTag::Repository => "repository",
        }
    }

    /// Unknown tags fall back to the repository strategy.
    pub fn parse(s: &str) -> SourceTag {
        match s {
            "publisher" => SourceTag::Publisher,
            _ => SourceTag::Repository,
        }
    }
}

#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape_for_fulltext(&self, url: &str) -> Result<ScrapeResult, ScrapeError>;
}

/// Landing-page heuristics, parameterized by source tag.
pub struct LandingPageScraper {
    cache: Arc<dyn PageCache>,
    tag: SourceTag,
}

impl LandingPageScraper {
    pub fn new(cache: Arc<dyn PageCache>, tag: SourceTag) -> Self {
        Self { cache, tag }
    }
}

#[async_trait]
impl Scraper for LandingPageScraper {
    async fn scrape_for_fulltext(&self, url: &str) -> Result<ScrapeResult, ScrapeError> {
        let resp = self.cache.get(url).await?;
        if resp.status >= 400 {
            return Err(ScrapeError::Status {
                url: url.to_string(),
                status: resp.status,
            });
        }

        let (pdf_url, license) = if resp.is_pdf() {
            (Some(resp.url.clone()), None)
        } else {
            let html = resp.text();
            let pdf = meta_content(&html, "citation_pdf_url").map(|href| resolve(&resp.url, &href));
            (pdf, find_license(&html))
        };

        let result = match (self.tag, pdf_url, license) {
            (SourceTag::Publisher, Some(pdf), license) => ScrapeResult {
                pdf_url: Some(pdf),
                metadata_url: Some(url.to_string()),
                license,
                evidence: Some("hybrid (via free pdf)".into()),
            },
            (SourceTag::Publisher, None, Some(license)) => ScrapeResult {
                pdf_url: None,
                metadata_url: Some(url.to_string()),
                license: Some(license),
                evidence: Some("hybrid (via page says license)".into()),
            },
            (SourceTag::Publisher, None, None) => ScrapeResult {
                evidence: Some("closed".into()),
                ..Default::default()
            },
            (SourceTag::Repository, Some(pdf), license) => ScrapeResult {
                pdf_url: Some(pdf),
                metadata_url: Some(url.to_string()),
                license,
                evidence: None,
            },
            (SourceTag::Repository, None, _) => ScrapeResult::default(),
        };
        Ok(result)
    }
}

/// Scrapers keyed by source tag.
pub struct ScraperSet {
    publisher: Arc<dyn Scraper>,
    repository: Arc<dyn Scraper>,
}

impl ScraperSet {
    pub fn new(publisher: Arc<dyn Scraper>, repository: Arc<dyn Scraper>) -> Self {
        Self {
            publisher,
            repository,
        }
    }

    /// Both strategies over one cache.
    pub fn landing_pages(cache: Arc<dyn PageCache>) -> Self {
        Self::new(
            Arc::new(LandingPageScraper::new(cache.clone(), SourceTag::Publisher)),
            Arc::new(LandingPageScraper::new(cache, SourceTag::Repository)),
        )
    }

    pub fn for_tag(&self, tag: SourceTag) -> Arc<dyn Scraper> {
        match tag {
            SourceTag::Publisher => self.publisher.clone(),
            SourceTag::Repository => self.repository.clone(),
        }
    }
}

/// Last-resort version signal: does the document carry a copyright mark?
#[async_trait]
pub trait DocumentProbe: Send + Sync {
    async fn has_copyright_mark(&self, pdf_url: &str) -> Result<bool, ScrapeError>;
}

/// Fetches the PDF and looks for `©` in its text.
pub struct CopyrightProbe {
    cache: Arc<dyn PageCache>,
}

impl CopyrightProbe {
    pub fn new(cache: Arc<dyn PageCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl DocumentProbe for CopyrightProbe {
    async fn has_copyright_mark(&self, pdf_url: &str) -> Result<bool, ScrapeError> {
        let resp = self.cache.get(pdf_url).await?;
        if resp.status >= 400 || !resp.is_pdf() {
            return Ok(false);
        }
        let url = pdf_url.to_string();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&resp.body))
            .await
            .map_err(|e| ScrapeError::parse(&url, e))?
            .map_err(|e| ScrapeError::parse(&url, e))?;
        Ok(text.contains('©'))
    }
}

// ============ HTML helpers ============

/// `content` of the first `<meta>` tag naming `name`.
fn meta_content(html: &str, name: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = lower[from..].find("<meta") {
        let start = from + pos;
        let end = lower[start..].find('>').map(|e| start + e)?;
        let tag = &html[start..end];
        let tag_lower = &lower[start..end];
        if tag_lower.contains(&format!("\"{}\"", name)) || tag_lower.contains(&format!("'{}'", name)) {
            if let Some(value) = attr_value(tag, tag_lower, "content") {
                return Some(value);
            }
        }
        from = end;
    }
    None
}

fn attr_value(tag: &str, tag_lower: &str, attr: &str) -> Option<String> {
    let pos = tag_lower.find(&format!("{}=", attr))?;
    let rest = &tag[pos + attr.len() + 1..];
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let value = &rest[1..];
    let end = value.find(quote)?;
    let value = value[..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.replace("&amp;", "&"))
    }
}

/// Resolve `href` against the page URL.
fn resolve(base: &str, href: &str) -> String {
    reqwest::Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// The first Creative Commons or public-domain link on the page.
fn find_license(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let pos = lower.find("creativecommons.org/")?;
    let end = lower[pos..]
        .find(|c: char| c == '"' || c == '\'' || c == '<' || c.is_whitespace())
        .map(|e| pos + e)
        .unwrap_or(lower.len());
    normalize_license(&lower[pos..end])
}
