//! OAI-PMH harvest loop.
//!
//! One harvest covers one date window of one endpoint:
//!
//! ```text
//! Idle -> Fetching(1) -> Advancing(token) -> Fetching(2) -> ... -> Complete
//!             |  ^
//!             |  +-- HTTP 503: sleep, retry same request (bounded)
//!             +----> Failed (any other error)
//! ```
//!
//! Pages with a resumption token advance; a page without one completes the
//! window. Records are kept only when [`PmhRecord::is_complete`], and each
//! complete record mints one [`Page`] per full-text URL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Days, Months, NaiveDate};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

use crate::config::HarvestConfig;
use crate::error::PmhError;
use crate::models::{now_ts, Page};
use crate::normalize::{clean_doi, normalize_title};

// ============ Windowing ============

/// Inclusive `from`/`until` dates sent to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestWindow {
    pub from: NaiveDate,
    pub until: NaiveDate,
}

impl fmt::Display for HarvestWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.until)
    }
}

/// Next window for an endpoint.
///
/// Starts at the watermark (minus a day of overlap) or at the epoch, never
/// later than two days ago. Spans a week for high-volume endpoints, a year
/// otherwise, and never reaches past tomorrow.
pub fn harvest_window(
    watermark: Option<&str>,
    base_url: &str,
    config: &HarvestConfig,
    today: NaiveDate,
) -> Result<HarvestWindow> {
    let watermark = watermark
        .map(|w| {
            NaiveDate::parse_from_str(w, "%Y-%m-%d")
                .with_context(|| format!("bad watermark date {:?}", w))
        })
        .transpose()?;

    let latest_start = today - Days::new(2);
    let start = watermark.unwrap_or_else(|| config.epoch_date()).min(latest_start);

    let end = if config.is_high_volume(base_url) {
        start + Days::new(7)
    } else {
        start.checked_add_months(Months::new(12)).unwrap_or(start)
    };
    let until = end.min(today + Days::new(1));

    let from = match watermark {
        Some(_) => start - Days::new(1),
        None => start,
    };
    Ok(HarvestWindow { from, until })
}

// ============ Protocol ============

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListRecordsParams {
    pub from: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub set: Option<String>,
    /// When set, every other parameter is ignored.
    pub resumption_token: Option<String>,
}

impl ListRecordsParams {
    /// Query pairs for a `ListRecords` request.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut q = vec![("verb", "ListRecords".to_string())];
        if let Some(token) = &self.resumption_token {
            q.push(("resumptionToken", token.clone()));
            return q;
        }
        q.push(("metadataPrefix", "oai_dc".to_string()));
        if let Some(from) = self.from {
            q.push(("from", from.to_string()));
        }
        if let Some(until) = self.until {
            q.push(("until", until.to_string()));
        }
        if let Some(set) = &self.set {
            q.push(("set", set.clone()));
        }
        q
    }
}

/// One harvested `oai_dc` record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PmhRecord {
    pub id: String,
    pub title: Option<String>,
    pub authors: Vec<String>,
    /// Every `dc:identifier`, as given.
    pub identifiers: Vec<String>,
    /// Open-access flag some endpoints add; `"0"` means closed.
    pub oa: Option<String>,
}

impl PmhRecord {
    /// `http(s)` identifiers that are not DOI links.
    pub fn urls(&self) -> Vec<&str> {
        self.identifiers
            .iter()
            .map(|i| i.trim())
            .filter(|i| i.starts_with("http://") || i.starts_with("https://"))
            .filter(|i| !i.contains("doi.org/"))
            .collect()
    }

    pub fn doi(&self) -> Option<String> {
        self.identifiers
            .iter()
            .filter(|i| {
                let lower = i.to_lowercase();
                lower.contains("doi.org/") || lower.starts_with("doi:") || lower.starts_with("10.")
            })
            .find_map(|i| clean_doi(i))
    }

    pub fn is_complete(&self) -> bool {
        if self.id.is_empty() || self.title.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return false;
        }
        if self.urls().is_empty() {
            return false;
        }
        if self.oa.as_deref() == Some("0") {
            tracing::debug!(id = %self.id, "record is closed access, skipping");
            return false;
        }
        true
    }

    /// One page per full-text URL.
    pub fn mint_pages(&self, endpoint_id: &str) -> Vec<Page> {
        let doi = self.doi();
        let normalized_title = self
            .title
            .as_deref()
            .map(normalize_title)
            .filter(|t| !t.is_empty());
        let created_at = now_ts();

        self.urls()
            .into_iter()
            .map(|url| Page {
                id: page_id(endpoint_id, &self.id, url),
                endpoint_id: endpoint_id.to_string(),
                pmh_id: self.id.clone(),
                url: url.to_string(),
                doi: doi.clone(),
                title: self.title.clone(),
                normalized_title: normalized_title.clone(),
                authors: self.authors.clone(),
                source_tag: "repository".to_string(),
                created_at,
                ..Default::default()
            })
            .collect()
    }
}

pub fn page_id(endpoint_id: &str, pmh_id: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(pmh_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PmhPage {
    pub records: Vec<PmhRecord>,
    pub resumption_token: Option<String>,
}

/// Source of `ListRecords` pages.
#[async_trait]
pub trait PmhClient: Send + Sync {
    async fn list_records(&self, base_url: &str, params: &ListRecordsParams) -> Result<PmhPage, PmhError>;
}

pub struct HttpPmhClient {
    client: reqwest::Client,
}

impl HttpPmhClient {
    pub fn new(config: &HarvestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build OAI-PMH HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PmhClient for HttpPmhClient {
    async fn list_records(&self, base_url: &str, params: &ListRecordsParams) -> Result<PmhPage, PmhError> {
        let resp = self.client.get(base_url).query(&params.query()).send().await?;
        let status = resp.status();
        if status.as_u16() == 503 {
            return Err(PmhError::Unavailable);
        }
        if !status.is_success() {
            return Err(PmhError::Http(status.as_u16()));
        }
        let body = resp.text().await?;
        parse_list_records(&body)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    HeaderId,
    Title,
    Creator,
    Identifier,
    Oa,
    Token,
    Error,
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

/// Parse a `ListRecords` response. `noRecordsMatch` is an empty page;
/// deleted records are dropped.
pub fn parse_list_records(xml: &str) -> Result<PmhPage, PmhError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = PmhPage::default();
    let mut record: Option<PmhRecord> = None;
    let mut deleted = false;
    let mut in_header = false;
    let mut field: Option<Field> = None;
    let mut text = String::new();
    let mut error_code: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                text.clear();
                match e.local_name().as_ref() {
                    b"record" => {
                        record = Some(PmhRecord::default());
                        deleted = false;
                    }
                    b"header" => {
                        in_header = true;
                        deleted = attr(&e, "status").as_deref() == Some("deleted");
                    }
                    b"identifier" if in_header => field = Some(Field::HeaderId),
                    b"identifier" => field = Some(Field::Identifier),
                    b"title" => field = Some(Field::Title),
                    b"creator" => field = Some(Field::Creator),
                    b"oa" => field = Some(Field::Oa),
                    b"resumptionToken" => field = Some(Field::Token),
                    b"error" => {
                        error_code = attr(&e, "code");
                        field = Some(Field::Error);
                    }
                    _ => field = None,
                }
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"error" {
                    error_code = attr(&e, "code");
                    text.clear();
                    field = Some(Field::Error);
                }
            }
            Event::Text(t) => {
                if field.is_some() {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(e) => {
                let value = text.trim().to_string();
                match (field.take(), record.as_mut()) {
                    (Some(Field::HeaderId), Some(r)) => r.id = value,
                    (Some(Field::Title), Some(r)) if r.title.is_none() && !value.is_empty() => {
                        r.title = Some(value)
                    }
                    (Some(Field::Creator), Some(r)) if !value.is_empty() => r.authors.push(value),
                    (Some(Field::Identifier), Some(r)) if !value.is_empty() => r.identifiers.push(value),
                    (Some(Field::Oa), Some(r)) => r.oa = Some(value),
                    (Some(Field::Token), _) if !value.is_empty() => page.resumption_token = Some(value),
                    (Some(Field::Error), _) => {
                        let code = error_code.take().unwrap_or_default();
                        if code != "noRecordsMatch" {
                            return Err(PmhError::Protocol { code, message: value });
                        }
                    }
                    _ => {}
                }
                text.clear();

                match e.local_name().as_ref() {
                    b"header" => in_header = false,
                    b"record" => {
                        if let Some(r) = record.take() {
                            if !deleted {
                                page.records.push(r);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(code) = error_code {
        if code != "noRecordsMatch" {
            return Err(PmhError::Protocol { code, message: String::new() });
        }
    }
    Ok(page)
}

// ============ Harvest loop ============

/// Where a harvest is.
#[derive(Debug)]
pub enum HarvestState {
    Idle,
    Fetching { page: u32, token: Option<String> },
    Advancing { page: u32, token: String },
    Complete,
    Failed(PmhError),
}

/// Result of one window.
#[derive(Debug, Default)]
pub struct HarvestReport {
    pub records_seen: usize,
    pub pages: Vec<Page>,
    pub requests: u32,
    pub retries: u32,
}

pub struct Harvester<'a> {
    client: &'a dyn PmhClient,
    retry_delay: Duration,
    max_retries: u32,
}

impl<'a> Harvester<'a> {
    pub fn new(client: &'a dyn PmhClient, config: &HarvestConfig) -> Self {
        Self {
            client,
            retry_delay: config.retry_delay(),
            max_retries: config.max_retries,
        }
    }

    /// Harvest `window` of an endpoint. Pages from complete records are
    /// returned only when the whole window succeeded.
    pub async fn run(
        &self,
        endpoint_id: &str,
        base_url: &str,
        set: Option<&str>,
        window: HarvestWindow,
    ) -> Result<HarvestReport, PmhError> {
        let mut report = HarvestReport::default();
        let mut attempts = 0u32;
        let mut state = HarvestState::Idle;

        loop {
            state = match state {
                HarvestState::Idle => HarvestState::Fetching { page: 1, token: None },
                HarvestState::Fetching { page, token } => {
                    let params = ListRecordsParams {
                        from: Some(window.from),
                        until: Some(window.until),
                        set: set.map(str::to_string),
                        resumption_token: token.clone(),
                    };
                    report.requests += 1;
                    match self.client.list_records(base_url, &params).await {
                        Ok(result) => {
                            attempts = 0;
                            report.records_seen += result.records.len();
                            for record in result.records.iter().filter(|r| r.is_complete()) {
                                report.pages.extend(record.mint_pages(endpoint_id));
                            }
                            tracing::debug!(
                                endpoint = %endpoint_id,
                                page,
                                records = result.records.len(),
                                "harvested page"
                            );
                            match result.resumption_token {
                                Some(token) => HarvestState::Advancing { page, token },
                                None => HarvestState::Complete,
                            }
                        }
                        Err(e) if e.is_retryable() && attempts < self.max_retries => {
                            attempts += 1;
                            report.retries += 1;
                            tracing::info!(
                                endpoint = %endpoint_id,
                                attempt = attempts,
                                retry_secs = self.retry_delay.as_secs(),
                                "endpoint unavailable, retrying"
                            );
                            tokio::time::sleep(self.retry_delay).await;
                            HarvestState::Fetching { page, token }
                        }
                        Err(e) => HarvestState::Failed(e),
                    }
                }
                HarvestState::Advancing { page, token } => HarvestState::Fetching {
                    page: page + 1,
                    token: Some(token),
                },
                HarvestState::Complete => return Ok(report),
                HarvestState::Failed(e) => return Err(e),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn first_window_starts_at_epoch() {
        let config = HarvestConfig::default();
        let w = harvest_window(None, "repo.example/oai", &config, date("2024-06-01")).unwrap();
        assert_eq!(w.from, config.epoch_date());
        assert_eq!(w.until, config.epoch_date().checked_add_months(Months::new(12)).unwrap());
    }

    #[test]
    fn window_overlaps_watermark_and_stops_at_tomorrow() {
        let config = HarvestConfig::default();
        let w = harvest_window(Some("2024-05-01"), "repo.example/oai", &config, date("2024-06-01")).unwrap();
        assert_eq!(w.from, date("2024-04-30"));
        assert_eq!(w.until, date("2024-06-02"));
    }

    #[test]
    fn recent_watermark_is_pulled_back_two_days() {
        let config = HarvestConfig::default();
        let w = harvest_window(Some("2024-06-01"), "repo.example/oai", &config, date("2024-06-01")).unwrap();
        assert_eq!(w.from, date("2024-05-29"));
    }

    #[test]
    fn high_volume_endpoints_get_a_week() {
        let config = HarvestConfig::default();
        let w = harvest_window(
            Some("2020-01-10"),
            "https://export.arxiv.org/oai2",
            &config,
            date("2024-06-01"),
        )
        .unwrap();
        assert_eq!(w.from, date("2020-01-09"));
        assert_eq!(w.until, date("2020-01-17"));
    }

    #[test]
    fn bad_watermark_is_an_error() {
        let config = HarvestConfig::default();
        assert!(harvest_window(Some("yesterday"), "x", &config, date("2024-06-01")).is_err());
    }

    const PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <ListRecords>
    <record>
      <header><identifier>oai:repo:1</identifier><datestamp>2020-01-01</datestamp></header>
      <metadata>
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">
          <dc:title>Deep sequencing &amp; the mouse</dc:title>
          <dc:creator>Smith, Jane</dc:creator>
          <dc:identifier>https://repo.example/1</dc:identifier>
          <dc:identifier>https://doi.org/10.1234/ABC</dc:identifier>
        </oai_dc:dc>
      </metadata>
    </record>
    <record>
      <header status="deleted"><identifier>oai:repo:2</identifier></header>
    </record>
    <resumptionToken cursor="0">tok-1</resumptionToken>
  </ListRecords>
</OAI-PMH>"#;

    #[test]
    fn parses_records_and_token() {
        let page = parse_list_records(PAGE).unwrap();
        assert_eq!(page.records.len(), 1);
        let r = &page.records[0];
        assert_eq!(r.id, "oai:repo:1");
        assert_eq!(r.title.as_deref(), Some("Deep sequencing & the mouse"));
        assert_eq!(r.authors, vec!["Smith, Jane"]);
        assert_eq!(r.urls(), vec!["https://repo.example/1"]);
        assert_eq!(r.doi().as_deref(), Some("10.1234/abc"));
        assert_eq!(page.resumption_token.as_deref(), Some("tok-1"));
    }

    #[test]
    fn no_records_match_is_empty() {
        let xml = r#"<OAI-PMH><error code="noRecordsMatch">nothing here</error></OAI-PMH>"#;
        assert_eq!(parse_list_records(xml).unwrap(), PmhPage::default());
    }

    #[test]
    fn other_oai_errors_fail() {
        let xml = r#"<OAI-PMH><error code="badResumptionToken">expired</error></OAI-PMH>"#;
        match parse_list_records(xml) {
            Err(PmhError::Protocol { code, message }) => {
                assert_eq!(code, "badResumptionToken");
                assert_eq!(message, "expired");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn incomplete_and_closed_records_are_skipped() {
        let mut r = PmhRecord {
            id: "oai:1".into(),
            title: Some("T".into()),
            identifiers: vec!["https://doi.org/10.1/x".into()],
            ..Default::default()
        };
        assert!(!r.is_complete());
        r.identifiers.push("https://repo.example/1".into());
        assert!(r.is_complete());
        r.oa = Some("0".into());
        assert!(!r.is_complete());
    }

    #[test]
    fn mints_one_page_per_url() {
        let r = PmhRecord {
            id: "oai:1".into(),
            title: Some("A Title".into()),
            identifiers: vec![
                "https://repo.example/1".into(),
                "https://repo.example/1.pdf".into(),
                "doi:10.5/y".into(),
            ],
            ..Default::default()
        };
        let pages = r.mint_pages("ep1");
        assert_eq!(pages.len(), 2);
        assert_ne!(pages[0].id, pages[1].id);
        assert_eq!(pages[0].doi.as_deref(), Some("10.5/y"));
        assert_eq!(pages[0].normalized_title.as_deref(), Some("atitle"));
        assert_eq!(pages[0].id, page_id("ep1", "oai:1", "https://repo.example/1"));
    }

    /// Serves scripted responses in order.
    struct Scripted {
        responses: Mutex<Vec<Result<PmhPage, PmhError>>>,
        seen: Mutex<Vec<ListRecordsParams>>,
    }

    impl Scripted {
        fn new(mut responses: Vec<Result<PmhPage, PmhError>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PmhClient for Scripted {
        async fn list_records(&self, _: &str, params: &ListRecordsParams) -> Result<PmhPage, PmhError> {
            self.seen.lock().unwrap().push(params.clone());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(PmhError::Parse("script exhausted".into())))
        }
    }

    fn record(id: &str) -> PmhRecord {
        PmhRecord {
            id: id.into(),
            title: Some("Some title".into()),
            identifiers: vec![format!("https://repo.example/{}", id)],
            ..Default::default()
        }
    }

    fn quick_config() -> HarvestConfig {
        HarvestConfig {
            retry_secs: 0,
            max_retries: 2,
            ..Default::default()
        }
    }

    fn window() -> HarvestWindow {
        HarvestWindow {
            from: date("2020-01-01"),
            until: date("2021-01-01"),
        }
    }

    #[tokio::test]
    async fn follows_tokens_and_retries_503() {
        let client = Scripted::new(vec![
            Ok(PmhPage {
                records: vec![record("a")],
                resumption_token: Some("t1".into()),
            }),
            Err(PmhError::Unavailable),
            Ok(PmhPage {
                records: vec![record("b")],
                resumption_token: None,
            }),
        ]);
        let config = quick_config();
        let report = Harvester::new(&client, &config)
            .run("ep", "https://repo.example/oai", None, window())
            .await
            .unwrap();
        assert_eq!(report.pages.len(), 2);
        assert_eq!(report.retries, 1);
        assert_eq!(report.requests, 3);

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].resumption_token, None);
        assert_eq!(seen[1].resumption_token.as_deref(), Some("t1"));
        assert_eq!(seen[2].resumption_token.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let client = Scripted::new(vec![
            Err(PmhError::Unavailable),
            Err(PmhError::Unavailable),
            Err(PmhError::Unavailable),
        ]);
        let config = quick_config();
        let result = Harvester::new(&client, &config)
            .run("ep", "https://repo.example/oai", None, window())
            .await;
        assert!(matches!(result, Err(PmhError::Unavailable)));
    }

    #[tokio::test]
    async fn protocol_error_fails_the_window() {
        let client = Scripted::new(vec![
            Ok(PmhPage {
                records: vec![record("a")],
                resumption_token: Some("t1".into()),
            }),
            Err(PmhError::Protocol {
                code: "badResumptionToken".into(),
                message: String::new(),
            }),
        ]);
        let config = quick_config();
        let result = Harvester::new(&client, &config)
            .run("ep", "https://repo.example/oai", Some("physics"), window())
            .await;
        assert!(matches!(result, Err(PmhError::Protocol { .. })));
    }
}
