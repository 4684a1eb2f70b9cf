use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use open_locator::config::Config;
use open_locator::endpoints::{load_endpoint, register_endpoint};
use open_locator::error::{PmhError, ScrapeError};
use open_locator::harvest::{ListRecordsParams, PmhClient, PmhPage, PmhRecord};
use open_locator::lease::{worker_tag, ClaimFilter};
use open_locator::pages::pages_by_doi;
use open_locator::queue::{QueueKind, WorkQueue};
use open_locator::runner::{run_operation, IdSource, JobContext, Operation, RunOptions};
use open_locator::scrape::{DocumentProbe, ScrapeResult, Scraper, ScraperSet};
use open_locator::works::{add_works, load_locations, load_work};
use open_locator::{db, migrate, rules};
use sqlx::SqlitePool;
use tempfile::TempDir;

// ============ Fakes ============

struct FakePmh {
    responses: Mutex<Vec<Result<PmhPage, PmhError>>>,
    seen: Mutex<Vec<ListRecordsParams>>,
}

impl FakePmh {
    fn new(mut responses: Vec<Result<PmhPage, PmhError>>) -> Self {
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<ListRecordsParams> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PmhClient for FakePmh {
    async fn list_records(&self, _: &str, params: &ListRecordsParams) -> Result<PmhPage, PmhError> {
        self.seen.lock().unwrap().push(params.clone());
        self.responses
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(Ok(PmhPage::default()))
    }
}

enum Behavior {
    Find(ScrapeResult),
    Fail,
    Hang,
}

struct FakeScraper(Behavior);

#[async_trait]
impl Scraper for FakeScraper {
    async fn scrape_for_fulltext(&self, url: &str) -> Result<ScrapeResult, ScrapeError> {
        match &self.0 {
            Behavior::Find(result) => Ok(result.clone()),
            Behavior::Fail => Err(ScrapeError::transport(url, "connection reset")),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ScrapeResult::default())
            }
        }
    }
}

struct NoMark;

#[async_trait]
impl DocumentProbe for NoMark {
    async fn has_copyright_mark(&self, _: &str) -> Result<bool, ScrapeError> {
        Ok(false)
    }
}

struct Marked;

#[async_trait]
impl DocumentProbe for Marked {
    async fn has_copyright_mark(&self, _: &str) -> Result<bool, ScrapeError> {
        Ok(true)
    }
}

// ============ Setup ============

const DOI: &str = "10.5555/widgets.1";
const PDF: &str = "https://repo.example.org/bitstream/1.pdf";

async fn setup() -> (TempDir, SqlitePool, Config) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::with_db_path(tmp.path().join("olo.sqlite"));
    config.harvest.retry_secs = 0;
    config.scrape.task_timeout_secs = 1;
    config.scrape.workers = 4;
    let pool = db::connect(&config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    (tmp, pool, config)
}

fn context(pool: &SqlitePool, config: &Config, pmh: Arc<FakePmh>, repository: Behavior) -> JobContext {
    context_with_publisher(pool, config, pmh, Behavior::Find(ScrapeResult::default()), repository)
}

fn context_with_publisher(
    pool: &SqlitePool,
    config: &Config,
    pmh: Arc<FakePmh>,
    publisher: Behavior,
    repository: Behavior,
) -> JobContext {
    JobContext {
        pool: pool.clone(),
        config: Arc::new(config.clone()),
        scrapers: Arc::new(ScraperSet::new(
            Arc::new(FakeScraper(publisher)),
            Arc::new(FakeScraper(repository)),
        )),
        pmh,
        probe: Arc::new(NoMark),
    }
}

fn record_page() -> PmhPage {
    PmhPage {
        records: vec![PmhRecord {
            id: "oai:repo.example.org:1".into(),
            title: Some("Widgets and their discontents in practice".into()),
            authors: vec!["Okafor, Ada".into()],
            identifiers: vec![
                "https://repo.example.org/handle/1".into(),
                format!("https://doi.org/{}", DOI.to_uppercase()),
            ],
            oa: None,
        }],
        resumption_token: None,
    }
}

fn found_pdf() -> Behavior {
    Behavior::Find(ScrapeResult {
        pdf_url: Some(PDF.into()),
        ..Default::default()
    })
}

async fn harvest(ctx: &JobContext, endpoint_id: &str) -> u64 {
    let summary = run_operation(
        ctx,
        Operation::Harvest,
        IdSource::Fixed(vec![endpoint_id.to_string()]),
        &RunOptions::from_config(&ctx.config),
    )
    .await
    .unwrap();
    summary.failed
}

async fn drain(ctx: &JobContext, op: Operation) -> u64 {
    let mut opts = RunOptions::from_config(&ctx.config);
    opts.drain = true;
    let source = IdSource::Queue {
        queue: WorkQueue::new(ctx.pool.clone(), op.queue(), &ctx.config, worker_tag()),
        filter: ClaimFilter::Available,
    };
    run_operation(ctx, op, source, &opts).await.unwrap().failed
}

async fn recalculate(ctx: &JobContext, id: &str) {
    let summary = run_operation(
        ctx,
        Operation::Recalculate,
        IdSource::Fixed(vec![id.to_string()]),
        &RunOptions::from_config(&ctx.config),
    )
    .await
    .unwrap();
    assert_eq!(summary.failed, 0);
}

fn write_rules(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("rules.toml");
    std::fs::write(&path, body).unwrap();
    path
}

// ============ Harvest ============

#[tokio::test]
async fn first_harvest_starts_at_epoch_and_queues_pages() {
    let (_tmp, pool, config) = setup().await;
    let pmh = Arc::new(FakePmh::new(vec![Ok(record_page())]));
    let ctx = context(&pool, &config, pmh.clone(), found_pdf());
    let id = register_endpoint(&pool, "https://repo.example.org/oai", None, None)
        .await
        .unwrap();

    assert_eq!(harvest(&ctx, &id).await, 0);

    let seen = pmh.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].from, Some(NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()));

    let endpoint = load_endpoint(&pool, &id).await.unwrap().unwrap();
    assert_eq!(endpoint.most_recent_date_harvested.as_deref(), Some("2001-01-01"));
    assert!(endpoint.error.is_none());

    let pages = pages_by_doi(&pool, DOI).await.unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].url, "https://repo.example.org/handle/1");
    assert_eq!(pages[0].endpoint_id, id);

    let queue = WorkQueue::new(pool.clone(), QueueKind::Pages, &config, worker_tag());
    assert_eq!(queue.backlog().await.unwrap().waiting, 1);
}

#[tokio::test]
async fn failed_harvest_keeps_the_watermark() {
    let (_tmp, pool, config) = setup().await;
    let pmh = Arc::new(FakePmh::new(vec![
        Ok(PmhPage {
            resumption_token: Some("t1".into()),
            ..record_page()
        }),
        Err(PmhError::Protocol {
            code: "badResumptionToken".into(),
            message: "expired".into(),
        }),
    ]));
    let ctx = context(&pool, &config, pmh.clone(), found_pdf());
    let id = register_endpoint(&pool, "https://repo.example.org/oai", None, None)
        .await
        .unwrap();
    sqlx::query("UPDATE endpoints SET most_recent_date_harvested = '2010-05-01' WHERE id = ?")
        .bind(&id)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(harvest(&ctx, &id).await, 1);

    // a day of overlap before the watermark
    assert_eq!(pmh.seen()[0].from, Some(NaiveDate::from_ymd_opt(2010, 4, 30).unwrap()));

    let endpoint = load_endpoint(&pool, &id).await.unwrap().unwrap();
    assert_eq!(endpoint.most_recent_date_harvested.as_deref(), Some("2010-05-01"));
    assert!(endpoint.error.unwrap().contains("badResumptionToken"));

    // the first page of the failed window was discarded
    assert!(pages_by_doi(&pool, DOI).await.unwrap().is_empty());
}

// ============ Scrape ============

#[tokio::test]
async fn scraped_page_feeds_the_work_result() {
    let (_tmp, pool, config) = setup().await;
    let pmh = Arc::new(FakePmh::new(vec![Ok(record_page())]));
    let ctx = context(&pool, &config, pmh, found_pdf());
    let endpoint_id = register_endpoint(&pool, "https://repo.example.org/oai", None, None)
        .await
        .unwrap();

    harvest(&ctx, &endpoint_id).await;
    assert_eq!(drain(&ctx, Operation::Scrape).await, 0);

    let page = pages_by_doi(&pool, DOI).await.unwrap().remove(0);
    assert_eq!(page.scrape_pdf_url.as_deref(), Some(PDF));
    assert!(page.scrape_updated.is_some());

    add_works(&pool, &[(DOI.to_string(), "{}".to_string())]).await.unwrap();
    assert_eq!(drain(&ctx, Operation::Recalculate).await, 0);

    let work = load_work(&pool, DOI).await.unwrap().unwrap();
    assert!(work.response_is_oa);
    assert_eq!(
        work.response_best_evidence.as_deref(),
        Some("oa repository (via OAI-PMH doi match)")
    );
    assert_eq!(work.response_best_url.as_deref(), Some(PDF));
    assert_eq!(work.response_best_host.as_deref(), Some("repository"));

    let locations = load_locations(&pool, DOI).await.unwrap();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].endpoint_id.as_deref(), Some(endpoint_id.as_str()));
}

#[tokio::test]
async fn scrape_timeout_leaves_the_page_alone() {
    let (_tmp, pool, config) = setup().await;
    let pmh = Arc::new(FakePmh::new(vec![Ok(record_page())]));
    let ctx = context(&pool, &config, pmh, Behavior::Hang);
    let endpoint_id = register_endpoint(&pool, "https://repo.example.org/oai", None, None)
        .await
        .unwrap();

    harvest(&ctx, &endpoint_id).await;
    assert_eq!(drain(&ctx, Operation::Scrape).await, 0);

    let page = pages_by_doi(&pool, DOI).await.unwrap().remove(0);
    assert!(page.scrape_updated.is_none());
    assert!(page.error.is_none());
}

#[tokio::test]
async fn scrape_failure_is_stored_on_the_page() {
    let (_tmp, pool, config) = setup().await;
    let pmh = Arc::new(FakePmh::new(vec![Ok(record_page())]));
    let ctx = context(&pool, &config, pmh, Behavior::Fail);
    let endpoint_id = register_endpoint(&pool, "https://repo.example.org/oai", None, None)
        .await
        .unwrap();

    harvest(&ctx, &endpoint_id).await;
    assert_eq!(drain(&ctx, Operation::Scrape).await, 1);

    let page = pages_by_doi(&pool, DOI).await.unwrap().remove(0);
    assert!(page.error.unwrap().contains("connection reset"));

    // the failed item was still finished; the queue is empty
    let queue = WorkQueue::new(pool.clone(), QueueKind::Pages, &config, worker_tag());
    assert_eq!(queue.backlog().await.unwrap().remaining(), 0);
}

// ============ Works ============

const PLOS_METADATA: &str = r#"{
  "title": "Gene expression in a model organism",
  "ISSN": ["1932-6203"],
  "issued": {"date-parts": [[2015]]}
}"#;

#[tokio::test]
async fn recalculate_is_idempotent() {
    let (tmp, pool, config) = setup().await;
    let ctx = context(&pool, &config, Arc::new(FakePmh::new(vec![])), found_pdf());
    let rules_path = write_rules(
        &tmp,
        r#"[[journal]]
kind = "issn"
value = "1932-6203"
license = "cc-by"
"#,
    );
    rules::import_rules(&pool, &rules_path).await.unwrap();
    let id = "10.1371/journal.pone.0001";
    add_works(&pool, &[(id.to_string(), PLOS_METADATA.to_string())]).await.unwrap();

    recalculate(&ctx, id).await;
    let first = load_work(&pool, id).await.unwrap().unwrap();
    let first_locations = load_locations(&pool, id).await.unwrap();
    assert!(first.response_is_oa);
    assert_eq!(first.response_color.as_deref(), Some("gold"));

    recalculate(&ctx, id).await;
    let second = load_work(&pool, id).await.unwrap().unwrap();
    let second_locations = load_locations(&pool, id).await.unwrap();

    assert_eq!(first.response_json, second.response_json);
    assert_eq!(first.response_updated, second.response_updated);
    assert_eq!(first_locations.len(), second_locations.len());
    assert_eq!(first_locations[0].created_at, second_locations[0].created_at);
}

#[tokio::test]
async fn manual_override_replaces_every_other_source() {
    let (tmp, pool, config) = setup().await;
    let ctx = context(&pool, &config, Arc::new(FakePmh::new(vec![])), found_pdf());
    let id = "10.1371/journal.pone.0002";
    let rules_path = write_rules(
        &tmp,
        &format!(
            r#"[[journal]]
kind = "issn"
value = "1932-6203"

[[override]]
work_id = "{id}"
pdf_url = "https://manual.example.org/copy.pdf"
version = "accepted"
"#
        ),
    );
    rules::import_rules(&pool, &rules_path).await.unwrap();
    add_works(&pool, &[(id.to_string(), PLOS_METADATA.to_string())]).await.unwrap();

    recalculate(&ctx, id).await;
    let work = load_work(&pool, id).await.unwrap().unwrap();
    assert_eq!(work.response_best_evidence.as_deref(), Some("manual"));
    assert_eq!(work.response_best_url.as_deref(), Some("https://manual.example.org/copy.pdf"));
    assert_eq!(work.response_best_version.as_deref(), Some("acceptedVersion"));
    assert_eq!(load_locations(&pool, id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn override_without_urls_forces_closed() {
    let (tmp, pool, config) = setup().await;
    let ctx = context(&pool, &config, Arc::new(FakePmh::new(vec![])), found_pdf());
    let id = "10.1371/journal.pone.0003";
    let rules_path = write_rules(
        &tmp,
        &format!(
            r#"[[journal]]
kind = "issn"
value = "1932-6203"

[[override]]
work_id = "{id}"
"#
        ),
    );
    rules::import_rules(&pool, &rules_path).await.unwrap();
    add_works(&pool, &[(id.to_string(), PLOS_METADATA.to_string())]).await.unwrap();

    recalculate(&ctx, id).await;
    let work = load_work(&pool, id).await.unwrap().unwrap();
    assert!(!work.response_is_oa);
    assert!(work.response_best_url.is_none());
    assert!(load_locations(&pool, id).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_work_row_gets_a_default_subject() {
    let (_tmp, pool, config) = setup().await;
    let ctx = context(&pool, &config, Arc::new(FakePmh::new(vec![])), found_pdf());

    recalculate(&ctx, "10.9999/never-added").await;
    let work = load_work(&pool, "10.9999/never-added").await.unwrap().unwrap();
    assert!(!work.response_is_oa);
    assert!(work.response_json.is_some());
}

#[tokio::test]
async fn refresh_stores_the_publisher_scrape() {
    let (_tmp, pool, config) = setup().await;
    let publisher = Behavior::Find(ScrapeResult {
        pdf_url: Some("https://publisher.example.com/article.pdf".into()),
        metadata_url: Some(format!("https://doi.org/{}", DOI)),
        license: Some("cc-by".into()),
        evidence: Some("hybrid (via free pdf)".into()),
    });
    let ctx = context_with_publisher(&pool, &config, Arc::new(FakePmh::new(vec![])), publisher, found_pdf());
    add_works(&pool, &[(DOI.to_string(), "{}".to_string())]).await.unwrap();

    let summary = run_operation(
        &ctx,
        Operation::Refresh,
        IdSource::Fixed(vec![DOI.to_string()]),
        &RunOptions::from_config(&config),
    )
    .await
    .unwrap();
    assert_eq!(summary.failed, 0);

    let work = load_work(&pool, DOI).await.unwrap().unwrap();
    assert!(work.scrape_updated.is_some());
    assert_eq!(work.scrape_evidence.as_deref(), Some("hybrid (via free pdf)"));
    assert!(work.response_is_oa);
    assert_eq!(work.response_best_evidence.as_deref(), Some("hybrid (via free pdf)"));
    assert_eq!(work.response_color.as_deref(), Some("gold"));
    assert!(work.error.is_none());
}

#[tokio::test]
async fn refresh_scrape_failure_still_recalculates() {
    let (tmp, pool, config) = setup().await;
    let ctx = context_with_publisher(
        &pool,
        &config,
        Arc::new(FakePmh::new(vec![])),
        Behavior::Fail,
        found_pdf(),
    );
    let rules_path = write_rules(
        &tmp,
        r#"[[journal]]
kind = "issn"
value = "1932-6203"
"#,
    );
    rules::import_rules(&pool, &rules_path).await.unwrap();
    let id = "10.1371/journal.pone.0004";
    add_works(&pool, &[(id.to_string(), PLOS_METADATA.to_string())]).await.unwrap();

    let summary = run_operation(
        &ctx,
        Operation::Refresh,
        IdSource::Fixed(vec![id.to_string()]),
        &RunOptions::from_config(&config),
    )
    .await
    .unwrap();
    assert_eq!(summary.failed, 0);

    let work = load_work(&pool, id).await.unwrap().unwrap();
    assert!(work.response_is_oa);
    assert!(work.scrape_updated.is_none());
    assert!(work.error.unwrap().contains("connection reset"));
}

async fn add_unversioned_repository_copy(pool: &SqlitePool) {
    add_works(pool, &[(DOI.to_string(), "{}".to_string())]).await.unwrap();
    sqlx::query(
        "INSERT INTO repository_links (work_id, repository, record_id, release, pdf_url) \
         VALUES (?, 'zenodo', '42', 'live', ?)",
    )
    .bind(DOI)
    .bind(PDF)
    .execute(pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn copyright_mark_decides_repository_copy_version() {
    let (_tmp, pool, config) = setup().await;
    add_unversioned_repository_copy(&pool).await;

    let unmarked = context(&pool, &config, Arc::new(FakePmh::new(vec![])), found_pdf());
    recalculate(&unmarked, DOI).await;
    let work = load_work(&pool, DOI).await.unwrap().unwrap();
    assert_eq!(work.response_best_url.as_deref(), Some(PDF));
    assert_eq!(work.response_best_version.as_deref(), Some("submittedVersion"));

    let marked = JobContext {
        probe: Arc::new(Marked),
        ..context(&pool, &config, Arc::new(FakePmh::new(vec![])), found_pdf())
    };
    recalculate(&marked, DOI).await;
    let work = load_work(&pool, DOI).await.unwrap().unwrap();
    assert_eq!(work.response_best_version.as_deref(), Some("publishedVersion"));
}

#[tokio::test]
async fn queue_run_outlasts_a_failed_claim() {
    let (_tmp, pool, config) = setup().await;
    let ctx = context(&pool, &config, Arc::new(FakePmh::new(vec![])), found_pdf());
    add_works(&pool, &[(DOI.to_string(), "{}".to_string())]).await.unwrap();
    sqlx::query("ALTER TABLE work_queue RENAME TO work_queue_away")
        .execute(&pool)
        .await
        .unwrap();

    let mut opts = RunOptions::from_config(&config);
    opts.limit = Some(1);
    opts.empty_backoff = Duration::from_millis(20);
    let source = IdSource::Queue {
        queue: WorkQueue::new(pool.clone(), QueueKind::Works, &config, worker_tag()),
        filter: ClaimFilter::Available,
    };
    let restore = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        sqlx::query("ALTER TABLE work_queue_away RENAME TO work_queue")
            .execute(&pool)
            .await
            .unwrap();
    };

    let (summary, ()) = tokio::time::timeout(
        Duration::from_secs(10),
        async { tokio::join!(run_operation(&ctx, Operation::Recalculate, source, &opts), restore) },
    )
    .await
    .expect("run recovers once claims succeed");
    let summary = summary.unwrap();
    assert_eq!(summary.processed, 1);
    assert!(load_work(&pool, DOI).await.unwrap().unwrap().response_json.is_some());
}
