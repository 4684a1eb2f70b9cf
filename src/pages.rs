//! Harvested pages: persistence, lookups, and the `scrape` operation.
//!
//! A chunk of pages is scraped on the [`scrape_pool`](crate::scrape_pool):
//! every page is cloned into its own job, and the scraped copies replace the
//! originals before the runner writes the chunk back in one transaction.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

use crate::lease::placeholders;
use crate::models::{now_ts, OpenLocation, Page, Version};
use crate::ranker::{copyright_mark_matters, derive_version, pmcid_from_url, VersionHints};
use crate::runner::{JobContext, PageOp, Target};
use crate::scrape::{DocumentProbe, ScraperSet, SourceTag};
use crate::scrape_pool::{run_pool, Outcome};

const PAGE_COLUMNS: &str = "id, endpoint_id, pmh_id, url, doi, title, normalized_title, authors_json, \
     source_tag, created_at, scrape_updated, scrape_pdf_url, scrape_metadata_url, scrape_license, \
     scrape_version, error";

fn page_from_row(row: &SqliteRow) -> Page {
    let authors_json: String = row.get("authors_json");
    let version: Option<String> = row.get("scrape_version");
    Page {
        id: row.get("id"),
        endpoint_id: row.get("endpoint_id"),
        pmh_id: row.get("pmh_id"),
        url: row.get("url"),
        doi: row.get("doi"),
        title: row.get("title"),
        normalized_title: row.get("normalized_title"),
        authors: serde_json::from_str(&authors_json).unwrap_or_default(),
        source_tag: row.get("source_tag"),
        created_at: row.get("created_at"),
        scrape_updated: row.get("scrape_updated"),
        scrape_pdf_url: row.get("scrape_pdf_url"),
        scrape_metadata_url: row.get("scrape_metadata_url"),
        scrape_license: row.get("scrape_license"),
        scrape_version: version.as_deref().and_then(Version::parse),
        error: row.get("error"),
    }
}

pub async fn pages_by_doi(pool: &SqlitePool, doi: &str) -> Result<Vec<Page>> {
    let sql = format!("SELECT {PAGE_COLUMNS} FROM pages WHERE doi = ? ORDER BY id");
    let rows = sqlx::query(&sql).bind(doi).fetch_all(pool).await?;
    Ok(rows.iter().map(page_from_row).collect())
}

pub async fn pages_by_normalized_title(pool: &SqlitePool, normalized_title: &str) -> Result<Vec<Page>> {
    let sql = format!("SELECT {PAGE_COLUMNS} FROM pages WHERE normalized_title = ? ORDER BY id");
    let rows = sqlx::query(&sql).bind(normalized_title).fetch_all(pool).await?;
    Ok(rows.iter().map(page_from_row).collect())
}

/// Insert harvested pages. Existing pages keep their scrape results and only
/// get fresh record metadata. Returns the ids that were new.
pub async fn upsert_pages_in(conn: &mut SqliteConnection, pages: &[Page]) -> Result<Vec<String>> {
    let mut inserted = Vec::new();
    for page in pages {
        let authors_json = serde_json::to_string(&page.authors)?;
        let result = sqlx::query(
            "INSERT INTO pages (id, endpoint_id, pmh_id, url, doi, title, normalized_title, \
             authors_json, source_tag, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&page.id)
        .bind(&page.endpoint_id)
        .bind(&page.pmh_id)
        .bind(&page.url)
        .bind(&page.doi)
        .bind(&page.title)
        .bind(&page.normalized_title)
        .bind(&authors_json)
        .bind(&page.source_tag)
        .bind(page.created_at)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() > 0 {
            inserted.push(page.id.clone());
        } else {
            sqlx::query(
                "UPDATE pages SET doi = ?, title = ?, normalized_title = ?, authors_json = ? WHERE id = ?",
            )
            .bind(&page.doi)
            .bind(&page.title)
            .bind(&page.normalized_title)
            .bind(&authors_json)
            .bind(&page.id)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(inserted)
}

/// Author-manuscript flags for the PMC ids in these pages' URLs.
async fn author_manuscripts(pool: &SqlitePool, pages: &[Page]) -> Result<HashMap<String, bool>> {
    let pmcids: Vec<String> = pages.iter().filter_map(|p| pmcid_from_url(&p.url)).collect();
    if pmcids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT pmcid, author_manuscript FROM pmc_manuscripts WHERE pmcid IN ({})",
        placeholders(pmcids.len())
    );
    let mut query = sqlx::query(&sql);
    for id in &pmcids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("pmcid"), r.get::<bool, _>("author_manuscript")))
        .collect())
}

/// Ask the probe whether a PDF carries a copyright mark. A failed fetch
/// counts as no mark.
pub async fn probe_copyright(probe: &dyn DocumentProbe, pdf_url: &str) -> bool {
    probe.has_copyright_mark(pdf_url).await.unwrap_or_else(|e| {
        tracing::debug!(url = %pdf_url, error = %e, "copyright probe failed");
        false
    })
}

/// Scrape one page and derive its version. Owns everything it touches so it
/// can run on the pool.
async fn scrape_page(
    mut page: Page,
    scrapers: Arc<ScraperSet>,
    probe: Arc<dyn DocumentProbe>,
    manuscripts: Arc<HashMap<String, bool>>,
) -> Result<Page> {
    if page.url.is_empty() {
        bail!("page {} has no url", page.id);
    }
    let scraper = scrapers.for_tag(SourceTag::parse(&page.source_tag));
    let result = scraper.scrape_for_fulltext(&page.url).await?;

    page.scrape_updated = Some(now_ts());
    page.scrape_pdf_url = result.pdf_url;
    page.scrape_metadata_url = result.metadata_url;
    page.scrape_license = result.license;
    page.scrape_version = None;
    page.error = None;

    if page.is_open() {
        let mut loc = OpenLocation::new(page.doi.as_deref().unwrap_or_default(), "oa repository");
        loc.pdf_url = page.scrape_pdf_url.clone();
        loc.metadata_url = page.scrape_metadata_url.clone();

        let hints = VersionHints {
            author_manuscript: pmcid_from_url(&page.url).and_then(|id| manuscripts.get(&id).copied()),
            copyright_mark: None,
        };
        let copyright_mark = match page.scrape_pdf_url.as_deref() {
            Some(pdf_url) if copyright_mark_matters(&loc, &hints) => {
                Some(probe_copyright(probe.as_ref(), pdf_url).await)
            }
            _ => Some(false),
        };
        page.scrape_version = derive_version(&loc, &VersionHints { copyright_mark, ..hints });
    }

    tracing::debug!(id = %page.id, open = page.is_open(), "page scraped");
    Ok(page)
}

#[async_trait]
impl Target for Page {
    type Op = PageOp;
    type Shortcut = ();

    fn id(&self) -> &str {
        &self.id
    }

    fn with_id(id: &str) -> Self {
        Page {
            id: id.to_string(),
            source_tag: SourceTag::Repository.as_str().to_string(),
            ..Default::default()
        }
    }

    fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    async fn load_many(pool: &SqlitePool, ids: &[String]) -> Result<Vec<Self>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM pages WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(pool).await?;
        Ok(rows.iter().map(page_from_row).collect())
    }

    async fn all_ids(pool: &SqlitePool) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM pages ORDER BY id")
            .fetch_all(pool)
            .await?;
        Ok(ids)
    }

    async fn shortcut(_ctx: &JobContext, _op: PageOp) -> Result<()> {
        Ok(())
    }

    async fn run_one(&mut self, _op: PageOp, ctx: &JobContext, _shortcut: &()) -> Result<()> {
        let manuscripts = author_manuscripts(&ctx.pool, std::slice::from_ref(self)).await?;
        *self = scrape_page(
            self.clone(),
            ctx.scrapers.clone(),
            ctx.probe.clone(),
            Arc::new(manuscripts),
        )
        .await?;
        Ok(())
    }

    async fn run_chunk(items: &mut [Self], _op: PageOp, ctx: &JobContext, _shortcut: &()) -> usize {
        let manuscripts = match author_manuscripts(&ctx.pool, items).await {
            Ok(m) => Arc::new(m),
            Err(e) => {
                tracing::warn!(error = %e, "could not load author-manuscript flags");
                Arc::new(HashMap::new())
            }
        };
        let scrapers = ctx.scrapers.clone();
        let probe = ctx.probe.clone();

        let results = run_pool(
            items.to_vec(),
            ctx.config.scrape.workers,
            ctx.config.scrape.task_timeout(),
            |page| scrape_page(page, scrapers.clone(), probe.clone(), manuscripts.clone()),
        )
        .await;

        tracing::info!(
            pages = items.len(),
            scraped = results.done,
            failed = results.failed,
            timed_out = results.timed_out,
            "scrape pool finished"
        );

        for (item, outcome) in items.iter_mut().zip(results.outcomes) {
            match outcome {
                Some(Outcome::Done(page)) => *item = page,
                Some(Outcome::Failed(error)) => item.set_error(Some(error)),
                // a timed-out scrape found nothing; the page is left as it was
                Some(Outcome::TimedOut) | None => {}
            }
        }
        results.failed + results.panicked
    }

    async fn save_all(conn: &mut SqliteConnection, items: &[Self]) -> Result<()> {
        for page in items {
            sqlx::query(
                "UPDATE pages SET scrape_updated = ?, scrape_pdf_url = ?, scrape_metadata_url = ?, \
                 scrape_license = ?, scrape_version = ?, error = ? WHERE id = ?",
            )
            .bind(page.scrape_updated)
            .bind(&page.scrape_pdf_url)
            .bind(&page.scrape_metadata_url)
            .bind(&page.scrape_license)
            .bind(page.scrape_version.map(|v| v.as_str()))
            .bind(&page.error)
            .bind(&page.id)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }
}
