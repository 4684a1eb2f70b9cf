//! Works: persistence and the `recalculate` / `refresh` operations.
//!
//! `recalculate` is a pure function of stored data: metadata, rule tables,
//! harvested pages, and the stored landing-page scrape. `refresh` re-scrapes
//! the publisher landing page first, then recalculates.
//!
//! Writes happen only in [`Target::save_all`], inside the runner's chunk
//! transaction.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;

use crate::biblio::Biblio;
use crate::evidence::{self, gather_inputs, Env, StoredScrape, Subject};
use crate::lease::{enqueue_in, placeholders};
use crate::models::{now_ts, OpenLocation, Version, Work};
use crate::queue::QueueKind;
use crate::pages::probe_copyright;
use crate::ranker::{
    self, consolidate, copyright_mark_matters, pmcid_from_url, rank, ConsolidatedResult, Ranked, VersionHints,
};
use crate::rules::RuleBook;
use crate::runner::{JobContext, Target, WorkOp};
use crate::scrape::SourceTag;

const WORK_COLUMNS: &str = "id, rand, created_at, updated_at, metadata_json, title, normalized_title, \
     scrape_updated, scrape_evidence, scrape_pdf_url, scrape_metadata_url, scrape_license, \
     response_json, response_is_oa, response_best_url, response_best_evidence, \
     response_best_version, response_best_host, response_color, response_updated, error";

fn work_from_row(row: &SqliteRow) -> Work {
    Work {
        id: row.get("id"),
        rand: row.get("rand"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        metadata_json: row.get("metadata_json"),
        title: row.get("title"),
        normalized_title: row.get("normalized_title"),
        scrape_updated: row.get("scrape_updated"),
        scrape_evidence: row.get("scrape_evidence"),
        scrape_pdf_url: row.get("scrape_pdf_url"),
        scrape_metadata_url: row.get("scrape_metadata_url"),
        scrape_license: row.get("scrape_license"),
        response_json: row.get("response_json"),
        response_is_oa: row.get("response_is_oa"),
        response_best_url: row.get("response_best_url"),
        response_best_evidence: row.get("response_best_evidence"),
        response_best_version: row.get("response_best_version"),
        response_best_host: row.get("response_best_host"),
        response_color: row.get("response_color"),
        response_updated: row.get("response_updated"),
        error: row.get("error"),
        locations: Vec::new(),
    }
}

pub async fn load_work(pool: &SqlitePool, id: &str) -> Result<Option<Work>> {
    let sql = format!("SELECT {WORK_COLUMNS} FROM works WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(work_from_row))
}

/// Stored open locations of a work, in no particular order.
pub async fn load_locations(pool: &SqlitePool, work_id: &str) -> Result<Vec<OpenLocation>> {
    let rows = sqlx::query(
        "SELECT work_id, pdf_url, metadata_url, license, evidence, version, host_type, endpoint_id, \
         created_at, updated_at, error FROM open_locations WHERE work_id = ? ORDER BY id",
    )
    .bind(work_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let version: Option<String> = row.get("version");
            let host_type: Option<String> = row.get("host_type");
            OpenLocation {
                work_id: row.get("work_id"),
                pdf_url: row.get("pdf_url"),
                metadata_url: row.get("metadata_url"),
                license: row.get("license"),
                evidence: row.get("evidence"),
                version: version.as_deref().and_then(Version::parse),
                host_type: host_type.as_deref().and_then(crate::models::HostType::parse),
                endpoint_id: row.get("endpoint_id"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
                error: row.get("error"),
            }
        })
        .collect())
}

/// Insert or update works with raw metadata and put them on the work queue.
pub async fn add_works(pool: &SqlitePool, works: &[(String, String)]) -> Result<usize> {
    let now = now_ts();
    let mut tx = pool.begin().await?;
    for (id, metadata_json) in works {
        let biblio = Biblio::from_metadata(id, metadata_json)?;
        sqlx::query(
            "INSERT INTO works (id, rand, created_at, updated_at, metadata_json, title, normalized_title) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET metadata_json = excluded.metadata_json, \
               title = excluded.title, normalized_title = excluded.normalized_title, \
               updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(rand::random::<f64>())
        .bind(now)
        .bind(now)
        .bind(metadata_json)
        .bind(&biblio.title)
        .bind(&biblio.normalized_title)
        .execute(&mut *tx)
        .await?;
    }
    let ids: Vec<String> = works.iter().map(|(id, _)| id.clone()).collect();
    enqueue_in(&mut *tx, QueueKind::Works.spec().table, &ids).await?;
    tx.commit().await?;
    Ok(works.len())
}

/// Deterministic location id: the same URL on the same work is the same row.
pub fn location_id(work_id: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(work_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Probe the PDFs of unversioned locations whose version hinges on a
/// copyright mark. Keyed by PDF URL.
async fn copyright_marks(
    ctx: &JobContext,
    locations: &[OpenLocation],
    author_manuscripts: &HashMap<String, bool>,
) -> HashMap<String, bool> {
    let mut marks = HashMap::new();
    for loc in locations.iter().filter(|l| l.version.is_none()) {
        let Some(pdf_url) = loc.pdf_url.as_deref() else {
            continue;
        };
        if marks.contains_key(pdf_url) {
            continue;
        }
        let hints = VersionHints {
            author_manuscript: loc
                .best_url()
                .and_then(pmcid_from_url)
                .and_then(|id| author_manuscripts.get(&id).copied()),
            copyright_mark: None,
        };
        if copyright_mark_matters(loc, &hints) {
            let marked = probe_copyright(ctx.probe.as_ref(), pdf_url).await;
            marks.insert(pdf_url.to_string(), marked);
        }
    }
    marks
}

impl Work {
    fn stored_scrape(&self) -> Option<StoredScrape> {
        self.scrape_updated.map(|updated| StoredScrape {
            evidence: self.scrape_evidence.clone(),
            pdf_url: self.scrape_pdf_url.clone(),
            metadata_url: self.scrape_metadata_url.clone(),
            license: self.scrape_license.clone(),
            updated,
        })
    }

    pub fn previous_result(&self) -> Option<ConsolidatedResult> {
        self.response_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
    }

    /// Re-evaluate evidence and rebuild the consolidated result.
    pub async fn recalculate(&mut self, ctx: &JobContext, rules: &RuleBook, now: DateTime<Utc>) -> Result<()> {
        let biblio = Biblio::from_metadata(&self.id, &self.metadata_json)?;
        self.title = biblio.title.clone();
        self.normalized_title = biblio.normalized_title.clone();

        let inputs = gather_inputs(&ctx.pool, &biblio)
            .await
            .with_context(|| format!("gathering evidence inputs for {}", self.id))?;
        let subject = Subject {
            biblio: &biblio,
            hybrid: self.stored_scrape(),
        };
        let env = Env {
            rules,
            now,
            hybrid_stale_days: ctx.config.scrape.hybrid_stale_days,
        };
        let collected = evidence::collect(&evidence::default_strategies(), &subject, &inputs, &env);
        let marks = copyright_marks(ctx, &collected.locations, &inputs.author_manuscripts).await;
        let ranked = rank(
            collected.locations,
            &inputs.noncompliant,
            &inputs.author_manuscripts,
            &marks,
        );

        let previous = self.previous_result();
        let result = consolidate(
            &biblio,
            &ranked,
            collected.journal_is_oa,
            !collected.errors.is_empty(),
            previous.as_ref(),
            now,
        );
        self.apply_result(&result, ranked, now)?;
        self.error = if collected.errors.is_empty() {
            None
        } else {
            Some(collected.errors.join("; "))
        };
        Ok(())
    }

    fn apply_result(&mut self, result: &ConsolidatedResult, ranked: Ranked, now: DateTime<Utc>) -> Result<()> {
        let changed = self
            .previous_result()
            .map(|prev| prev.updated != result.updated)
            .unwrap_or(true);

        let best = result.best_oa_location.as_ref();
        self.response_json = Some(serde_json::to_string(result)?);
        self.response_is_oa = result.is_open;
        self.response_best_url = best.map(|b| b.url.clone());
        self.response_best_evidence = best.map(|b| b.evidence.clone());
        self.response_best_version = best.and_then(|b| b.version).map(|v| v.as_str().to_string());
        self.response_best_host = best.map(|b| b.host_type.as_str().to_string());
        self.response_color = Some(result.color().as_str().to_string());
        if changed {
            self.response_updated = Some(now.timestamp());
        }

        let ts = now.timestamp();
        self.locations = ranked
            .locations
            .into_iter()
            .map(|mut loc| {
                loc.work_id = self.id.clone();
                if loc.created_at == 0 {
                    loc.created_at = ts;
                }
                if loc.updated_at == 0 {
                    loc.updated_at = ts;
                }
                loc
            })
            .collect();
        Ok(())
    }

    /// Scrape the publisher landing page and store what it says.
    /// A timeout is a non-finding; other failures are returned.
    pub async fn refresh_scrape(&mut self, ctx: &JobContext) -> Result<()> {
        let biblio = Biblio::from_metadata(&self.id, &self.metadata_json)?;
        let scraper = ctx.scrapers.for_tag(SourceTag::Publisher);
        let url = biblio.doi_url();

        match tokio::time::timeout(ctx.config.scrape.task_timeout(), scraper.scrape_for_fulltext(&url)).await {
            Ok(Ok(found)) => {
                self.scrape_updated = Some(now_ts());
                self.scrape_evidence = found.evidence;
                self.scrape_pdf_url = found.pdf_url;
                self.scrape_metadata_url = found.metadata_url;
                self.scrape_license = found.license;
                Ok(())
            }
            Ok(Err(e)) => Err(e).with_context(|| format!("landing page scrape for {}", self.id)),
            Err(_) => {
                tracing::info!(id = %self.id, url = %url, "landing page scrape timed out");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Target for Work {
    type Op = WorkOp;
    type Shortcut = RuleBook;

    fn id(&self) -> &str {
        &self.id
    }

    fn with_id(id: &str) -> Self {
        let now = now_ts();
        Work {
            id: id.to_string(),
            rand: rand::random(),
            created_at: now,
            updated_at: now,
            metadata_json: "{}".to_string(),
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
            "SELECT {WORK_COLUMNS} FROM works WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(pool).await?;
        Ok(rows.iter().map(work_from_row).collect())
    }

    async fn all_ids(pool: &SqlitePool) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM works ORDER BY id")
            .fetch_all(pool)
            .await?;
        Ok(ids)
    }

    async fn shortcut(ctx: &JobContext, _op: WorkOp) -> Result<RuleBook> {
        RuleBook::load(&ctx.pool).await
    }

    async fn run_one(&mut self, op: WorkOp, ctx: &JobContext, rules: &RuleBook) -> Result<()> {
        match op {
            WorkOp::Recalculate => self.recalculate(ctx, rules, Utc::now()).await,
            WorkOp::Refresh => {
                let scraped = self.refresh_scrape(ctx).await;
                self.recalculate(ctx, rules, Utc::now()).await?;
                if let Err(e) = scraped {
                    tracing::warn!(id = %self.id, error = %format!("{:#}", e), "refresh scrape failed");
                    let note = format!("{:#}", e);
                    self.error = Some(match self.error.take() {
                        Some(existing) => format!("{}; {}", existing, note),
                        None => note,
                    });
                }
                Ok(())
            }
        }
    }

    async fn save_all(conn: &mut SqliteConnection, items: &[Self]) -> Result<()> {
        let now = now_ts();
        for work in items {
            sqlx::query(
                "INSERT INTO works (id, rand, created_at, updated_at, metadata_json, title, normalized_title, \
                   scrape_updated, scrape_evidence, scrape_pdf_url, scrape_metadata_url, scrape_license, \
                   response_json, response_is_oa, response_best_url, response_best_evidence, \
                   response_best_version, response_best_host, response_color, response_updated, error) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                   updated_at = excluded.updated_at, title = excluded.title, \
                   normalized_title = excluded.normalized_title, \
                   scrape_updated = excluded.scrape_updated, scrape_evidence = excluded.scrape_evidence, \
                   scrape_pdf_url = excluded.scrape_pdf_url, \
                   scrape_metadata_url = excluded.scrape_metadata_url, \
                   scrape_license = excluded.scrape_license, response_json = excluded.response_json, \
                   response_is_oa = excluded.response_is_oa, response_best_url = excluded.response_best_url, \
                   response_best_evidence = excluded.response_best_evidence, \
                   response_best_version = excluded.response_best_version, \
                   response_best_host = excluded.response_best_host, \
                   response_color = excluded.response_color, \
                   response_updated = excluded.response_updated, error = excluded.error",
            )
            .bind(&work.id)
            .bind(work.rand)
            .bind(work.created_at)
            .bind(now)
            .bind(&work.metadata_json)
            .bind(&work.title)
            .bind(&work.normalized_title)
            .bind(work.scrape_updated)
            .bind(&work.scrape_evidence)
            .bind(&work.scrape_pdf_url)
            .bind(&work.scrape_metadata_url)
            .bind(&work.scrape_license)
            .bind(&work.response_json)
            .bind(work.response_is_oa)
            .bind(&work.response_best_url)
            .bind(&work.response_best_evidence)
            .bind(&work.response_best_version)
            .bind(&work.response_best_host)
            .bind(&work.response_color)
            .bind(work.response_updated)
            .bind(&work.error)
            .execute(&mut *conn)
            .await?;

            save_locations(conn, work).await?;
        }
        Ok(())
    }
}

/// Replace a work's stored locations with `work.locations`, keeping the
/// creation time of locations that survive.
async fn save_locations(conn: &mut SqliteConnection, work: &Work) -> Result<()> {
    let mut ids = Vec::with_capacity(work.locations.len());
    for loc in &work.locations {
        let Some(url) = loc.best_url() else { continue };
        let id = location_id(&work.id, url);
        sqlx::query(
            "INSERT INTO open_locations (id, work_id, pdf_url, metadata_url, license, evidence, version, \
               host_type, endpoint_id, created_at, updated_at, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET pdf_url = excluded.pdf_url, \
               metadata_url = excluded.metadata_url, license = excluded.license, \
               evidence = excluded.evidence, version = excluded.version, \
               host_type = excluded.host_type, endpoint_id = excluded.endpoint_id, \
               updated_at = excluded.updated_at, error = excluded.error",
        )
        .bind(&id)
        .bind(&work.id)
        .bind(&loc.pdf_url)
        .bind(&loc.metadata_url)
        .bind(&loc.license)
        .bind(&loc.evidence)
        .bind(loc.version.map(|v| v.as_str()))
        .bind(ranker::host_type(loc).as_str())
        .bind(&loc.endpoint_id)
        .bind(loc.created_at)
        .bind(loc.updated_at)
        .bind(&loc.error)
        .execute(&mut *conn)
        .await?;
        ids.push(id);
    }

    let sql = if ids.is_empty() {
        "DELETE FROM open_locations WHERE work_id = ?".to_string()
    } else {
        format!(
            "DELETE FROM open_locations WHERE work_id = ? AND id NOT IN ({})",
            placeholders(ids.len())
        )
    };
    let mut query = sqlx::query(&sql).bind(&work.id);
    for id in &ids {
        query = query.bind(id);
    }
    query.execute(&mut *conn).await?;
    Ok(())
}
