//! Harvest endpoints: registration, persistence, and the `harvest` operation.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::harvest::{harvest_window, Harvester};
use crate::lease::{enqueue_in, placeholders};
use crate::models::Endpoint;
use crate::pages::upsert_pages_in;
use crate::queue::QueueKind;
use crate::runner::{EndpointOp, JobContext, Target};

const ENDPOINT_COLUMNS: &str = "id, base_url, pmh_set, rand, last_harvest_started, last_harvest_finished, \
     most_recent_date_harvested, error, ready_to_run";

fn endpoint_from_row(row: &SqliteRow) -> Endpoint {
    Endpoint {
        id: row.get("id"),
        base_url: row.get("base_url"),
        pmh_set: row.get("pmh_set"),
        rand: row.get("rand"),
        last_harvest_started: row.get("last_harvest_started"),
        last_harvest_finished: row.get("last_harvest_finished"),
        most_recent_date_harvested: row.get("most_recent_date_harvested"),
        error: row.get("error"),
        ready_to_run: row.get("ready_to_run"),
        harvested: Vec::new(),
    }
}

/// `repo.example.org/oai` for `https://repo.example.org/oai/`, with the set
/// appended after `#` when there is one.
pub fn default_endpoint_id(base_url: &str, set: Option<&str>) -> String {
    let bare = base_url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    match set {
        Some(set) => format!("{}#{}", bare, set),
        None => bare.to_string(),
    }
}

/// Register an endpoint, or update the URL and set of an existing id.
/// Returns the endpoint id.
pub async fn register_endpoint(
    pool: &SqlitePool,
    base_url: &str,
    set: Option<&str>,
    id: Option<&str>,
) -> Result<String> {
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        bail!("endpoint base url must be http(s): {}", base_url);
    }
    let id = id
        .map(str::to_string)
        .unwrap_or_else(|| default_endpoint_id(base_url, set));

    sqlx::query(
        "INSERT INTO endpoints (id, base_url, pmh_set, rand, ready_to_run) VALUES (?, ?, ?, ?, 1) \
         ON CONFLICT(id) DO UPDATE SET base_url = excluded.base_url, pmh_set = excluded.pmh_set, \
           ready_to_run = 1",
    )
    .bind(&id)
    .bind(base_url)
    .bind(set)
    .bind(rand::random::<f64>())
    .execute(pool)
    .await
    .with_context(|| format!("registering endpoint {}", base_url))?;

    Ok(id)
}

pub async fn load_endpoint(pool: &SqlitePool, id: &str) -> Result<Option<Endpoint>> {
    let sql = format!("SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(endpoint_from_row))
}

/// Endpoints whose last run failed, for the status report.
pub async fn failing_endpoints(pool: &SqlitePool) -> Result<Vec<Endpoint>> {
    let sql = format!("SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE error IS NOT NULL ORDER BY id");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    Ok(rows.iter().map(endpoint_from_row).collect())
}

#[async_trait]
impl Target for Endpoint {
    type Op = EndpointOp;
    type Shortcut = ();

    fn id(&self) -> &str {
        &self.id
    }

    fn with_id(id: &str) -> Self {
        Endpoint {
            id: id.to_string(),
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
            "SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(pool).await?;
        Ok(rows.iter().map(endpoint_from_row).collect())
    }

    async fn all_ids(pool: &SqlitePool) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM endpoints WHERE ready_to_run = 1 ORDER BY id")
            .fetch_all(pool)
            .await?;
        Ok(ids)
    }

    async fn shortcut(_ctx: &JobContext, _op: EndpointOp) -> Result<()> {
        Ok(())
    }

    /// Harvest the next window. The watermark moves only when the whole
    /// window came back without error.
    async fn run_one(&mut self, _op: EndpointOp, ctx: &JobContext, _shortcut: &()) -> Result<()> {
        if self.base_url.is_empty() {
            bail!("endpoint {} has no base url", self.id);
        }
        let config = &ctx.config.harvest;
        let window = harvest_window(
            self.most_recent_date_harvested.as_deref(),
            &self.base_url,
            config,
            Utc::now().date_naive(),
        )?;
        tracing::info!(endpoint = %self.id, window = %window, "harvesting");

        let report = Harvester::new(ctx.pmh.as_ref(), config)
            .run(&self.id, &self.base_url, self.pmh_set.as_deref(), window)
            .await
            .with_context(|| format!("harvesting {} for {}", self.base_url, window))?;

        tracing::info!(
            endpoint = %self.id,
            records = report.records_seen,
            pages = report.pages.len(),
            requests = report.requests,
            "harvest window complete"
        );
        self.harvested = report.pages;
        self.most_recent_date_harvested = Some(window.until.to_string());
        self.error = None;
        Ok(())
    }

    async fn save_all(conn: &mut SqliteConnection, items: &[Self]) -> Result<()> {
        for endpoint in items {
            sqlx::query("UPDATE endpoints SET most_recent_date_harvested = ?, error = ? WHERE id = ?")
                .bind(&endpoint.most_recent_date_harvested)
                .bind(&endpoint.error)
                .bind(&endpoint.id)
                .execute(&mut *conn)
                .await?;

            let new_pages = upsert_pages_in(conn, &endpoint.harvested).await?;
            enqueue_in(conn, QueueKind::Pages.spec().table, &new_pages).await?;
            if !new_pages.is_empty() {
                tracing::info!(endpoint = %endpoint.id, new_pages = new_pages.len(), "pages queued");
            }
        }
        Ok(())
    }
}
