//! Chunked job runner.
//!
//! Runs one [`Operation`] over a stream of ids, a chunk at a time:
//!
//! 1. Take the next chunk of ids (from a fixed list, or by claiming from a
//!    [`WorkQueue`]).
//! 2. Load full rows. Ids with no row get a default subject so the operation
//!    always has something concrete to work on.
//! 3. Run the operation over the chunk. A failing item is logged and its
//!    error stored on the row; the rest of the chunk carries on.
//! 4. Write every row and finish the leases in one transaction.
//!
//! The chunk is the unit of atomicity. A crash before the commit leaves the
//! leases to expire and the whole chunk runs again, so operations must be
//! idempotent.
//!
//! A queue-driven run never ends on its own unless `drain` is set or the
//! `limit` is reached; an empty claim sleeps for the backoff and tries again.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::harvest::{HttpPmhClient, PmhClient};
use crate::lease::ClaimFilter;
use crate::models::{Endpoint, Page, Work};
use crate::queue::{QueueKind, WorkQueue};
use crate::scrape::{CopyrightProbe, DocumentProbe, HttpPageCache, ScraperSet};

/// Everything an operation may reach: the pool for reads, config, and the
/// network collaborators.
#[derive(Clone)]
pub struct JobContext {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub scrapers: Arc<ScraperSet>,
    pub pmh: Arc<dyn PmhClient>,
    pub probe: Arc<dyn DocumentProbe>,
}

impl JobContext {
    /// Context wired to real HTTP collaborators.
    pub fn from_config(pool: SqlitePool, config: &Config) -> Result<Self> {
        let cache = Arc::new(HttpPageCache::new(&config.scrape)?);
        Ok(Self {
            pool,
            config: Arc::new(config.clone()),
            scrapers: Arc::new(ScraperSet::landing_pages(cache.clone())),
            pmh: Arc::new(HttpPmhClient::new(&config.harvest)?),
            probe: Arc::new(CopyrightProbe::new(cache)),
        })
    }
}

/// The operations a runner can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Operation {
    /// Re-evaluate a work's evidence from stored data.
    Recalculate,
    /// Re-scrape a work's landing page, then re-evaluate.
    Refresh,
    /// Harvest an endpoint's next date window.
    Harvest,
    /// Scrape harvested pages for full text.
    Scrape,
}

impl Operation {
    /// The queue whose subjects this operation runs on.
    pub fn queue(self) -> QueueKind {
        match self {
            Operation::Recalculate | Operation::Refresh => QueueKind::Works,
            Operation::Harvest => QueueKind::Endpoints,
            Operation::Scrape => QueueKind::Pages,
        }
    }

    pub fn default_for(queue: QueueKind) -> Operation {
        match queue {
            QueueKind::Works => Operation::Recalculate,
            QueueKind::Pages => Operation::Scrape,
            QueueKind::Endpoints => Operation::Harvest,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Recalculate => "recalculate",
            Operation::Refresh => "refresh",
            Operation::Harvest => "harvest",
            Operation::Scrape => "scrape",
        };
        f.write_str(name)
    }
}

/// Work operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOp {
    Recalculate,
    Refresh,
}

impl fmt::Display for WorkOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkOp::Recalculate => f.write_str("recalculate"),
            WorkOp::Refresh => f.write_str("refresh"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOp {
    Harvest,
}

impl fmt::Display for EndpointOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("harvest")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOp {
    Scrape,
}

impl fmt::Display for PageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scrape")
    }
}

/// A subject type the runner can drive.
#[async_trait]
pub trait Target: Sized + Send + Sync + 'static {
    type Op: Copy + Send + Sync + fmt::Display + 'static;
    /// Data precomputed once per run or once per chunk.
    type Shortcut: Send + Sync;

    fn id(&self) -> &str;

    /// A fresh subject for an id with no row.
    fn with_id(id: &str) -> Self;

    fn set_error(&mut self, error: Option<String>);

    async fn load_many(pool: &SqlitePool, ids: &[String]) -> Result<Vec<Self>>;

    /// Every id of this subject type, for one-shot runs.
    async fn all_ids(pool: &SqlitePool) -> Result<Vec<String>>;

    async fn shortcut(ctx: &JobContext, op: Self::Op) -> Result<Self::Shortcut>;

    async fn run_one(
        &mut self,
        op: Self::Op,
        ctx: &JobContext,
        shortcut: &Self::Shortcut,
    ) -> Result<()>;

    /// Run `op` over a chunk; returns the number of failed items.
    /// Sequential by default.
    async fn run_chunk(
        items: &mut [Self],
        op: Self::Op,
        ctx: &JobContext,
        shortcut: &Self::Shortcut,
    ) -> usize {
        let mut failed = 0;
        for item in items.iter_mut() {
            if let Err(e) = item.run_one(op, ctx, shortcut).await {
                tracing::warn!(id = item.id(), op = %op, error = %e, "item failed");
                item.set_error(Some(format!("{:#}", e)));
                failed += 1;
            }
        }
        failed
    }

    async fn save_all(conn: &mut SqliteConnection, items: &[Self]) -> Result<()>;
}

/// Where a run gets its ids.
pub enum IdSource {
    /// A one-shot list; the run ends when it is exhausted.
    Fixed(Vec<String>),
    /// Claim from a queue until stopped.
    Queue {
        queue: WorkQueue,
        filter: ClaimFilter,
    },
}

/// When the shortcut is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutScope {
    PerRun,
    PerChunk,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub chunk_size: usize,
    pub limit: Option<usize>,
    pub shortcut_scope: ShortcutScope,
    pub empty_backoff: Duration,
    /// Exit a queue run on the first empty claim instead of sleeping.
    pub drain: bool,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.queue.chunk_size,
            limit: None,
            shortcut_scope: ShortcutScope::PerRun,
            empty_backoff: config.queue.empty_backoff(),
            drain: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub chunks: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Running throughput for operator-facing progress lines.
#[derive(Debug, Clone)]
pub struct Throughput {
    started: Instant,
    items: u64,
    chunks: u64,
    last_chunk: Duration,
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new()
    }
}

impl Throughput {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            items: 0,
            chunks: 0,
            last_chunk: Duration::ZERO,
        }
    }

    pub fn record(&mut self, items: u64, elapsed: Duration) {
        self.items += items;
        self.chunks += 1;
        self.last_chunk = elapsed;
    }

    pub fn items(&self) -> u64 {
        self.items
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn last_chunk(&self) -> Duration {
        self.last_chunk
    }

    /// Items per hour over the run so far.
    pub fn per_hour(&self) -> f64 {
        Self::rate(self.items, self.started.elapsed())
    }

    fn rate(items: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        items as f64 * 3600.0 / secs
    }

    /// Time to process `remaining` more items at the current rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        Self::eta_at(self.per_hour(), remaining)
    }

    fn eta_at(per_hour: f64, remaining: u64) -> Option<Duration> {
        if per_hour <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / per_hour * 3600.0))
    }
}

/// Dispatch `op` to its subject type and run it.
pub async fn run_operation(
    ctx: &JobContext,
    op: Operation,
    source: IdSource,
    opts: &RunOptions,
) -> Result<RunSummary> {
    match op {
        Operation::Recalculate => run::<Work>(ctx, WorkOp::Recalculate, source, opts).await,
        Operation::Refresh => run::<Work>(ctx, WorkOp::Refresh, source, opts).await,
        Operation::Harvest => run::<Endpoint>(ctx, EndpointOp::Harvest, source, opts).await,
        Operation::Scrape => run::<Page>(ctx, PageOp::Scrape, source, opts).await,
    }
}

/// All ids of `op`'s subject type, for a one-shot run without `--id`.
pub async fn all_ids(pool: &SqlitePool, op: Operation) -> Result<Vec<String>> {
    match op.queue() {
        QueueKind::Works => Work::all_ids(pool).await,
        QueueKind::Endpoints => Endpoint::all_ids(pool).await,
        QueueKind::Pages => Page::all_ids(pool).await,
    }
}

pub async fn run<T: Target>(
    ctx: &JobContext,
    op: T::Op,
    source: IdSource,
    opts: &RunOptions,
) -> Result<RunSummary> {
    let chunk_size = opts.chunk_size.max(1);
    let mut summary = RunSummary::default();
    let mut throughput = Throughput::new();
    let mut shortcut = T::shortcut(ctx, op).await?;

    match source {
        IdSource::Fixed(ids) => {
            let ids = match opts.limit {
                Some(limit) => &ids[..limit.min(ids.len())],
                None => &ids[..],
            };
            let total = ids.len() as u64;
            for chunk in ids.chunks(chunk_size) {
                if opts.shortcut_scope == ShortcutScope::PerChunk && summary.chunks > 0 {
                    shortcut = T::shortcut(ctx, op).await?;
                }
                run_chunk::<T>(ctx, op, chunk, &shortcut, None, &mut summary, &mut throughput)
                    .await;
                log_progress(op, &throughput, Some(total - throughput.items()));
            }
        }
        IdSource::Queue { queue, filter } => loop {
            let want = match opts.limit {
                Some(limit) if summary.processed as usize >= limit => break,
                Some(limit) => chunk_size.min(limit - summary.processed as usize),
                None => chunk_size,
            };

            let ids = match queue.claim(want, &filter).await {
                Ok(ids) => ids,
                Err(e) if opts.drain => return Err(e),
                Err(e) => {
                    tracing::warn!(queue = %queue.kind(), error = %e, "claim failed, retrying");
                    tokio::time::sleep(opts.empty_backoff).await;
                    continue;
                }
            };
            if ids.is_empty() {
                if opts.drain {
                    break;
                }
                tracing::debug!(queue = %queue.kind(), "queue empty, sleeping");
                tokio::time::sleep(opts.empty_backoff).await;
                continue;
            }

            if opts.shortcut_scope == ShortcutScope::PerChunk && summary.chunks > 0 {
                shortcut = T::shortcut(ctx, op).await?;
            }
            run_chunk::<T>(ctx, op, &ids, &shortcut, Some(&queue), &mut summary, &mut throughput)
                .await;
            log_progress(op, &throughput, None);
        },
    }

    tracing::info!(
        op = %op,
        chunks = summary.chunks,
        processed = summary.processed,
        failed = summary.failed,
        "run finished"
    );
    Ok(summary)
}

fn log_progress<O: fmt::Display>(op: O, throughput: &Throughput, remaining: Option<u64>) {
    let eta = remaining
        .and_then(|r| throughput.eta(r))
        .map(|d| format!("{:.1}h", d.as_secs_f64() / 3600.0))
        .unwrap_or_else(|| "-".to_string());
    tracing::info!(
        op = %op,
        chunk = throughput.chunks(),
        done = throughput.items(),
        last_chunk_ms = throughput.last_chunk().as_millis() as u64,
        per_hour = throughput.per_hour() as u64,
        eta = %eta,
        "chunk committed"
    );
}

async fn run_chunk<T: Target>(
    ctx: &JobContext,
    op: T::Op,
    ids: &[String],
    shortcut: &T::Shortcut,
    queue: Option<&WorkQueue>,
    summary: &mut RunSummary,
    throughput: &mut Throughput,
) {
    let started = Instant::now();
    match process_chunk::<T>(ctx, op, ids, shortcut, queue).await {
        Ok(failed) => {
            summary.failed += failed as u64;
        }
        Err(e) => {
            // leases stay in place and expire; the chunk is retried later
            tracing::error!(op = %op, error = %format!("{:#}", e), "chunk not committed");
            summary.failed += ids.len() as u64;
        }
    }
    summary.chunks += 1;
    summary.processed += ids.len() as u64;
    throughput.record(ids.len() as u64, started.elapsed());
}

async fn process_chunk<T: Target>(
    ctx: &JobContext,
    op: T::Op,
    ids: &[String],
    shortcut: &T::Shortcut,
    queue: Option<&WorkQueue>,
) -> Result<usize> {
    let mut items = load_with_defaults::<T>(&ctx.pool, ids).await?;
    let failed = T::run_chunk(&mut items, op, ctx, shortcut).await;

    let mut tx = ctx.pool.begin().await?;
    T::save_all(&mut *tx, &items).await?;
    if let Some(queue) = queue {
        queue.finish_in(&mut *tx, ids).await?;
    }
    tx.commit().await?;
    Ok(failed)
}

/// Rows for `ids` in id order, with defaults for ids that have none.
pub async fn load_with_defaults<T: Target>(pool: &SqlitePool, ids: &[String]) -> Result<Vec<T>> {
    let mut found: HashMap<String, T> = T::load_many(pool, ids)
        .await?
        .into_iter()
        .map(|item| (item.id().to_string(), item))
        .collect();

    Ok(ids
        .iter()
        .map(|id| {
            found.remove(id).unwrap_or_else(|| {
                tracing::warn!(id = %id, "no row for id, using a default subject");
                T::with_id(id)
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_extrapolates_to_hours() {
        assert_eq!(Throughput::rate(10, Duration::from_secs(36)), 1000.0);
        assert_eq!(Throughput::rate(10, Duration::ZERO), 0.0);
    }

    #[test]
    fn eta_from_rate() {
        let eta = Throughput::eta_at(100.0, 50).unwrap();
        assert_eq!(eta, Duration::from_secs(1800));
        assert!(Throughput::eta_at(0.0, 50).is_none());
    }

    #[test]
    fn record_accumulates() {
        let mut t = Throughput::new();
        t.record(10, Duration::from_millis(200));
        t.record(5, Duration::from_millis(300));
        assert_eq!(t.items(), 15);
        assert_eq!(t.chunks(), 2);
        assert_eq!(t.last_chunk(), Duration::from_millis(300));
    }

    #[test]
    fn operations_map_to_queues() {
        assert_eq!(Operation::Refresh.queue(), QueueKind::Works);
        assert_eq!(Operation::Harvest.queue(), QueueKind::Endpoints);
        assert_eq!(Operation::default_for(QueueKind::Pages), Operation::Scrape);
    }
}
