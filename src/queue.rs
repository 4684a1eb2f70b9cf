//! The named work queues.
//!
//! | Queue | Flavor | Table | Subject |
//! |-------|--------|-------|---------|
//! | `works` | separate table | `work_queue` | [`Work`](crate::models::Work) |
//! | `pages` | separate table | `page_queue` | [`Page`](crate::models::Page) |
//! | `endpoints` | flag on base | `endpoints` | [`Endpoint`](crate::models::Endpoint) |
//!
//! The endpoint queue adds a readiness predicate on top of the lease: an
//! endpoint is only handed out when its watermark is behind, it was not
//! harvested in the last few minutes, and a failed run has backed off.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::fmt;

use crate::config::Config;
use crate::lease::{Backlog, Bind, ClaimFilter, Condition, Flavor, LeaseSpec, LeaseStore};
use crate::models::now_ts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum QueueKind {
    Works,
    Pages,
    Endpoints,
}

impl QueueKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::Works => "works",
            QueueKind::Pages => "pages",
            QueueKind::Endpoints => "endpoints",
        }
    }

    pub fn spec(&self) -> LeaseSpec {
        match self {
            QueueKind::Works => LeaseSpec::separate("work_queue"),
            QueueKind::Pages => LeaseSpec::separate("page_queue"),
            QueueKind::Endpoints => LeaseSpec {
                table: "endpoints",
                flavor: Flavor::FlagOnBase,
                started_col: "last_harvest_started",
                finished_col: "last_harvest_finished",
            },
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A lease store bound to one named queue.
#[derive(Clone)]
pub struct WorkQueue {
    kind: QueueKind,
    store: LeaseStore,
    config: Config,
}

impl WorkQueue {
    pub fn new(pool: SqlitePool, kind: QueueKind, config: &Config, owner_tag: String) -> Self {
        let store = LeaseStore::new(pool, kind.spec(), config.queue.lease_timeout(), owner_tag);
        Self {
            kind,
            store,
            config: config.clone(),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn store(&self) -> &LeaseStore {
        &self.store
    }

    /// Harvest schedule for endpoints; `None` for the other queues.
    fn ready_condition(&self) -> Option<Condition> {
        if self.kind != QueueKind::Endpoints {
            return None;
        }
        let now = now_ts();
        let yesterday = (Utc::now() - ChronoDuration::days(1))
            .format("%Y-%m-%d")
            .to_string();
        Some(Condition {
            sql: "ready_to_run = 1 \
                  AND (most_recent_date_harvested IS NULL OR most_recent_date_harvested < ?) \
                  AND (last_harvest_finished IS NULL OR last_harvest_finished <= ?) \
                  AND (error IS NULL OR last_harvest_finished IS NULL OR last_harvest_finished <= ?)"
                .to_string(),
            binds: vec![
                Bind::Text(yesterday),
                Bind::Int(now - self.config.harvest.min_interval_secs),
                Bind::Int(now - self.config.harvest.error_backoff_secs),
            ],
        })
    }

    pub async fn claim(&self, n: usize, filter: &ClaimFilter) -> Result<Vec<String>> {
        let ready = self.ready_condition();
        self.store.claim(n, filter, ready.as_ref()).await
    }

    pub async fn finish_in(&self, conn: &mut SqliteConnection, ids: &[String]) -> Result<u64> {
        self.store.finish_in(conn, ids).await
    }

    pub async fn kick(&self) -> Result<u64> {
        self.store.kick().await
    }

    pub async fn backlog(&self) -> Result<Backlog> {
        let ready = self.ready_condition();
        self.store.backlog(ready.as_ref()).await
    }
}
