//! Lease store: atomic claim / finish / kick over a table of work items.
//!
//! Two table flavors share one contract:
//!
//! - **Separate table** — a thin `(id, rand, enqueued, started, finished,
//!   owner_tag)` table decoupled from the subject schema (`work_queue`,
//!   `page_queue`).
//! - **Flag on base table** — the subject row itself carries the lease
//!   columns (`endpoints.last_harvest_started` and friends).
//!
//! # Claim semantics
//!
//! A claim is one statement:
//!
//! ```sql
//! UPDATE t SET started = :now, owner_tag = :me
//! WHERE id IN (SELECT id FROM t WHERE <eligible> ORDER BY rand LIMIT :n)
//! RETURNING id
//! ```
//!
//! SQLite holds the writer lock for the whole statement, so two concurrent
//! claims can never return the same row. Claimers contend only on that lock
//! (bounded by the pool's busy timeout), never on individual rows.
//!
//! A lease whose `started` is older than the lease timeout is eligible again:
//! the original owner is not interrupted, it simply loses the row. `finish`
//! only touches rows the caller still owns.

use anyhow::Result;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::time::Duration;

use crate::models::now_ts;

/// Which table layout a queue uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    SeparateTable,
    FlagOnBase,
}

/// Table and column names for one queue.
#[derive(Debug, Clone)]
pub struct LeaseSpec {
    pub table: &'static str,
    pub flavor: Flavor,
    pub started_col: &'static str,
    pub finished_col: &'static str,
}

impl LeaseSpec {
    pub const fn separate(table: &'static str) -> Self {
        Self {
            table,
            flavor: Flavor::SeparateTable,
            started_col: "started",
            finished_col: "finished",
        }
    }
}

/// Which rows a claim may pick.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimFilter {
    /// Never leased (or lease expired) and not finished.
    Available,
    /// Only rows whose lease expired without a finish.
    Overdue,
    /// Rows finished more than `age` ago, for a periodic re-run.
    FinishedBefore(Duration),
}

/// A bind value for a dynamically built predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    Int(i64),
    Text(String),
}

/// Extra SQL predicate ANDed into eligibility, with its binds in order.
#[derive(Debug, Clone, Default)]
pub struct Condition {
    pub sql: String,
    pub binds: Vec<Bind>,
}

/// Queue counts for status output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Backlog {
    pub waiting: i64,
    pub leased: i64,
    pub overdue: i64,
    pub finished: i64,
    pub finished_last_hour: i64,
}

impl Backlog {
    /// Items still to do, counting expired leases.
    pub fn remaining(&self) -> i64 {
        self.waiting + self.overdue
    }

    /// Hours to drain at the last hour's rate, if anything finished.
    pub fn eta_hours(&self) -> Option<f64> {
        if self.finished_last_hour > 0 {
            Some(self.remaining() as f64 / self.finished_last_hour as f64)
        } else {
            None
        }
    }
}

/// Tag identifying this worker process in `owner_tag`.
pub fn worker_tag() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("pid{}-{}", std::process::id(), &id[..8])
}

fn apply_binds<'q>(
    mut query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    binds: &[Bind],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    for b in binds {
        query = match b {
            Bind::Int(v) => query.bind(*v),
            Bind::Text(v) => query.bind(v.clone()),
        };
    }
    query
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Lease operations for one queue, bound to one worker's tag.
#[derive(Clone)]
pub struct LeaseStore {
    pool: SqlitePool,
    spec: LeaseSpec,
    lease_timeout: Duration,
    owner_tag: String,
}

impl LeaseStore {
    pub fn new(pool: SqlitePool, spec: LeaseSpec, lease_timeout: Duration, owner_tag: String) -> Self {
        Self {
            pool,
            spec,
            lease_timeout,
            owner_tag,
        }
    }

    pub fn spec(&self) -> &LeaseSpec {
        &self.spec
    }

    pub fn owner_tag(&self) -> &str {
        &self.owner_tag
    }

    fn lease_cutoff(&self, now: i64) -> i64 {
        now - self.lease_timeout.as_secs() as i64
    }

    /// Eligibility predicate and binds for `filter`.
    fn eligible(&self, filter: &ClaimFilter, now: i64, ready: Option<&Condition>) -> Condition {
        let s = self.spec.started_col;
        let f = self.spec.finished_col;
        let cutoff = self.lease_cutoff(now);
        let not_leased = format!("({s} IS NULL OR {s} <= ?)");

        let mut cond = match filter {
            ClaimFilter::Available => match self.spec.flavor {
                Flavor::SeparateTable => Condition {
                    sql: format!("enqueued = 1 AND {f} IS NULL AND {not_leased}"),
                    binds: vec![Bind::Int(cutoff)],
                },
                Flavor::FlagOnBase => Condition {
                    sql: not_leased,
                    binds: vec![Bind::Int(cutoff)],
                },
            },
            ClaimFilter::Overdue => Condition {
                sql: format!("{s} IS NOT NULL AND {s} <= ?"),
                binds: vec![Bind::Int(cutoff)],
            },
            ClaimFilter::FinishedBefore(age) => Condition {
                sql: format!("{f} IS NOT NULL AND {f} <= ? AND {not_leased}"),
                binds: vec![Bind::Int(now - age.as_secs() as i64), Bind::Int(cutoff)],
            },
        };

        if let Some(extra) = ready {
            cond.sql = format!("{} AND ({})", cond.sql, extra.sql);
            cond.binds.extend(extra.binds.iter().cloned());
        }
        cond
    }

    /// Atomically lease up to `n` eligible rows, lowest `rand` first.
    ///
    /// `ready` narrows eligibility with a queue-specific predicate (the
    /// endpoint queue uses it for its harvest schedule).
    pub async fn claim(
        &self,
        n: usize,
        filter: &ClaimFilter,
        ready: Option<&Condition>,
    ) -> Result<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let now = now_ts();
        let cond = self.eligible(filter, now, ready);
        let t = self.spec.table;
        let sql = format!(
            "UPDATE {t} SET {started} = ?, owner_tag = ? \
             WHERE id IN (SELECT id FROM {t} WHERE {pred} ORDER BY rand LIMIT ?) \
             RETURNING id",
            started = self.spec.started_col,
            pred = cond.sql,
        );

        let query = sqlx::query(&sql).bind(now).bind(&self.owner_tag);
        let query = apply_binds(query, &cond.binds).bind(n as i64);
        let rows = query.fetch_all(&self.pool).await?;

        let ids: Vec<String> = rows.iter().map(|r| r.get::<String, _>("id")).collect();
        tracing::debug!(table = t, claimed = ids.len(), owner = %self.owner_tag, "claim");
        Ok(ids)
    }

    /// Mark `ids` finished inside the caller's transaction. Rows that were
    /// reclaimed by another worker in the meantime are left alone.
    pub async fn finish_in(&self, conn: &mut SqliteConnection, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {t} SET {f} = ?, {s} = NULL WHERE owner_tag = ? AND {s} IS NOT NULL AND id IN ({ph})",
            t = self.spec.table,
            f = self.spec.finished_col,
            s = self.spec.started_col,
            ph = placeholders(ids.len()),
        );
        let mut query = sqlx::query(&sql).bind(now_ts()).bind(&self.owner_tag);
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.execute(&mut *conn).await?.rows_affected())
    }

    /// [`finish_in`](Self::finish_in) on its own connection.
    pub async fn finish(&self, ids: &[String]) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        self.finish_in(&mut conn, ids).await
    }

    /// Clear every outstanding lease so the rows are claimable right away.
    pub async fn kick(&self) -> Result<u64> {
        let sql = format!(
            "UPDATE {t} SET {s} = NULL WHERE {s} IS NOT NULL",
            t = self.spec.table,
            s = self.spec.started_col,
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn backlog(&self, ready: Option<&Condition>) -> Result<Backlog> {
        let now = now_ts();
        let t = self.spec.table;
        let s = self.spec.started_col;
        let f = self.spec.finished_col;

        let mut waiting = match self.spec.flavor {
            Flavor::SeparateTable => Condition {
                sql: format!("enqueued = 1 AND {f} IS NULL AND {s} IS NULL"),
                binds: vec![],
            },
            Flavor::FlagOnBase => Condition {
                sql: format!("{s} IS NULL"),
                binds: vec![],
            },
        };
        if let Some(extra) = ready {
            waiting.sql = format!("{} AND ({})", waiting.sql, extra.sql);
            waiting.binds.extend(extra.binds.iter().cloned());
        }

        let sql = format!(
            "SELECT \
               (SELECT COUNT(*) FROM {t} WHERE {w}) AS waiting, \
               (SELECT COUNT(*) FROM {t} WHERE {s} IS NOT NULL AND {s} > ?) AS leased, \
               (SELECT COUNT(*) FROM {t} WHERE {s} IS NOT NULL AND {s} <= ?) AS overdue, \
               (SELECT COUNT(*) FROM {t} WHERE {f} IS NOT NULL) AS finished, \
               (SELECT COUNT(*) FROM {t} WHERE {f} >= ?) AS finished_last_hour",
            w = waiting.sql,
        );
        let cutoff = self.lease_cutoff(now);
        let query = apply_binds(sqlx::query(&sql), &waiting.binds)
            .bind(cutoff)
            .bind(cutoff)
            .bind(now - 3600);
        let row = query.fetch_one(&self.pool).await?;

        Ok(Backlog {
            waiting: row.get("waiting"),
            leased: row.get("leased"),
            overdue: row.get("overdue"),
            finished: row.get("finished"),
            finished_last_hour: row.get("finished_last_hour"),
        })
    }
}

/// Put `ids` on a separate-table queue, or re-arm them if already present.
/// An in-flight lease on a re-armed row is kept.
pub async fn enqueue_in(conn: &mut SqliteConnection, table: &str, ids: &[String]) -> Result<u64> {
    let sql = format!(
        "INSERT INTO {table} (id, rand, enqueued) VALUES (?, ?, 1) \
         ON CONFLICT(id) DO UPDATE SET enqueued = 1, finished = NULL"
    );
    let mut count = 0;
    for id in ids {
        let rand: f64 = rand::random();
        count += sqlx::query(&sql)
            .bind(id)
            .bind(rand)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(count)
}
