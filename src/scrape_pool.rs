//! Parallel scrape pool.
//!
//! Runs one async job per subject on a bounded set of workers. Each job is
//! wrapped in a hard timeout; a job that overruns is dropped and reported as
//! [`Outcome::TimedOut`], which callers treat as "found nothing".
//!
//! Jobs own their subject (a clone detached from any connection) and hand it
//! back when done. Results are collected here and written by the caller in
//! one transaction.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// How one subject's job ended.
#[derive(Debug)]
pub enum Outcome<T> {
    Done(T),
    Failed(String),
    TimedOut,
}

/// Results in input order. `None` marks a job that panicked.
#[derive(Debug)]
pub struct PoolResults<T> {
    pub outcomes: Vec<Option<Outcome<T>>>,
    pub done: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub panicked: usize,
}

/// Run `job` over every item with at most `workers` in flight, each under
/// `timeout`.
pub async fn run_pool<T, F, Fut>(items: Vec<T>, workers: usize, timeout: Duration, job: F) -> PoolResults<T>
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    let total = items.len();

    for (index, item) in items.into_iter().enumerate() {
        let sem = Arc::clone(&semaphore);
        let fut = job(item);
        tasks.spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            let outcome = match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(item)) => Outcome::Done(item),
                Ok(Err(e)) => Outcome::Failed(format!("{:#}", e)),
                Err(_) => Outcome::TimedOut,
            };
            (index, outcome)
        });
    }

    let mut results = PoolResults {
        outcomes: (0..total).map(|_| None).collect(),
        done: 0,
        failed: 0,
        timed_out: 0,
        panicked: 0,
    };

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, outcome)) => {
                match &outcome {
                    Outcome::Done(_) => results.done += 1,
                    Outcome::Failed(error) => {
                        tracing::warn!(index, error = %error, "scrape job failed");
                        results.failed += 1;
                    }
                    Outcome::TimedOut => {
                        tracing::info!(index, timeout_secs = timeout.as_secs(), "scrape job timed out");
                        results.timed_out += 1;
                    }
                }
                results.outcomes[index] = Some(outcome);
            }
            Err(join_err) => {
                tracing::warn!(error = %join_err, "scrape task panicked");
                results.panicked += 1;
            }
        }
    }

    results
}
