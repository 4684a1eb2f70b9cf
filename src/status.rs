//! Queue status report for `olo queue <name> --status`.
//!
//! Backlog counts come from the lease store; the ETA extrapolates from the
//! number of items finished in the last hour.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::endpoints;
use crate::lease::worker_tag;
use crate::queue::{QueueKind, WorkQueue};

/// Print the backlog of one queue.
pub async fn run_status(pool: &SqlitePool, config: &Config, kind: QueueKind) -> Result<()> {
    let queue = WorkQueue::new(pool.clone(), kind, config, worker_tag());
    let backlog = queue.backlog().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Queue status: {}", kind);
    println!("================================");
    println!();
    println!("  Database:       {} ({})", config.db.path.display(), format_bytes(db_size));
    println!();
    println!("  Waiting:        {}", backlog.waiting);
    println!("  Leased:         {}", backlog.leased);
    println!("  Overdue leases: {}", backlog.overdue);
    println!("  Finished:       {}", backlog.finished);
    println!("  Last hour:      {}", backlog.finished_last_hour);
    println!(
        "  ETA:            {}",
        match backlog.eta_hours() {
            Some(hours) => format_hours(hours),
            None if backlog.remaining() == 0 => "done".to_string(),
            None => "unknown (nothing finished in the last hour)".to_string(),
        }
    );

    if kind == QueueKind::Endpoints {
        let failing = endpoints::failing_endpoints(pool).await?;
        if !failing.is_empty() {
            println!();
            println!("  Failing endpoints:");
            println!("  {:<40} {:<12} {}", "ENDPOINT", "WATERMARK", "LAST FINISHED");
            println!("  {}", "-".repeat(76));
            for ep in &failing {
                let finished = match ep.last_harvest_finished {
                    Some(ts) => format_ts_relative(ts),
                    None => "never".to_string(),
                };
                println!(
                    "  {:<40} {:<12} {}",
                    ep.id,
                    ep.most_recent_date_harvested.as_deref().unwrap_or("-"),
                    finished
                );
                if let Some(error) = &ep.error {
                    println!("      {}", truncate(error, 100));
                }
            }
        }
    }

    println!();
    Ok(())
}

/// `0.5` -> `30m`, `30.0` -> `1d 6h`.
pub fn format_hours(hours: f64) -> String {
    let minutes = (hours * 60.0).round() as i64;
    if minutes < 60 {
        format!("{}m", minutes)
    } else if minutes < 60 * 24 {
        format!("{}h {}m", minutes / 60, minutes % 60)
    } else {
        format!("{}d {}h", minutes / (60 * 24), (minutes / 60) % 24)
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hours_format() {
        assert_eq!(format_hours(0.5), "30m");
        assert_eq!(format_hours(2.25), "2h 15m");
        assert_eq!(format_hours(30.0), "1d 6h");
    }

    #[test]
    fn truncates_long_errors() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }
}
