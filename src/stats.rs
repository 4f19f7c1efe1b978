//! Pipeline statistics and health overview.
//!
//! Provides a quick summary of every store: registry coverage, queue depth
//! by status and kind, research session totals, and the state of each
//! persisted flow. Used by `gearflow stats` to show whether the pipeline
//! is moving.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::db::Stores;
use crate::models::DiscoveryStatus;

/// Run the stats command: query every store and print a summary.
pub async fn run_stats(config: &Config, stores: &Stores) -> Result<()> {
    let registry = stores.registry.stats().await?;
    let queue = stores.queue.status().await?;
    let ledger = stores.ledger.counts().await?;
    let flows = stores.snapshots.list().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("gearflow pipeline stats");
    println!("=======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Sources:     {}", registry.total_sources);
    println!("  Items found: {}", registry.total_items);
    println!("  Discoveries: {}", queue.total());
    println!(
        "  Research:    {} sessions ({} in progress, {} completed, {} ready), {} steps",
        ledger.sessions, ledger.in_progress, ledger.completed, ledger.ready_for_load, ledger.steps
    );

    if queue.total() > 0 {
        println!();
        println!("  Queue:");
        println!("  {:<14} {:>8} {:>14}", "STATUS", "COUNT", "AVG PRIORITY");
        println!("  {}", "-".repeat(38));
        for status in DiscoveryStatus::ALL {
            if let Some(c) = queue.by_status.get(status) {
                println!("  {:<14} {:>8} {:>14.1}", status, c.count, c.avg_priority);
            }
        }

        println!();
        println!("  {:<14} {:>8} {:>8}", "KIND", "TOTAL", "PENDING");
        println!("  {}", "-".repeat(32));
        for (kind, total) in &queue.by_kind {
            let pending = queue.pending_by_kind.get(kind).copied().unwrap_or(0);
            println!("  {:<14} {:>8} {:>8}", kind, total, pending);
        }
    }

    if !flows.is_empty() {
        println!();
        println!("  Flows:");
        println!("  {:<24} {:>8} {:<14}   {}", "FLOW", "VERSION", "NEXT STAGE", "UPDATED");
        println!("  {}", "-".repeat(70));
        for flow in &flows {
            println!(
                "  {:<24} {:>8} {:<14}   {}",
                flow.flow_id,
                flow.version,
                flow.stage,
                format_ts_relative(flow.updated_at)
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
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

/// Format a timestamp as a relative time string (e.g. "3 hours ago").
pub(crate) fn format_ts_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();

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

pub(crate) fn format_ts_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_timestamps() {
        let now = Utc::now();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - Duration::minutes(5)), "5 mins ago");
        assert_eq!(format_ts_relative(now - Duration::hours(1)), "1 hour ago");
        assert_eq!(format_ts_relative(now - Duration::days(3)), "3 days ago");
    }
}
