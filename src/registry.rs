//! Source registry: permanent deduplication memory for scanned locations.
//!
//! Every scan attempt is recorded against the normalized location. Records
//! are merged on re-scan (scan count increments, item counts accumulate),
//! never replaced and never deleted, so `check` can answer "seen before?"
//! for the lifetime of the database.
//!
//! Storage faults surface as [`PipelineError::StorageUnavailable`]; this
//! layer does not retry.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::models::{
    from_millis, normalize_location, CategoryStats, RegistryCheck, RegistryStats, ScanStatus,
    SourceCategory, SourceRecord,
};

const RECORD_COLUMNS: &str =
    "location, category, first_seen, last_scanned, items_discovered, scan_count, status";

#[derive(Debug, Clone)]
pub struct SourceRegistry {
    pool: SqlitePool,
}

impl SourceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Pure lookup; never creates a record.
    pub async fn check(&self, location: &str) -> Result<RegistryCheck> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM visited_sources WHERE location = ?",
            RECORD_COLUMNS
        ))
        .bind(normalize_location(location))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(RegistryCheck::Visited(record_from_row(&row)?)),
            None => Ok(RegistryCheck::New),
        }
    }

    /// Record a completed scan of `location` that found `items_found` items.
    ///
    /// Creates the record with scan count 1 on first sight; otherwise merges
    /// into it. The category is only written when previously unset.
    pub async fn record(
        &self,
        location: &str,
        category: Option<SourceCategory>,
        items_found: u32,
    ) -> Result<SourceRecord> {
        self.upsert(location, category, items_found, ScanStatus::Completed)
            .await
    }

    /// Record a scan attempt that failed. Counts as a scan with zero items.
    pub async fn record_failed(
        &self,
        location: &str,
        category: Option<SourceCategory>,
    ) -> Result<SourceRecord> {
        self.upsert(location, category, 0, ScanStatus::Failed).await
    }

    async fn upsert(
        &self,
        location: &str,
        category: Option<SourceCategory>,
        items_found: u32,
        status: ScanStatus,
    ) -> Result<SourceRecord> {
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO visited_sources
                (location, category, first_seen, last_scanned, items_discovered, scan_count, status)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(location) DO UPDATE SET
                category = COALESCE(visited_sources.category, excluded.category),
                last_scanned = excluded.last_scanned,
                items_discovered = visited_sources.items_discovered + excluded.items_discovered,
                scan_count = visited_sources.scan_count + 1,
                status = excluded.status
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(normalize_location(location))
        .bind(category.map(|c| c.as_str()))
        .bind(now)
        .bind(now)
        .bind(i64::from(items_found))
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;

        record_from_row(&row)
    }

    /// Most recently scanned records first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<SourceRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM visited_sources ORDER BY last_scanned DESC, rowid DESC LIMIT ?",
            RECORD_COLUMNS
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Aggregate counts per category plus global totals.
    pub async fn stats(&self) -> Result<RegistryStats> {
        let rows = sqlx::query(
            r#"
            SELECT category,
                   COUNT(*) AS sources,
                   COALESCE(SUM(items_discovered), 0) AS items
            FROM visited_sources
            GROUP BY category
            ORDER BY sources DESC, category
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_category = Vec::with_capacity(rows.len());
        for row in &rows {
            let category: Option<String> = row.get("category");
            by_category.push(CategoryStats {
                category: category.map(|c| c.parse()).transpose()?,
                sources: row.get("sources"),
                items: row.get("items"),
            });
        }

        Ok(RegistryStats {
            total_sources: by_category.iter().map(|c| c.sources).sum(),
            total_items: by_category.iter().map(|c| c.items).sum(),
            by_category,
        })
    }
}

fn record_from_row(row: &SqliteRow) -> Result<SourceRecord> {
    let category: Option<String> = row.get("category");
    let status: String = row.get("status");

    Ok(SourceRecord {
        location: row.get("location"),
        category: category.map(|c| c.parse()).transpose()?,
        first_seen: from_millis(row.get("first_seen")),
        last_scanned: from_millis(row.get("last_scanned")),
        items_discovered: row.get("items_discovered"),
        scan_count: row.get("scan_count"),
        status: status.parse()?,
    })
}
