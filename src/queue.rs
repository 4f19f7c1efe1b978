//! Durable priority queue of discoveries awaiting verification.
//!
//! The queue is an admission channel, not an update channel: `enqueue`
//! never overwrites an existing record. Claiming is a single conditional
//! `UPDATE ... RETURNING` so that, however many workers race, exactly one
//! observes a given record move from `pending` to `researching`.
//!
//! Ordering is priority (10 highest) then strict FIFO by insertion
//! sequence within a priority band.
//!
//! A claimed record whose worker disappears stays `researching` until
//! [`DiscoveryQueue::reclaim_stale`] is called by the flow on resume.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::models::{
    from_millis, ClaimOutcome, Discovery, DiscoveryStatus, EnqueueOutcome, KindLabel, QueueEntry,
    QueueStatus, StatusCount, StatusUpdate,
};

const ENTRY_COLUMNS: &str =
    "discovery_id, status, payload_json, enqueued_at, claimed_at, claimed_by, updated_at";

#[derive(Debug, Clone)]
pub struct DiscoveryQueue {
    pool: SqlitePool,
}

impl DiscoveryQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Admit a new discovery as `pending`.
    ///
    /// Returns [`EnqueueOutcome::Duplicate`] without touching the stored
    /// record if the id is already known, whatever its current status.
    pub async fn enqueue(&self, discovery: &Discovery) -> Result<EnqueueOutcome> {
        discovery.validate()?;

        let mut stored = discovery.clone();
        stored.status = DiscoveryStatus::Pending;
        let payload = serde_json::to_string(&stored)?;
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO discovery_queue
                (discovery_id, kind, name, status, priority, payload_json, enqueued_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?, ?, ?)
            ON CONFLICT(discovery_id) DO NOTHING
            "#,
        )
        .bind(&stored.discovery_id)
        .bind(stored.label().as_str())
        .bind(&stored.name)
        .bind(i64::from(stored.priority.get()))
        .bind(&payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            tracing::debug!(
                discovery_id = %stored.discovery_id,
                kind = %stored.label(),
                priority = stored.priority.get(),
                "discovery enqueued"
            );
            return Ok(EnqueueOutcome::Accepted);
        }

        let existing: String =
            sqlx::query_scalar("SELECT status FROM discovery_queue WHERE discovery_id = ?")
                .bind(&stored.discovery_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(EnqueueOutcome::Duplicate {
            existing: existing.parse()?,
        })
    }

    /// Claim the highest-priority, earliest-enqueued pending record for `worker`.
    pub async fn dequeue_next(&self, worker: &str) -> Result<ClaimOutcome> {
        let now = Utc::now().timestamp_millis();

        // Selection and transition happen in one statement under SQLite's
        // write lock; the trailing status guard makes the claim a CAS.
        let row = sqlx::query(&format!(
            r#"
            UPDATE discovery_queue
            SET status = 'researching', claimed_by = ?, claimed_at = ?, updated_at = ?
            WHERE seq = (
                SELECT seq FROM discovery_queue
                WHERE status = 'pending'
                ORDER BY priority DESC, seq ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        ))
        .bind(worker)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let entry = entry_from_row(&row)?;
                tracing::debug!(discovery_id = %entry.id(), worker, "discovery claimed");
                Ok(ClaimOutcome::Claimed(entry))
            }
            None => Ok(ClaimOutcome::Empty),
        }
    }

    /// The next `n` pending records in claim order, without claiming them.
    pub async fn peek(&self, n: i64) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM discovery_queue
            WHERE status = 'pending'
            ORDER BY priority DESC, seq ASC
            LIMIT ?
            "#,
            ENTRY_COLUMNS
        ))
        .bind(n.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Set a status without consulting the transition table.
    ///
    /// This is the operator override path. Pipeline code uses
    /// [`DiscoveryQueue::transition`].
    pub async fn set_status(&self, id: &str, status: DiscoveryStatus) -> Result<StatusUpdate> {
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            r#"
            UPDATE discovery_queue
            SET status = ?1,
                updated_at = ?2,
                claimed_by = CASE WHEN ?1 = 'pending' THEN NULL ELSE claimed_by END,
                claimed_at = CASE WHEN ?1 = 'pending' THEN NULL ELSE claimed_at END
            WHERE discovery_id = ?3
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(StatusUpdate::NotFound);
        }
        tracing::info!(discovery_id = id, status = %status, "status set (override)");
        Ok(StatusUpdate::Updated)
    }

    /// Move `id` to `to` only if its current status is a legal predecessor.
    pub async fn transition(&self, id: &str, to: DiscoveryStatus) -> Result<StatusUpdate> {
        self.compare_and_set(id, DiscoveryStatus::predecessors(to), to)
            .await
    }

    /// Operator reset of a failed record back to `pending`.
    pub async fn reset(&self, id: &str) -> Result<StatusUpdate> {
        self.compare_and_set(id, &[DiscoveryStatus::Error], DiscoveryStatus::Pending)
            .await
    }

    async fn compare_and_set(
        &self,
        id: &str,
        from: &[DiscoveryStatus],
        to: DiscoveryStatus,
    ) -> Result<StatusUpdate> {
        let now = Utc::now().timestamp_millis();
        let placeholders = vec!["?"; from.len()].join(", ");

        let sql = format!(
            r#"
            UPDATE discovery_queue
            SET status = ?,
                updated_at = ?,
                claimed_by = CASE WHEN ? = 'pending' THEN NULL ELSE claimed_by END,
                claimed_at = CASE WHEN ? = 'pending' THEN NULL ELSE claimed_at END
            WHERE discovery_id = ? AND status IN ({})
            "#,
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(now)
            .bind(to.as_str())
            .bind(to.as_str())
            .bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;

        if result.rows_affected() == 1 {
            tracing::debug!(discovery_id = id, to = %to, "status transition");
            return Ok(StatusUpdate::Updated);
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM discovery_queue WHERE discovery_id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Ok(StatusUpdate::NotFound),
            Some(current) => Ok(StatusUpdate::InvalidTransition {
                from: current.parse()?,
                to,
            }),
        }
    }

    /// Return records stuck in `researching` since before `cutoff` to
    /// `pending`, clearing their claim. Returns the reclaimed ids.
    pub async fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let now = Utc::now().timestamp_millis();

        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE discovery_queue
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL, updated_at = ?
            WHERE status = 'researching' AND claimed_at < ?
            RETURNING discovery_id
            "#,
        )
        .bind(now)
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        for id in &ids {
            tracing::warn!(discovery_id = %id, "stale claim reclaimed");
        }
        Ok(ids)
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueueEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM discovery_queue WHERE discovery_id = ?",
            ENTRY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    /// Records in claim order, optionally restricted to one status.
    pub async fn list(
        &self,
        status: Option<DiscoveryStatus>,
        limit: i64,
    ) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM discovery_queue
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY priority DESC, seq ASC
            LIMIT ?2
            "#,
            ENTRY_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Counts grouped by status and by kind, for backpressure decisions.
    pub async fn status(&self) -> Result<QueueStatus> {
        let mut summary = QueueStatus::default();

        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n, AVG(priority) AS avg_priority
            FROM discovery_queue
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let status: String = row.get("status");
            summary.by_status.insert(
                status.parse()?,
                StatusCount {
                    count: row.get("n"),
                    avg_priority: row.get("avg_priority"),
                },
            );
        }

        let rows = sqlx::query(
            r#"
            SELECT kind,
                   COUNT(*) AS n,
                   SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending
            FROM discovery_queue
            GROUP BY kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let kind: String = row.get("kind");
            let kind: KindLabel = kind.parse()?;
            summary.by_kind.insert(kind, row.get("n"));
            let pending: i64 = row.get("pending");
            if pending > 0 {
                summary.pending_by_kind.insert(kind, pending);
            }
        }

        Ok(summary)
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<QueueEntry> {
    let payload: String = row.get("payload_json");
    let status: String = row.get("status");
    let claimed_at: Option<i64> = row.get("claimed_at");

    let mut discovery: Discovery = serde_json::from_str(&payload)?;
    discovery.status = status.parse()?;

    Ok(QueueEntry {
        discovery,
        enqueued_at: from_millis(row.get("enqueued_at")),
        claimed_at: claimed_at.map(from_millis),
        claimed_by: row.get("claimed_by"),
        updated_at: from_millis(row.get("updated_at")),
    })
}
