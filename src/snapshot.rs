//! Flow state snapshot: the single source of truth for resuming a flow.
//!
//! The snapshot is a flat, versioned record keyed by flow id and stored as
//! JSON. Every field carries a serde default, so a snapshot written by an
//! older build still loads after fields are added; a snapshot written by a
//! newer build is refused with [`PipelineError::UnsupportedSnapshot`].
//!
//! The stage to run next is never stored as an instruction. It is derived
//! from what the current cycle has already recorded (see
//! [`FlowStateSnapshot::next_stage`]), so a process that dies between
//! finishing a stage and persisting re-runs that stage and nothing earlier.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::config::FlowConfig;
use crate::error::{PipelineError, Result};
use crate::models::{from_millis, SourceCategory};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Most recent quality scores kept for the rolling average.
const QUALITY_WINDOW: usize = 100;
/// Most recent error records kept in the snapshot. `errors_total` keeps
/// counting past this.
const ERROR_LOG_CAP: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scan,
    Aggregate,
    Route,
    CurateNormal,
    CurateBatch,
    Load,
    Health,
    /// Terminal stage of a cycle with nothing new and no backlog to curate.
    Idle,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Aggregate => "aggregate",
            Stage::Route => "route",
            Stage::CurateNormal => "curate_normal",
            Stage::CurateBatch => "curate_batch",
            Stage::Load => "load",
            Stage::Health => "health",
            Stage::Idle => "idle",
            Stage::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Path selected by the route stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Idle,
    Normal,
    Batch,
}

/// Runtime-adjustable settings carried in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSettings {
    pub max_parallel_scans: usize,
    pub max_parallel_research: usize,
    pub quality_threshold: f64,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self::from(&FlowConfig::default())
    }
}

impl From<&FlowConfig> for FlowSettings {
    fn from(config: &FlowConfig) -> Self {
        Self {
            max_parallel_scans: config.max_parallel_scans,
            max_parallel_research: config.max_parallel_research,
            quality_threshold: config.quality_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub message: String,
    #[serde(default)]
    pub discovery_id: Option<String>,
}

/// What one producer contributed to the scan stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanResult {
    pub locations_scanned: usize,
    pub locations_skipped: usize,
    pub locations_failed: usize,
    /// Discovery ids admitted to the queue.
    pub accepted: Vec<String>,
    pub duplicates: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateResult {
    pub accepted: Vec<String>,
    pub producers: usize,
}

impl AggregateResult {
    pub fn count(&self) -> usize {
        self.accepted.len()
    }
}

/// Outcome of one curation batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratedBatch {
    pub claimed: usize,
    pub verified: Vec<String>,
    pub errored: Vec<String>,
    /// Abandoned on timeout; left `researching` for the liveness reclaim.
    pub abandoned: Vec<String>,
    /// Moved out of `researching` by someone else while being curated.
    pub released: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadSummary {
    pub loaded: Vec<String>,
    pub failed: Vec<String>,
    pub nodes_created: u64,
    pub relationships_created: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        };
        f.pad(s)
    }
}

/// Result of the post-load health stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub disconnected_records: u64,
    pub remediated: u64,
    #[serde(default)]
    pub details: Vec<String>,
}

/// Pipeline health derived from the snapshot's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub error_rate: f64,
    pub recent_errors: usize,
    pub quality_average: Option<f64>,
    pub total_cycles: u64,
    pub uptime_secs: i64,
}

/// Process-wide coordination state, persisted after every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowStateSnapshot {
    pub version: u32,
    pub flow_id: String,

    // ── durable across cycles ───────────────────────────────────────
    pub visited_sources: BTreeSet<String>,
    pub last_scan_time: BTreeMap<SourceCategory, DateTime<Utc>>,
    pub pending_discoveries: BTreeSet<String>,
    /// discovery id → claiming worker.
    pub research_in_progress: BTreeMap<String, String>,
    pub research_completed: BTreeSet<String>,
    pub graph_nodes_created: u64,
    pub graph_relationships_created: u64,
    pub graph_updates_pending: u64,
    pub errors: Vec<ErrorRecord>,
    pub errors_total: u64,
    pub quality_scores: Vec<f64>,
    pub settings: FlowSettings,
    pub session_start: DateTime<Utc>,
    pub total_cycles: u64,
    pub discoveries_today: u64,
    pub verifications_today: u64,
    pub counters_date: Option<NaiveDate>,

    // ── current cycle ───────────────────────────────────────────────
    /// Producer names expected at the aggregate barrier; `None` until the
    /// scan stage has started.
    pub scan_expected: Option<Vec<String>>,
    pub scan_results: BTreeMap<String, ScanResult>,
    pub aggregate: Option<AggregateResult>,
    /// Pending records from earlier cycles counted in by the route stage.
    pub backlog: usize,
    pub route: Option<Route>,
    /// Claim budget of each curation batch.
    pub curation_plan: Vec<usize>,
    pub curated_batches: Vec<CuratedBatch>,
    pub load: Option<LoadSummary>,
    pub health: Option<HealthReport>,
}

impl Default for FlowStateSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            flow_id: String::new(),
            visited_sources: BTreeSet::new(),
            last_scan_time: BTreeMap::new(),
            pending_discoveries: BTreeSet::new(),
            research_in_progress: BTreeMap::new(),
            research_completed: BTreeSet::new(),
            graph_nodes_created: 0,
            graph_relationships_created: 0,
            graph_updates_pending: 0,
            errors: Vec::new(),
            errors_total: 0,
            quality_scores: Vec::new(),
            settings: FlowSettings::default(),
            session_start: Utc::now(),
            total_cycles: 0,
            discoveries_today: 0,
            verifications_today: 0,
            counters_date: None,
            scan_expected: None,
            scan_results: BTreeMap::new(),
            aggregate: None,
            backlog: 0,
            route: None,
            curation_plan: Vec::new(),
            curated_batches: Vec::new(),
            load: None,
            health: None,
        }
    }
}

impl FlowStateSnapshot {
    pub fn new(flow_id: impl Into<String>, settings: FlowSettings) -> Self {
        Self {
            flow_id: flow_id.into(),
            settings,
            ..Self::default()
        }
    }

    /// The stage to run next, derived from what this cycle has recorded.
    pub fn next_stage(&self) -> Stage {
        let Some(expected) = &self.scan_expected else {
            return Stage::Scan;
        };
        if expected.iter().any(|p| !self.scan_results.contains_key(p)) {
            return Stage::Scan;
        }
        if self.aggregate.is_none() {
            return Stage::Aggregate;
        }
        let curate = match self.route {
            None => return Stage::Route,
            Some(Route::Idle) => return Stage::Idle,
            Some(Route::Normal) => Stage::CurateNormal,
            Some(Route::Batch) => Stage::CurateBatch,
        };
        if self.curated_batches.len() < self.curation_plan.len() {
            return curate;
        }
        if self.load.is_none() {
            return Stage::Load;
        }
        if self.health.is_none() {
            return Stage::Health;
        }
        Stage::Complete
    }

    /// Close the current cycle and clear its per-cycle fields.
    pub fn finish_cycle(&mut self) {
        self.total_cycles += 1;
        self.scan_expected = None;
        self.scan_results.clear();
        self.aggregate = None;
        self.backlog = 0;
        self.route = None;
        self.curation_plan.clear();
        self.curated_batches.clear();
        self.load = None;
        self.health = None;
    }

    pub fn record_error(
        &mut self,
        stage: Stage,
        message: impl Into<String>,
        discovery_id: Option<&str>,
    ) {
        self.errors.push(ErrorRecord {
            timestamp: Utc::now(),
            stage,
            message: message.into(),
            discovery_id: discovery_id.map(str::to_string),
        });
        self.errors_total += 1;
        if self.errors.len() > ERROR_LOG_CAP {
            let excess = self.errors.len() - ERROR_LOG_CAP;
            self.errors.drain(..excess);
        }
    }

    pub fn record_quality(&mut self, score: f64) {
        self.quality_scores.push(score);
        if self.quality_scores.len() > QUALITY_WINDOW {
            let excess = self.quality_scores.len() - QUALITY_WINDOW;
            self.quality_scores.drain(..excess);
        }
    }

    pub fn quality_average(&self) -> Option<f64> {
        if self.quality_scores.is_empty() {
            None
        } else {
            Some(self.quality_scores.iter().sum::<f64>() / self.quality_scores.len() as f64)
        }
    }

    /// Reset the daily counters when the calendar date has changed.
    pub fn roll_daily_counters(&mut self, today: NaiveDate) {
        if self.counters_date != Some(today) {
            self.discoveries_today = 0;
            self.verifications_today = 0;
            self.counters_date = Some(today);
        }
    }

    /// Classify pipeline health from the error log and quality scores.
    pub fn health_summary(&self, now: DateTime<Utc>) -> HealthSummary {
        let error_rate = self.errors_total as f64 / self.total_cycles.max(1) as f64;
        let day_ago = now - Duration::hours(24);
        let recent_errors = self
            .errors
            .iter()
            .filter(|e| e.timestamp > day_ago)
            .count();
        let quality_average = self.quality_average();

        let status = if error_rate > 0.5 {
            HealthStatus::Critical
        } else if error_rate > 0.2 {
            HealthStatus::Degraded
        } else if recent_errors > 10
            || quality_average.is_some_and(|q| q < self.settings.quality_threshold)
        {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        HealthSummary {
            status,
            error_rate,
            recent_errors,
            quality_average,
            total_cycles: self.total_cycles,
            uptime_secs: (now - self.session_start).num_seconds(),
        }
    }
}

/// Listing entry for stored snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    pub flow_id: String,
    pub version: u32,
    pub stage: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Durably write the snapshot, replacing the previous one for its flow id.
    pub async fn save(&self, snapshot: &FlowStateSnapshot) -> Result<()> {
        let mut stored = snapshot.clone();
        stored.version = SNAPSHOT_VERSION;
        let state_json = serde_json::to_string(&stored)?;

        sqlx::query(
            r#"
            INSERT INTO flow_snapshots (flow_id, version, stage, state_json, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(flow_id) DO UPDATE SET
                version = excluded.version,
                stage = excluded.stage,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&stored.flow_id)
        .bind(i64::from(SNAPSHOT_VERSION))
        .bind(stored.next_stage().as_str())
        .bind(&state_json)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load(&self, flow_id: &str) -> Result<Option<FlowStateSnapshot>> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT version, state_json FROM flow_snapshots WHERE flow_id = ?")
                .bind(flow_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some((version, state_json)) = row else {
            return Ok(None);
        };
        decode_snapshot(version, &state_json).map(Some)
    }

    pub async fn list(&self) -> Result<Vec<SnapshotInfo>> {
        let rows = sqlx::query(
            "SELECT flow_id, version, stage, updated_at FROM flow_snapshots ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let version: i64 = row.get("version");
                SnapshotInfo {
                    flow_id: row.get("flow_id"),
                    version: u32::try_from(version).unwrap_or(u32::MAX),
                    stage: row.get("stage"),
                    updated_at: from_millis(row.get("updated_at")),
                }
            })
            .collect())
    }
}

fn decode_snapshot(version: i64, state_json: &str) -> Result<FlowStateSnapshot> {
    let found = u32::try_from(version).unwrap_or(u32::MAX);
    if found > SNAPSHOT_VERSION {
        return Err(PipelineError::UnsupportedSnapshot {
            found,
            supported: SNAPSHOT_VERSION,
        });
    }
    Ok(serde_json::from_str(state_json)?)
}
