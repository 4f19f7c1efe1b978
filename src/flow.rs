//! Orchestration flow: a resumable state machine over the pipeline stages.
//!
//! ```text
//! scan ──▶ aggregate ──▶ route ─┬─▶ curate_normal ─┐
//! (fan-out)  (barrier)          ├─▶ curate_batch ──┴─▶ load ──▶ health ──▶ complete
//!                               └─▶ idle                 (fan-in)
//! ```
//!
//! The coordinator owns the [`FlowStateSnapshot`] and is the only code that
//! mutates it. Parallel scan producers return their results to the
//! coordinator; parallel curators report claims and outcomes over a channel
//! that the coordinator drains. After every stage the snapshot is written
//! to the [`SnapshotStore`](crate::snapshot::SnapshotStore), and the next
//! stage is always derived from the snapshot's contents, so reopening a
//! flow continues exactly where the last persisted stage left off.
//!
//! On open, queue records left `researching` for longer than the liveness
//! timeout are returned to `pending`. The snapshot's pending and in-progress
//! sets mirror the queue and are rebuilt from it on open and before every
//! stage, so queue changes made elsewhere (an operator reclaim or reset)
//! are picked up instead of being overwritten by the next persist.
//!
//! The route stage counts pending records left from earlier cycles
//! together with this cycle's new ones, so reclaimed or reset work is
//! curated even when a scan finds nothing new.
//!
//! Cross-store consistency is kept by ordering: a session is completed and
//! validated in the ledger before its discovery is moved to `verified`, and
//! a discovery is only moved to `loaded` after the loader has applied it.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::config::{Config, RetryConfig};
use crate::db::Stores;
use crate::error::{PipelineError, Result};
use crate::models::{
    normalize_location, ClaimOutcome, Discovery, DiscoveryStatus, EnqueueOutcome, NewStep,
    RegistryCheck, ResearchSource, ScanStatus, SourceCategory, StatusUpdate, Validation,
};
use crate::retry::retry_with_backoff;
use crate::snapshot::{
    AggregateResult, CuratedBatch, FlowSettings, FlowStateSnapshot, HealthReport, HealthStatus,
    LoadSummary, Route, ScanResult, Stage,
};
use crate::traits::{Collaborators, LoadRequest, ResearchExecutor, Scanner};

/// A collaborator call that did not answer within the task timeout.
#[derive(Debug, thiserror::Error)]
#[error("timed out after {0:?}")]
struct TaskTimeout(Duration);

async fn call_with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TaskTimeout(timeout).into()),
    }
}

fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TaskTimeout>().is_some()
}

/// Summary of one finished cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub flow_id: String,
    pub cycle: u64,
    pub route: Option<Route>,
    pub producers: usize,
    pub discovered: usize,
    /// Pending records from earlier cycles included in curation.
    pub backlog: usize,
    pub duplicates: usize,
    pub verified: usize,
    pub errored: usize,
    pub abandoned: usize,
    pub released: usize,
    pub loaded: usize,
    pub nodes_created: u64,
    pub relationships_created: u64,
    pub health: Option<HealthStatus>,
}

pub struct FlowCoordinator {
    stores: Stores,
    collaborators: Collaborators,
    config: Config,
    snapshot: FlowStateSnapshot,
}

impl FlowCoordinator {
    /// Load (or create) the snapshot for `flow_id`, reclaim stale claims,
    /// and persist the result.
    pub async fn open(
        stores: Stores,
        collaborators: Collaborators,
        config: Config,
        flow_id: &str,
    ) -> Result<Self> {
        let snapshot = match stores.snapshots.load(flow_id).await? {
            Some(snapshot) => {
                tracing::info!(
                    flow_id,
                    next_stage = %snapshot.next_stage(),
                    cycles = snapshot.total_cycles,
                    "resuming flow"
                );
                snapshot
            }
            None => {
                tracing::info!(flow_id, "starting new flow");
                FlowStateSnapshot::new(flow_id, FlowSettings::from(&config.flow))
            }
        };

        let mut coordinator = Self {
            stores,
            collaborators,
            config,
            snapshot,
        };
        coordinator.reclaim_stale().await?;
        Ok(coordinator)
    }

    pub fn snapshot(&self) -> &FlowStateSnapshot {
        &self.snapshot
    }

    pub fn flow_id(&self) -> &str {
        &self.snapshot.flow_id
    }

    /// Return claims older than the liveness timeout to `pending` and drop
    /// them from the in-progress map.
    pub async fn reclaim_stale(&mut self) -> Result<Vec<String>> {
        let timeout = chrono::Duration::from_std(self.config.flow.liveness_timeout())
            .map_err(|e| PipelineError::InvalidValue(format!("liveness timeout: {}", e)))?;
        let reclaimed = self.stores.queue.reclaim_stale(Utc::now() - timeout).await?;

        if !reclaimed.is_empty() {
            tracing::warn!(
                flow_id = %self.snapshot.flow_id,
                count = reclaimed.len(),
                "reclaimed stale research claims"
            );
        }

        self.sync_with_queue().await?;
        self.persist().await?;
        Ok(reclaimed)
    }

    /// Rebuild the pending and in-progress mirrors from the queue.
    async fn sync_with_queue(&mut self) -> Result<()> {
        let pending = self
            .stores
            .queue
            .list(Some(DiscoveryStatus::Pending), i64::MAX)
            .await?;
        let researching = self
            .stores
            .queue
            .list(Some(DiscoveryStatus::Researching), i64::MAX)
            .await?;

        self.snapshot.pending_discoveries =
            pending.iter().map(|e| e.id().to_string()).collect();
        self.snapshot.research_in_progress = researching
            .into_iter()
            .filter_map(|e| {
                let worker = e.claimed_by.clone()?;
                Some((e.id().to_string(), worker))
            })
            .collect();
        Ok(())
    }

    /// Adjust worker bounds. Takes effect from the next stage.
    pub async fn set_parallelism(
        &mut self,
        max_parallel_scans: Option<usize>,
        max_parallel_research: Option<usize>,
    ) -> Result<()> {
        if max_parallel_scans == Some(0) || max_parallel_research == Some(0) {
            return Err(PipelineError::InvalidValue(
                "parallelism must be >= 1".to_string(),
            ));
        }
        if let Some(n) = max_parallel_scans {
            self.snapshot.settings.max_parallel_scans = n;
        }
        if let Some(n) = max_parallel_research {
            self.snapshot.settings.max_parallel_research = n;
        }
        tracing::info!(
            scans = self.snapshot.settings.max_parallel_scans,
            research = self.snapshot.settings.max_parallel_research,
            "parallelism updated"
        );
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        self.stores.snapshots.save(&self.snapshot).await
    }

    /// Run the next stage and persist the snapshot.
    ///
    /// On failure the error is appended to the snapshot's error log, the
    /// snapshot is persisted with whatever progress the stage made, and the
    /// error is returned. The same stage runs again on the next call.
    pub async fn step(&mut self) -> Result<Stage> {
        let stage = self.snapshot.next_stage();
        tracing::info!(flow_id = %self.snapshot.flow_id, %stage, "stage started");

        let result = match self.sync_with_queue().await {
            Ok(()) => self.run_stage(stage).await,
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            tracing::error!(flow_id = %self.snapshot.flow_id, %stage, error = %err, "stage failed");
            self.snapshot.record_error(stage, err.to_string(), None);
            if let Err(persist_err) = self.persist().await {
                tracing::error!(error = %persist_err, "failed to persist snapshot after stage error");
            }
            return Err(err);
        }

        self.persist().await?;
        tracing::info!(flow_id = %self.snapshot.flow_id, %stage, "stage finished");
        Ok(stage)
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Scan => self.run_scan().await,
            Stage::Aggregate => self.run_aggregate(),
            Stage::Route => self.run_route().await,
            Stage::CurateNormal | Stage::CurateBatch => self.run_curation(stage).await,
            Stage::Load => self.run_load().await,
            Stage::Health => self.run_health().await,
            Stage::Idle | Stage::Complete => {
                self.snapshot.finish_cycle();
                Ok(())
            }
        }
    }

    /// Run stages until the current cycle ends.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        loop {
            let next = self.snapshot.next_stage();
            if matches!(next, Stage::Idle | Stage::Complete) {
                let report = self.cycle_report();
                self.step().await?;
                tracing::info!(
                    flow_id = %report.flow_id,
                    cycle = report.cycle,
                    route = ?report.route,
                    discovered = report.discovered,
                    verified = report.verified,
                    loaded = report.loaded,
                    "cycle finished"
                );
                return Ok(report);
            }
            self.step().await?;
        }
    }

    fn cycle_report(&self) -> CycleReport {
        let s = &self.snapshot;
        let mut report = CycleReport {
            flow_id: s.flow_id.clone(),
            cycle: s.total_cycles + 1,
            route: s.route,
            producers: s.scan_results.len(),
            discovered: s.aggregate.as_ref().map(|a| a.count()).unwrap_or(0),
            backlog: s.backlog,
            duplicates: s.scan_results.values().map(|r| r.duplicates).sum(),
            health: s.health.as_ref().map(|h| h.status),
            ..CycleReport::default()
        };
        for batch in &s.curated_batches {
            report.verified += batch.verified.len();
            report.errored += batch.errored.len();
            report.abandoned += batch.abandoned.len();
            report.released += batch.released.len();
        }
        if let Some(load) = &s.load {
            report.loaded = load.loaded.len();
            report.nodes_created = load.nodes_created;
            report.relationships_created = load.relationships_created;
        }
        report
    }

    // ── scan ────────────────────────────────────────────────────────────

    async fn run_scan(&mut self) -> Result<()> {
        self.snapshot.roll_daily_counters(Utc::now().date_naive());

        if self.snapshot.scan_expected.is_none() {
            // Fix barrier membership before any producer runs.
            self.snapshot.scan_expected = Some(self.collaborators.scanners.names());
            self.persist().await?;
        }
        let expected = self.snapshot.scan_expected.clone().unwrap_or_default();

        let Self {
            stores,
            collaborators,
            config,
            snapshot,
        } = self;

        let mut runnable: Vec<&dyn Scanner> = Vec::new();
        for name in &expected {
            if snapshot.scan_results.contains_key(name) {
                continue;
            }
            match collaborators.scanners.find(name) {
                Some(scanner) => runnable.push(scanner),
                None => {
                    // Producer disappeared between runs; let the barrier pass.
                    snapshot.record_error(
                        Stage::Scan,
                        format!("producer '{}' is no longer registered", name),
                        None,
                    );
                    snapshot.scan_results.insert(name.clone(), ScanResult::default());
                }
            }
        }

        let ctx = ScanContext {
            stores,
            retry: &config.retry,
            task_timeout: config.flow.task_timeout(),
            visited: &snapshot.visited_sources,
        };
        let parallel = snapshot.settings.max_parallel_scans.max(1);

        let outcomes: Vec<Result<ProducerOutcome>> = stream::iter(runnable)
            .map(|scanner| run_producer(&ctx, scanner))
            .buffer_unordered(parallel)
            .collect()
            .await;

        let mut fault = None;
        let now = Utc::now();
        for outcome in outcomes {
            match outcome {
                Ok(outcome) => {
                    tracing::info!(
                        producer = %outcome.name,
                        scanned = outcome.result.locations_scanned,
                        skipped = outcome.result.locations_skipped,
                        failed = outcome.result.locations_failed,
                        accepted = outcome.result.accepted.len(),
                        duplicates = outcome.result.duplicates,
                        "producer finished"
                    );
                    snapshot.visited_sources.extend(outcome.visited);
                    snapshot.last_scan_time.insert(outcome.category, now);
                    snapshot
                        .pending_discoveries
                        .extend(outcome.result.accepted.iter().cloned());
                    snapshot.discoveries_today += outcome.result.accepted.len() as u64;
                    for (message, discovery_id) in outcome.errors {
                        snapshot.record_error(Stage::Scan, message, discovery_id.as_deref());
                    }
                    snapshot.scan_results.insert(outcome.name, outcome.result);
                }
                Err(err) => {
                    fault.get_or_insert(err);
                }
            }
        }

        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ── aggregate / route ───────────────────────────────────────────────

    fn run_aggregate(&mut self) -> Result<()> {
        let accepted: BTreeSet<String> = self
            .snapshot
            .scan_results
            .values()
            .flat_map(|r| r.accepted.iter().cloned())
            .collect();

        let aggregate = AggregateResult {
            accepted: accepted.into_iter().collect(),
            producers: self.snapshot.scan_results.len(),
        };
        tracing::info!(
            producers = aggregate.producers,
            discovered = aggregate.count(),
            "scan results aggregated"
        );
        self.snapshot.aggregate = Some(aggregate);
        Ok(())
    }

    async fn run_route(&mut self) -> Result<()> {
        let discovered = self
            .snapshot
            .aggregate
            .as_ref()
            .map(|a| a.count())
            .unwrap_or(0);
        let pending = self
            .stores
            .queue
            .status()
            .await?
            .count(DiscoveryStatus::Pending);
        // Reclaimed, reset, or left behind by an interrupted scan.
        let backlog = usize::try_from(pending)
            .unwrap_or(0)
            .saturating_sub(discovered);
        let count = discovered + backlog;
        let flow = &self.config.flow;

        let (route, plan) = if count == 0 {
            (Route::Idle, Vec::new())
        } else if count > flow.volume_threshold {
            let batch_size = flow.batch_size.max(1);
            let mut plan = vec![batch_size; count / batch_size];
            if count % batch_size > 0 {
                plan.push(count % batch_size);
            }
            (Route::Batch, plan)
        } else {
            (Route::Normal, vec![count])
        };

        tracing::info!(
            discovered,
            backlog,
            route = ?route,
            batches = plan.len(),
            "route selected"
        );
        self.snapshot.backlog = backlog;
        self.snapshot.route = Some(route);
        self.snapshot.curation_plan = plan;
        Ok(())
    }

    // ── curate ──────────────────────────────────────────────────────────

    async fn run_curation(&mut self, stage: Stage) -> Result<()> {
        while self.snapshot.curated_batches.len() < self.snapshot.curation_plan.len() {
            let index = self.snapshot.curated_batches.len();
            let budget = self.snapshot.curation_plan[index];
            self.run_batch(stage, index, budget).await?;
            self.persist().await?;
        }
        Ok(())
    }

    /// Curate up to `budget` queue records with a bounded worker pool.
    async fn run_batch(&mut self, stage: Stage, index: usize, budget: usize) -> Result<()> {
        let Self {
            stores,
            collaborators,
            config,
            snapshot,
        } = self;

        let workers = budget.min(snapshot.settings.max_parallel_research).max(1);
        let remaining = AtomicUsize::new(budget);
        let ctx = CurationContext {
            stores,
            executor: collaborators.executor.as_ref(),
            retry: &config.retry,
            task_timeout: config.flow.task_timeout(),
            max_rounds: config.flow.max_research_rounds.max(1),
        };

        tracing::info!(batch = index, budget, workers, "curation batch started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = futures::future::join_all((0..workers).map(|i| {
            let worker = format!("{}-b{}-w{}", snapshot.flow_id, index, i);
            curate_worker(&ctx, worker, &remaining, tx.clone())
        }));
        drop(tx);
        tokio::pin!(pool);

        let mut batch = CuratedBatch::default();
        let mut fault = None;
        loop {
            tokio::select! {
                Some(event) = rx.recv() => apply_event(snapshot, &mut batch, stage, event),
                results = &mut pool => {
                    for result in results {
                        if let Err(err) = result {
                            fault.get_or_insert(err);
                        }
                    }
                    break;
                }
            }
        }
        while let Ok(event) = rx.try_recv() {
            apply_event(snapshot, &mut batch, stage, event);
        }

        if let Some(err) = fault {
            return Err(err);
        }

        tracing::info!(
            batch = index,
            claimed = batch.claimed,
            verified = batch.verified.len(),
            errored = batch.errored.len(),
            abandoned = batch.abandoned.len(),
            released = batch.released.len(),
            "curation batch finished"
        );
        snapshot.curated_batches.push(batch);
        Ok(())
    }

    // ── load ────────────────────────────────────────────────────────────

    async fn run_load(&mut self) -> Result<()> {
        let verified = self
            .stores
            .queue
            .list(Some(DiscoveryStatus::Verified), i64::MAX)
            .await?;
        let timeout = self.config.flow.task_timeout();
        let mut summary = LoadSummary::default();

        for entry in verified {
            let id = entry.id().to_string();

            let Some(ready) = self.stores.ledger.ready_payload(&id).await? else {
                self.snapshot.record_error(
                    Stage::Load,
                    "verified discovery has no load-ready research payload",
                    Some(&id),
                );
                summary.failed.push(id);
                continue;
            };

            let request = LoadRequest {
                discovery_id: id.clone(),
                research_id: ready.research_id,
                mutation: ready.payload,
            };
            let loader = self.collaborators.loader.as_ref();
            let request_ref = &request;
            let applied = retry_with_backoff(&self.config.retry, "load", move || {
                call_with_timeout(timeout, loader.apply(request_ref))
            })
            .await;

            match applied {
                Ok(report) => match self.stores.queue.transition(&id, DiscoveryStatus::Loaded).await? {
                    StatusUpdate::Updated => {
                        summary.nodes_created += report.nodes_created;
                        summary.relationships_created += report.relationships_created;
                        self.snapshot.graph_nodes_created += report.nodes_created;
                        self.snapshot.graph_relationships_created += report.relationships_created;
                        self.snapshot.graph_updates_pending =
                            self.snapshot.graph_updates_pending.saturating_sub(1);
                        summary.loaded.push(id);
                    }
                    other => {
                        tracing::warn!(discovery_id = %id, outcome = ?other, "loaded discovery could not be marked loaded");
                        summary.failed.push(id);
                    }
                },
                Err(err) => {
                    // Stays verified; the next cycle's load retries it.
                    tracing::error!(discovery_id = %id, error = %err, "load failed");
                    self.snapshot
                        .record_error(Stage::Load, format!("load failed: {:#}", err), Some(&id));
                    summary.failed.push(id);
                }
            }
        }

        tracing::info!(
            loaded = summary.loaded.len(),
            failed = summary.failed.len(),
            nodes = summary.nodes_created,
            relationships = summary.relationships_created,
            "load finished"
        );
        self.snapshot.load = Some(summary);
        Ok(())
    }

    // ── health ──────────────────────────────────────────────────────────

    async fn run_health(&mut self) -> Result<()> {
        let timeout = self.config.flow.task_timeout();
        let checker = self.collaborators.health.as_ref();

        let checked = retry_with_backoff(&self.config.retry, "health", move || {
            call_with_timeout(timeout, checker.check())
        })
        .await;

        let mut details = Vec::new();
        let mut disconnected = 0;
        let mut remediated = 0;
        let mut check_failed = false;
        match checked {
            Ok(report) => {
                disconnected = report.disconnected_records;
                details = report.details.clone();
                if self.config.health.auto_remediate && disconnected > 0 {
                    let report_ref = &report;
                    match retry_with_backoff(&self.config.retry, "remediate", move || {
                        call_with_timeout(timeout, checker.remediate(report_ref))
                    })
                    .await
                    {
                        Ok(fixed) => remediated = fixed,
                        Err(err) => self.snapshot.record_error(
                            Stage::Health,
                            format!("remediation failed: {:#}", err),
                            None,
                        ),
                    }
                }
            }
            Err(err) => {
                check_failed = true;
                let message = format!("health check failed: {:#}", err);
                details.push(message.clone());
                self.snapshot.record_error(Stage::Health, message, None);
            }
        }

        if disconnected > 0 {
            tracing::warn!(disconnected, remediated, "structural integrity issues reported");
        }
        let mut status = self.snapshot.health_summary(Utc::now()).status;
        if check_failed || disconnected > remediated {
            status = status.max(HealthStatus::Warning);
        }

        self.snapshot.health = Some(HealthReport {
            status,
            disconnected_records: disconnected,
            remediated,
            details,
        });
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Scan producers
// ═══════════════════════════════════════════════════════════════════════

struct ScanContext<'a> {
    stores: &'a Stores,
    retry: &'a RetryConfig,
    task_timeout: Duration,
    visited: &'a BTreeSet<String>,
}

struct ProducerOutcome {
    name: String,
    category: SourceCategory,
    result: ScanResult,
    visited: Vec<String>,
    errors: Vec<(String, Option<String>)>,
}

/// Run one producer over its candidates. Collaborator failures are
/// recorded in the outcome; only storage faults are returned as errors.
async fn run_producer(ctx: &ScanContext<'_>, scanner: &dyn Scanner) -> Result<ProducerOutcome> {
    let timeout = ctx.task_timeout;
    let mut outcome = ProducerOutcome {
        name: scanner.name().to_string(),
        category: scanner.category(),
        result: ScanResult::default(),
        visited: Vec::new(),
        errors: Vec::new(),
    };

    let candidates = match retry_with_backoff(ctx.retry, "candidates", move || {
        call_with_timeout(timeout, scanner.candidates())
    })
    .await
    {
        Ok(candidates) => candidates,
        Err(err) => {
            outcome.errors.push((
                format!("producer '{}' could not list candidates: {:#}", outcome.name, err),
                None,
            ));
            return Ok(outcome);
        }
    };

    let mut seen_this_run = BTreeSet::new();
    for location in candidates {
        let key = normalize_location(&location);
        if ctx.visited.contains(&key) || !seen_this_run.insert(key.clone()) {
            outcome.result.locations_skipped += 1;
            continue;
        }
        if let RegistryCheck::Visited(record) = ctx.stores.registry.check(&key).await? {
            if record.status == ScanStatus::Completed {
                outcome.result.locations_skipped += 1;
                outcome.visited.push(key);
                continue;
            }
        }

        let location_ref = location.as_str();
        let scanned = retry_with_backoff(ctx.retry, "scan", move || {
            call_with_timeout(timeout, scanner.scan(location_ref))
        })
        .await;

        let output = match scanned {
            Ok(output) => output,
            Err(err) => {
                ctx.stores
                    .registry
                    .record_failed(&key, Some(outcome.category))
                    .await?;
                outcome.result.locations_failed += 1;
                outcome
                    .errors
                    .push((format!("scan of {} failed: {:#}", key, err), None));
                continue;
            }
        };

        let found = output.discoveries.len();
        for mut discovery in output.discoveries {
            if discovery.source.title.is_none() {
                discovery.source.title = output.title.clone();
            }
            match ctx.stores.queue.enqueue(&discovery).await {
                Ok(EnqueueOutcome::Accepted) => {
                    outcome.result.accepted.push(discovery.discovery_id);
                }
                Ok(EnqueueOutcome::Duplicate { .. }) => outcome.result.duplicates += 1,
                Err(PipelineError::InvalidDiscovery(reason)) => {
                    outcome.result.rejected += 1;
                    outcome.errors.push((
                        format!("rejected discovery from {}: {}", key, reason),
                        Some(discovery.discovery_id),
                    ));
                }
                Err(err) => return Err(err),
            }
        }

        ctx.stores
            .registry
            .record(&key, Some(outcome.category), found.try_into().unwrap_or(u32::MAX))
            .await?;
        outcome.result.locations_scanned += 1;
        outcome.visited.push(key);
    }

    Ok(outcome)
}

// ═══════════════════════════════════════════════════════════════════════
// Curators
// ═══════════════════════════════════════════════════════════════════════

struct CurationContext<'a> {
    stores: &'a Stores,
    executor: &'a dyn ResearchExecutor,
    retry: &'a RetryConfig,
    task_timeout: Duration,
    max_rounds: u32,
}

#[derive(Debug)]
enum CurationEvent {
    Claimed {
        discovery_id: String,
        worker: String,
    },
    Finished {
        discovery_id: String,
        outcome: CurationOutcome,
    },
}

#[derive(Debug)]
enum CurationOutcome {
    Verified {
        completeness: f64,
    },
    /// Every research round fell below the thresholds; escalated to `error`.
    Rejected {
        rounds: u32,
        completeness: Option<f64>,
        reasons: Vec<String>,
    },
    Errored {
        message: String,
    },
    /// Timed out; the claim stays in place for the liveness reclaim.
    Abandoned {
        message: String,
    },
    /// The record left `researching` through another path (an operator
    /// override or reclaim) before this curator could report its outcome.
    Released {
        message: String,
    },
}

/// Move a claimed record to `error` and report `outcome`, or report it as
/// released when the record is no longer ours to move.
async fn escalate(
    ctx: &CurationContext<'_>,
    id: &str,
    outcome: CurationOutcome,
) -> Result<CurationOutcome> {
    match ctx.stores.queue.transition(id, DiscoveryStatus::Error).await? {
        StatusUpdate::Updated => Ok(outcome),
        other => Ok(released(id, "error", other)),
    }
}

fn released(id: &str, target: &str, update: StatusUpdate) -> CurationOutcome {
    tracing::warn!(discovery_id = id, target, outcome = ?update, "curated discovery was moved elsewhere");
    CurationOutcome::Released {
        message: format!("could not mark {}: {:?}", target, update),
    }
}

/// Claim and curate records until the shared budget or the queue runs out.
async fn curate_worker(
    ctx: &CurationContext<'_>,
    worker: String,
    remaining: &AtomicUsize,
    events: mpsc::UnboundedSender<CurationEvent>,
) -> Result<()> {
    loop {
        if remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Ok(());
        }

        let entry = match ctx.stores.queue.dequeue_next(&worker).await? {
            ClaimOutcome::Claimed(entry) => entry,
            ClaimOutcome::Empty => return Ok(()),
        };
        let discovery_id = entry.id().to_string();
        let _ = events.send(CurationEvent::Claimed {
            discovery_id: discovery_id.clone(),
            worker: worker.clone(),
        });

        let outcome = curate_one(ctx, &worker, &entry.discovery).await?;
        let _ = events.send(CurationEvent::Finished {
            discovery_id,
            outcome,
        });
    }
}

/// Research a claimed discovery, looping back for further rounds while the
/// ledger rejects the evidence.
async fn curate_one(
    ctx: &CurationContext<'_>,
    worker: &str,
    discovery: &Discovery,
) -> Result<CurationOutcome> {
    let id = discovery.discovery_id.as_str();
    let timeout = ctx.task_timeout;
    let executor = ctx.executor;
    let mut prior: Vec<ResearchSource> = Vec::new();
    let mut last_completeness = None;
    let mut last_reasons = Vec::new();

    for round in 1..=ctx.max_rounds {
        let research_id = uuid::Uuid::new_v4().to_string();

        let prior_ref = prior.as_slice();
        let researched = retry_with_backoff(ctx.retry, "research", move || {
            call_with_timeout(timeout, executor.research(discovery, prior_ref))
        })
        .await;

        let sources = match researched {
            Ok(sources) => sources,
            Err(err) if is_timeout(&err) => {
                return Ok(CurationOutcome::Abandoned {
                    message: format!("research timed out: {:#}", err),
                });
            }
            Err(err) => {
                let message = format!("research failed: {:#}", err);
                return escalate(ctx, id, CurationOutcome::Errored { message }).await;
            }
        };

        if sources.is_empty() {
            last_reasons = vec!["research returned no sources".to_string()];
            continue;
        }

        for source in sources {
            let step = ctx
                .stores
                .ledger
                .log_step(NewStep {
                    research_id: research_id.clone(),
                    discovery_id: id.to_string(),
                    kind: Some(discovery.label()),
                    researcher: Some(worker.to_string()),
                    source,
                })
                .await?;
            prior.push(step.source);
        }

        let report = ctx.stores.ledger.complete(&research_id).await?;
        last_completeness = Some(report.completeness);

        match ctx.stores.ledger.validate(&research_id).await? {
            Validation::Valid { .. } => {
                let session = ctx
                    .stores
                    .ledger
                    .session(&research_id)
                    .await?
                    .ok_or_else(|| PipelineError::SessionNotFound(research_id.clone()))?;

                let session_ref = &session;
                let drafted = retry_with_backoff(ctx.retry, "draft_mutation", move || {
                    call_with_timeout(timeout, executor.draft_mutation(discovery, session_ref))
                })
                .await;
                let mutation = match drafted {
                    Ok(mutation) => mutation,
                    Err(err) => {
                        let message = format!("mutation drafting failed: {:#}", err);
                        return escalate(ctx, id, CurationOutcome::Errored { message }).await;
                    }
                };

                ctx.stores.ledger.attach_payload(&research_id, &mutation).await?;
                return match ctx.stores.queue.transition(id, DiscoveryStatus::Verified).await? {
                    StatusUpdate::Updated => Ok(CurationOutcome::Verified {
                        completeness: report.completeness,
                    }),
                    other => Ok(released(id, "verified", other)),
                };
            }
            Validation::Invalid { reasons } => {
                tracing::info!(
                    discovery_id = id,
                    round,
                    max_rounds = ctx.max_rounds,
                    reasons = ?reasons,
                    "research below threshold"
                );
                last_reasons = reasons.iter().map(|r| r.to_string()).collect();
            }
        }
    }

    let rejected = CurationOutcome::Rejected {
        rounds: ctx.max_rounds,
        completeness: last_completeness,
        reasons: last_reasons,
    };
    escalate(ctx, id, rejected).await
}

/// The single place where curation results touch the snapshot.
fn apply_event(
    snapshot: &mut FlowStateSnapshot,
    batch: &mut CuratedBatch,
    stage: Stage,
    event: CurationEvent,
) {
    match event {
        CurationEvent::Claimed {
            discovery_id,
            worker,
        } => {
            snapshot.pending_discoveries.remove(&discovery_id);
            snapshot.research_in_progress.insert(discovery_id, worker);
            batch.claimed += 1;
        }
        CurationEvent::Finished {
            discovery_id,
            outcome,
        } => match outcome {
            CurationOutcome::Verified { completeness } => {
                snapshot.research_in_progress.remove(&discovery_id);
                snapshot.research_completed.insert(discovery_id.clone());
                snapshot.record_quality(completeness);
                snapshot.verifications_today += 1;
                snapshot.graph_updates_pending += 1;
                batch.verified.push(discovery_id);
            }
            CurationOutcome::Rejected {
                rounds,
                completeness,
                reasons,
            } => {
                snapshot.research_in_progress.remove(&discovery_id);
                if let Some(score) = completeness {
                    snapshot.record_quality(score);
                }
                snapshot.record_error(
                    stage,
                    format!(
                        "research rejected after {} round(s): {}",
                        rounds,
                        reasons.join("; ")
                    ),
                    Some(&discovery_id),
                );
                batch.errored.push(discovery_id);
            }
            CurationOutcome::Errored { message } => {
                snapshot.research_in_progress.remove(&discovery_id);
                snapshot.record_error(stage, message, Some(&discovery_id));
                batch.errored.push(discovery_id);
            }
            CurationOutcome::Abandoned { message } => {
                snapshot.record_error(stage, message, Some(&discovery_id));
                batch.abandoned.push(discovery_id);
            }
            CurationOutcome::Released { message } => {
                snapshot.research_in_progress.remove(&discovery_id);
                snapshot.record_error(stage, message, Some(&discovery_id));
                batch.released.push(discovery_id);
            }
        },
    }
}
