//! Operator-facing presentation of the store operations.
//!
//! Each function here backs one `gearflow` subcommand: it calls the store,
//! branches on the returned outcome, and prints a short human-readable
//! result. Sentinel outcomes (duplicate, empty, not found) are printed, not
//! turned into process failures.

use anyhow::{Context, Result};
use chrono::Utc;

use crate::config::Config;
use crate::db::Stores;
use crate::models::{
    AuthorityCategory, ClaimOutcome, ConfidenceLevel, Discovery, DiscoveryKind, DiscoverySource,
    DiscoveryStatus, EnqueueOutcome, KindLabel, NewStep, Priority, QueueEntry, RegistryCheck,
    ResearchSource, SourceCategory, SourceRecord, StatusUpdate, Validation,
};
use crate::snapshot::FlowStateSnapshot;
use crate::stats::{format_ts_iso, format_ts_relative};

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

pub async fn registry_check(stores: &Stores, location: &str) -> Result<()> {
    match stores.registry.check(location).await? {
        RegistryCheck::New => println!("new: {}", location),
        RegistryCheck::Visited(record) => {
            println!("visited: {}", record.location);
            print_source(&record);
        }
    }
    Ok(())
}

pub async fn registry_record(
    stores: &Stores,
    location: &str,
    category: Option<SourceCategory>,
    items: u32,
    failed: bool,
) -> Result<()> {
    let record = if failed {
        stores.registry.record_failed(location, category).await?
    } else {
        stores.registry.record(location, category, items).await?
    };
    println!("recorded: {}", record.location);
    print_source(&record);
    Ok(())
}

pub async fn registry_recent(stores: &Stores, limit: i64) -> Result<()> {
    let records = stores.registry.recent(limit).await?;
    if records.is_empty() {
        println!("No sources recorded.");
        return Ok(());
    }

    println!(
        "{:<48} {:<8} {:>6} {:>6} {:<9}   {}",
        "LOCATION", "CATEGORY", "SCANS", "ITEMS", "STATUS", "LAST SCANNED"
    );
    println!("{}", "-".repeat(100));
    for r in &records {
        println!(
            "{:<48} {:<8} {:>6} {:>6} {:<9}   {}",
            truncate(&r.location, 48),
            r.category.map(|c| c.as_str()).unwrap_or("-"),
            r.scan_count,
            r.items_discovered,
            r.status,
            format_ts_relative(r.last_scanned)
        );
    }
    Ok(())
}

pub async fn registry_stats(stores: &Stores) -> Result<()> {
    let stats = stores.registry.stats().await?;
    println!("Sources: {}", stats.total_sources);
    println!("Items:   {}", stats.total_items);
    if !stats.by_category.is_empty() {
        println!();
        println!("{:<10} {:>8} {:>8}", "CATEGORY", "SOURCES", "ITEMS");
        println!("{}", "-".repeat(28));
        for c in &stats.by_category {
            println!(
                "{:<10} {:>8} {:>8}",
                c.category.map(|c| c.as_str()).unwrap_or("-"),
                c.sources,
                c.items
            );
        }
    }
    Ok(())
}

fn print_source(record: &SourceRecord) {
    println!(
        "  category: {}",
        record.category.map(|c| c.as_str()).unwrap_or("-")
    );
    println!("  scans:    {}", record.scan_count);
    println!("  items:    {}", record.items_discovered);
    println!("  status:   {}", record.status);
    println!("  first:    {}", format_ts_iso(record.first_seen));
    println!("  last:     {}", format_ts_iso(record.last_scanned));
}

// ═══════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════

/// Fields for an operator-submitted discovery.
pub struct EnqueueArgs {
    pub kind: KindLabel,
    pub name: String,
    pub source_url: String,
    pub source_category: SourceCategory,
    pub brand: Option<String>,
    pub summary: Option<String>,
    pub parent: Option<String>,
    pub website: Option<String>,
    pub context: Option<String>,
    pub priority: u8,
    pub confidence: f64,
    pub discovered_by: String,
}

impl EnqueueArgs {
    pub fn into_discovery(self) -> Result<Discovery> {
        let kind = match self.kind {
            KindLabel::Brand => DiscoveryKind::Brand {
                website: self.website,
                description: None,
            },
            KindLabel::Product => DiscoveryKind::Product {
                brand: self
                    .brand
                    .context("--brand is required for product discoveries")?,
                product_family: None,
                estimated_price: None,
                estimated_weight: None,
            },
            KindLabel::Insight => DiscoveryKind::Insight {
                summary: self
                    .summary
                    .context("--summary is required for insight discoveries")?,
                related_products: Vec::new(),
            },
            KindLabel::Category => DiscoveryKind::Category {
                parent: self.parent,
            },
        };

        let id = Discovery::derive_id(self.kind, &self.name, &self.source_url);
        let mut discovery = Discovery::new(
            id,
            kind,
            self.name,
            DiscoverySource {
                url: self.source_url,
                category: self.source_category,
                title: None,
            },
            self.discovered_by,
        )
        .with_priority(Priority::new(self.priority)?)
        .with_confidence(self.confidence);
        if let Some(context) = self.context {
            discovery = discovery.with_context(context);
        }
        Ok(discovery)
    }
}

pub async fn queue_enqueue(stores: &Stores, args: EnqueueArgs) -> Result<()> {
    let discovery = args.into_discovery()?;
    match stores.queue.enqueue(&discovery).await? {
        EnqueueOutcome::Accepted => println!("accepted: {}", discovery.discovery_id),
        EnqueueOutcome::Duplicate { existing } => println!(
            "duplicate: {} (existing status: {})",
            discovery.discovery_id, existing
        ),
    }
    Ok(())
}

pub async fn queue_next(stores: &Stores, worker: &str) -> Result<()> {
    match stores.queue.dequeue_next(worker).await? {
        ClaimOutcome::Claimed(entry) => {
            println!("claimed: {}", entry.id());
            print_entry(&entry);
        }
        ClaimOutcome::Empty => println!("empty"),
    }
    Ok(())
}

pub async fn queue_peek(stores: &Stores, n: i64) -> Result<()> {
    let entries = stores.queue.peek(n).await?;
    print_entries(&entries);
    Ok(())
}

pub async fn queue_list(stores: &Stores, status: Option<DiscoveryStatus>, limit: i64) -> Result<()> {
    let entries = stores.queue.list(status, limit).await?;
    print_entries(&entries);
    Ok(())
}

pub async fn queue_show(stores: &Stores, id: &str) -> Result<()> {
    match stores.queue.get(id).await? {
        Some(entry) => {
            println!("{}", entry.id());
            print_entry(&entry);
            println!("{}", serde_json::to_string_pretty(&entry.discovery)?);
        }
        None => println!("not found: {}", id),
    }
    Ok(())
}

pub async fn queue_set_status(
    stores: &Stores,
    id: &str,
    status: DiscoveryStatus,
    validated: bool,
) -> Result<()> {
    let outcome = if validated {
        stores.queue.transition(id, status).await?
    } else {
        stores.queue.set_status(id, status).await?
    };
    print_status_update(id, status, &outcome);
    Ok(())
}

pub async fn queue_reset(stores: &Stores, id: &str) -> Result<()> {
    let outcome = stores.queue.reset(id).await?;
    print_status_update(id, DiscoveryStatus::Pending, &outcome);
    Ok(())
}

pub async fn queue_reclaim(stores: &Stores, older_than_secs: u64) -> Result<()> {
    let age = chrono::Duration::from_std(std::time::Duration::from_secs(older_than_secs))
        .context("reclaim age out of range")?;
    let reclaimed = stores.queue.reclaim_stale(Utc::now() - age).await?;
    println!("reclaimed {} stale claim(s)", reclaimed.len());
    for id in &reclaimed {
        println!("  {}", id);
    }
    Ok(())
}

pub async fn queue_status(stores: &Stores) -> Result<()> {
    let status = stores.queue.status().await?;
    println!("Total: {}", status.total());
    println!();
    println!("{:<12} {:>8} {:>13}", "STATUS", "COUNT", "AVG PRIORITY");
    println!("{}", "-".repeat(35));
    for s in DiscoveryStatus::ALL {
        let (count, avg) = status
            .by_status
            .get(s)
            .map(|c| (c.count, c.avg_priority))
            .unwrap_or((0, 0.0));
        println!("{:<12} {:>8} {:>13.1}", s, count, avg);
    }
    if !status.by_kind.is_empty() {
        println!();
        println!("{:<12} {:>8} {:>8}", "KIND", "TOTAL", "PENDING");
        println!("{}", "-".repeat(30));
        for (kind, total) in &status.by_kind {
            let pending = status.pending_by_kind.get(kind).copied().unwrap_or(0);
            println!("{:<12} {:>8} {:>8}", kind, total, pending);
        }
    }
    Ok(())
}

fn print_status_update(id: &str, to: DiscoveryStatus, outcome: &StatusUpdate) {
    match outcome {
        StatusUpdate::Updated => println!("updated: {} -> {}", id, to),
        StatusUpdate::NotFound => println!("not found: {}", id),
        StatusUpdate::InvalidTransition { from, to } => {
            println!("invalid transition: {} is {}, cannot move to {}", id, from, to)
        }
    }
}

fn print_entry(entry: &QueueEntry) {
    let d = &entry.discovery;
    println!("  kind:     {}", d.label());
    println!("  name:     {}", d.name);
    println!("  status:   {}", d.status);
    println!("  priority: {}", d.priority.get());
    println!("  source:   {} ({})", d.source.url, d.source.category);
    println!("  enqueued: {}", format_ts_iso(entry.enqueued_at));
    if let (Some(by), Some(at)) = (&entry.claimed_by, entry.claimed_at) {
        println!("  claimed:  {} by {}", format_ts_relative(at), by);
    }
}

fn print_entries(entries: &[QueueEntry]) {
    if entries.is_empty() {
        println!("No discoveries.");
        return;
    }
    println!(
        "{:<26} {:<9} {:>3} {:<12} {}",
        "ID", "KIND", "PRI", "STATUS", "NAME"
    );
    println!("{}", "-".repeat(80));
    for e in entries {
        println!(
            "{:<26} {:<9} {:>3} {:<12} {}",
            truncate(e.id(), 26),
            e.discovery.label(),
            e.discovery.priority.get(),
            e.status(),
            e.discovery.name
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Research
// ═══════════════════════════════════════════════════════════════════════

pub struct LogStepArgs {
    pub research_id: String,
    pub discovery_id: String,
    pub url: String,
    pub authority: AuthorityCategory,
    pub fields: Vec<String>,
    pub confidence: ConfidenceLevel,
    pub note: Option<String>,
    pub kind: Option<KindLabel>,
    pub researcher: Option<String>,
}

pub async fn research_log(stores: &Stores, args: LogStepArgs) -> Result<()> {
    let mut source = ResearchSource::new(args.url, args.authority, args.fields, args.confidence);
    source.note = args.note;

    let step = stores
        .ledger
        .log_step(NewStep {
            research_id: args.research_id,
            discovery_id: args.discovery_id,
            kind: args.kind,
            researcher: args.researcher,
            source,
        })
        .await?;
    println!(
        "logged step {} in session {} ({})",
        step.step_id, step.research_id, step.content_hash
    );
    Ok(())
}

pub async fn research_retrieve(stores: &Stores, discovery_id: &str) -> Result<()> {
    let sessions = stores.ledger.retrieve(discovery_id).await?;
    if sessions.is_empty() {
        println!("No research sessions for {}.", discovery_id);
        return Ok(());
    }

    for session in &sessions {
        println!(
            "session {} [{}] started {}",
            session.research_id,
            session.status,
            format_ts_iso(session.started_at)
        );
        if let (Some(score), Some(confidence)) =
            (session.completeness_score, session.overall_confidence)
        {
            println!(
                "  completeness {:.0}%, confidence {}{}",
                score * 100.0,
                confidence,
                if session.ready_for_load { ", ready for load" } else { "" }
            );
        }
        for step in &session.steps {
            println!(
                "  #{:<5} {:<13} {:<12} {}  [{}]",
                step.step_id,
                step.source.authority,
                step.source.confidence,
                step.source.url,
                step.source.fields_found.join(", ")
            );
            if let Some(note) = &step.source.note {
                println!("         {}", note);
            }
        }
    }
    Ok(())
}

pub async fn research_complete(stores: &Stores, research_id: &str) -> Result<()> {
    let report = stores.ledger.complete(research_id).await?;
    println!("completed: {}", report.research_id);
    println!("  steps:        {}", report.step_count);
    println!("  completeness: {:.1}%", report.completeness * 100.0);
    println!("  confidence:   {}", report.overall_confidence);
    if !report.missing_fields.is_empty() {
        let missing: Vec<&str> = report.missing_fields.iter().map(String::as_str).collect();
        println!("  missing:      {}", missing.join(", "));
    }
    Ok(())
}

pub async fn research_validate(stores: &Stores, research_id: &str) -> Result<()> {
    match stores.ledger.validate(research_id).await? {
        Validation::Valid {
            completeness,
            confidence,
        } => println!(
            "valid: {:.1}% complete, {} confidence",
            completeness * 100.0,
            confidence
        ),
        Validation::Invalid { reasons } => {
            println!("invalid:");
            for reason in &reasons {
                println!("  - {}", reason);
            }
        }
    }
    Ok(())
}

pub async fn research_verify(stores: &Stores, research_id: &str) -> Result<()> {
    let tampered = stores.ledger.verify_integrity(research_id).await?;
    if tampered.is_empty() {
        println!("ok: all step hashes match");
    } else {
        println!("MISMATCH in steps: {:?}", tampered);
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Flow
// ═══════════════════════════════════════════════════════════════════════

pub async fn flow_show(stores: &Stores, flow_id: Option<&str>) -> Result<()> {
    let Some(flow_id) = flow_id else {
        let flows = stores.snapshots.list().await?;
        if flows.is_empty() {
            println!("No flows recorded.");
        }
        for f in &flows {
            println!(
                "{:<24} v{}  next: {:<14} updated {}",
                f.flow_id,
                f.version,
                f.stage,
                format_ts_relative(f.updated_at)
            );
        }
        return Ok(());
    };

    let snapshot = load_snapshot(stores, flow_id).await?;
    println!("flow {}", snapshot.flow_id);
    println!("  next stage:        {}", snapshot.next_stage());
    println!("  cycles:            {}", snapshot.total_cycles);
    println!("  session start:     {}", format_ts_iso(snapshot.session_start));
    println!("  visited sources:   {}", snapshot.visited_sources.len());
    println!("  pending:           {}", snapshot.pending_discoveries.len());
    println!("  in progress:       {}", snapshot.research_in_progress.len());
    println!("  completed:         {}", snapshot.research_completed.len());
    println!("  nodes created:     {}", snapshot.graph_nodes_created);
    println!("  relationships:     {}", snapshot.graph_relationships_created);
    println!("  updates pending:   {}", snapshot.graph_updates_pending);
    println!("  discoveries today: {}", snapshot.discoveries_today);
    println!("  verified today:    {}", snapshot.verifications_today);
    println!(
        "  parallelism:       {} scan / {} research",
        snapshot.settings.max_parallel_scans, snapshot.settings.max_parallel_research
    );
    for (category, at) in &snapshot.last_scan_time {
        println!("  last {:<8} scan: {}", category, format_ts_relative(*at));
    }
    for (id, worker) in &snapshot.research_in_progress {
        println!("  researching {} ({})", id, worker);
    }
    if !snapshot.errors.is_empty() {
        println!();
        println!("  recent errors:");
        for e in snapshot.errors.iter().rev().take(10) {
            println!(
                "  {} [{}] {}",
                format_ts_iso(e.timestamp),
                e.stage,
                e.message
            );
        }
    }
    Ok(())
}

pub async fn flow_health(stores: &Stores, flow_id: &str) -> Result<()> {
    let snapshot = load_snapshot(stores, flow_id).await?;
    let summary = snapshot.health_summary(Utc::now());
    println!("status:         {}", summary.status);
    println!("error rate:     {:.2} per cycle", summary.error_rate);
    println!("errors (24h):   {}", summary.recent_errors);
    match summary.quality_average {
        Some(q) => println!(
            "quality:        {:.1}% (threshold {:.1}%)",
            q * 100.0,
            snapshot.settings.quality_threshold * 100.0
        ),
        None => println!("quality:        n/a"),
    }
    println!("cycles:         {}", summary.total_cycles);
    println!("uptime:         {}s", summary.uptime_secs);
    if let Some(report) = &snapshot.health {
        println!(
            "last check:     {} disconnected, {} remediated",
            report.disconnected_records, report.remediated
        );
    }
    Ok(())
}

/// Reclaim stale claims for a flow without running it.
///
/// Only the queue is changed. The flow's coordinator owns the snapshot and
/// rebuilds its pending and in-progress sets from the queue before its next
/// stage, so the snapshot is never written from here.
pub async fn flow_reclaim(stores: &Stores, config: &Config, flow_id: &str) -> Result<()> {
    load_snapshot(stores, flow_id).await?;
    let age = chrono::Duration::from_std(config.flow.liveness_timeout())
        .context("liveness timeout out of range")?;
    let reclaimed = stores.queue.reclaim_stale(Utc::now() - age).await?;
    for id in &reclaimed {
        println!("  {}", id);
    }
    println!(
        "reclaimed {} stale claim(s); flow {} picks them up at its next stage",
        reclaimed.len(),
        flow_id
    );
    Ok(())
}

async fn load_snapshot(stores: &Stores, flow_id: &str) -> Result<FlowStateSnapshot> {
    stores
        .snapshots
        .load(flow_id)
        .await?
        .with_context(|| format!("no snapshot for flow '{}'", flow_id))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}
