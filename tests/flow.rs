use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use gearflow::config::Config;
use gearflow::db::Stores;
use gearflow::flow::FlowCoordinator;
use gearflow::models::{
    AuthorityCategory, ClaimOutcome, ConfidenceLevel, Discovery, DiscoveryKind,
    DiscoverySource, DiscoveryStatus, KindLabel, Priority, RegistryCheck, ResearchSession,
    ResearchSource, ScanStatus, SourceCategory,
};
use gearflow::snapshot::{HealthStatus, Route, Stage};
use gearflow::traits::{
    Collaborators, HealthCheck, IntegrityReport, LoadReport, LoadRequest, Loader,
    ResearchExecutor, ScanOutput, Scanner, ScannerRegistry,
};
use tempfile::TempDir;

// ═══════════════════════════════════════════════════════════════════════
// Test collaborators
// ═══════════════════════════════════════════════════════════════════════

/// Emits a fixed set of products per location.
struct CatalogScanner {
    name: String,
    pages: Vec<(String, Vec<String>)>,
    failing: Vec<String>,
    scans: Arc<AtomicUsize>,
}

impl CatalogScanner {
    fn new(name: &str, pages: &[(&str, &[&str])], scans: Arc<AtomicUsize>) -> Self {
        Self {
            name: name.to_string(),
            pages: pages
                .iter()
                .map(|(url, products)| {
                    (
                        url.to_string(),
                        products.iter().map(|p| p.to_string()).collect(),
                    )
                })
                .collect(),
            failing: Vec::new(),
            scans,
        }
    }
}

fn product_discovery(name: &str, url: &str) -> Discovery {
    Discovery::new(
        Discovery::derive_id(KindLabel::Product, name, url),
        DiscoveryKind::product("Zpacks"),
        name,
        DiscoverySource {
            url: url.to_string(),
            category: SourceCategory::Website,
            title: None,
        },
        "catalog",
    )
}

#[async_trait]
impl Scanner for CatalogScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> SourceCategory {
        SourceCategory::Website
    }

    async fn candidates(&self) -> Result<Vec<String>> {
        let mut all: Vec<String> = self.pages.iter().map(|(url, _)| url.clone()).collect();
        all.extend(self.failing.iter().cloned());
        Ok(all)
    }

    async fn scan(&self, location: &str) -> Result<ScanOutput> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.failing.iter().any(|f| f == location) {
            anyhow::bail!("connection reset");
        }
        let products = self
            .pages
            .iter()
            .find(|(url, _)| url == location)
            .map(|(_, products)| products.clone())
            .unwrap_or_default();
        Ok(ScanOutput {
            title: Some(format!("Catalog page {}", location)),
            discoveries: products
                .iter()
                .map(|name| product_discovery(name, location))
                .collect(),
        })
    }
}

#[derive(Clone, Copy)]
enum Evidence {
    /// Every required product field from the manufacturer.
    Complete,
    /// Only the name, from a forum post.
    Thin,
    /// Never answers within the task timeout.
    Hang,
}

struct ScriptedExecutor {
    evidence: Evidence,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(evidence: Evidence) -> Arc<Self> {
        Arc::new(Self {
            evidence,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ResearchExecutor for ScriptedExecutor {
    async fn research(
        &self,
        discovery: &Discovery,
        prior: &[ResearchSource],
    ) -> Result<Vec<ResearchSource>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.evidence {
            Evidence::Complete => Ok(vec![ResearchSource::new(
                discovery.source.url.clone(),
                AuthorityCategory::Manufacturer,
                ["name", "brand", "weight", "price", "productUrl", "imageUrl", "type"],
                ConfidenceLevel::Verified,
            )]),
            Evidence::Thin => Ok(vec![ResearchSource::new(
                format!("https://forum.example.com/{}", prior.len()),
                AuthorityCategory::Forum,
                ["name"],
                ConfidenceLevel::Reported,
            )]),
            Evidence::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn draft_mutation(
        &self,
        discovery: &Discovery,
        session: &ResearchSession,
    ) -> Result<String> {
        Ok(format!(
            "MERGE (p:Product {{id: '{}'}}) // {} steps",
            discovery.discovery_id,
            session.steps.len()
        ))
    }
}

#[derive(Default)]
struct RecordingLoader {
    applied: std::sync::Mutex<Vec<LoadRequest>>,
    fail: bool,
}

#[async_trait]
impl Loader for RecordingLoader {
    async fn apply(&self, request: &LoadRequest) -> Result<LoadReport> {
        if self.fail {
            anyhow::bail!("knowledge store unavailable");
        }
        self.applied.lock().unwrap().push(request.clone());
        Ok(LoadReport {
            nodes_created: 1,
            relationships_created: 2,
        })
    }
}

struct FixedHealth {
    disconnected: u64,
}

#[async_trait]
impl HealthCheck for FixedHealth {
    async fn check(&self) -> Result<IntegrityReport> {
        Ok(IntegrityReport {
            disconnected_records: self.disconnected,
            details: Vec::new(),
        })
    }
}

/// Simulates an operator override landing mid-research: puts the record
/// back to `pending`, then fails.
struct OverriddenExecutor {
    stores: Stores,
}

#[async_trait]
impl ResearchExecutor for OverriddenExecutor {
    async fn research(
        &self,
        discovery: &Discovery,
        _prior: &[ResearchSource],
    ) -> Result<Vec<ResearchSource>> {
        self.stores
            .queue
            .set_status(&discovery.discovery_id, DiscoveryStatus::Pending)
            .await?;
        anyhow::bail!("source unreachable")
    }

    async fn draft_mutation(
        &self,
        _discovery: &Discovery,
        _session: &ResearchSession,
    ) -> Result<String> {
        Ok(String::new())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Harness
// ═══════════════════════════════════════════════════════════════════════

fn test_config(tmp: &TempDir, flow: &str) -> Config {
    let config_content = format!(
        r#"[db]
path = "{}/data/gearflow.sqlite"

[flow]
{}

[retry]
max_retries = 0
backoff_base_ms = 1
"#,
        tmp.path().display(),
        flow
    );
    toml::from_str(&config_content).unwrap()
}

struct Harness {
    scans: Arc<AtomicUsize>,
    executor: Arc<ScriptedExecutor>,
    loader: Arc<RecordingLoader>,
}

fn collaborators(
    scanner: Option<CatalogScanner>,
    evidence: Evidence,
    loader: RecordingLoader,
    disconnected: u64,
) -> (Collaborators, Harness) {
    let scans = scanner
        .as_ref()
        .map(|s| s.scans.clone())
        .unwrap_or_default();
    let mut scanners = ScannerRegistry::new();
    if let Some(scanner) = scanner {
        scanners.register(Box::new(scanner));
    }
    let executor = ScriptedExecutor::new(evidence);
    let loader = Arc::new(loader);

    let collaborators = Collaborators {
        scanners,
        executor: executor.clone(),
        loader: loader.clone(),
        health: Arc::new(FixedHealth { disconnected }),
    };
    (
        collaborators,
        Harness {
            scans,
            executor,
            loader,
        },
    )
}

fn catalog(scans: &Arc<AtomicUsize>) -> CatalogScanner {
    CatalogScanner::new(
        "catalog",
        &[
            ("https://shop.example.com/packs", &["Arc Haul", "Duplex"][..]),
            ("https://shop.example.com/tents", &["Plex Solo"][..]),
        ],
        scans.clone(),
    )
}

// ═══════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn full_cycle_verifies_and_loads() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();
    let scans = Arc::new(AtomicUsize::new(0));
    let (collab, harness) =
        collaborators(Some(catalog(&scans)), Evidence::Complete, RecordingLoader::default(), 0);

    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "main")
        .await
        .unwrap();
    let report = flow.run_cycle().await.unwrap();

    assert_eq!(report.cycle, 1);
    assert_eq!(report.route, Some(Route::Normal));
    assert_eq!(report.producers, 1);
    assert_eq!(report.discovered, 3);
    assert_eq!(report.verified, 3);
    assert_eq!(report.errored, 0);
    assert_eq!(report.loaded, 3);
    assert_eq!(report.nodes_created, 3);
    assert_eq!(report.relationships_created, 6);
    assert_eq!(report.health, Some(HealthStatus::Healthy));

    let status = stores.queue.status().await.unwrap();
    assert_eq!(status.count(DiscoveryStatus::Loaded), 3);
    assert_eq!(harness.loader.applied.lock().unwrap().len(), 3);
    assert_eq!(harness.scans.load(Ordering::SeqCst), 2);

    let snapshot = flow.snapshot();
    assert_eq!(snapshot.total_cycles, 1);
    assert_eq!(snapshot.next_stage(), Stage::Scan);
    assert_eq!(snapshot.research_completed.len(), 3);
    assert!(snapshot.research_in_progress.is_empty());
    assert!(snapshot.pending_discoveries.is_empty());
    assert_eq!(snapshot.visited_sources.len(), 2);
    assert_eq!(snapshot.graph_nodes_created, 3);
    assert_eq!(snapshot.graph_updates_pending, 0);
    assert_eq!(snapshot.discoveries_today, 3);
    assert_eq!(snapshot.verifications_today, 3);
    assert!(snapshot.last_scan_time.contains_key(&SourceCategory::Website));

    let ledger = stores.ledger.counts().await.unwrap();
    assert_eq!(ledger.ready_for_load, 3);

    // The persisted snapshot matches the in-memory one.
    let stored = stores.snapshots.load("main").await.unwrap().unwrap();
    assert_eq!(stored.total_cycles, 1);
    assert_eq!(stored.research_completed, snapshot.research_completed);
}

#[tokio::test]
async fn visited_sources_are_not_rescanned() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();
    let scans = Arc::new(AtomicUsize::new(0));
    let (collab, harness) =
        collaborators(Some(catalog(&scans)), Evidence::Complete, RecordingLoader::default(), 0);

    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "main")
        .await
        .unwrap();
    flow.run_cycle().await.unwrap();
    let second = flow.run_cycle().await.unwrap();

    assert_eq!(second.cycle, 2);
    assert_eq!(second.route, Some(Route::Idle));
    assert_eq!(second.discovered, 0);
    assert_eq!(harness.scans.load(Ordering::SeqCst), 2);
    assert_eq!(flow.snapshot().total_cycles, 2);
}

#[tokio::test]
async fn empty_scan_routes_to_idle() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();
    let (collab, harness) = collaborators(None, Evidence::Complete, RecordingLoader::default(), 0);

    let mut flow = FlowCoordinator::open(stores, collab, config, "idle")
        .await
        .unwrap();

    assert_eq!(flow.step().await.unwrap(), Stage::Scan);
    assert_eq!(flow.step().await.unwrap(), Stage::Aggregate);
    assert_eq!(flow.step().await.unwrap(), Stage::Route);
    assert_eq!(flow.snapshot().next_stage(), Stage::Idle);
    assert_eq!(flow.step().await.unwrap(), Stage::Idle);

    assert_eq!(flow.snapshot().total_cycles, 1);
    assert_eq!(harness.executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn high_volume_takes_the_batch_path() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "volume_threshold = 2\nbatch_size = 2\nmax_parallel_research = 2");
    let stores = Stores::open(&config).await.unwrap();
    let scans = Arc::new(AtomicUsize::new(0));
    let scanner = CatalogScanner::new(
        "bulk",
        &[
            ("https://bulk.example.com/1", &["A", "B", "C"][..]),
            ("https://bulk.example.com/2", &["D", "E"][..]),
        ],
        scans.clone(),
    );
    let (collab, _harness) =
        collaborators(Some(scanner), Evidence::Complete, RecordingLoader::default(), 0);

    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "bulk")
        .await
        .unwrap();
    for _ in 0..3 {
        flow.step().await.unwrap();
    }
    assert_eq!(flow.snapshot().route, Some(Route::Batch));
    assert_eq!(flow.snapshot().curation_plan, vec![2, 2, 1]);
    assert_eq!(flow.snapshot().next_stage(), Stage::CurateBatch);

    let report = flow.run_cycle().await.unwrap();
    assert_eq!(report.route, Some(Route::Batch));
    assert_eq!(report.verified, 5);
    assert_eq!(report.loaded, 5);
    assert_eq!(
        stores.queue.status().await.unwrap().count(DiscoveryStatus::Loaded),
        5
    );
}

#[tokio::test]
async fn resumed_flow_continues_where_it_stopped() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();
    let scans = Arc::new(AtomicUsize::new(0));

    {
        let (collab, _) =
            collaborators(Some(catalog(&scans)), Evidence::Complete, RecordingLoader::default(), 0);
        let mut flow = FlowCoordinator::open(stores.clone(), collab, config.clone(), "resume")
            .await
            .unwrap();
        assert_eq!(flow.step().await.unwrap(), Stage::Scan);
        assert_eq!(flow.step().await.unwrap(), Stage::Aggregate);
        // Process stops here.
    }

    let (collab, harness) =
        collaborators(Some(catalog(&scans)), Evidence::Complete, RecordingLoader::default(), 0);
    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "resume")
        .await
        .unwrap();
    assert_eq!(flow.snapshot().next_stage(), Stage::Route);

    let report = flow.run_cycle().await.unwrap();
    assert_eq!(report.discovered, 3);
    assert_eq!(report.loaded, 3);
    assert_eq!(scans.load(Ordering::SeqCst), 2);
    assert_eq!(harness.loader.applied.lock().unwrap().len(), 3);
    assert_eq!(stores.queue.status().await.unwrap().total(), 3);
}

#[tokio::test]
async fn stale_claims_are_reclaimed_on_open() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "liveness_timeout_secs = 0");
    let stores = Stores::open(&config).await.unwrap();

    let discovery = product_discovery("Orphan", "https://shop.example.com/orphan");
    stores.queue.enqueue(&discovery).await.unwrap();
    stores.queue.dequeue_next("crashed-worker").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (collab, _) = collaborators(None, Evidence::Complete, RecordingLoader::default(), 0);
    let flow = FlowCoordinator::open(stores.clone(), collab, config, "reclaim")
        .await
        .unwrap();

    let entry = stores
        .queue
        .get(&discovery.discovery_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status(), DiscoveryStatus::Pending);
    assert!(entry.claimed_by.is_none());
    assert!(flow
        .snapshot()
        .pending_discoveries
        .contains(&discovery.discovery_id));
}

#[tokio::test]
async fn restart_after_liveness_timeout_reclaims_only_the_stale_claim() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "liveness_timeout_secs = 0");
    let stores = Stores::open(&config).await.unwrap();

    let stale = product_discovery("Arc Haul", "https://shop.example.com/arc")
        .with_priority(Priority::new(9).unwrap());
    let second = product_discovery("Duplex", "https://shop.example.com/duplex")
        .with_priority(Priority::new(5).unwrap());
    let third = product_discovery("Plex Solo", "https://shop.example.com/plex")
        .with_priority(Priority::new(3).unwrap());
    for discovery in [&stale, &second, &third] {
        stores.queue.enqueue(discovery).await.unwrap();
    }
    match stores.queue.dequeue_next("crashed-worker").await.unwrap() {
        ClaimOutcome::Claimed(entry) => assert_eq!(entry.id(), stale.discovery_id),
        ClaimOutcome::Empty => panic!("expected a claim"),
    }
    let untouched_before = [
        stores.queue.get(&second.discovery_id).await.unwrap().unwrap(),
        stores.queue.get(&third.discovery_id).await.unwrap().unwrap(),
    ];
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Process restarts.
    let (collab, _) = collaborators(None, Evidence::Complete, RecordingLoader::default(), 0);
    let flow = FlowCoordinator::open(stores.clone(), collab, config, "restart")
        .await
        .unwrap();

    let reclaimed = stores.queue.get(&stale.discovery_id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status(), DiscoveryStatus::Pending);
    assert!(reclaimed.claimed_by.is_none());
    assert!(reclaimed.claimed_at.is_none());
    assert!(flow.snapshot().research_in_progress.is_empty());
    assert_eq!(flow.snapshot().pending_discoveries.len(), 3);

    for before in &untouched_before {
        let after = stores.queue.get(before.id()).await.unwrap().unwrap();
        assert_eq!(&after, before);
    }

    match stores.queue.dequeue_next("fresh-worker").await.unwrap() {
        ClaimOutcome::Claimed(entry) => {
            assert_eq!(entry.id(), stale.discovery_id);
            assert_eq!(entry.claimed_by.as_deref(), Some("fresh-worker"));
        }
        ClaimOutcome::Empty => panic!("reclaimed record should be claimable again"),
    }
}

#[tokio::test]
async fn reclaimed_work_is_curated_without_new_scans() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "liveness_timeout_secs = 0");
    let stores = Stores::open(&config).await.unwrap();

    let orphan = product_discovery("Orphan", "https://shop.example.com/orphan");
    stores.queue.enqueue(&orphan).await.unwrap();
    stores.queue.dequeue_next("crashed-worker").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (collab, harness) = collaborators(None, Evidence::Complete, RecordingLoader::default(), 0);
    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "backlog")
        .await
        .unwrap();
    let report = flow.run_cycle().await.unwrap();

    assert_eq!(report.discovered, 0);
    assert_eq!(report.backlog, 1);
    assert_eq!(report.route, Some(Route::Normal));
    assert_eq!(report.verified, 1);
    assert_eq!(report.loaded, 1);
    assert_eq!(harness.executor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        stores.queue.get(&orphan.discovery_id).await.unwrap().unwrap().status(),
        DiscoveryStatus::Loaded
    );

    // Nothing left: the next cycle idles.
    let next = flow.run_cycle().await.unwrap();
    assert_eq!(next.route, Some(Route::Idle));
    assert_eq!(next.backlog, 0);
}

#[tokio::test]
async fn reset_work_is_curated_alongside_new_finds() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();

    let retried = product_discovery("Retried", "https://shop.example.com/retried")
        .with_priority(Priority::new(1).unwrap());
    stores.queue.enqueue(&retried).await.unwrap();
    stores.queue.dequeue_next("w").await.unwrap();
    stores
        .queue
        .transition(&retried.discovery_id, DiscoveryStatus::Error)
        .await
        .unwrap();
    stores.queue.reset(&retried.discovery_id).await.unwrap();

    let scans = Arc::new(AtomicUsize::new(0));
    let (collab, _) =
        collaborators(Some(catalog(&scans)), Evidence::Complete, RecordingLoader::default(), 0);
    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "mixed")
        .await
        .unwrap();
    let report = flow.run_cycle().await.unwrap();

    assert_eq!(report.discovered, 3);
    assert_eq!(report.backlog, 1);
    assert_eq!(report.verified, 4);
    assert_eq!(report.loaded, 4);
    let status = stores.queue.status().await.unwrap();
    assert_eq!(status.count(DiscoveryStatus::Pending), 0);
    assert_eq!(status.count(DiscoveryStatus::Loaded), 4);
}

#[tokio::test]
async fn operator_reclaim_survives_the_next_stage() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "liveness_timeout_secs = 0");
    let stores = Stores::open(&config).await.unwrap();

    let (collab, _) = collaborators(None, Evidence::Complete, RecordingLoader::default(), 0);
    let mut flow = FlowCoordinator::open(stores.clone(), collab, config.clone(), "operated")
        .await
        .unwrap();

    let discovery = product_discovery("Stuck", "https://shop.example.com/stuck");
    stores.queue.enqueue(&discovery).await.unwrap();
    stores.queue.dequeue_next("crashed-worker").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    gearflow::commands::flow_reclaim(&stores, &config, "operated")
        .await
        .unwrap();
    assert_eq!(flow.step().await.unwrap(), Stage::Scan);

    let id = &discovery.discovery_id;
    assert!(flow.snapshot().pending_discoveries.contains(id));
    assert!(!flow.snapshot().research_in_progress.contains_key(id));

    let stored = stores.snapshots.load("operated").await.unwrap().unwrap();
    assert!(stored.pending_discoveries.contains(id));
    assert_eq!(
        stores.queue.get(id).await.unwrap().unwrap().status(),
        DiscoveryStatus::Pending
    );
}

#[tokio::test]
async fn curation_reports_records_moved_by_an_operator() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();
    let scans = Arc::new(AtomicUsize::new(0));
    let scanner = CatalogScanner::new(
        "one",
        &[("https://shop.example.com/moved", &["Moved"][..])],
        scans.clone(),
    );

    let mut scanners = ScannerRegistry::new();
    scanners.register(Box::new(scanner));
    let collab = Collaborators {
        scanners,
        executor: Arc::new(OverriddenExecutor {
            stores: stores.clone(),
        }),
        loader: Arc::new(RecordingLoader::default()),
        health: Arc::new(FixedHealth { disconnected: 0 }),
    };

    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "moved")
        .await
        .unwrap();
    let report = flow.run_cycle().await.unwrap();

    assert_eq!(report.errored, 0);
    assert_eq!(report.released, 1);
    let id = Discovery::derive_id(KindLabel::Product, "Moved", "https://shop.example.com/moved");
    // The override stands; curation did not force the record into `error`.
    assert_eq!(
        stores.queue.get(&id).await.unwrap().unwrap().status(),
        DiscoveryStatus::Pending
    );
    assert!(flow
        .snapshot()
        .errors
        .iter()
        .any(|e| e.discovery_id.as_deref() == Some(id.as_str())
            && e.message.contains("could not mark error")));
    assert!(!flow.snapshot().research_in_progress.contains_key(&id));
}

#[tokio::test]
async fn rejected_research_loops_back_then_escalates() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "max_research_rounds = 2");
    let stores = Stores::open(&config).await.unwrap();
    let scans = Arc::new(AtomicUsize::new(0));
    let scanner = CatalogScanner::new(
        "one",
        &[("https://shop.example.com/one", &["Sparse"][..])],
        scans.clone(),
    );
    let (collab, harness) =
        collaborators(Some(scanner), Evidence::Thin, RecordingLoader::default(), 0);

    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "reject")
        .await
        .unwrap();
    let report = flow.run_cycle().await.unwrap();

    assert_eq!(report.verified, 0);
    assert_eq!(report.errored, 1);
    assert_eq!(report.loaded, 0);
    assert_eq!(harness.executor.calls.load(Ordering::SeqCst), 2);

    let id = Discovery::derive_id(KindLabel::Product, "Sparse", "https://shop.example.com/one");
    assert_eq!(
        stores.queue.get(&id).await.unwrap().unwrap().status(),
        DiscoveryStatus::Error
    );
    assert_eq!(stores.ledger.retrieve(&id).await.unwrap().len(), 2);

    let errors = &flow.snapshot().errors;
    assert!(errors
        .iter()
        .any(|e| e.discovery_id.as_deref() == Some(id.as_str())
            && e.message.contains("rejected after 2 round(s)")));
    assert!(flow.snapshot().research_in_progress.is_empty());
}

#[tokio::test]
async fn timed_out_research_is_left_for_reclaim() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "task_timeout_secs = 1");
    let stores = Stores::open(&config).await.unwrap();
    let scans = Arc::new(AtomicUsize::new(0));
    let scanner = CatalogScanner::new(
        "one",
        &[("https://shop.example.com/slow", &["Slow"][..])],
        scans.clone(),
    );
    let (collab, _) = collaborators(Some(scanner), Evidence::Hang, RecordingLoader::default(), 0);

    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "slow")
        .await
        .unwrap();
    let report = flow.run_cycle().await.unwrap();

    assert_eq!(report.abandoned, 1);
    assert_eq!(report.verified, 0);
    let id = Discovery::derive_id(KindLabel::Product, "Slow", "https://shop.example.com/slow");
    assert_eq!(
        stores.queue.get(&id).await.unwrap().unwrap().status(),
        DiscoveryStatus::Researching
    );
    assert!(flow.snapshot().research_in_progress.contains_key(&id));
}

#[tokio::test]
async fn load_failures_stay_verified_for_retry() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();
    let scans = Arc::new(AtomicUsize::new(0));
    let loader = RecordingLoader {
        fail: true,
        ..RecordingLoader::default()
    };
    let (collab, _) = collaborators(Some(catalog(&scans)), Evidence::Complete, loader, 0);

    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "noload")
        .await
        .unwrap();
    let report = flow.run_cycle().await.unwrap();

    assert_eq!(report.verified, 3);
    assert_eq!(report.loaded, 0);
    assert_eq!(
        stores.queue.status().await.unwrap().count(DiscoveryStatus::Verified),
        3
    );
    assert_eq!(flow.snapshot().graph_nodes_created, 0);
    assert_eq!(flow.snapshot().graph_updates_pending, 3);
    assert!(flow.snapshot().errors.iter().any(|e| e.stage == Stage::Load));
}

#[tokio::test]
async fn failed_locations_are_retried_next_cycle() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();
    let scans = Arc::new(AtomicUsize::new(0));
    let mut scanner = catalog(&scans);
    scanner.failing = vec!["https://flaky.example.com".to_string()];
    let (collab, _) =
        collaborators(Some(scanner), Evidence::Complete, RecordingLoader::default(), 0);

    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "flaky")
        .await
        .unwrap();
    flow.run_cycle().await.unwrap();

    match stores.registry.check("https://flaky.example.com").await.unwrap() {
        RegistryCheck::Visited(record) => assert_eq!(record.status, ScanStatus::Failed),
        RegistryCheck::New => panic!("failed scan should be recorded"),
    }
    assert!(!flow
        .snapshot()
        .visited_sources
        .contains("https://flaky.example.com/"));
    assert_eq!(scans.load(Ordering::SeqCst), 3);

    flow.run_cycle().await.unwrap();
    // Only the failed location is attempted again.
    assert_eq!(scans.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn unresolved_integrity_issues_raise_a_warning() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();
    let scans = Arc::new(AtomicUsize::new(0));
    let (collab, _) =
        collaborators(Some(catalog(&scans)), Evidence::Complete, RecordingLoader::default(), 4);

    let mut flow = FlowCoordinator::open(stores, collab, config, "orphans")
        .await
        .unwrap();
    let report = flow.run_cycle().await.unwrap();
    assert_eq!(report.health, Some(HealthStatus::Warning));
}

#[tokio::test]
async fn parallelism_changes_are_persisted() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();

    {
        let (collab, _) = collaborators(None, Evidence::Complete, RecordingLoader::default(), 0);
        let mut flow = FlowCoordinator::open(stores.clone(), collab, config.clone(), "tune")
            .await
            .unwrap();
        flow.set_parallelism(Some(1), Some(7)).await.unwrap();
        assert!(flow.set_parallelism(Some(0), None).await.is_err());
    }

    let (collab, _) = collaborators(None, Evidence::Complete, RecordingLoader::default(), 0);
    let flow = FlowCoordinator::open(stores, collab, config, "tune")
        .await
        .unwrap();
    assert_eq!(flow.snapshot().settings.max_parallel_scans, 1);
    assert_eq!(flow.snapshot().settings.max_parallel_research, 7);
}

#[tokio::test]
async fn flows_are_listed_with_their_next_stage() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp, "");
    let stores = Stores::open(&config).await.unwrap();

    let (collab, _) = collaborators(None, Evidence::Complete, RecordingLoader::default(), 0);
    let mut flow = FlowCoordinator::open(stores.clone(), collab, config, "listed")
        .await
        .unwrap();
    flow.step().await.unwrap();

    let flows: HashMap<String, String> = stores
        .snapshots
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|f| (f.flow_id, f.stage))
        .collect();
    assert_eq!(flows.get("listed").map(String::as_str), Some("aggregate"));
}
