//! Collaborator seams for the orchestration flow.
//!
//! The pipeline core never fetches pages, reasons over text, or talks to the
//! knowledge store itself. Those jobs belong to collaborators implementing
//! the traits below; the flow only consumes what they return.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             ScannerRegistry              │
//! │  ┌─────────┐ ┌─────────┐ ┌────────────┐  │
//! │  │ YouTube │ │ Website │ │  Forum ... │  │
//! │  └─────────┘ └─────────┘ └────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼  scan (fan-out) → aggregate (barrier)
//!          Discovery Queue
//!                ▼  curate
//!   ResearchExecutor → Research Ledger
//!                ▼  load
//!             Loader → HealthCheck
//! ```
//!
//! Collaborators report failures through `anyhow::Result`; the flow retries
//! them with back-off and records what still fails in the snapshot's error
//! log.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::models::{Discovery, ResearchSession, ResearchSource, SourceCategory};

// ═══════════════════════════════════════════════════════════════════════
// Scanner Trait
// ═══════════════════════════════════════════════════════════════════════

/// What a scanner found at one location.
#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    pub title: Option<String>,
    pub discoveries: Vec<Discovery>,
}

/// A per-source producer of discoveries.
///
/// # Lifecycle
///
/// 1. The scanner is registered via [`ScannerRegistry::register`].
/// 2. During the scan stage the flow asks for [`candidates`](Scanner::candidates).
/// 3. Each candidate not already in the source registry is passed to
///    [`scan`](Scanner::scan); the returned discoveries are offered to the
///    queue.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Unique producer name; the aggregate barrier waits on each name.
    fn name(&self) -> &str;

    fn category(&self) -> SourceCategory;

    /// Locations this producer would like to scan this cycle.
    async fn candidates(&self) -> Result<Vec<String>>;

    async fn scan(&self, location: &str) -> Result<ScanOutput>;
}

// ═══════════════════════════════════════════════════════════════════════
// Research Executor Trait
// ═══════════════════════════════════════════════════════════════════════

/// Performs research for a claimed discovery.
#[async_trait]
pub trait ResearchExecutor: Send + Sync {
    /// Consult sources for `discovery`. `prior` holds every source already
    /// logged in earlier rounds, so a follow-up round can look elsewhere.
    async fn research(
        &self,
        discovery: &Discovery,
        prior: &[ResearchSource],
    ) -> Result<Vec<ResearchSource>>;

    /// Generate the downstream mutation for a completed, valid session.
    async fn draft_mutation(
        &self,
        discovery: &Discovery,
        session: &ResearchSession,
    ) -> Result<String>;
}

// ═══════════════════════════════════════════════════════════════════════
// Loader Trait
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub discovery_id: String,
    pub research_id: String,
    pub mutation: String,
}

/// Counts reported back by the knowledge store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub nodes_created: u64,
    pub relationships_created: u64,
}

/// Applies validated mutations to the external knowledge store.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn apply(&self, request: &LoadRequest) -> Result<LoadReport>;
}

// ═══════════════════════════════════════════════════════════════════════
// Health Check Trait
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Records in the external store with no relationships.
    pub disconnected_records: u64,
    pub details: Vec<String>,
}

/// Inspects the external store for structural problems after a load.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<IntegrityReport>;

    /// Apply the collaborator's sanctioned auto-repair. Returns the number
    /// of records fixed; the default repairs nothing.
    async fn remediate(&self, _report: &IntegrityReport) -> Result<u64> {
        Ok(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Ordered set of scanners taking part in the scan stage.
pub struct ScannerRegistry {
    scanners: Vec<Box<dyn Scanner>>,
}

impl ScannerRegistry {
    pub fn new() -> Self {
        Self {
            scanners: Vec::new(),
        }
    }

    /// Register a scanner. A scanner whose name is already taken replaces
    /// the earlier one.
    pub fn register(&mut self, scanner: Box<dyn Scanner>) {
        self.scanners.retain(|s| s.name() != scanner.name());
        self.scanners.push(scanner);
    }

    pub fn scanners(&self) -> &[Box<dyn Scanner>] {
        &self.scanners
    }

    pub fn find(&self, name: &str) -> Option<&dyn Scanner> {
        self.scanners
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.scanners.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.scanners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.scanners.len()
    }
}

impl Default for ScannerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Every collaborator the flow needs.
pub struct Collaborators {
    pub scanners: ScannerRegistry,
    pub executor: Arc<dyn ResearchExecutor>,
    pub loader: Arc<dyn Loader>,
    pub health: Arc<dyn HealthCheck>,
}
