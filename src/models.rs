//! Core data models used throughout gearflow.
//!
//! These types represent the sources, discoveries, and research records
//! that flow through the registry → queue → ledger → loader pipeline, plus
//! the explicit sentinel outcomes the stores return for expected
//! steady-state situations (duplicate admission, empty queue, unknown id).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// stored form is a fixed lowercase string.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = PipelineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(PipelineError::InvalidValue(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// ═══════════════════════════════════════════════════════════════════════
// Sources
// ═══════════════════════════════════════════════════════════════════════

/// Kind of external source a producer scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceCategory {
    Youtube,
    Website,
    Blog,
    Reddit,
    Forum,
    Other,
}

string_enum!(SourceCategory {
    Youtube => "youtube",
    Website => "website",
    Blog => "blog",
    Reddit => "reddit",
    Forum => "forum",
    Other => "other",
});

/// Outcome of the most recent scan of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Completed,
    Failed,
}

string_enum!(ScanStatus {
    Completed => "completed",
    Failed => "failed",
});

/// Permanent dedup memory for one normalized source location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRecord {
    pub location: String,
    pub category: Option<SourceCategory>,
    pub first_seen: DateTime<Utc>,
    pub last_scanned: DateTime<Utc>,
    pub items_discovered: i64,
    pub scan_count: i64,
    pub status: ScanStatus,
}

/// Answer to "has this location been seen before?".
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryCheck {
    New,
    Visited(SourceRecord),
}

impl RegistryCheck {
    pub fn is_new(&self) -> bool {
        matches!(self, RegistryCheck::New)
    }
}

/// Per-category aggregate inside [`RegistryStats`]. `category` is `None`
/// for sources recorded without a category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStats {
    pub category: Option<SourceCategory>,
    pub sources: i64,
    pub items: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total_sources: i64,
    pub total_items: i64,
    pub by_category: Vec<CategoryStats>,
}

/// Normalize a source locator so equivalent spellings share one registry row.
///
/// For `http`/`https` URLs the scheme and host are lower-cased, the fragment
/// is dropped and a trailing slash on a non-root path is trimmed. Anything
/// else (opaque resource identifiers) is only trimmed.
pub fn normalize_location(raw: &str) -> String {
    let trimmed = raw.trim();
    match url::Url::parse(trimmed) {
        Ok(mut parsed) if matches!(parsed.scheme(), "http" | "https") => {
            parsed.set_fragment(None);
            let path = parsed.path().to_string();
            if path.len() > 1 && path.ends_with('/') {
                parsed.set_path(path.trim_end_matches('/'));
            }
            parsed.to_string()
        }
        _ => trimmed.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Discoveries
// ═══════════════════════════════════════════════════════════════════════

/// Discriminant of [`DiscoveryKind`], used for grouping and policy lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindLabel {
    Brand,
    Product,
    Insight,
    Category,
}

string_enum!(KindLabel {
    Brand => "brand",
    Product => "product",
    Insight => "insight",
    Category => "category",
});

/// Kind-specific payload of a discovery. Fields are only reachable after
/// matching on the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryKind {
    Brand {
        #[serde(default)]
        website: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Product {
        brand: String,
        #[serde(default)]
        product_family: Option<String>,
        #[serde(default)]
        estimated_price: Option<String>,
        #[serde(default)]
        estimated_weight: Option<String>,
    },
    Insight {
        summary: String,
        #[serde(default)]
        related_products: Vec<String>,
    },
    Category {
        #[serde(default)]
        parent: Option<String>,
    },
}

impl DiscoveryKind {
    pub fn label(&self) -> KindLabel {
        match self {
            DiscoveryKind::Brand { .. } => KindLabel::Brand,
            DiscoveryKind::Product { .. } => KindLabel::Product,
            DiscoveryKind::Insight { .. } => KindLabel::Insight,
            DiscoveryKind::Category { .. } => KindLabel::Category,
        }
    }

    pub fn product(brand: impl Into<String>) -> Self {
        DiscoveryKind::Product {
            brand: brand.into(),
            product_family: None,
            estimated_price: None,
            estimated_weight: None,
        }
    }

    pub fn brand() -> Self {
        DiscoveryKind::Brand {
            website: None,
            description: None,
        }
    }
}

/// Verification priority, 1 (lowest) to 10 (highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(10);

    pub fn new(value: u8) -> Result<Self, PipelineError> {
        if (1..=10).contains(&value) {
            Ok(Priority(value))
        } else {
            Err(PipelineError::InvalidValue(format!(
                "priority must be within 1..=10, got {}",
                value
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(5)
    }
}

impl TryFrom<u8> for Priority {
    type Error = PipelineError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

/// Where a discovery was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySource {
    pub url: String,
    pub category: SourceCategory,
    #[serde(default)]
    pub title: Option<String>,
}

/// Lifecycle of a queued discovery.
///
/// ```text
/// pending → researching → verified → loaded
///               │   ▲
///               ▼   │ (reclaim)
///             error ─┘→ pending (operator reset)
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStatus {
    #[default]
    Pending,
    Researching,
    Verified,
    Loaded,
    Error,
}

string_enum!(DiscoveryStatus {
    Pending => "pending",
    Researching => "researching",
    Verified => "verified",
    Loaded => "loaded",
    Error => "error",
});

impl DiscoveryStatus {
    /// Statuses from which `to` may be entered under the validated table.
    pub fn predecessors(to: DiscoveryStatus) -> &'static [DiscoveryStatus] {
        use DiscoveryStatus::*;
        match to {
            Pending => &[Researching, Error],
            Researching => &[Pending],
            Verified => &[Researching],
            Loaded => &[Verified],
            Error => &[Researching],
        }
    }

    pub fn can_transition_to(self, to: DiscoveryStatus) -> bool {
        DiscoveryStatus::predecessors(to).contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DiscoveryStatus::Loaded | DiscoveryStatus::Error)
    }
}

fn default_confidence() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

/// A candidate fact found by a producer, awaiting verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub discovery_id: String,
    pub kind: DiscoveryKind,
    pub name: String,
    #[serde(default)]
    pub context: String,
    /// Opaque collaborator-specific extras.
    #[serde(default)]
    pub partial_data: serde_json::Map<String, serde_json::Value>,
    pub source: DiscoverySource,
    pub discovered_by: String,
    #[serde(default = "Utc::now")]
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub status: DiscoveryStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_true")]
    pub needs_research: bool,
}

impl Discovery {
    pub fn new(
        discovery_id: impl Into<String>,
        kind: DiscoveryKind,
        name: impl Into<String>,
        source: DiscoverySource,
        discovered_by: impl Into<String>,
    ) -> Self {
        Self {
            discovery_id: discovery_id.into(),
            kind,
            name: name.into(),
            context: String::new(),
            partial_data: serde_json::Map::new(),
            source,
            discovered_by: discovered_by.into(),
            discovered_at: Utc::now(),
            status: DiscoveryStatus::Pending,
            priority: Priority::default(),
            confidence: default_confidence(),
            needs_research: true,
        }
    }

    /// Stable id for a (kind, name, source) triple.
    ///
    /// Producers that re-emit the same finding after a restart produce the
    /// same id, so the queue reports a duplicate instead of admitting twice.
    pub fn derive_id(kind: KindLabel, name: &str, source_url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(name.trim().to_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_location(source_url).as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        format!("{}-{}", kind.as_str(), &digest[..16])
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn label(&self) -> KindLabel {
        self.kind.label()
    }

    /// Check the envelope invariants before admission.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.discovery_id.trim().is_empty() {
            return Err(PipelineError::InvalidDiscovery(
                "discovery_id must not be empty".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidDiscovery(format!(
                "{}: name must not be empty",
                self.discovery_id
            )));
        }
        if self.source.url.trim().is_empty() {
            return Err(PipelineError::InvalidDiscovery(format!(
                "{}: source url must not be empty",
                self.discovery_id
            )));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(PipelineError::InvalidDiscovery(format!(
                "{}: confidence must be within [0.0, 1.0], got {}",
                self.discovery_id, self.confidence
            )));
        }
        match &self.kind {
            DiscoveryKind::Product { brand, .. } if brand.trim().is_empty() => {
                Err(PipelineError::InvalidDiscovery(format!(
                    "{}: product discoveries need a brand",
                    self.discovery_id
                )))
            }
            DiscoveryKind::Insight { summary, .. } if summary.trim().is_empty() => {
                Err(PipelineError::InvalidDiscovery(format!(
                    "{}: insight discoveries need a summary",
                    self.discovery_id
                )))
            }
            _ => Ok(()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Queue results
// ═══════════════════════════════════════════════════════════════════════

/// A discovery as held by the queue, with its claim metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub discovery: Discovery,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn id(&self) -> &str {
        &self.discovery.discovery_id
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.discovery.status
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Accepted,
    /// A record with this id already exists; it was left untouched.
    Duplicate { existing: DiscoveryStatus },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(QueueEntry),
    Empty,
}

impl ClaimOutcome {
    pub fn into_entry(self) -> Option<QueueEntry> {
        match self {
            ClaimOutcome::Claimed(entry) => Some(entry),
            ClaimOutcome::Empty => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Updated,
    NotFound,
    /// Only returned by the validated transition path.
    InvalidTransition {
        from: DiscoveryStatus,
        to: DiscoveryStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusCount {
    pub count: i64,
    pub avg_priority: f64,
}

/// Queue depth grouped by status and by discovery kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStatus {
    pub by_status: BTreeMap<DiscoveryStatus, StatusCount>,
    pub by_kind: BTreeMap<KindLabel, i64>,
    pub pending_by_kind: BTreeMap<KindLabel, i64>,
}

impl QueueStatus {
    pub fn count(&self, status: DiscoveryStatus) -> i64 {
        self.by_status.get(&status).map(|c| c.count).unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.by_status.values().map(|c| c.count).sum()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Research
// ═══════════════════════════════════════════════════════════════════════

/// Authority of a consulted research source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityCategory {
    Manufacturer,
    Retailer,
    ReviewSite,
    Blog,
    Forum,
    Other,
}

string_enum!(AuthorityCategory {
    Manufacturer => "manufacturer",
    Retailer => "retailer",
    ReviewSite => "review_site",
    Blog => "blog",
    Forum => "forum",
    Other => "other",
});

/// Evidentiary strength, ordered `uncertain < reported < corroborated < verified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Uncertain,
    Reported,
    Corroborated,
    Verified,
}

string_enum!(ConfidenceLevel {
    Uncertain => "uncertain",
    Reported => "reported",
    Corroborated => "corroborated",
    Verified => "verified",
});

/// One consulted source within a research session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSource {
    pub url: String,
    pub authority: AuthorityCategory,
    #[serde(default)]
    pub fields_found: Vec<String>,
    pub confidence: ConfidenceLevel,
    #[serde(default = "Utc::now")]
    pub accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
}

impl ResearchSource {
    pub fn new<I, S>(
        url: impl Into<String>,
        authority: AuthorityCategory,
        fields_found: I,
        confidence: ConfidenceLevel,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            url: url.into(),
            authority,
            fields_found: fields_found.into_iter().map(Into::into).collect(),
            confidence,
            accessed_at: Utc::now(),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Request to append one step to a research session.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub research_id: String,
    pub discovery_id: String,
    /// Selects the required-field set; recorded on the session's first step.
    pub kind: Option<KindLabel>,
    pub researcher: Option<String>,
    pub source: ResearchSource,
}

/// An immutable, logged research step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResearchStep {
    pub step_id: i64,
    pub research_id: String,
    pub discovery_id: String,
    pub source: ResearchSource,
    pub content_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
}

string_enum!(SessionStatus {
    InProgress => "in_progress",
    Completed => "completed",
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResearchSession {
    pub research_id: String,
    pub discovery_id: String,
    pub kind: Option<KindLabel>,
    pub researcher: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completeness_score: Option<f64>,
    pub overall_confidence: Option<ConfidenceLevel>,
    pub mutation_payload: Option<String>,
    pub ready_for_load: bool,
    pub steps: Vec<ResearchStep>,
}

/// Derived scores computed when a session is completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionReport {
    pub research_id: String,
    pub completeness: f64,
    pub overall_confidence: ConfidenceLevel,
    pub fields_found: BTreeSet<String>,
    pub missing_fields: BTreeSet<String>,
    pub step_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ValidationIssue {
    LowCompleteness { score: f64, minimum: f64 },
    LowConfidence { found: ConfidenceLevel },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::LowCompleteness { score, minimum } => write!(
                f,
                "low completeness ({:.1}% < {:.1}%)",
                score * 100.0,
                minimum * 100.0
            ),
            ValidationIssue::LowConfidence { found } => {
                write!(f, "low confidence ({})", found)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Validation {
    Valid {
        completeness: f64,
        confidence: ConfidenceLevel,
    },
    Invalid {
        reasons: Vec<ValidationIssue>,
    },
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid { .. })
    }

    pub fn reasons(&self) -> &[ValidationIssue] {
        match self {
            Validation::Valid { .. } => &[],
            Validation::Invalid { reasons } => reasons,
        }
    }
}

/// Convert a stored millisecond timestamp back into a `DateTime`.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
