use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ledger::LedgerPolicy;
use crate::models::{ConfidenceLevel, KindLabel};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FlowConfig {
    #[serde(default = "default_max_parallel_scans")]
    pub max_parallel_scans: usize,
    #[serde(default = "default_max_parallel_research")]
    pub max_parallel_research: usize,
    /// Rolling quality average below which the health summary warns.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Aggregated item counts strictly above this take the batch path.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_research_rounds")]
    pub max_research_rounds: u32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_parallel_scans: default_max_parallel_scans(),
            max_parallel_research: default_max_parallel_research(),
            quality_threshold: default_quality_threshold(),
            volume_threshold: default_volume_threshold(),
            batch_size: default_batch_size(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            max_research_rounds: default_max_research_rounds(),
        }
    }
}

impl FlowConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

fn default_max_parallel_scans() -> usize {
    4
}
fn default_max_parallel_research() -> usize {
    3
}
fn default_quality_threshold() -> f64 {
    0.95
}
fn default_volume_threshold() -> usize {
    50
}
fn default_batch_size() -> usize {
    10
}
fn default_liveness_timeout_secs() -> u64 {
    1800
}
fn default_task_timeout_secs() -> u64 {
    120
}
fn default_max_research_rounds() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResearchConfig {
    #[serde(default = "default_min_completeness")]
    pub min_completeness: f64,
    #[serde(default = "default_acceptable_confidence")]
    pub acceptable_confidence: Vec<String>,
    /// Per-kind overrides; kinds not listed keep their built-in field set.
    #[serde(default)]
    pub required_fields: BTreeMap<String, Vec<String>>,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            min_completeness: default_min_completeness(),
            acceptable_confidence: default_acceptable_confidence(),
            required_fields: BTreeMap::new(),
        }
    }
}

fn default_min_completeness() -> f64 {
    0.85
}
fn default_acceptable_confidence() -> Vec<String> {
    vec!["verified".to_string(), "corroborated".to_string()]
}

impl ResearchConfig {
    /// Build the ledger's validation policy from this section.
    pub fn policy(&self) -> Result<LedgerPolicy> {
        let mut policy = LedgerPolicy::default();
        policy.min_completeness = self.min_completeness;

        policy.acceptable = self
            .acceptable_confidence
            .iter()
            .map(|name| {
                name.parse::<ConfidenceLevel>()
                    .with_context(|| format!("research.acceptable_confidence: '{}'", name))
            })
            .collect::<Result<_>>()?;

        for (kind, fields) in &self.required_fields {
            let label: KindLabel = kind
                .parse()
                .with_context(|| format!("research.required_fields: '{}'", kind))?;
            policy.required_fields.insert(label, fields.iter().cloned().collect());
        }

        Ok(policy)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HealthConfig {
    /// Ask the health-check collaborator to repair what it reports.
    #[serde(default)]
    pub auto_remediate: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Longest time a curator can hold one claim: a research call per round
    /// plus the mutation draft, each with every retry timing out.
    pub fn max_claim_hold(&self) -> Duration {
        let calls = self.flow.max_research_rounds.max(1) + 1;
        let per_call = self.flow.task_timeout() * (self.retry.max_retries + 1)
            + crate::retry::worst_case_backoff(&self.retry);
        per_call * calls
    }

    pub fn validate(&self) -> Result<()> {
        // Validate flow
        if self.flow.max_parallel_scans == 0 {
            anyhow::bail!("flow.max_parallel_scans must be >= 1");
        }
        if self.flow.max_parallel_research == 0 {
            anyhow::bail!("flow.max_parallel_research must be >= 1");
        }
        if self.flow.batch_size == 0 {
            anyhow::bail!("flow.batch_size must be >= 1");
        }
        if self.flow.max_research_rounds == 0 {
            anyhow::bail!("flow.max_research_rounds must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.flow.quality_threshold) {
            anyhow::bail!("flow.quality_threshold must be in [0.0, 1.0]");
        }
        // A shorter timeout would hand a live claim to a second worker.
        let hold = self.max_claim_hold();
        if self.flow.liveness_timeout() <= hold {
            anyhow::bail!(
                "flow.liveness_timeout_secs ({}) must exceed the longest claim a curator can hold ({}s)",
                self.flow.liveness_timeout_secs,
                hold.as_secs_f64().ceil()
            );
        }

        // Validate research
        if !(0.0..=1.0).contains(&self.research.min_completeness) {
            anyhow::bail!("research.min_completeness must be in [0.0, 1.0]");
        }
        if self.research.acceptable_confidence.is_empty() {
            anyhow::bail!("research.acceptable_confidence must name at least one level");
        }
        for (kind, fields) in &self.research.required_fields {
            if fields.is_empty() {
                anyhow::bail!("research.required_fields.{} must not be empty", kind);
            }
        }
        self.research.policy()?;

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
