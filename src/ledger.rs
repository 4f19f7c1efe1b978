//! Research ledger: an append-only audit log of research steps grouped
//! into sessions, with derived quality scores and a promotion gate.
//!
//! # Scoring
//!
//! Scores are never supplied by callers. `complete` derives them from the
//! full step history of a session:
//!
//! ```text
//! completeness       = |union(fields_found) ∩ required| / |required|
//! overall_confidence = max(step.confidence)   uncertain < reported < corroborated < verified
//! ```
//!
//! Both aggregations are order-independent (set union, max), so steps
//! logged concurrently by several callers always produce the same result.
//!
//! # Append-only
//!
//! Steps are protected by SQLite triggers that abort any `UPDATE` or
//! `DELETE` on `research_steps`. Each step also carries a SHA-256 content
//! hash that [`ResearchLedger::verify_integrity`] recomputes.
//!
//! # Atomicity
//!
//! `log_step` runs in one write transaction and only inserts the step while
//! the session is still `in_progress`. `complete` computes scores from a
//! read and then commits them with a compare-and-swap on the session's
//! status and step count; a step that slips in between forces a recompute.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{PipelineError, Result};
use crate::models::{
    from_millis, CompletionReport, ConfidenceLevel, KindLabel, NewStep, ResearchSession,
    ResearchSource, ResearchStep, SessionStatus, Validation, ValidationIssue,
};

/// Thresholds and required-field sets used to score and gate sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerPolicy {
    pub min_completeness: f64,
    pub acceptable: BTreeSet<ConfidenceLevel>,
    pub required_fields: BTreeMap<KindLabel, BTreeSet<String>>,
}

fn field_set(fields: &[&str]) -> BTreeSet<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        let mut required_fields = BTreeMap::new();
        required_fields.insert(
            KindLabel::Product,
            field_set(&["name", "brand", "weight", "price", "productUrl", "imageUrl", "type"]),
        );
        required_fields.insert(KindLabel::Brand, field_set(&["name", "website", "description"]));
        required_fields.insert(KindLabel::Insight, field_set(&["summary", "relatedProducts"]));
        required_fields.insert(KindLabel::Category, field_set(&["name", "parent"]));

        Self {
            min_completeness: 0.85,
            acceptable: [ConfidenceLevel::Verified, ConfidenceLevel::Corroborated]
                .into_iter()
                .collect(),
            required_fields,
        }
    }
}

impl LedgerPolicy {
    /// Required fields for `kind`. Sessions logged without a kind are
    /// scored as products.
    pub fn required_for(&self, kind: Option<KindLabel>) -> BTreeSet<String> {
        self.required_fields
            .get(&kind.unwrap_or(KindLabel::Product))
            .cloned()
            .unwrap_or_default()
    }

    /// Compare derived scores against the thresholds, itemizing every
    /// failed criterion.
    pub fn judge(&self, completeness: f64, confidence: ConfidenceLevel) -> Validation {
        let mut reasons = Vec::new();
        if completeness < self.min_completeness {
            reasons.push(ValidationIssue::LowCompleteness {
                score: completeness,
                minimum: self.min_completeness,
            });
        }
        if !self.acceptable.contains(&confidence) {
            reasons.push(ValidationIssue::LowConfidence { found: confidence });
        }

        if reasons.is_empty() {
            Validation::Valid {
                completeness,
                confidence,
            }
        } else {
            Validation::Invalid { reasons }
        }
    }
}

/// Scores derived from a set of steps; independent of step order.
#[derive(Debug, Clone, PartialEq)]
pub struct Scores {
    pub completeness: f64,
    pub overall_confidence: ConfidenceLevel,
    pub fields_found: BTreeSet<String>,
    pub missing_fields: BTreeSet<String>,
}

pub fn compute_scores<'a, I>(required: &BTreeSet<String>, sources: I) -> Scores
where
    I: IntoIterator<Item = &'a ResearchSource>,
{
    let mut fields_found = BTreeSet::new();
    let mut overall_confidence = ConfidenceLevel::Uncertain;
    for source in sources {
        fields_found.extend(source.fields_found.iter().map(|f| f.trim().to_string()));
        overall_confidence = overall_confidence.max(source.confidence);
    }

    let missing_fields: BTreeSet<String> =
        required.difference(&fields_found).cloned().collect();
    let completeness = if required.is_empty() {
        1.0
    } else {
        (required.len() - missing_fields.len()) as f64 / required.len() as f64
    };

    Scores {
        completeness,
        overall_confidence,
        fields_found,
        missing_fields,
    }
}

/// SHA-256 over the immutable content of one step.
pub fn step_hash(research_id: &str, discovery_id: &str, source: &ResearchSource) -> String {
    let fields = source.fields_found.join("\u{1f}");
    let accessed = source.accessed_at.timestamp_millis().to_string();

    let mut hasher = Sha256::new();
    for part in [
        research_id,
        discovery_id,
        source.url.as_str(),
        source.authority.as_str(),
        fields.as_str(),
        source.confidence.as_str(),
        accessed.as_str(),
        source.note.as_deref().unwrap_or(""),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// A validated mutation payload waiting to be applied by the loader.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyPayload {
    pub research_id: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub sessions: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub ready_for_load: i64,
    pub steps: i64,
}

const SESSION_COLUMNS: &str = "research_id, discovery_id, kind, researcher, status, started_at, \
     completed_at, completeness, overall_confidence, mutation_payload, ready_for_load";

const STEP_COLUMNS: &str = "step_id, research_id, discovery_id, url, authority, fields_json, \
     confidence, note, accessed_at, content_hash";

#[derive(Debug, Clone)]
pub struct ResearchLedger {
    pool: SqlitePool,
    policy: Arc<LedgerPolicy>,
}

impl ResearchLedger {
    pub fn new(pool: SqlitePool, policy: LedgerPolicy) -> Self {
        Self {
            pool,
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    /// Append one step, creating the session on first use of `research_id`.
    ///
    /// Fails with [`PipelineError::SessionClosed`] once the session is
    /// completed and with [`PipelineError::ResearchMismatch`] if the
    /// research id already belongs to another discovery.
    pub async fn log_step(&self, step: NewStep) -> Result<ResearchStep> {
        let now = Utc::now().timestamp_millis();
        let mut source = step.source;
        // Stored at millisecond precision; hash what will be read back.
        source.accessed_at = from_millis(source.accessed_at.timestamp_millis());
        let fields_json = serde_json::to_string(&source.fields_found)?;
        let content_hash = step_hash(&step.research_id, &step.discovery_id, &source);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO research_sessions
                (research_id, discovery_id, kind, researcher, status, started_at)
            VALUES (?, ?, ?, ?, 'in_progress', ?)
            ON CONFLICT(research_id) DO NOTHING
            "#,
        )
        .bind(&step.research_id)
        .bind(&step.discovery_id)
        .bind(step.kind.map(|k| k.as_str()))
        .bind(&step.researcher)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let step_id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO research_steps
                (research_id, discovery_id, url, authority, fields_json, confidence,
                 note, accessed_at, content_hash)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
            WHERE EXISTS (
                SELECT 1 FROM research_sessions
                WHERE research_id = ?1 AND discovery_id = ?2 AND status = 'in_progress'
            )
            RETURNING step_id
            "#,
        )
        .bind(&step.research_id)
        .bind(&step.discovery_id)
        .bind(&source.url)
        .bind(source.authority.as_str())
        .bind(&fields_json)
        .bind(source.confidence.as_str())
        .bind(&source.note)
        .bind(source.accessed_at.timestamp_millis())
        .bind(&content_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(step_id) = step_id else {
            let owner: Option<(String, String)> = sqlx::query_as(
                "SELECT discovery_id, status FROM research_sessions WHERE research_id = ?",
            )
            .bind(&step.research_id)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;

            return Err(match owner {
                Some((expected, _)) if expected != step.discovery_id => {
                    PipelineError::ResearchMismatch {
                        research_id: step.research_id,
                        expected,
                        found: step.discovery_id,
                    }
                }
                _ => PipelineError::SessionClosed(step.research_id),
            });
        };

        tx.commit().await?;

        tracing::debug!(
            research_id = %step.research_id,
            discovery_id = %step.discovery_id,
            step_id,
            confidence = %source.confidence,
            fields = source.fields_found.len(),
            "research step logged"
        );

        Ok(ResearchStep {
            step_id,
            research_id: step.research_id,
            discovery_id: step.discovery_id,
            source,
            content_hash,
        })
    }

    /// All sessions for a discovery with their steps, newest session first.
    pub async fn retrieve(&self, discovery_id: &str) -> Result<Vec<ResearchSession>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM research_sessions
            WHERE discovery_id = ?
            ORDER BY started_at DESC, rowid DESC
            "#,
            SESSION_COLUMNS
        ))
        .bind(discovery_id)
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut session = session_from_row(row)?;
            session.steps = self.steps(&session.research_id).await?;
            sessions.push(session);
        }
        Ok(sessions)
    }

    /// One session with its steps.
    pub async fn session(&self, research_id: &str) -> Result<Option<ResearchSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM research_sessions WHERE research_id = ?",
            SESSION_COLUMNS
        ))
        .bind(research_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut session = session_from_row(&row)?;
                session.steps = self.steps(research_id).await?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn steps(&self, research_id: &str) -> Result<Vec<ResearchStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM research_steps WHERE research_id = ? ORDER BY step_id",
            STEP_COLUMNS
        ))
        .bind(research_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }

    /// Derive and store completeness and overall confidence, closing the
    /// session. Completing an already completed session returns the stored
    /// report.
    pub async fn complete(&self, research_id: &str) -> Result<CompletionReport> {
        loop {
            let session: Option<(String, Option<String>)> = sqlx::query_as(
                "SELECT status, kind FROM research_sessions WHERE research_id = ?",
            )
            .bind(research_id)
            .fetch_optional(&self.pool)
            .await?;

            // Sessions only exist once a step has been logged.
            let Some((status, kind)) = session else {
                return Err(PipelineError::NoStepsLogged(research_id.to_string()));
            };
            if status.parse::<SessionStatus>()? == SessionStatus::Completed {
                return self.stored_report(research_id).await;
            }

            let steps = self.steps(research_id).await?;
            if steps.is_empty() {
                return Err(PipelineError::NoStepsLogged(research_id.to_string()));
            }

            let kind = kind.map(|k| k.parse::<KindLabel>()).transpose()?;
            let required = self.policy.required_for(kind);
            let scores = compute_scores(&required, steps.iter().map(|s| &s.source));
            let step_count = steps.len() as i64;

            let result = sqlx::query(
                r#"
                UPDATE research_sessions
                SET status = 'completed',
                    completed_at = ?,
                    completeness = ?,
                    overall_confidence = ?,
                    fields_found_json = ?,
                    missing_fields_json = ?,
                    step_count = ?
                WHERE research_id = ?
                  AND status = 'in_progress'
                  AND (SELECT COUNT(*) FROM research_steps WHERE research_id = ?) = ?
                "#,
            )
            .bind(Utc::now().timestamp_millis())
            .bind(scores.completeness)
            .bind(scores.overall_confidence.as_str())
            .bind(serde_json::to_string(&scores.fields_found)?)
            .bind(serde_json::to_string(&scores.missing_fields)?)
            .bind(step_count)
            .bind(research_id)
            .bind(research_id)
            .bind(step_count)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                tracing::info!(
                    research_id,
                    completeness = scores.completeness,
                    confidence = %scores.overall_confidence,
                    steps = step_count,
                    "research session completed"
                );
                return Ok(CompletionReport {
                    research_id: research_id.to_string(),
                    completeness: scores.completeness,
                    overall_confidence: scores.overall_confidence,
                    fields_found: scores.fields_found,
                    missing_fields: scores.missing_fields,
                    step_count,
                });
            }
            // Lost a race with another completer or a late step; re-read.
        }
    }

    async fn stored_report(&self, research_id: &str) -> Result<CompletionReport> {
        let row = sqlx::query(
            r#"
            SELECT completeness, overall_confidence, fields_found_json,
                   missing_fields_json, step_count
            FROM research_sessions WHERE research_id = ?
            "#,
        )
        .bind(research_id)
        .fetch_one(&self.pool)
        .await?;

        let confidence: String = row.get("overall_confidence");
        let found: String = row.get("fields_found_json");
        let missing: String = row.get("missing_fields_json");

        Ok(CompletionReport {
            research_id: research_id.to_string(),
            completeness: row.get("completeness"),
            overall_confidence: confidence.parse()?,
            fields_found: serde_json::from_str(&found)?,
            missing_fields: serde_json::from_str(&missing)?,
            step_count: row.get("step_count"),
        })
    }

    /// Gate a completed session against the policy thresholds.
    pub async fn validate(&self, research_id: &str) -> Result<Validation> {
        let row: Option<(String, Option<f64>, Option<String>)> = sqlx::query_as(
            "SELECT status, completeness, overall_confidence FROM research_sessions WHERE research_id = ?",
        )
        .bind(research_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, completeness, confidence)) = row else {
            return Err(PipelineError::SessionNotFound(research_id.to_string()));
        };

        match (status.parse::<SessionStatus>()?, completeness, confidence) {
            (SessionStatus::Completed, Some(completeness), Some(confidence)) => {
                let validation = self.policy.judge(completeness, confidence.parse()?);
                if !validation.is_valid() {
                    tracing::info!(
                        research_id,
                        reasons = ?validation.reasons(),
                        "research session rejected"
                    );
                }
                Ok(validation)
            }
            _ => Err(PipelineError::NotCompleted(research_id.to_string())),
        }
    }

    /// Store the generated downstream mutation for a valid session and mark
    /// it ready for load. Invalid sessions are left untouched and the
    /// failing validation is returned.
    pub async fn attach_payload(&self, research_id: &str, payload: &str) -> Result<Validation> {
        let validation = self.validate(research_id).await?;
        if !validation.is_valid() {
            return Ok(validation);
        }

        sqlx::query(
            r#"
            UPDATE research_sessions
            SET mutation_payload = ?, ready_for_load = 1
            WHERE research_id = ? AND status = 'completed'
            "#,
        )
        .bind(payload)
        .bind(research_id)
        .execute(&self.pool)
        .await?;

        Ok(validation)
    }

    /// Newest load-ready payload for a discovery, if any.
    pub async fn ready_payload(&self, discovery_id: &str) -> Result<Option<ReadyPayload>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT research_id, mutation_payload FROM research_sessions
            WHERE discovery_id = ? AND ready_for_load = 1 AND mutation_payload IS NOT NULL
            ORDER BY completed_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(discovery_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(research_id, payload)| ReadyPayload {
            research_id,
            payload,
        }))
    }

    /// Session and step totals for the overview.
    pub async fn counts(&self) -> Result<LedgerCounts> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS sessions,
                   COALESCE(SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END), 0) AS in_progress,
                   COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                   COALESCE(SUM(ready_for_load), 0) AS ready
            FROM research_sessions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let steps: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM research_steps")
            .fetch_one(&self.pool)
            .await?;

        Ok(LedgerCounts {
            sessions: row.get("sessions"),
            in_progress: row.get("in_progress"),
            completed: row.get("completed"),
            ready_for_load: row.get("ready"),
            steps,
        })
    }

    /// Recompute every step hash of a session. Returns the ids of steps
    /// whose stored hash no longer matches their content.
    pub async fn verify_integrity(&self, research_id: &str) -> Result<Vec<i64>> {
        let steps = self.steps(research_id).await?;
        if steps.is_empty() {
            let exists: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM research_sessions WHERE research_id = ?",
            )
            .bind(research_id)
            .fetch_one(&self.pool)
            .await?;
            if exists == 0 {
                return Err(PipelineError::SessionNotFound(research_id.to_string()));
            }
        }

        let tampered: Vec<i64> = steps
            .iter()
            .filter(|s| step_hash(&s.research_id, &s.discovery_id, &s.source) != s.content_hash)
            .map(|s| s.step_id)
            .collect();

        if !tampered.is_empty() {
            tracing::error!(research_id, ?tampered, "research step hash mismatch");
        }
        Ok(tampered)
    }
}

fn session_from_row(row: &SqliteRow) -> Result<ResearchSession> {
    let kind: Option<String> = row.get("kind");
    let status: String = row.get("status");
    let completed_at: Option<i64> = row.get("completed_at");
    let confidence: Option<String> = row.get("overall_confidence");
    let ready: i64 = row.get("ready_for_load");

    Ok(ResearchSession {
        research_id: row.get("research_id"),
        discovery_id: row.get("discovery_id"),
        kind: kind.map(|k| k.parse()).transpose()?,
        researcher: row.get("researcher"),
        status: status.parse()?,
        started_at: from_millis(row.get("started_at")),
        completed_at: completed_at.map(from_millis),
        completeness_score: row.get("completeness"),
        overall_confidence: confidence.map(|c| c.parse()).transpose()?,
        mutation_payload: row.get("mutation_payload"),
        ready_for_load: ready != 0,
        steps: Vec::new(),
    })
}

fn step_from_row(row: &SqliteRow) -> Result<ResearchStep> {
    let authority: String = row.get("authority");
    let confidence: String = row.get("confidence");
    let fields: String = row.get("fields_json");

    Ok(ResearchStep {
        step_id: row.get("step_id"),
        research_id: row.get("research_id"),
        discovery_id: row.get("discovery_id"),
        source: ResearchSource {
            url: row.get("url"),
            authority: authority.parse()?,
            fields_found: serde_json::from_str(&fields)?,
            confidence: confidence.parse()?,
            accessed_at: from_millis(row.get("accessed_at")),
            note: row.get("note"),
        },
        content_hash: row.get("content_hash"),
    })
}
