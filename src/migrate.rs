use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Source registry: permanent dedup memory keyed by normalized location
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS visited_sources (
            location TEXT PRIMARY KEY,
            category TEXT,
            first_seen INTEGER NOT NULL,
            last_scanned INTEGER NOT NULL,
            items_discovered INTEGER NOT NULL DEFAULT 0,
            scan_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Discovery queue. `seq` gives strict FIFO inside a priority band.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS discovery_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            discovery_id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            priority INTEGER NOT NULL,
            payload_json TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            claimed_at INTEGER,
            claimed_by TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Research sessions; derived columns are filled in by `complete`
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS research_sessions (
            research_id TEXT PRIMARY KEY,
            discovery_id TEXT NOT NULL,
            kind TEXT,
            researcher TEXT,
            status TEXT NOT NULL DEFAULT 'in_progress',
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            completeness REAL,
            overall_confidence TEXT,
            fields_found_json TEXT,
            missing_fields_json TEXT,
            step_count INTEGER,
            mutation_payload TEXT,
            ready_for_load INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS research_steps (
            step_id INTEGER PRIMARY KEY AUTOINCREMENT,
            research_id TEXT NOT NULL,
            discovery_id TEXT NOT NULL,
            url TEXT NOT NULL,
            authority TEXT NOT NULL,
            fields_json TEXT NOT NULL,
            confidence TEXT NOT NULL,
            note TEXT,
            accessed_at INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            FOREIGN KEY (research_id) REFERENCES research_sessions(research_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Steps are an audit trail: refuse edits and removals at the storage layer
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS research_steps_no_update
        BEFORE UPDATE ON research_steps
        BEGIN
            SELECT RAISE(ABORT, 'research steps are append-only');
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS research_steps_no_delete
        BEFORE DELETE ON research_steps
        BEGIN
            SELECT RAISE(ABORT, 'research steps are append-only');
        END
        "#,
    )
    .execute(pool)
    .await?;

    // Flow state snapshots, one flat versioned record per flow id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS flow_snapshots (
            flow_id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            stage TEXT NOT NULL,
            state_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_claim ON discovery_queue(status, priority DESC, seq)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_kind ON discovery_queue(kind, status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sources_last_scanned ON visited_sources(last_scanned DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sessions_discovery ON research_sessions(discovery_id, started_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_steps_research ON research_steps(research_id, step_id)")
        .execute(pool)
        .await?;

    Ok(())
}
