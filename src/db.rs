use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;
use crate::ledger::ResearchLedger;
use crate::migrate;
use crate::queue::DiscoveryQueue;
use crate::registry::SourceRegistry;
use crate::snapshot::SnapshotStore;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Concurrent claimers serialize on SQLite's write lock; wait rather than fail.
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// The four durable stores sharing one pool.
#[derive(Clone)]
pub struct Stores {
    pub registry: SourceRegistry,
    pub queue: DiscoveryQueue,
    pub ledger: ResearchLedger,
    pub snapshots: SnapshotStore,
}

impl Stores {
    /// Connect, apply migrations, and build every store from `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = connect(config).await?;
        migrate::run_migrations(&pool).await?;
        let policy = config.research.policy()?;

        Ok(Self {
            registry: SourceRegistry::new(pool.clone()),
            queue: DiscoveryQueue::new(pool.clone()),
            ledger: ResearchLedger::new(pool.clone(), policy),
            snapshots: SnapshotStore::new(pool),
        })
    }
}
