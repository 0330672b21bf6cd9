use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per harvested repository, keyed by endpoint URL
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS services (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            url TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Ingested records; the primary key is the idempotence guard
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS identifiers (
            id TEXT PRIMARY KEY,
            service_id INTEGER NOT NULL,
            harvest_time INTEGER NOT NULL,
            id_time INTEGER,
            metadata_json TEXT,
            deleted INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (service_id) REFERENCES services(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS identifier_sets (
            identifier_id TEXT NOT NULL,
            set_spec TEXT NOT NULL,
            PRIMARY KEY (identifier_id, set_spec),
            FOREIGN KEY (identifier_id) REFERENCES identifiers(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-alias progress of the most recent sessions
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            alias TEXT PRIMARY KEY,
            cursor INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_identifiers_service_time ON identifiers(service_id, id_time DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_identifier_sets_set ON identifier_sets(set_spec)")
        .execute(pool)
        .await?;

    Ok(())
}
