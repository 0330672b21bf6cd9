//! Identifier retrieval by id.
//!
//! Used by the `harvest get` command and by tests that inspect what the
//! ingestion pipeline stored.

use anyhow::bail;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::{HarvestError, Result};
use crate::models::{from_unix, Identifier};

pub async fn get_identifier(pool: &SqlitePool, id: &str) -> Result<Option<Identifier>> {
    let row = sqlx::query(
        "SELECT id, service_id, harvest_time, id_time, metadata_json, deleted FROM identifiers WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let harvest_time: i64 = row.get("harvest_time");
    let id_time: Option<i64> = row.get("id_time");
    let metadata_json: Option<String> = row.get("metadata_json");

    let metadata = metadata_json
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(Some(Identifier {
        id: row.get("id"),
        service_id: row.get("service_id"),
        id_time: id_time.and_then(from_unix),
        harvest_time: from_unix(harvest_time).ok_or_else(|| {
            HarvestError::parse(id, format!("stored harvest_time out of range: {}", harvest_time))
        })?,
        metadata,
        deleted: row.get("deleted"),
    }))
}

/// `harvest get` output shape.
#[derive(Debug, Serialize)]
struct IdentifierResponse {
    id: String,
    service: Option<String>,
    id_time: Option<String>,
    harvest_time: String,
    deleted: bool,
    sets: Vec<String>,
    metadata: Option<serde_json::Value>,
}

/// CLI entry point. Prints the stored identifier as JSON.
pub async fn run_get(config: &Config, id: &str) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;

    let identifier = match get_identifier(&pool, id).await? {
        Some(identifier) => identifier,
        None => {
            pool.close().await;
            bail!("identifier not found: {}", id);
        }
    };

    let service: Option<String> = sqlx::query_scalar("SELECT name FROM services WHERE id = ?")
        .bind(identifier.service_id)
        .fetch_optional(&pool)
        .await?;

    let sets: Vec<String> = sqlx::query_scalar(
        "SELECT set_spec FROM identifier_sets WHERE identifier_id = ? ORDER BY set_spec",
    )
    .bind(id)
    .fetch_all(&pool)
    .await?;

    pool.close().await;

    let response = IdentifierResponse {
        id: identifier.id,
        service,
        id_time: identifier.id_time.map(format_ts_iso),
        harvest_time: format_ts_iso(identifier.harvest_time),
        deleted: identifier.deleted,
        sets,
        metadata: identifier.metadata,
    };
    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(())
}

fn format_ts_iso(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
