//! Database statistics.
//!
//! Summarises what has been harvested: identifier counts per service,
//! tombstones, the newest stored datestamp and the per-alias checkpoints.
//! Used by `harvest stats`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::checkpoint::list_checkpoints;
use crate::config::Config;
use crate::db;
use crate::models::from_unix;

/// Per-service breakdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    pub service: String,
    pub identifiers: i64,
    pub deleted: i64,
    pub latest_id_time: Option<i64>,
    pub last_harvest_ts: Option<i64>,
}

pub async fn service_stats(pool: &SqlitePool) -> Result<Vec<ServiceStats>> {
    let rows = sqlx::query(
        r#"
        SELECT
            s.name AS service,
            COUNT(i.id) AS identifiers,
            COALESCE(SUM(i.deleted), 0) AS deleted,
            MAX(i.id_time) AS latest_id_time,
            MAX(i.harvest_time) AS last_harvest_ts
        FROM services s
        LEFT JOIN identifiers i ON i.service_id = s.id
        GROUP BY s.id
        ORDER BY identifiers DESC, s.name
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ServiceStats {
            service: row.get("service"),
            identifiers: row.get("identifiers"),
            deleted: row.get("deleted"),
            latest_id_time: row.get("latest_id_time"),
            last_harvest_ts: row.get("last_harvest_ts"),
        })
        .collect())
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM identifiers")
        .fetch_one(&pool)
        .await?;
    let stats = service_stats(&pool).await?;
    let checkpoints = list_checkpoints(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("OAI Harvest: Database Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", human_size(db_size));
    println!();
    println!("  Identifiers: {}", total);

    if !stats.is_empty() {
        println!();
        println!("  By service:");
        println!(
            "  {:<20} {:>8} {:>8}   {:<20} {}",
            "SERVICE", "IDS", "DELETED", "LATEST DATESTAMP", "LAST HARVEST"
        );
        println!("  {}", "-".repeat(76));

        for s in &stats {
            println!(
                "  {:<20} {:>8} {:>8}   {:<20} {}",
                s.service,
                s.identifiers,
                s.deleted,
                s.latest_id_time
                    .map(format_ts_iso)
                    .unwrap_or_else(|| "-".to_string()),
                s.last_harvest_ts
                    .map(format_ts_iso)
                    .unwrap_or_else(|| "never".to_string())
            );
        }
    }

    if !checkpoints.is_empty() {
        println!();
        println!("  Checkpoints:");
        for cp in &checkpoints {
            println!(
                "  {:<56} {}",
                cp.alias,
                cp.cursor
                    .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

fn format_ts_iso(ts: i64) -> String {
    from_unix(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
