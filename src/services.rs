//! Harvested repositories (`services`) and the `harvest targets` listing.

use sqlx::{Row, SqlitePool};

use crate::checkpoint;
use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::models::Service;

/// Resolve the service row for an endpoint, creating it on first use.
///
/// The endpoint URL is the key, so targets harvesting different sets of
/// one repository share a service. `name` labels a new row only; the first
/// target to reach an endpoint names it.
pub async fn ensure_service(pool: &SqlitePool, name: &str, url: &str) -> Result<Service> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO services (name, url, created_at) VALUES (?, ?, ?)
        ON CONFLICT(url) DO NOTHING
        "#,
    )
    .bind(name)
    .bind(url)
    .bind(now)
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT id, name, url FROM services WHERE url = ?")
        .bind(url)
        .fetch_one(pool)
        .await?;

    Ok(service_from_row(&row))
}

pub async fn find_service(pool: &SqlitePool, url: &str) -> Result<Option<Service>> {
    let row = sqlx::query("SELECT id, name, url FROM services WHERE url = ?")
        .bind(url)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(service_from_row))
}

fn service_from_row(row: &sqlx::sqlite::SqliteRow) -> Service {
    Service {
        id: row.get("id"),
        name: row.get("name"),
        url: row.get("url"),
    }
}

/// Print every configured target with its stored progress.
pub async fn list_targets(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;

    println!(
        "{:<16} {:<10} {:<12} {:<22} URL",
        "TARGET", "PREFIX", "SET", "CHECKPOINT"
    );

    for (name, target) in &config.targets {
        let ctx = target.context(name)?;
        let checkpoint = match find_service(&pool, &ctx.endpoint).await? {
            Some(service) => {
                checkpoint::latest_identifier_time(&pool, service.id, ctx.set_spec.as_deref())
                    .await?
            }
            None => None,
        };
        println!(
            "{:<16} {:<10} {:<12} {:<22} {}",
            name,
            ctx.metadata_prefix,
            ctx.set_spec.as_deref().unwrap_or("-"),
            checkpoint
                .map(|ts| ts.format("%Y-%m-%dT%H:%M:%SZ").to_string())
                .unwrap_or_else(|| "never".to_string()),
            ctx.endpoint
        );
    }

    if config.targets.is_empty() {
        println!("(no targets configured)");
    }

    pool.close().await;
    Ok(())
}
