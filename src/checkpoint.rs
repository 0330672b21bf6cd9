//! Durable checkpoints.
//!
//! The authoritative "how far did we get" for a service is derived from the
//! stored identifiers themselves: [`latest_identifier_time`] is what seeds
//! the `from` date of the next session. The `checkpoints` table additionally
//! keeps the latest datestamp seen per harvest alias, written after every
//! page, for reporting.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::models::from_unix;

/// Most recent `id_time` stored for a service, optionally restricted to
/// identifiers that belong to `set_spec`.
pub async fn latest_identifier_time(
    pool: &SqlitePool,
    service_id: i64,
    set_spec: Option<&str>,
) -> Result<Option<DateTime<Utc>>> {
    let latest: Option<i64> = match set_spec {
        None => {
            sqlx::query_scalar("SELECT MAX(id_time) FROM identifiers WHERE service_id = ?")
                .bind(service_id)
                .fetch_one(pool)
                .await?
        }
        Some(set) => {
            sqlx::query_scalar(
                r#"
                SELECT MAX(i.id_time)
                FROM identifiers i
                JOIN identifier_sets s ON s.identifier_id = i.id
                WHERE i.service_id = ? AND s.set_spec = ?
                "#,
            )
            .bind(service_id)
            .bind(set)
            .fetch_one(pool)
            .await?
        }
    };

    Ok(latest.and_then(from_unix))
}

pub async fn get_checkpoint(pool: &SqlitePool, alias: &str) -> Result<Option<DateTime<Utc>>> {
    let cursor: Option<i64> = sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE alias = ?")
        .bind(alias)
        .fetch_optional(pool)
        .await?;

    Ok(cursor.and_then(from_unix))
}

/// Record progress for an alias. The stored cursor never moves backwards.
pub async fn set_checkpoint(pool: &SqlitePool, alias: &str, cursor: DateTime<Utc>) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (alias, cursor, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(alias) DO UPDATE SET
            cursor = MAX(cursor, excluded.cursor),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(alias)
    .bind(cursor.timestamp())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// A stored alias checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointRow {
    pub alias: String,
    pub cursor: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub async fn list_checkpoints(pool: &SqlitePool) -> Result<Vec<CheckpointRow>> {
    let rows = sqlx::query("SELECT alias, cursor, updated_at FROM checkpoints ORDER BY alias")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| CheckpointRow {
            alias: row.get("alias"),
            cursor: from_unix(row.get("cursor")),
            updated_at: from_unix(row.get("updated_at")),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestPipeline;
    use crate::models::{RawRecord, RecordHeader};
    use crate::services::ensure_service;
    use crate::testutil::test_pool;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, day, 12, 0, 0).unwrap()
    }

    fn record(id: &str, day: u32, set: &str) -> RawRecord {
        RawRecord {
            header: RecordHeader {
                identifier: id.to_string(),
                datestamp: Some(ts(day)),
                set_specs: vec![set.to_string()],
                deleted: false,
            },
            metadata: Some("<x/>".to_string()),
        }
    }

    #[tokio::test]
    async fn latest_time_is_scoped_to_service_and_set() {
        let (_tmp, pool) = test_pool().await;
        let service = ensure_service(&pool, "doidb", "https://example.org/oai")
            .await
            .unwrap();
        let other = ensure_service(&pool, "other", "https://other.org/oai")
            .await
            .unwrap();

        let pipeline = IngestPipeline::new(pool.clone(), service.id, None);
        for (id, day, set) in [("t1", 1, "A"), ("t3", 3, "A"), ("t2", 2, "A"), ("b9", 9, "B")] {
            pipeline
                .ingest_record(&record(id, day, set), None)
                .await
                .unwrap();
        }
        IngestPipeline::new(pool.clone(), other.id, None)
            .ingest_record(&record("x20", 20, "A"), None)
            .await
            .unwrap();

        assert_eq!(
            latest_identifier_time(&pool, service.id, Some("A")).await.unwrap(),
            Some(ts(3))
        );
        assert_eq!(
            latest_identifier_time(&pool, service.id, None).await.unwrap(),
            Some(ts(9))
        );
        assert_eq!(
            latest_identifier_time(&pool, service.id, Some("C")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn alias_checkpoint_never_moves_backwards() {
        let (_tmp, pool) = test_pool().await;
        assert_eq!(get_checkpoint(&pool, "a").await.unwrap(), None);

        set_checkpoint(&pool, "a", ts(5)).await.unwrap();
        set_checkpoint(&pool, "a", ts(2)).await.unwrap();
        assert_eq!(get_checkpoint(&pool, "a").await.unwrap(), Some(ts(5)));

        set_checkpoint(&pool, "a", ts(7)).await.unwrap();
        assert_eq!(get_checkpoint(&pool, "a").await.unwrap(), Some(ts(7)));

        let rows = list_checkpoints(&pool).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cursor, Some(ts(7)));
    }
}
