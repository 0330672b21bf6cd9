//! Record ingestion pipeline.
//!
//! Turns accepted records into [`Identifier`] rows with insert-or-skip
//! semantics: the first successful ingestion of an identifier wins and
//! later ones are no-ops. Overlapping sessions that race on the same
//! identifier are resolved by the primary key; the loser's unique
//! violation is treated as success.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{Identifier, RawRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new row was written.
    Inserted,
    /// The identifier was already stored; nothing changed.
    Existing,
}

pub struct IngestPipeline {
    pool: SqlitePool,
    service_id: i64,
    /// Set the session harvests, recorded as membership of every record.
    set_spec: Option<String>,
}

impl IngestPipeline {
    pub fn new(pool: SqlitePool, service_id: i64, set_spec: Option<String>) -> Self {
        Self {
            pool,
            service_id,
            set_spec,
        }
    }

    pub fn service_id(&self) -> i64 {
        self.service_id
    }

    /// Build the canonical row for a record. `metadata` is `None` for
    /// deletion tombstones.
    pub fn build_identifier(
        &self,
        record: &RawRecord,
        metadata: Option<Value>,
        harvest_time: DateTime<Utc>,
    ) -> Identifier {
        Identifier {
            id: record.header.identifier.clone(),
            service_id: self.service_id,
            id_time: record.header.datestamp,
            harvest_time,
            metadata,
            deleted: record.header.deleted,
        }
    }

    /// Ingest one record, stamped with the current time.
    pub async fn ingest_record(
        &self,
        record: &RawRecord,
        metadata: Option<Value>,
    ) -> Result<IngestOutcome> {
        let identifier = self.build_identifier(record, metadata, Utc::now());
        let outcome = self.store(&identifier).await?;
        self.record_sets(&identifier.id, &record.header.set_specs)
            .await?;
        Ok(outcome)
    }

    /// Insert `identifier` unless its id is already stored.
    pub async fn store(&self, identifier: &Identifier) -> Result<IngestOutcome> {
        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM identifiers WHERE id = ?")
            .bind(&identifier.id)
            .fetch_optional(&self.pool)
            .await?;

        if existing.is_some() {
            debug!(id = %identifier.id, "identifier exists");
            return Ok(IngestOutcome::Existing);
        }

        self.insert(identifier).await
    }

    async fn insert(&self, identifier: &Identifier) -> Result<IngestOutcome> {
        let metadata_json = identifier
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO identifiers (id, service_id, harvest_time, id_time, metadata_json, deleted)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&identifier.id)
        .bind(identifier.service_id)
        .bind(identifier.harvest_time.timestamp())
        .bind(identifier.id_time.map(|t| t.timestamp()))
        .bind(metadata_json)
        .bind(identifier.deleted)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(id = %identifier.id, deleted = identifier.deleted, "added identifier");
                Ok(IngestOutcome::Inserted)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                warn!(id = %identifier.id, "identifier already exists (concurrent insert)");
                Ok(IngestOutcome::Existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record set membership from the header plus the session's own set.
    async fn record_sets(&self, identifier_id: &str, header_sets: &[String]) -> Result<()> {
        let sets = header_sets
            .iter()
            .map(String::as_str)
            .chain(self.set_spec.as_deref())
            .filter(|s| !s.is_empty());

        for set in sets {
            sqlx::query(
                "INSERT OR IGNORE INTO identifier_sets (identifier_id, set_spec) VALUES (?, ?)",
            )
            .bind(identifier_id)
            .bind(set)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::get::get_identifier;
    use crate::models::RecordHeader;
    use crate::services::ensure_service;
    use crate::testutil::test_pool;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(id: &str) -> RawRecord {
        RawRecord {
            header: RecordHeader {
                identifier: id.to_string(),
                datestamp: Some(Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap()),
                set_specs: vec!["IEDA".to_string()],
                deleted: false,
            },
            metadata: Some("<x/>".to_string()),
        }
    }

    async fn pipeline() -> (tempfile::TempDir, IngestPipeline) {
        let (tmp, pool) = test_pool().await;
        let service = ensure_service(&pool, "doidb", "https://example.org/oai")
            .await
            .unwrap();
        (tmp, IngestPipeline::new(pool, service.id, Some("SESAR".to_string())))
    }

    #[tokio::test]
    async fn second_ingestion_is_a_no_op() {
        let (_tmp, pipeline) = pipeline().await;
        let first_time = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let later_time = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();

        let first = pipeline.build_identifier(&record("A"), Some(json!({"v": 1})), first_time);
        let again = pipeline.build_identifier(&record("A"), Some(json!({"v": 2})), later_time);

        assert_eq!(pipeline.store(&first).await.unwrap(), IngestOutcome::Inserted);
        assert_eq!(pipeline.store(&again).await.unwrap(), IngestOutcome::Existing);

        let stored = get_identifier(&pipeline.pool, "A").await.unwrap().unwrap();
        assert_eq!(stored.harvest_time, first_time);
        assert_eq!(stored.metadata, Some(json!({"v": 1})));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM identifiers")
            .fetch_one(&pipeline.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn unique_violation_on_insert_is_success() {
        let (_tmp, pipeline) = pipeline().await;
        let identifier = pipeline.build_identifier(&record("B"), None, Utc::now());

        assert_eq!(
            pipeline.insert(&identifier).await.unwrap(),
            IngestOutcome::Inserted
        );
        // Skips the existence check, as a racing session would.
        assert_eq!(
            pipeline.insert(&identifier).await.unwrap(),
            IngestOutcome::Existing
        );
    }

    #[tokio::test]
    async fn concurrent_duplicates_store_one_row() {
        let (_tmp, pipeline) = pipeline().await;
        let other = IngestPipeline::new(pipeline.pool.clone(), pipeline.service_id(), None);
        let rec = record("C");

        let (a, b) = tokio::join!(
            pipeline.ingest_record(&rec, Some(json!({}))),
            other.ingest_record(&rec, Some(json!({})))
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == IngestOutcome::Existing);
        assert_eq!(outcomes, vec![IngestOutcome::Inserted, IngestOutcome::Existing]);
    }

    #[tokio::test]
    async fn records_header_and_session_sets() {
        let (_tmp, pipeline) = pipeline().await;
        pipeline.ingest_record(&record("D"), None).await.unwrap();
        // Re-ingesting from another set adds membership but leaves the row alone.
        IngestPipeline::new(pipeline.pool.clone(), pipeline.service_id(), Some("OTHER".into()))
            .ingest_record(&record("D"), None)
            .await
            .unwrap();

        let sets: Vec<String> = sqlx::query_scalar(
            "SELECT set_spec FROM identifier_sets WHERE identifier_id = ? ORDER BY set_spec",
        )
        .bind("D")
        .fetch_all(&pipeline.pool)
        .await
        .unwrap();
        assert_eq!(sets, vec!["IEDA", "OTHER", "SESAR"]);
    }
}
