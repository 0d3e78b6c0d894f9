use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite, SqliteConnection};

use crate::opportunity::{RawDocument, TagRecord};
use crate::{Error, Result};

const INIT_SQL: &str = r"
CREATE TABLE IF NOT EXISTS opportunities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    business_id TEXT,
    body TEXT NOT NULL,
    tags TEXT
);

CREATE INDEX IF NOT EXISTS idx_opportunities_business ON opportunities(business_id);
";

/// How tag records are written back to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistMode {
    /// Update the matching document in place. Documents without a match are
    /// skipped, never inserted.
    Merge,
    /// Insert every tag record as a new document, duplicates included.
    Append,
}

impl PersistMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Append => "append",
        }
    }
}

impl std::fmt::Display for PersistMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PersistMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "merge" => Ok(Self::Merge),
            "append" => Ok(Self::Append),
            _ => Err(crate::Error::InvalidPersistMode(s.to_string())),
        }
    }
}

/// Per-record outcome of one write call.
#[derive(Debug, Default)]
pub struct WriteReport {
    pub written: usize,
    /// Business ids that matched no stored document (merge mode only).
    pub missed: Vec<String>,
    /// Records whose individual write failed, with the error.
    pub failed: Vec<(String, Error)>,
}

impl WriteReport {
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.written + self.missed.len() + self.failed.len()
    }

    pub fn absorb(&mut self, other: Self) {
        self.written += other.written;
        self.missed.extend(other.missed);
        self.failed.extend(other.failed);
    }
}

/// Read and write access to the opportunity store.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Every document in the store, in stored order.
    async fn load_all(&self) -> Result<Vec<RawDocument>>;

    /// Write tag records back. Record failures are isolated in the report;
    /// only failing to reach the store at all aborts the call.
    async fn apply_tags(&self, tags: &[TagRecord], mode: PersistMode) -> Result<WriteReport>;
}

/// A stored document with its tag payload, as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub id: i64,
    pub business_id: Option<String>,
    pub body: String,
    pub tags: Option<String>,
}

pub struct SqlStore {
    pool: Pool<Sqlite>,
}

impl SqlStore {
    pub async fn open(path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{path}?mode=rwc"))
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Insert one raw document and return its row id.
    pub async fn insert_document(&self, business_id: Option<&str>, body: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO opportunities (business_id, body) VALUES (?, ?)")
            .bind(business_id)
            .bind(body)
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    /// Fetch the first document carrying this business id.
    pub async fn document(&self, business_id: &str) -> Result<Option<StoredDocument>> {
        let row: Option<(i64, Option<String>, String, Option<String>)> = sqlx::query_as(
            "SELECT id, business_id, body, tags FROM opportunities WHERE business_id = ? ORDER BY id LIMIT 1",
        )
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, business_id, body, tags)| StoredDocument {
            id,
            business_id,
            body,
            tags,
        }))
    }

    pub async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM opportunities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.unsigned_abs())
    }

    pub async fn tagged_count(&self) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM opportunities WHERE tags IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.unsigned_abs())
    }

    async fn merge_tag(conn: &mut SqliteConnection, tag: &TagRecord) -> Result<bool> {
        let tags_json = serde_json::to_string(tag)?;
        let result = sqlx::query("UPDATE opportunities SET tags = ? WHERE business_id = ?")
            .bind(tags_json)
            .bind(&tag.business_id)
            .execute(conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_tag(conn: &mut SqliteConnection, tag: &TagRecord) -> Result<bool> {
        let body = serde_json::to_string(tag)?;
        sqlx::query("INSERT INTO opportunities (business_id, body, tags) VALUES (?, ?, ?)")
            .bind(&tag.business_id)
            .bind(&body)
            .bind(&body)
            .execute(conn)
            .await?;

        Ok(true)
    }
}

#[async_trait]
impl OpportunityStore for SqlStore {
    async fn load_all(&self) -> Result<Vec<RawDocument>> {
        let rows: Vec<(i64, Option<String>, String)> =
            sqlx::query_as("SELECT id, business_id, body FROM opportunities ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, business_id, body)| RawDocument::new(id, business_id, body))
            .collect())
    }

    async fn apply_tags(&self, tags: &[TagRecord], mode: PersistMode) -> Result<WriteReport> {
        // One checkout for the whole call: failing to reach the store aborts
        // before any record is written. The connection goes back to the pool
        // on every exit path when the guard drops.
        let mut conn = self.pool.acquire().await?;
        let mut report = WriteReport::default();

        for tag in tags {
            let outcome = match mode {
                PersistMode::Merge => Self::merge_tag(&mut conn, tag).await,
                PersistMode::Append => Self::append_tag(&mut conn, tag).await,
            };
            match outcome {
                Ok(true) => report.written += 1,
                Ok(false) => {
                    tracing::debug!(business_id = %tag.business_id, "no matching document, skipping");
                    report.missed.push(tag.business_id.clone());
                }
                Err(err) => {
                    tracing::warn!(business_id = %tag.business_id, error = %err, "tag write failed");
                    report.failed.push((tag.business_id.clone(), err));
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_store(ids: &[&str]) -> SqlStore {
        let store = SqlStore::open_memory().await.unwrap();
        for id in ids {
            store
                .insert_document(Some(id), &format!("{{'id': '{id}'}}"))
                .await
                .unwrap();
        }
        store
    }

    fn tag(id: &str) -> TagRecord {
        TagRecord::new(id).with_research_type("Non-Clinical")
    }

    #[tokio::test]
    async fn merge_updates_matching_documents_in_place() {
        let store = seeded_store(&["GRANT-1", "GRANT-2"]).await;

        let report = store
            .apply_tags(&[tag("GRANT-1"), tag("GRANT-2")], PersistMode::Merge)
            .await
            .unwrap();

        assert_eq!(report.written, 2);
        assert!(report.missed.is_empty());
        assert_eq!(store.count().await.unwrap(), 2);

        let doc = store.document("GRANT-1").await.unwrap().unwrap();
        assert!(doc.tags.unwrap().contains("Non-Clinical"));
        assert_eq!(doc.body, "{'id': 'GRANT-1'}");
    }

    #[tokio::test]
    async fn merge_is_idempotent() {
        let store = seeded_store(&["GRANT-1"]).await;

        store
            .apply_tags(&[tag("GRANT-1")], PersistMode::Merge)
            .await
            .unwrap();
        let first = store.document("GRANT-1").await.unwrap().unwrap();

        store
            .apply_tags(&[tag("GRANT-1")], PersistMode::Merge)
            .await
            .unwrap();
        let second = store.document("GRANT-1").await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn merge_never_inserts_on_miss() {
        let store = seeded_store(&["GRANT-1"]).await;

        let report = store
            .apply_tags(&[tag("GRANT-1"), tag("GRANT-404")], PersistMode::Merge)
            .await
            .unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(report.missed, vec!["GRANT-404".to_string()]);
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.document("GRANT-404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_inserts_every_record() {
        let store = seeded_store(&[]).await;

        let report = store
            .apply_tags(&[tag("GRANT-1"), tag("GRANT-2")], PersistMode::Append)
            .await
            .unwrap();

        assert_eq!(report.written, 2);
        assert_eq!(store.count().await.unwrap(), 2);

        let doc = store.document("GRANT-1").await.unwrap().unwrap();
        assert!(doc.body.contains("researchTypeTags"));
    }

    #[tokio::test]
    async fn append_duplicates_rather_than_dedupes() {
        let store = seeded_store(&[]).await;

        store
            .apply_tags(&[tag("GRANT-1")], PersistMode::Append)
            .await
            .unwrap();
        store
            .apply_tags(&[tag("GRANT-1")], PersistMode::Append)
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn load_all_returns_documents_in_stored_order() {
        let store = seeded_store(&["GRANT-1", "GRANT-2", "GRANT-3"]).await;

        let docs = store.load_all().await.unwrap();
        let ids: Vec<Option<&str>> = docs.iter().map(|d| d.business_id.as_deref()).collect();
        assert_eq!(
            ids,
            vec![Some("GRANT-1"), Some("GRANT-2"), Some("GRANT-3")]
        );
    }

    #[tokio::test]
    async fn tagged_count_tracks_merges() {
        let store = seeded_store(&["GRANT-1", "GRANT-2"]).await;
        assert_eq!(store.tagged_count().await.unwrap(), 0);

        store
            .apply_tags(&[tag("GRANT-1")], PersistMode::Merge)
            .await
            .unwrap();

        assert_eq!(store.tagged_count().await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[test]
    fn persist_mode_round_trips_through_strings() {
        use std::str::FromStr;

        assert_eq!(PersistMode::from_str("merge").unwrap(), PersistMode::Merge);
        assert_eq!(PersistMode::from_str("append").unwrap(), PersistMode::Append);
        assert_eq!(PersistMode::Merge.to_string(), "merge");
        assert!(PersistMode::from_str("upsert").is_err());
    }

    #[test]
    fn write_report_absorbs_partial_results() {
        let mut total = WriteReport::default();
        total.absorb(WriteReport {
            written: 2,
            missed: vec!["GRANT-9".to_string()],
            failed: Vec::new(),
        });
        total.absorb(WriteReport {
            written: 1,
            missed: Vec::new(),
            failed: Vec::new(),
        });

        assert_eq!(total.written, 3);
        assert_eq!(total.missed.len(), 1);
        assert_eq!(total.attempted(), 4);
    }
}
