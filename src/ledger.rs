//! Durable per-chunk metadata: the text of every chunk and, once generated,
//! the URL of its audio. Survives restarts so an interrupted document can be
//! resumed and inspected.

use crate::error::PipelineError;
use crate::segmenter::Chunk;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record a document's chunk texts, replacing any prior rows for the
    /// same document id (re-submission resets the ledger for that id).
    async fn record_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<(), PipelineError>;

    /// Back-fill the audio URL once a chunk's audio has been stored.
    async fn set_audio_url(
        &self,
        doc_id: &str,
        index: usize,
        url: &str,
    ) -> Result<(), PipelineError>;

    /// Audio URL recorded for a chunk, if generation has completed.
    async fn audio_url(&self, doc_id: &str, index: usize)
        -> Result<Option<String>, PipelineError>;
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS pdf_chunks (
    id TEXT PRIMARY KEY,
    doc_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    audio_url TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(doc_id, chunk_index)
)";

/// SQLite-backed ledger.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Connect to a SQLite database, e.g. `sqlite:data/chunks.db?mode=rwc`,
    /// and ensure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, PipelineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory ledger, used in tests and credential-free demo runs. A
    /// single connection keeps every query on the same database.
    pub async fn in_memory() -> Result<Self, PipelineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn record_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<(), PipelineError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pdf_chunks WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO pdf_chunks (id, doc_id, chunk_index, text, audio_url, created_at, updated_at)
                 VALUES (?, ?, ?, ?, NULL, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(doc_id)
            .bind(chunk.index as i64)
            .bind(&chunk.text)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_audio_url(
        &self,
        doc_id: &str,
        index: usize,
        url: &str,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            "UPDATE pdf_chunks SET audio_url = ?, updated_at = ? WHERE doc_id = ? AND chunk_index = ?",
        )
        .bind(url)
        .bind(chrono::Utc::now().timestamp())
        .bind(doc_id)
        .bind(index as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audio_url(
        &self,
        doc_id: &str,
        index: usize,
    ) -> Result<Option<String>, PipelineError> {
        let row = sqlx::query(
            "SELECT audio_url FROM pdf_chunks WHERE doc_id = ? AND chunk_index = ?",
        )
        .bind(doc_id)
        .bind(index as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("audio_url")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                index,
                text: text.to_string(),
                word_count: text.split_whitespace().count(),
            })
            .collect()
    }

    #[tokio::test]
    async fn records_and_backfills_urls() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        ledger
            .record_chunks("doc1", &chunks(&["first chunk", "second chunk"]))
            .await
            .unwrap();

        assert_eq!(ledger.audio_url("doc1", 0).await.unwrap(), None);

        ledger
            .set_audio_url("doc1", 0, "http://cdn/audio/doc1_chunk_0.mp3")
            .await
            .unwrap();
        assert_eq!(
            ledger.audio_url("doc1", 0).await.unwrap().as_deref(),
            Some("http://cdn/audio/doc1_chunk_0.mp3")
        );
        assert_eq!(ledger.audio_url("doc1", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn resubmission_replaces_prior_rows() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        ledger
            .record_chunks("doc1", &chunks(&["old text"]))
            .await
            .unwrap();
        ledger
            .set_audio_url("doc1", 0, "http://cdn/old.mp3")
            .await
            .unwrap();

        ledger
            .record_chunks("doc1", &chunks(&["new text", "more text"]))
            .await
            .unwrap();
        // Re-recording clears the back-filled URL along with the old rows.
        assert_eq!(ledger.audio_url("doc1", 0).await.unwrap(), None);
        assert_eq!(ledger.audio_url("doc1", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_chunk_has_no_url() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        assert_eq!(ledger.audio_url("missing", 7).await.unwrap(), None);
    }
}
