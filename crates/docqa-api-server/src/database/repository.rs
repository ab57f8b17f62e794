use super::models::{
    ChunkMatch, ConversationRecord, Document, DocumentRow, EmbeddingProviderKind, IngestStatus,
    NewChunk, Owner, QuizRecord, UserDocumentRecord,
};
use super::DbPool;
use anyhow::{Context, Result};
use chrono::Utc;
use pgvector::Vector;
use tracing::debug;
use uuid::Uuid;

/// Retrieval flavor executed by the chunk-match RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Vector,
    Hybrid,
}

const DOCUMENT_COLUMNS: &str = "id, slug, owner_id, title, subtitle, access_level, \
     embedding_provider, chunk_limit, forced_model, intro_message, passcode, \
     abstract_text, keywords, page_count, processor_version, active, updated_at";

pub struct Repository {
    pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        self.pool.get_pool()
    }

    // ===== documents =====

    pub async fn get_document_by_slug(&self, slug: &str) -> Result<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE slug = $1 AND active"
        ))
        .bind(slug)
        .fetch_optional(self.pool())
        .await?;

        row.map(Document::try_from).transpose()
    }

    pub async fn get_document_by_id(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.map(Document::try_from).transpose()
    }

    pub async fn list_active_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE active ORDER BY slug"
        ))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(Document::try_from).collect()
    }

    pub async fn get_owner(&self, id: Uuid) -> Result<Option<Owner>> {
        let owner = sqlx::query_as::<_, Owner>(
            "SELECT id, slug, name, forced_model, default_chunk_limit, cover_image \
             FROM owners WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        Ok(owner)
    }

    pub async fn get_owner_by_slug(&self, slug: &str) -> Result<Option<Owner>> {
        let owner = sqlx::query_as::<_, Owner>(
            "SELECT id, slug, name, forced_model, default_chunk_limit, cover_image \
             FROM owners WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(self.pool())
        .await?;

        Ok(owner)
    }

    /// Insert a fresh document created by ingestion. The id is generated by
    /// the caller so chunks can reference it inside the same transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_document(
        &self,
        id: Uuid,
        slug: &str,
        owner_id: Uuid,
        title: &str,
        embedding_provider: EmbeddingProviderKind,
        processor_version: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents \
             (id, slug, owner_id, title, access_level, embedding_provider, \
              processor_version, active, updated_at) \
             VALUES ($1, $2, $3, $4, 'public', $5, $6, TRUE, $7)",
        )
        .bind(id)
        .bind(slug)
        .bind(owner_id)
        .bind(title)
        .bind(embedding_provider.as_str())
        .bind(processor_version)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .context("insert document")?;

        Ok(())
    }

    /// Metadata written at the end of ingestion: AI abstract, keyword cloud,
    /// page count and the processor version that produced the chunks.
    pub async fn update_document_enrichment(
        &self,
        id: Uuid,
        abstract_text: Option<&str>,
        keywords: Option<&serde_json::Value>,
        page_count: i32,
        processor_version: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET abstract_text = COALESCE($2, abstract_text), \
             keywords = COALESCE($3, keywords), page_count = $4, \
             processor_version = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(id)
        .bind(abstract_text)
        .bind(keywords)
        .bind(page_count)
        .bind(processor_version)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    // ===== chunks =====

    /// Insert a chunk set for a document, atomically. Any failure rolls the
    /// whole set back and leaves previously stored chunks untouched.
    pub async fn store_chunks(
        &self,
        document_id: Uuid,
        provider: EmbeddingProviderKind,
        chunks: &[NewChunk],
    ) -> Result<()> {
        let table = provider.chunk_table();
        let mut tx = self.pool().begin().await?;

        for chunk in chunks {
            sqlx::query(&format!(
                "INSERT INTO {table} \
                 (document_id, chunk_index, content, page_number, embedding, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6)"
            ))
            .bind(document_id)
            .bind(chunk.index)
            .bind(&chunk.content)
            .bind(chunk.page_number)
            .bind(Vector::from(chunk.embedding.clone()))
            .bind(&chunk.metadata)
            .execute(&mut *tx)
            .await
            .context("insert chunk")?;
        }

        tx.commit().await?;
        debug!("Stored {} chunks for document {}", chunks.len(), document_id);

        Ok(())
    }

    /// Retrain replacement: delete the existing chunk set and insert the new
    /// one under the same document id, in a single transaction. External
    /// references keep resolving because only `index` rows change.
    pub async fn replace_chunks(
        &self,
        document_id: Uuid,
        provider: EmbeddingProviderKind,
        chunks: &[NewChunk],
    ) -> Result<()> {
        let table = provider.chunk_table();
        let mut tx = self.pool().begin().await?;

        sqlx::query(&format!("DELETE FROM {table} WHERE document_id = $1"))
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(&format!(
                "INSERT INTO {table} \
                 (document_id, chunk_index, content, page_number, embedding, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6)"
            ))
            .bind(document_id)
            .bind(chunk.index)
            .bind(&chunk.content)
            .bind(chunk.page_number)
            .bind(Vector::from(chunk.embedding.clone()))
            .bind(&chunk.metadata)
            .execute(&mut *tx)
            .await
            .context("insert replacement chunk")?;
        }

        tx.commit().await?;
        debug!(
            "Replaced chunk set for document {} ({} chunks)",
            document_id,
            chunks.len()
        );

        Ok(())
    }

    pub async fn delete_chunks(
        &self,
        document_id: Uuid,
        provider: EmbeddingProviderKind,
    ) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE document_id = $1",
            provider.chunk_table()
        ))
        .bind(document_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Leading chunk contents in index order, used to seed quiz and summary
    /// synthesis.
    pub async fn get_leading_chunks(
        &self,
        document_id: Uuid,
        provider: EmbeddingProviderKind,
        limit: i64,
    ) -> Result<Vec<String>> {
        let contents = sqlx::query_scalar::<_, String>(&format!(
            "SELECT content FROM {} WHERE document_id = $1 ORDER BY chunk_index LIMIT $2",
            provider.chunk_table()
        ))
        .bind(document_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(contents)
    }

    /// Top-k chunk matches for one document, ordered by relevance score
    /// descending.
    ///
    /// The hybrid variant computes `similarity + text_match_boost` in a CTE
    /// projection and sorts by that expression. Never order by the chunk
    /// identifier: identifiers are opaque and an identifier-first ordering
    /// degenerates into random chunk selection.
    pub async fn match_chunks(
        &self,
        document_id: Uuid,
        provider: EmbeddingProviderKind,
        query_vec: &[f32],
        k: i64,
        mode: SearchMode,
        query_text: &str,
        text_match_boost: f32,
    ) -> Result<Vec<ChunkMatch>> {
        let table = provider.chunk_table();
        let vector = Vector::from(query_vec.to_vec());

        let matches = match mode {
            SearchMode::Vector => {
                sqlx::query_as::<_, ChunkMatch>(&format!(
                    "SELECT document_id, chunk_index, content, page_number, \
                            (1 - (embedding <=> $2))::real AS similarity, \
                            (1 - (embedding <=> $2))::real AS score \
                     FROM {table} \
                     WHERE document_id = $1 \
                     ORDER BY embedding <=> $2 \
                     LIMIT $3"
                ))
                .bind(document_id)
                .bind(&vector)
                .bind(k)
                .fetch_all(self.pool())
                .await?
            }
            SearchMode::Hybrid => {
                sqlx::query_as::<_, ChunkMatch>(&format!(
                    "WITH vector_matches AS ( \
                         SELECT chunk_index, content, page_number, \
                                (1 - (embedding <=> $2))::real AS similarity \
                         FROM {table} \
                         WHERE document_id = $1 \
                         ORDER BY embedding <=> $2 \
                         LIMIT $3 \
                     ), \
                     text_matches AS ( \
                         SELECT chunk_index, content, page_number, \
                                ts_rank(to_tsvector('english', content), \
                                        plainto_tsquery('english', $4))::real AS text_rank \
                         FROM {table} \
                         WHERE document_id = $1 \
                           AND to_tsvector('english', content) @@ plainto_tsquery('english', $4) \
                         ORDER BY text_rank DESC \
                         LIMIT $3 \
                     ), \
                     scored AS ( \
                         SELECT COALESCE(v.chunk_index, t.chunk_index) AS chunk_index, \
                                COALESCE(v.content, t.content) AS content, \
                                COALESCE(v.page_number, t.page_number) AS page_number, \
                                v.similarity, \
                                (COALESCE(v.similarity, 0) \
                                 + COALESCE(t.text_rank, 0) * $5)::real AS score \
                         FROM vector_matches v \
                         FULL OUTER JOIN text_matches t USING (chunk_index) \
                     ) \
                     SELECT $1 AS document_id, chunk_index, content, page_number, \
                            similarity, score \
                     FROM scored \
                     ORDER BY score DESC \
                     LIMIT $3"
                ))
                .bind(document_id)
                .bind(&vector)
                .bind(k)
                .bind(query_text)
                .bind(text_match_boost)
                .fetch_all(self.pool())
                .await?
            }
        };

        debug!(
            "match_chunks doc={} mode={:?} returned {}",
            document_id,
            mode,
            matches.len()
        );

        Ok(matches)
    }

    /// Per-document top-k across several documents. Results are returned
    /// grouped per input id, each group score-descending.
    #[allow(clippy::too_many_arguments)]
    pub async fn match_chunks_multi(
        &self,
        document_ids: &[Uuid],
        provider: EmbeddingProviderKind,
        query_vec: &[f32],
        k_per_doc: i64,
        mode: SearchMode,
        query_text: &str,
        text_match_boost: f32,
    ) -> Result<Vec<Vec<ChunkMatch>>> {
        let futures = document_ids.iter().map(|id| {
            self.match_chunks(
                *id,
                provider,
                query_vec,
                k_per_doc,
                mode,
                query_text,
                text_match_boost,
            )
        });

        futures::future::try_join_all(futures).await
    }

    // ===== conversation log =====

    pub async fn append_conversation(&self, record: &ConversationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_logs \
             (id, session_id, user_id, document_ids, question, answer, model, \
              retrieval_ms, generation_ms, total_ms, similarity, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(record.id)
        .bind(record.session_id)
        .bind(record.user_id)
        .bind(&record.document_ids)
        .bind(&record.question)
        .bind(&record.answer)
        .bind(&record.model)
        .bind(record.retrieval_ms)
        .bind(record.generation_ms)
        .bind(record.total_ms)
        .bind(&record.similarity)
        .bind(record.created_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn set_conversation_rating(&self, conversation_id: Uuid, rating: i16) -> Result<()> {
        sqlx::query("UPDATE conversation_logs SET rating = $2 WHERE id = $1")
            .bind(conversation_id)
            .bind(rating)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    // ===== user-documents (ingestion status) =====

    pub async fn create_user_document(
        &self,
        filename: &str,
        document_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO user_documents (id, document_id, filename, status, log, updated_at) \
             VALUES ($1, $2, $3, $4, '[]'::jsonb, $5)",
        )
        .bind(id)
        .bind(document_id)
        .bind(filename)
        .bind(IngestStatus::Pending.as_str())
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(id)
    }

    pub async fn update_user_document_status(
        &self,
        id: Uuid,
        status: IngestStatus,
        error_kind: Option<&str>,
        log_line: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE user_documents SET status = $2, error_kind = $3, \
             log = log || $4::jsonb, updated_at = $5 WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_kind)
        .bind(serde_json::json!([log_line]))
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn attach_user_document(&self, id: Uuid, document_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE user_documents SET document_id = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(document_id)
            .bind(Utc::now())
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn get_user_document(&self, id: Uuid) -> Result<Option<UserDocumentRecord>> {
        let record = sqlx::query_as::<_, UserDocumentRecord>(
            "SELECT id, document_id, filename, status, error_kind, log, updated_at \
             FROM user_documents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        Ok(record)
    }

    // ===== quizzes =====

    pub async fn get_quiz(&self, document_id: Uuid) -> Result<Option<QuizRecord>> {
        let quiz = sqlx::query_as::<_, QuizRecord>(
            "SELECT document_id, questions, generated_at FROM quizzes WHERE document_id = $1",
        )
        .bind(document_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(quiz)
    }

    pub async fn upsert_quiz(&self, document_id: Uuid, questions: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO quizzes (document_id, questions, generated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (document_id) DO UPDATE \
             SET questions = EXCLUDED.questions, generated_at = EXCLUDED.generated_at",
        )
        .bind(document_id)
        .bind(questions)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(())
    }
}

/// Unique-key conflicts on chunk index during a retrain are fatal for that
/// ingestion; the surrounding transaction has already rolled back.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| match e {
            sqlx::Error::Database(db) => Some(db.is_unique_violation()),
            _ => None,
        })
        .unwrap_or(false)
}
