use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Which embedding backend produced a document's chunk vectors. The two
/// backends write to separate chunk partitions because their dimensionalities
/// differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    Remote,
    Local,
}

impl EmbeddingProviderKind {
    pub fn dimension(&self) -> usize {
        match self {
            Self::Remote => 1536,
            Self::Local => 384,
        }
    }

    /// Chunk partition backing this provider.
    pub fn chunk_table(&self) -> &'static str {
        match self {
            Self::Remote => "document_chunks_remote",
            Self::Local => "document_chunks_local",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "remote" => Ok(Self::Remote),
            "local" => Ok(Self::Local),
            other => Err(anyhow!("unknown embedding provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Public,
    Passcode,
    Registered,
    OwnerRestricted,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Passcode => "passcode",
            Self::Registered => "registered",
            Self::OwnerRestricted => "owner_restricted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(Self::Public),
            "passcode" => Ok(Self::Passcode),
            "registered" => Ok(Self::Registered),
            "owner_restricted" => Ok(Self::OwnerRestricted),
            other => Err(anyhow!("unknown access level: {}", other)),
        }
    }
}

/// Canonical document entity. `id` never mutates after creation; `slug` is
/// the mutable routing key and every cross-reference uses `id`.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: Uuid,
    pub slug: String,
    pub owner_id: Uuid,
    pub title: String,
    pub subtitle: Option<String>,
    pub access_level: AccessLevel,
    pub embedding_provider: EmbeddingProviderKind,
    pub chunk_limit: Option<i32>,
    pub forced_model: Option<String>,
    pub intro_message: Option<String>,
    pub passcode: Option<String>,
    pub abstract_text: Option<String>,
    pub keywords: Option<serde_json::Value>,
    pub page_count: Option<i32>,
    pub processor_version: Option<String>,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DocumentRow {
    pub id: Uuid,
    pub slug: String,
    pub owner_id: Uuid,
    pub title: String,
    pub subtitle: Option<String>,
    pub access_level: String,
    pub embedding_provider: String,
    pub chunk_limit: Option<i32>,
    pub forced_model: Option<String>,
    pub intro_message: Option<String>,
    pub passcode: Option<String>,
    pub abstract_text: Option<String>,
    pub keywords: Option<serde_json::Value>,
    pub page_count: Option<i32>,
    pub processor_version: Option<String>,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DocumentRow> for Document {
    type Error = anyhow::Error;

    fn try_from(row: DocumentRow) -> Result<Self> {
        Ok(Document {
            id: row.id,
            slug: row.slug,
            owner_id: row.owner_id,
            title: row.title,
            subtitle: row.subtitle,
            access_level: AccessLevel::parse(&row.access_level)?,
            embedding_provider: EmbeddingProviderKind::parse(&row.embedding_provider)?,
            chunk_limit: row.chunk_limit,
            forced_model: row.forced_model,
            intro_message: row.intro_message,
            passcode: row.passcode,
            abstract_text: row.abstract_text,
            keywords: row.keywords,
            page_count: row.page_count,
            processor_version: row.processor_version,
            active: row.active,
            updated_at: row.updated_at,
        })
    }
}

/// Tenant grouping that scopes documents and supplies fallback defaults.
/// Document overrides win over these.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Owner {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub forced_model: Option<String>,
    pub default_chunk_limit: Option<i32>,
    pub cover_image: Option<String>,
}

/// One ranked match from `match_chunks`. `similarity` is absent for
/// text-only hybrid matches; `score` is always present and is the sole
/// ordering key.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkMatch {
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub page_number: Option<i32>,
    pub similarity: Option<f32>,
    pub score: f32,
}

/// Chunk payload for `store_chunks`. `index` is dense `0..N-1` per document.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub index: i32,
    pub content: String,
    pub page_number: Option<i32>,
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
}

/// Ingestion phase persisted on the user-documents record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Pending,
    Extracting,
    Chunking,
    Embedding,
    Summarizing,
    Ready,
    Error,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Summarizing => "summarizing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserDocumentRecord {
    pub id: Uuid,
    pub document_id: Option<Uuid>,
    pub filename: String,
    pub status: String,
    pub error_kind: Option<String>,
    pub log: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Write-once conversation record; never blocks the response path.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Option<Uuid>,
    pub document_ids: Vec<Uuid>,
    pub question: String,
    pub answer: String,
    pub model: String,
    pub retrieval_ms: i64,
    pub generation_ms: i64,
    pub total_ms: i64,
    pub similarity: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QuizRecord {
    pub document_id: Uuid,
    pub questions: serde_json::Value,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_dimensions_match_partitions() {
        assert_eq!(EmbeddingProviderKind::Remote.dimension(), 1536);
        assert_eq!(EmbeddingProviderKind::Local.dimension(), 384);
        assert_eq!(
            EmbeddingProviderKind::Remote.chunk_table(),
            "document_chunks_remote"
        );
        assert_eq!(
            EmbeddingProviderKind::Local.chunk_table(),
            "document_chunks_local"
        );
    }

    #[test]
    fn provider_round_trips_through_text() {
        for kind in [EmbeddingProviderKind::Remote, EmbeddingProviderKind::Local] {
            assert_eq!(EmbeddingProviderKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(EmbeddingProviderKind::parse("hybrid").is_err());
    }

    #[test]
    fn access_level_round_trips_through_text() {
        for level in [
            AccessLevel::Public,
            AccessLevel::Passcode,
            AccessLevel::Registered,
            AccessLevel::OwnerRestricted,
        ] {
            assert_eq!(AccessLevel::parse(level.as_str()).unwrap(), level);
        }
    }
}
