//! Knowledge Base - 저장소, 디스패처, 인덱서, 검색기 연결
//!
//! 애플리케이션이 소유하는 서비스 객체입니다. `open` 으로 시작하고
//! `shutdown` 으로 디스패처를 정리합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let config = KbConfig::from_env()?;
//! let provider = Arc::new(GeminiEmbedding::from_env(config.dimension())?);
//! let kb = KnowledgeBase::open(config, provider)?;
//!
//! let connection = kb.connection("uploads")?;
//! kb.ingest_text("notes.md", connection.id, &text, None).await?;
//! let results = kb.search("lsh shards", &[], ResultBudget::TopK(5)).await?;
//! kb.shutdown().await?;
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::KbConfig;
use crate::dispatcher::{DispatcherStats, EmbeddingDispatcher};
use crate::embedding::EmbeddingProvider;
use crate::error::KbError;

use super::builder::{BuildReport, ChunkIndexer};
use super::chunker::{Chunker, DocumentChunks, MarkdownChunker};
use super::hybrid::{HybridRetriever, RankedChunk, ResultBudget};
use super::store::{Connection, Document, KnowledgeStore, StoreStats};

/// CLI 업로드 기본 연결 이름
pub const DEFAULT_CONNECTION: &str = "uploads";

/// 하이브리드 지식베이스
pub struct KnowledgeBase {
    config: KbConfig,
    store: Arc<KnowledgeStore>,
    dispatcher: Arc<EmbeddingDispatcher>,
    indexer: ChunkIndexer,
    retriever: HybridRetriever,
    chunker: Box<dyn Chunker>,
}

impl KnowledgeBase {
    /// 지식베이스 열기 (tokio 런타임 안에서 호출)
    pub fn open(config: KbConfig, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        config.validate()?;

        if provider.dimension() != config.dimension() {
            return Err(KbError::DimensionMismatch {
                expected: config.dimension(),
                actual: provider.dimension(),
            }
            .into());
        }

        if !config.data_dir.exists() {
            std::fs::create_dir_all(&config.data_dir).context("Failed to create data directory")?;
        }

        let store = Arc::new(
            KnowledgeStore::open(&config.db_path()).context("Failed to open knowledge store")?,
        );
        let dispatcher = Arc::new(EmbeddingDispatcher::start(provider, config.workers)?);

        let indexer = ChunkIndexer::new(
            store.clone(),
            dispatcher.clone(),
            config.lsh,
            config.build,
            config.delete_grace,
        );
        let retriever =
            HybridRetriever::new(store.clone(), dispatcher.clone(), config.lsh, config.ranker);
        let chunker: Box<dyn Chunker> = Box::new(MarkdownChunker::with_defaults()?);

        tracing::info!("Knowledge base opened at {:?}", config.data_dir);

        Ok(Self {
            config,
            store,
            dispatcher,
            indexer,
            retriever,
            chunker,
        })
    }

    pub fn config(&self) -> &KbConfig {
        &self.config
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    /// 이름으로 연결 조회, 없으면 생성 (kind = "upload")
    pub fn connection(&self, name: &str) -> Result<Connection> {
        self.store.ensure_connection(name, "upload")
    }

    /// 이름으로 연결 ID 조회 (없으면 `ConnectionNotFound`)
    pub fn connection_id(&self, name: &str) -> Result<i64> {
        self.store
            .find_connection(name)?
            .map(|c| c.id)
            .ok_or_else(|| KbError::ConnectionNotFound(name.to_string()).into())
    }

    /// 텍스트 분할
    pub fn split(&self, text: &str) -> DocumentChunks {
        self.chunker.split(text)
    }

    /// 텍스트 문서 색인 (분할 + 빌드)
    pub async fn ingest_text(
        &self,
        name: &str,
        connection_id: i64,
        text: &str,
        resource: Option<Vec<u8>>,
    ) -> Result<BuildReport> {
        let chunks = self.split(text);
        self.indexer
            .index_document(name, connection_id, chunks, resource)
            .await
    }

    /// 분할이 끝난 청크 색인
    pub async fn ingest_chunks(
        &self,
        name: &str,
        connection_id: i64,
        chunks: DocumentChunks,
        resource: Option<Vec<u8>>,
    ) -> Result<BuildReport> {
        self.indexer
            .index_document(name, connection_id, chunks, resource)
            .await
    }

    /// 하이브리드 검색
    pub async fn search(
        &self,
        query: &str,
        connection_ids: &[i64],
        budget: ResultBudget,
    ) -> Result<Vec<RankedChunk>> {
        self.retriever.search(query, connection_ids, budget).await
    }

    /// 문서 삭제 (빌드 중 유예 기간 보호)
    pub fn delete_document(&self, id: i64) -> Result<()> {
        self.indexer.delete_document(id)
    }

    pub fn get_document(&self, id: i64) -> Result<Option<Document>> {
        self.store.get_document(id)
    }

    pub fn list_documents(&self, limit: usize, connection_id: Option<i64>) -> Result<Vec<Document>> {
        self.store.list_documents(limit, connection_id)
    }

    pub fn list_connections(&self) -> Result<Vec<Connection>> {
        self.store.list_connections()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// 디스패처 종료 (대기 중인 임베딩 요청 거절)
    pub async fn shutdown(&self) -> Result<()> {
        self.dispatcher.shutdown().await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::HashEmbedding;
    use crate::knowledge::DocumentStatus;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> KbConfig {
        let mut config = KbConfig::with_data_dir(dir.path().join("kb"));
        config.lsh.dimensions = 64;
        config.lsh.num_tables = 6;
        config.lsh.hashes_per_table = 3;
        config
    }

    #[tokio::test]
    async fn test_open_rejects_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(HashEmbedding::new(32));
        let err = KnowledgeBase::open(test_config(&dir), provider).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<KbError>(),
            Some(KbError::DimensionMismatch {
                expected: 64,
                actual: 32
            })
        ));
    }

    #[tokio::test]
    async fn test_ingest_search_delete_cycle() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(HashEmbedding::new(64));
        let kb = KnowledgeBase::open(test_config(&dir), provider).unwrap();

        let connection = kb.connection(DEFAULT_CONNECTION).unwrap();
        assert_eq!(kb.connection_id(DEFAULT_CONNECTION).unwrap(), connection.id);
        assert!(kb.connection_id("missing").is_err());

        let text = "# Shards\n\nEach build window produces one vector shard.\n\n\
                    # Fusion\n\nLexical scores are normalized before fusion.";
        let report = kb
            .ingest_text("notes.md", connection.id, text, Some(text.as_bytes().to_vec()))
            .await
            .unwrap();
        assert!(report.chunk_count() > 0);

        let doc = kb.get_document(report.document_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Success);

        let results = kb
            .search("normalized fusion", &[connection.id], ResultBudget::TopK(3))
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert!(results[0].chunk.text.contains("normalized"));

        kb.delete_document(report.document_id).unwrap();
        assert!(kb.list_documents(10, None).unwrap().is_empty());
        let results = kb
            .search("normalized fusion", &[], ResultBudget::TopK(3))
            .await
            .unwrap();
        assert!(results.is_empty());

        assert!(kb.dispatcher_stats().completed > 0);
        kb.shutdown().await.unwrap();
    }
}
