//! palank-kb - 로컬 하이브리드 지식베이스
//!
//! LSH 벡터 검색과 BM25 키워드 검색을 결합한 청크 단위
//! 지식베이스입니다. 임베딩 요청은 우선순위 디스패처를 거칩니다.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod embedding;
pub mod error;
pub mod knowledge;

// Re-exports
pub use config::KbConfig;
pub use dispatcher::{DispatcherStats, EmbeddingDispatcher, QueueKind};
pub use embedding::{
    get_api_key, has_api_key, EmbeddingBatch, EmbeddingProvider, GeminiEmbedding, TaskTag,
};
pub use error::KbError;
pub use knowledge::{
    BuildReport, ChunkIndexer, Connection, Document, DocumentStatus, HybridRetriever,
    KnowledgeBase, KnowledgeStore, LexicalIndex, LshIndex, LshParams, RankedChunk,
    RankerConfig, ResultBudget, SearchMethod, StoreStats, TextChunk,
};
