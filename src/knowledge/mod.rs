//! Knowledge 모듈 - 하이브리드 지식 저장소
//!
//! - Store: SQLite 에 연결, 문서, 청크, 샤드 저장
//! - LSH: 랜덤 초평면 해시 기반 벡터 검색
//! - Lexical: BM25 키워드 검색
//! - Builder: 윈도우 단위 청크 색인
//! - Hybrid: 벡터 + 키워드 점수 융합

mod base;
mod builder;
mod chunker;
mod hybrid;
mod lexical;
mod lsh;
mod store;

// Re-exports
pub use base::{KnowledgeBase, DEFAULT_CONNECTION};
pub use builder::{ensure_deletable, BuildConfig, BuildReport, ChunkIndexer, WindowReport};
pub use chunker::{
    ChunkConfig, Chunker, DocumentChunks, MarkdownChunker, SplitChunk,
};
pub use hybrid::{
    apply_budget, estimate_tokens, fuse_scores, rerank_lexical, tail_magnitude, FusedHit,
    HybridRetriever, RankedChunk, RankerConfig, ResultBudget, SearchMethod,
};
pub use lexical::{tokenize, LexicalHit, LexicalIndex};
pub use lsh::{
    cosine_similarity, LshIndex, LshParams, ProjectionSet, ShardTables, SimilarHit,
    EMBEDDING_DIMENSION,
};
pub use store::{
    ChunkKind, Connection, Document, DocumentStatus, KnowledgeStore, NewChunk, NewDocument,
    StoreStats, TextChunk,
};
