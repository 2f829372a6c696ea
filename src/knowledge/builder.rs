//! 청크 인덱서 - 윈도우 단위 배치 빌드
//!
//! 분할된 청크를 고정 크기 윈도우로 나눠 순차 처리합니다. 윈도우 하나마다:
//!
//! 1. 청크 행 저장 (ID 할당)
//! 2. 텍스트를 서브배치로 나눠 build 큐에 제출, 모든 벡터 대기
//! 3. 공유 투영 집합으로 LSH 샤드 생성 및 저장
//! 4. 윈도우가 big 청크 구간과 겹치면 렉시컬 샤드 생성 및 저장
//!
//! 메모리 사용량은 문서 크기가 아니라 윈도우 크기에 비례합니다.
//!
//! 문서 상태: `Building` → `Success` | `Fail` (종료 상태).
//! 중간 실패 시 앞선 윈도우의 청크/샤드는 되돌리지 않습니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::try_join_all;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::dispatcher::EmbeddingDispatcher;
use crate::error::KbError;

use super::chunker::{DocumentChunks, SplitChunk};
use super::lexical::LexicalIndex;
use super::lsh::{LshIndex, LshParams, ProjectionSet};
use super::store::{ChunkKind, Document, DocumentStatus, KnowledgeStore, NewChunk, NewDocument};

// ============================================================================
// Types
// ============================================================================

/// 빌드 설정
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuildConfig {
    /// 윈도우당 청크 수 (big + mini)
    pub window_size: usize,
    /// 임베딩 요청당 텍스트 수
    pub embed_batch_size: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            embed_batch_size: 20,
        }
    }
}

/// 윈도우 하나의 빌드 결과
#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub chunk_range: (i64, i64),
    pub chunk_count: usize,
    pub vector_shard: i64,
    pub lexical_shard: Option<i64>,
}

/// 문서 빌드 결과
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub document_id: i64,
    /// 모든 윈도우를 포함하는 [from, to] (청크가 없으면 None)
    pub chunk_range: Option<(i64, i64)>,
    pub windows: Vec<WindowReport>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl BuildReport {
    pub fn chunk_count(&self) -> usize {
        self.windows.iter().map(|w| w.chunk_count).sum()
    }

    pub fn vector_shards(&self) -> Vec<i64> {
        self.windows.iter().map(|w| w.vector_shard).collect()
    }

    pub fn lexical_shards(&self) -> Vec<i64> {
        self.windows.iter().filter_map(|w| w.lexical_shard).collect()
    }
}

/// 윈도우 범위 합치기
fn overall_range(windows: &[WindowReport]) -> Option<(i64, i64)> {
    windows.iter().fold(None, |acc, w| {
        let (from, to) = w.chunk_range;
        Some(match acc {
            None => (from, to),
            Some((f, t)) => (f.min(from), t.max(to)),
        })
    })
}

// ============================================================================
// ChunkIndexer
// ============================================================================

/// 청크 인덱서 / 배치 빌더
///
/// 한 문서의 윈도우는 순차 처리되지만, 서로 다른 문서의 빌드는
/// 동시에 진행되어 디스패처에서 섞일 수 있습니다.
pub struct ChunkIndexer {
    store: Arc<KnowledgeStore>,
    dispatcher: Arc<EmbeddingDispatcher>,
    lsh: LshParams,
    build: BuildConfig,
    delete_grace: Duration,
    projections: Mutex<Option<Arc<ProjectionSet>>>,
}

impl ChunkIndexer {
    pub fn new(
        store: Arc<KnowledgeStore>,
        dispatcher: Arc<EmbeddingDispatcher>,
        lsh: LshParams,
        build: BuildConfig,
        delete_grace: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            lsh,
            build,
            delete_grace,
            projections: Mutex::new(None),
        }
    }

    /// 공유 투영 집합 (첫 사용 시 생성, 이후 재사용)
    pub async fn projections(&self) -> Result<Arc<ProjectionSet>> {
        let mut cached = self.projections.lock().await;
        if let Some(set) = cached.as_ref() {
            return Ok(set.clone());
        }

        let set = match self.store.load_projections()? {
            Some(set) => set,
            None => self.store.init_projections(&ProjectionSet::random(&self.lsh))?,
        };

        if !set.matches(&self.lsh) {
            return Err(KbError::InvalidConfig(format!(
                "stored projection set is {}x{}x{} but configuration expects {}x{}x{}",
                set.num_tables(),
                set.hashes_per_table(),
                set.dimensions(),
                self.lsh.num_tables,
                self.lsh.hashes_per_table,
                self.lsh.dimensions
            ))
            .into());
        }

        let set = Arc::new(set);
        *cached = Some(set.clone());
        Ok(set)
    }

    /// 문서 생성 (Building)
    pub fn create_document(
        &self,
        name: &str,
        connection_id: i64,
        resource: Option<Vec<u8>>,
    ) -> Result<Document> {
        self.store.create_document(NewDocument {
            name: name.to_string(),
            connection_id,
            resource,
        })
    }

    /// 문서 생성 + 빌드
    pub async fn index_document(
        &self,
        name: &str,
        connection_id: i64,
        chunks: DocumentChunks,
        resource: Option<Vec<u8>>,
    ) -> Result<BuildReport> {
        let document = self.create_document(name, connection_id, resource)?;
        self.build_document(&document, chunks).await
    }

    /// Building 문서 빌드
    ///
    /// 성공하면 범위/샤드 목록/상태와 연결 합집합을 함께 저장합니다.
    /// 실패하면 상태만 `Fail` 로 바꾸고 에러를 반환합니다.
    pub async fn build_document(&self, document: &Document, chunks: DocumentChunks) -> Result<BuildReport> {
        let started = Instant::now();
        let mut windows = Vec::new();

        tracing::info!(
            "Building document {} (id={}, big={}, mini={})",
            document.name,
            document.id,
            chunks.big.len(),
            chunks.mini.len()
        );

        let built = self.build_windows(document.id, &chunks, &mut windows).await;
        let report = BuildReport {
            document_id: document.id,
            chunk_range: overall_range(&windows),
            windows,
            elapsed: started.elapsed(),
        };

        let completed = built.and_then(|()| {
            self.store
                .complete_document(
                    document.id,
                    report.chunk_range,
                    &report.vector_shards(),
                    &report.lexical_shards(),
                )
                .map(|_| ())
                .context("Failed to complete document")
        });
        if let Err(e) = completed {
            self.mark_failed(&report);
            return Err(e.context(format!("Failed to build document {}", document.id)));
        }

        tracing::info!(
            "Built document {} (id={}, chunks={}, windows={}, {:?})",
            document.name,
            document.id,
            report.chunk_count(),
            report.windows.len(),
            report.elapsed
        );

        Ok(report)
    }

    /// 실패 처리: 상태를 `Fail` 로 바꾸고 남은 청크/샤드를 기록
    fn mark_failed(&self, report: &BuildReport) {
        if let Err(e) = self.store.fail_document(report.document_id) {
            tracing::error!("Failed to mark document {} as failed: {:#}", report.document_id, e);
        }
        if !report.windows.is_empty() {
            tracing::warn!(
                "Document {} failed after {} window(s); orphaned chunks {:?}, vector shards {:?}, lexical shards {:?}",
                report.document_id,
                report.windows.len(),
                report.chunk_range,
                report.vector_shards(),
                report.lexical_shards()
            );
        }
    }

    async fn build_windows(
        &self,
        document_id: i64,
        chunks: &DocumentChunks,
        windows: &mut Vec<WindowReport>,
    ) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let projections = self.projections().await?;
        let big_count = chunks.big.len();
        let all: Vec<(ChunkKind, &SplitChunk)> = chunks
            .big
            .iter()
            .map(|c| (ChunkKind::Big, c))
            .chain(chunks.mini.iter().map(|c| (ChunkKind::Mini, c)))
            .collect();

        for (w, window) in all.chunks(self.build.window_size).enumerate() {
            let offset = w * self.build.window_size;

            // 1. 청크 행 저장
            let rows: Vec<NewChunk> = window
                .iter()
                .map(|(kind, chunk)| NewChunk {
                    document_id,
                    kind: *kind,
                    text: chunk.text.clone(),
                    line_from: chunk.line_from,
                    line_to: chunk.line_to,
                    page: chunk.page,
                })
                .collect();
            let ids = self.store.add_chunks(&rows)?;

            // 2. 서브배치 임베딩 (build 큐)
            let texts: Vec<String> = rows.into_iter().map(|r| r.text).collect();
            let batches = try_join_all(
                texts
                    .chunks(self.build.embed_batch_size)
                    .map(|batch| self.dispatcher.embed_documents(batch.to_vec())),
            )
            .await
            .with_context(|| format!("Embedding failed in window {}", w + 1))?;

            // 3. 벡터 샤드
            let mut index = LshIndex::new(self.lsh, Some(projections.clone()))?;
            let vectors = batches.iter().flat_map(|b| b.rows());
            let tables = index.add_vectors(ids.iter().copied().zip(vectors))?;
            let vector_shard = self.store.add_vector_shard(tables)?;

            // 4. 렉시컬 샤드 (big 청크만)
            let lexical_shard = if offset < big_count {
                let big_in_window = (big_count - offset).min(window.len());
                let lexical = LexicalIndex::build(
                    ids[..big_in_window]
                        .iter()
                        .copied()
                        .zip(texts[..big_in_window].iter().map(String::as_str)),
                );
                Some(self.store.add_lexical_shard(&lexical)?)
            } else {
                None
            };

            // 5. 윈도우 범위
            let from = ids.iter().copied().min().unwrap_or_default();
            let to = ids.iter().copied().max().unwrap_or_default();

            tracing::debug!(
                "Window {} of document {}: chunks [{}, {}], vector shard {}, lexical shard {:?}",
                w + 1,
                document_id,
                from,
                to,
                vector_shard,
                lexical_shard
            );

            windows.push(WindowReport {
                chunk_range: (from, to),
                chunk_count: ids.len(),
                vector_shard,
                lexical_shard,
            });
        }

        Ok(())
    }

    /// 문서 삭제
    ///
    /// 유예 기간 안의 Building 문서는 삭제할 수 없습니다 (`KbError::StillBuilding`).
    pub fn delete_document(&self, id: i64) -> Result<()> {
        let document = self
            .store
            .get_document(id)?
            .ok_or(KbError::DocumentNotFound(id))?;

        ensure_deletable(&document, self.delete_grace)?;
        self.store.delete_document(id)?;
        Ok(())
    }
}

/// 삭제 가능 여부 확인
///
/// 생성 후 `grace` 가 지나지 않은 Building 문서는 `KbError::StillBuilding`.
/// 유예 기간이 지난 Building 문서는 중단된 빌드로 보고 삭제를 허용합니다.
pub fn ensure_deletable(document: &Document, grace: Duration) -> Result<()> {
    match document.status {
        DocumentStatus::Building => {
            let age = (Utc::now() - document.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age < grace {
                return Err(KbError::StillBuilding {
                    id: document.id,
                    remaining: grace - age,
                }
                .into());
            }
            tracing::warn!(
                "Deleting document {} stuck in Building for {:?}",
                document.id,
                age
            );
        }
        DocumentStatus::Fail => {
            tracing::warn!(
                "Document {} failed during build; chunk rows written before the failure are not tracked",
                document.id
            );
        }
        DocumentStatus::Success => {}
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::HashEmbedding;
    use crate::embedding::EmbeddingProvider;
    use tempfile::TempDir;

    const DIM: usize = 16;

    fn lsh_params() -> LshParams {
        LshParams {
            dimensions: DIM,
            num_tables: 4,
            hashes_per_table: 3,
            similarity_threshold: 0.3,
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<KnowledgeStore>,
        indexer: ChunkIndexer,
        connection_id: i64,
    }

    fn fixture(provider: Arc<dyn EmbeddingProvider>, grace: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KnowledgeStore::open(&dir.path().join("kb.db")).unwrap());
        let connection_id = store.ensure_connection("uploads", "upload").unwrap().id;
        let dispatcher = Arc::new(EmbeddingDispatcher::start(provider, 1).unwrap());
        let indexer = ChunkIndexer::new(
            store.clone(),
            dispatcher,
            lsh_params(),
            BuildConfig::default(),
            grace,
        );
        Fixture {
            _dir: dir,
            store,
            indexer,
            connection_id,
        }
    }

    fn synthetic_chunks(big: usize, mini: usize) -> DocumentChunks {
        let chunk = |text: String, line: u32| SplitChunk {
            text,
            line_from: line,
            line_to: line,
            page: None,
        };
        DocumentChunks {
            big: (0..big)
                .map(|i| chunk(format!("big chunk number{i} alpha"), i as u32 + 1))
                .collect(),
            mini: (0..mini)
                .map(|i| chunk(format!("mini chunk number{i} beta"), i as u32 + 1))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_windows_and_shards() {
        let provider = Arc::new(HashEmbedding::new(DIM));
        let fx = fixture(provider.clone(), Duration::from_secs(1800));

        let report = fx
            .indexer
            .index_document("doc", fx.connection_id, synthetic_chunks(120, 130), None)
            .await
            .unwrap();

        let sizes: Vec<usize> = report.windows.iter().map(|w| w.chunk_count).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(report.vector_shards().len(), 3);
        assert_eq!(report.lexical_shards().len(), 2);
        assert!(report.windows[2].lexical_shard.is_none());

        // 100/20 + 100/20 + ceil(50/20)
        assert_eq!(provider.calls(), 13);

        let (from, to) = report.chunk_range.unwrap();
        assert_eq!(to - from + 1, 250);

        let doc = fx.store.get_document(report.document_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Success);
        assert_eq!(doc.chunk_range, Some((from, to)));
        assert_eq!(doc.vector_shards, report.vector_shards());

        let connection = fx.store.get_connection(fx.connection_id).unwrap().unwrap();
        assert_eq!(connection.vector_shards, report.vector_shards());
        assert_eq!(connection.lexical_shards, report.lexical_shards());

        // 두 번째 렉시컬 샤드는 big 청크 20개만 포함
        let lexical = fx
            .store
            .get_lexical_shards(&[report.windows[1].lexical_shard.unwrap()])
            .unwrap();
        assert_eq!(lexical[0].1.len(), 20);
    }

    #[tokio::test]
    async fn test_persisted_shard_finds_its_chunks() {
        let provider = Arc::new(HashEmbedding::new(DIM));
        let fx = fixture(provider.clone(), Duration::from_secs(1800));

        let report = fx
            .indexer
            .index_document("doc", fx.connection_id, synthetic_chunks(5, 0), None)
            .await
            .unwrap();

        let projections = fx.indexer.projections().await.unwrap();
        let shards = fx.store.get_vector_shards(&report.vector_shards()).unwrap();
        let index = LshIndex::new(lsh_params(), Some(projections))
            .unwrap()
            .with_tables(shards[0].1.clone())
            .unwrap();

        let (from, _) = report.chunk_range.unwrap();
        let query = provider.vector("big chunk number0 alpha");
        let hits = index.find_similar(&query).unwrap();
        let best = hits
            .iter()
            .find(|h| h.id == from)
            .expect("chunk should match itself");
        assert!((best.similarity - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_failure_marks_document_failed() {
        // 첫 윈도우는 5번 호출, 6번째 호출(두 번째 윈도우)에서 실패
        let provider = Arc::new(HashEmbedding::failing_on(DIM, 5));
        let fx = fixture(provider, Duration::from_secs(1800));

        let document = fx.indexer.create_document("doc", fx.connection_id, None).unwrap();
        let result = fx
            .indexer
            .build_document(&document, synthetic_chunks(150, 100))
            .await;
        assert!(result.is_err());

        let doc = fx.store.get_document(document.id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Fail);
        assert!(doc.chunk_range.is_none());

        // 첫 윈도우는 되돌리지 않음
        let first_window = fx.store.chunks_in_range(1, 100).unwrap();
        assert_eq!(first_window.len(), 100);
        assert_eq!(fx.store.stats().unwrap().vector_shard_count, 1);

        let connection = fx.store.get_connection(fx.connection_id).unwrap().unwrap();
        assert!(connection.vector_shards.is_empty());
    }

    #[tokio::test]
    async fn test_failed_completion_marks_document_failed() {
        let provider = Arc::new(HashEmbedding::new(DIM));
        let fx = fixture(provider, Duration::from_secs(1800));

        // 완료 쓰기만 실패하도록 트리거 설치
        let conn = rusqlite::Connection::open(fx._dir.path().join("kb.db")).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_success BEFORE UPDATE ON documents
             WHEN NEW.status = 'success'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();
        drop(conn);

        let document = fx.indexer.create_document("doc", fx.connection_id, None).unwrap();
        let result = fx
            .indexer
            .build_document(&document, synthetic_chunks(10, 5))
            .await;
        assert!(result.is_err());

        let doc = fx.store.get_document(document.id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Fail);
        assert!(doc.vector_shards.is_empty());

        // Fail 문서는 유예 기간 없이 삭제 가능
        fx.indexer.delete_document(document.id).unwrap();
        assert!(fx.store.get_document(document.id).unwrap().is_none());

        let connection = fx.store.get_connection(fx.connection_id).unwrap().unwrap();
        assert!(connection.vector_shards.is_empty());
    }

    #[tokio::test]
    async fn test_delete_leaves_sibling_untouched() {
        let provider = Arc::new(HashEmbedding::new(DIM));
        let fx = fixture(provider, Duration::from_secs(1800));

        let a = fx
            .indexer
            .index_document("a", fx.connection_id, synthetic_chunks(30, 10), Some(vec![1]))
            .await
            .unwrap();
        let b = fx
            .indexer
            .index_document("b", fx.connection_id, synthetic_chunks(20, 5), None)
            .await
            .unwrap();

        fx.indexer.delete_document(a.document_id).unwrap();

        assert!(fx.store.get_document(a.document_id).unwrap().is_none());
        let (a_from, a_to) = a.chunk_range.unwrap();
        assert!(fx.store.chunks_in_range(a_from, a_to).unwrap().is_empty());
        assert!(fx.store.get_vector_shards(&a.vector_shards()).unwrap().is_empty());

        let (b_from, b_to) = b.chunk_range.unwrap();
        assert_eq!(fx.store.chunks_in_range(b_from, b_to).unwrap().len(), 25);
        assert_eq!(fx.store.get_vector_shards(&b.vector_shards()).unwrap().len(), 1);

        let connection = fx.store.get_connection(fx.connection_id).unwrap().unwrap();
        assert_eq!(connection.document_ids, vec![b.document_id]);
        assert_eq!(connection.vector_shards, b.vector_shards());
        assert_eq!(connection.lexical_shards, b.lexical_shards());
    }

    #[tokio::test]
    async fn test_delete_guard_for_building_document() {
        let provider = Arc::new(HashEmbedding::new(DIM));
        let fx = fixture(provider.clone(), Duration::from_secs(1800));

        let doc = fx.indexer.create_document("pending", fx.connection_id, None).unwrap();
        let err = fx.indexer.delete_document(doc.id).unwrap_err();
        match err.downcast_ref::<KbError>() {
            Some(KbError::StillBuilding { id, remaining }) => {
                assert_eq!(*id, doc.id);
                assert!(*remaining > Duration::from_secs(1700));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = fx.indexer.delete_document(9999).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KbError>(),
            Some(KbError::DocumentNotFound(9999))
        ));

        // 유예 기간이 0이면 바로 삭제 가능
        let fx = fixture(provider, Duration::ZERO);
        let doc = fx.indexer.create_document("pending", fx.connection_id, None).unwrap();
        fx.indexer.delete_document(doc.id).unwrap();
        assert!(fx.store.get_document(doc.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_document_succeeds_without_windows() {
        let provider = Arc::new(HashEmbedding::new(DIM));
        let fx = fixture(provider.clone(), Duration::from_secs(1800));

        let report = fx
            .indexer
            .index_document("empty", fx.connection_id, DocumentChunks::default(), None)
            .await
            .unwrap();

        assert!(report.windows.is_empty());
        assert!(report.chunk_range.is_none());
        assert_eq!(provider.calls(), 0);
        let doc = fx.store.get_document(report.document_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Success);
    }

    #[tokio::test]
    async fn test_projection_set_is_shared() {
        let provider = Arc::new(HashEmbedding::new(DIM));
        let fx = fixture(provider, Duration::from_secs(1800));

        let first = fx.indexer.projections().await.unwrap();
        let second = fx.indexer.projections().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fx.store.load_projections().unwrap().as_ref(), Some(first.as_ref()));
    }
}
