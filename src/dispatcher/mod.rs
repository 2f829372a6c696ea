//! 임베딩 태스크 디스패처 - 검색 우선 2단 큐 + 고정 크기 워커 풀
//!
//! ```text
//! ┌───────────┐   submit   ┌──────────────┐         ┌───────────────┐
//! │ Retriever │──────────▶│ search queue │──┐      │ Worker (permit)│──▶ provider.encode
//! └───────────┘            └──────────────┘  ├─────▶│ Worker (permit)│
//! ┌───────────┐   submit   ┌──────────────┐  │      └───────────────┘
//! │  Indexer  │──────────▶│ build queue  │──┘ dispatch loop
//! └───────────┘            └──────────────┘    (Notify + Semaphore)
//! ```
//!
//! 디스패치 루프는 워커 허가를 먼저 얻은 뒤 search 큐를 build 큐보다 항상
//! 먼저 비웁니다. 큐가 비어 있으면 enqueue 알림을 기다립니다 (폴링 없음).
//! 태스크마다 `oneshot` 응답 채널이 있으므로 한 태스크의 실패는 해당
//! 요청자에게만 전달됩니다.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::embedding::{EmbeddingBatch, EmbeddingProvider, TaskTag};
use crate::error::KbError;

// ============================================================================
// Types
// ============================================================================

/// 대상 큐
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// 대화형 검색 (항상 우선)
    Search,
    /// 대량 색인 빌드
    Build,
}

/// 큐에 들어가는 작업 단위
struct EmbedTask {
    texts: Vec<String>,
    tag: TaskTag,
    reply: oneshot::Sender<Result<EmbeddingBatch>>,
}

#[derive(Default)]
struct Queues {
    search: VecDeque<EmbedTask>,
    build: VecDeque<EmbedTask>,
    closed: bool,
}

enum Next {
    Task(EmbedTask),
    Empty,
    Closed,
}

/// 디스패처 통계
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub provider: String,
    pub workers: usize,
    pub search_queued: usize,
    pub build_queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
}

struct Inner {
    queues: Mutex<Queues>,
    notify: Notify,
    workers: Arc<Semaphore>,
    worker_count: usize,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Inner {
    fn queues(&self) -> MutexGuard<'_, Queues> {
        // 큐 상태는 push/pop 단위로만 바뀌므로 poison 이후에도 일관됨
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_task(&self) -> Next {
        let mut queues = self.queues();
        if let Some(task) = queues.search.pop_front() {
            return Next::Task(task);
        }
        if let Some(task) = queues.build.pop_front() {
            return Next::Task(task);
        }
        if queues.closed {
            Next::Closed
        } else {
            Next::Empty
        }
    }

    /// 닫기 + 대기 중인 태스크 회수
    fn close(&self) -> Vec<EmbedTask> {
        let drained = {
            let mut queues = self.queues();
            queues.closed = true;
            let mut drained: Vec<EmbedTask> = queues.search.drain(..).collect();
            drained.extend(queues.build.drain(..));
            drained
        };
        self.notify.notify_one();
        drained
    }
}

// ============================================================================
// PendingEmbedding
// ============================================================================

/// 제출된 태스크의 결과 핸들
///
/// 드롭하면 결과를 버립니다. 이미 워커에 배정된 인코딩은 취소되지 않습니다.
pub struct PendingEmbedding {
    rx: oneshot::Receiver<Result<EmbeddingBatch>>,
}

impl PendingEmbedding {
    /// 결과 대기
    pub async fn wait(self) -> Result<EmbeddingBatch> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(KbError::Embedding("embedding worker dropped the request".to_string()).into()),
        }
    }
}

// ============================================================================
// EmbeddingDispatcher
// ============================================================================

/// 임베딩 디스패처
///
/// `KnowledgeBase` 가 소유하며 `start` / `shutdown` 으로 수명을 관리합니다.
pub struct EmbeddingDispatcher {
    inner: Arc<Inner>,
    provider_name: String,
    dimension: usize,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddingDispatcher {
    /// 디스패치 루프 시작 (tokio 런타임 안에서 호출)
    pub fn start(provider: Arc<dyn EmbeddingProvider>, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(KbError::InvalidConfig("dispatcher needs at least one worker".to_string()).into());
        }

        let inner = Arc::new(Inner {
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            workers: Arc::new(Semaphore::new(workers)),
            worker_count: workers,
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let provider_name = provider.name().to_string();
        let dimension = provider.dimension();
        let handle = tokio::spawn(dispatch_loop(inner.clone(), provider));

        tracing::info!(
            "Embedding dispatcher started (provider={}, workers={})",
            provider_name,
            workers
        );

        Ok(Self {
            inner,
            provider_name,
            dimension,
            loop_handle: Mutex::new(Some(handle)),
        })
    }

    /// 프로바이더 임베딩 차원
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// 태스크 제출
    pub fn submit(&self, kind: QueueKind, texts: Vec<String>, tag: TaskTag) -> Result<PendingEmbedding> {
        let (tx, rx) = oneshot::channel();
        let task = EmbedTask {
            texts,
            tag,
            reply: tx,
        };

        {
            let mut queues = self.inner.queues();
            if queues.closed {
                return Err(KbError::DispatcherClosed.into());
            }
            match kind {
                QueueKind::Search => queues.search.push_back(task),
                QueueKind::Build => queues.build.push_back(task),
            }
        }

        self.inner.notify.notify_one();
        Ok(PendingEmbedding { rx })
    }

    /// 쿼리 하나 임베딩 (search 큐)
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let batch = self
            .submit(QueueKind::Search, vec![query.to_string()], TaskTag::Query)?
            .wait()
            .await?;
        batch
            .row(0)
            .map(<[f32]>::to_vec)
            .ok_or_else(|| KbError::Embedding("empty query embedding".to_string()).into())
    }

    /// 문서 청크 서브배치 임베딩 (build 큐)
    pub async fn embed_documents(&self, texts: Vec<String>) -> Result<EmbeddingBatch> {
        self.submit(QueueKind::Build, texts, TaskTag::Document)?
            .wait()
            .await
    }

    pub fn stats(&self) -> DispatcherStats {
        let (search_queued, build_queued) = {
            let queues = self.inner.queues();
            (queues.search.len(), queues.build.len())
        };
        DispatcherStats {
            provider: self.provider_name.clone(),
            workers: self.inner.worker_count,
            search_queued,
            build_queued,
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    /// 종료
    ///
    /// 대기 중인 태스크는 `DispatcherClosed` 로 거절하고, 이후 제출도 거절합니다.
    /// 이미 실행 중인 인코딩은 끝까지 진행됩니다.
    pub async fn shutdown(&self) -> Result<()> {
        let drained = self.inner.close();
        if !drained.is_empty() {
            tracing::warn!("Rejecting {} queued embedding task(s) on shutdown", drained.len());
        }
        for task in drained {
            let _ = task.reply.send(Err(KbError::DispatcherClosed.into()));
        }

        let handle = self
            .loop_handle
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .take();
        if let Some(handle) = handle {
            handle.await.context("Dispatch loop panicked")?;
            tracing::info!("Embedding dispatcher stopped");
        }
        Ok(())
    }
}

impl Drop for EmbeddingDispatcher {
    fn drop(&mut self) {
        for task in self.inner.close() {
            let _ = task.reply.send(Err(KbError::DispatcherClosed.into()));
        }
    }
}

/// 디스패치 루프 - 생산자와 워커 사이의 유일한 직렬화 지점
async fn dispatch_loop(inner: Arc<Inner>, provider: Arc<dyn EmbeddingProvider>) {
    loop {
        let permit = match inner.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let task = loop {
            match inner.next_task() {
                Next::Task(task) => break Some(task),
                Next::Closed => break None,
                Next::Empty => inner.notify.notified().await,
            }
        };
        let Some(task) = task else {
            break;
        };

        // 요청자가 이미 포기했으면 인코딩하지 않음
        if task.reply.is_closed() {
            tracing::debug!("Skipping abandoned embedding task ({} texts)", task.texts.len());
            continue;
        }

        inner.in_flight.fetch_add(1, Ordering::Relaxed);
        let provider = provider.clone();
        let inner = inner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let expected = task.texts.len();
            let result = provider
                .encode(&task.texts, task.tag)
                .await
                .and_then(|batch| {
                    batch.check_shape(expected, provider.dimension())?;
                    Ok(batch)
                });

            match &result {
                Ok(_) => {
                    inner.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Embedding task failed ({} texts): {:#}", expected, e);
                }
            }
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);

            // 수신자가 드롭된 경우 결과는 버림
            let _ = task.reply.send(result);
        });
    }

    tracing::debug!("Embedding dispatch loop exited");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::{GatedEmbedding, HashEmbedding};

    fn texts(s: &str) -> Vec<String> {
        vec![s.to_string()]
    }

    async fn wait_until_started(provider: &GatedEmbedding, n: usize) {
        while provider.started().len() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_search_queue_has_priority() {
        let provider = Arc::new(GatedEmbedding::new());
        let dispatcher = EmbeddingDispatcher::start(provider.clone(), 1).unwrap();

        let a = dispatcher.submit(QueueKind::Build, texts("A"), TaskTag::Document).unwrap();
        wait_until_started(&provider, 1).await;

        let b = dispatcher.submit(QueueKind::Build, texts("B"), TaskTag::Document).unwrap();
        let c = dispatcher.submit(QueueKind::Build, texts("C"), TaskTag::Document).unwrap();
        let s = dispatcher.submit(QueueKind::Search, texts("S"), TaskTag::Query).unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.build_queued, 2);
        assert_eq!(stats.search_queued, 1);
        assert_eq!(stats.in_flight, 1);

        provider.gate.add_permits(4);
        for pending in [a, s, b, c] {
            pending.wait().await.unwrap();
        }

        assert_eq!(provider.started(), vec!["A", "S", "B", "C"]);
        assert_eq!(dispatcher.stats().completed, 4);
        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_requester() {
        let provider = Arc::new(GatedEmbedding::new());
        provider.gate.add_permits(3);
        let dispatcher = EmbeddingDispatcher::start(provider.clone(), 2).unwrap();

        let ok1 = dispatcher.submit(QueueKind::Build, texts("ok"), TaskTag::Document).unwrap();
        let bad = dispatcher.submit(QueueKind::Build, texts("fail"), TaskTag::Document).unwrap();
        let ok2 = dispatcher.submit(QueueKind::Search, texts("q"), TaskTag::Query).unwrap();

        assert!(ok1.wait().await.is_ok());
        assert!(bad.wait().await.is_err());
        assert!(ok2.wait().await.is_ok());

        let stats = dispatcher.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_queued_and_new_tasks() {
        let provider = Arc::new(GatedEmbedding::new());
        let dispatcher = EmbeddingDispatcher::start(provider.clone(), 1).unwrap();

        let running = dispatcher.submit(QueueKind::Build, texts("A"), TaskTag::Document).unwrap();
        wait_until_started(&provider, 1).await;
        let queued = dispatcher.submit(QueueKind::Build, texts("B"), TaskTag::Document).unwrap();

        provider.gate.add_permits(1);
        dispatcher.shutdown().await.unwrap();

        assert!(running.wait().await.is_ok());
        let err = queued.wait().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<KbError>(), Some(KbError::DispatcherClosed)));

        let err = dispatcher
            .submit(QueueKind::Search, texts("late"), TaskTag::Query)
            .err()
            .unwrap();
        assert!(matches!(err.downcast_ref::<KbError>(), Some(KbError::DispatcherClosed)));
    }

    #[tokio::test]
    async fn test_embed_query_and_documents() {
        let provider = Arc::new(HashEmbedding::new(16));
        let dispatcher = EmbeddingDispatcher::start(provider, 1).unwrap();

        let query = dispatcher.embed_query("hybrid search").await.unwrap();
        assert_eq!(query.len(), 16);

        let batch = dispatcher
            .embed_documents(vec!["one chunk".to_string(), "two chunk".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.shape(), [2, 16]);
        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_pending_task_is_skipped() {
        let provider = Arc::new(GatedEmbedding::new());
        let dispatcher = EmbeddingDispatcher::start(provider.clone(), 1).unwrap();

        let running = dispatcher.submit(QueueKind::Build, texts("A"), TaskTag::Document).unwrap();
        wait_until_started(&provider, 1).await;

        let abandoned = dispatcher.submit(QueueKind::Build, texts("X"), TaskTag::Document).unwrap();
        drop(abandoned);
        let next = dispatcher.submit(QueueKind::Build, texts("Y"), TaskTag::Document).unwrap();

        provider.gate.add_permits(2);
        running.wait().await.unwrap();
        next.wait().await.unwrap();

        assert_eq!(provider.started(), vec!["A", "Y"]);
        let stats = dispatcher.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 0);
        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_dispatcher_has_nothing_in_flight() {
        let provider = Arc::new(HashEmbedding::new(8));
        let dispatcher = EmbeddingDispatcher::start(provider, 2).unwrap();
        assert_eq!(dispatcher.stats().in_flight, 0);

        dispatcher.embed_query("idle check").await.unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.completed, 1);
        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let provider = Arc::new(HashEmbedding::new(4));
        assert!(EmbeddingDispatcher::start(provider, 0).is_err());
    }
}
