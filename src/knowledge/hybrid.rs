//! 하이브리드 검색 - LSH 벡터 샤드 + BM25 렉시컬 샤드 점수 융합
//!
//! 1. 쿼리를 search 큐로 한 번 임베딩
//! 2. 범위 내 벡터/렉시컬 샤드를 연속 구간으로 나눠 블로킹 워커에서 병렬 검색
//! 3. 스트림별 상위 N개로 절단
//! 4. 렉시컬 후보로 임시 인덱스를 다시 만들어 재채점, 최대값으로 정규화
//! 5. 가중 융합 (렉시컬 전용 결과는 tail magnitude 로 스케일)
//! 6. 최소 점수 미만 제거, 정렬
//! 7. 청크/문서 materialize, 같은 텍스트 제거, 예산 적용

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::try_join_all;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::dispatcher::EmbeddingDispatcher;
use crate::error::KbError;

use super::lexical::{LexicalHit, LexicalIndex};
use super::lsh::{LshIndex, LshParams, ProjectionSet, SimilarHit};
use super::store::{Document, KnowledgeStore, TextChunk};

// ============================================================================
// Types
// ============================================================================

/// 랭커 설정
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankerConfig {
    pub vector_weight: f32,
    pub lexical_weight: f32,
    /// 스트림별 후보 수 (top-N)
    pub candidate_limit: usize,
    /// 최종 점수 하한
    pub min_score: f32,
    /// 샤드 검색 블로킹 워커 수
    pub search_workers: usize,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.8,
            lexical_weight: 0.2,
            candidate_limit: 100,
            min_score: 0.1,
            search_workers: 4,
        }
    }
}

/// 결과 예산
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultBudget {
    /// 상위 k개
    TopK(usize),
    /// 추정 토큰 합계 상한
    MaxTokens(usize),
}

/// 검색 방법
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchMethod {
    /// 벡터 검색에서만 발견
    Vector,
    /// 렉시컬 검색에서만 발견
    Lexical,
    /// 양쪽 모두에서 발견
    Hybrid,
}

/// 융합 결과 (materialize 전)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedHit {
    pub id: i64,
    pub score: f32,
    pub vector_score: Option<f32>,
    pub lexical_score: Option<f32>,
    pub method: SearchMethod,
}

/// 최종 검색 결과
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub chunk: TextChunk,
    pub document: Document,
    pub score: f32,
    pub vector_score: Option<f32>,
    pub lexical_score: Option<f32>,
    pub method: SearchMethod,
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
pub struct HybridRetriever {
    store: Arc<KnowledgeStore>,
    dispatcher: Arc<EmbeddingDispatcher>,
    lsh: LshParams,
    config: RankerConfig,
    projections: Mutex<Option<Arc<ProjectionSet>>>,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<KnowledgeStore>,
        dispatcher: Arc<EmbeddingDispatcher>,
        lsh: LshParams,
        config: RankerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            lsh,
            config,
            projections: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RankerConfig {
        &self.config
    }

    /// 저장된 투영 집합 (아직 없으면 None)
    async fn projections(&self) -> Result<Option<Arc<ProjectionSet>>> {
        let mut cached = self.projections.lock().await;
        if let Some(set) = cached.as_ref() {
            return Ok(Some(set.clone()));
        }

        let Some(set) = self.store.load_projections()? else {
            return Ok(None);
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
        Ok(Some(set))
    }

    /// 하이브리드 검색
    ///
    /// # Arguments
    /// * `query` - 검색 쿼리
    /// * `connection_ids` - 검색 범위 (비어 있으면 전체 연결)
    /// * `budget` - 결과 예산
    pub async fn search(
        &self,
        query: &str,
        connection_ids: &[i64],
        budget: ResultBudget,
    ) -> Result<Vec<RankedChunk>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let Some(projections) = self.projections().await? else {
            tracing::debug!("No projection set yet; nothing indexed");
            return Ok(Vec::new());
        };

        let (vector_shards, lexical_shards) = self.scope(connection_ids)?;
        if vector_shards.is_empty() && lexical_shards.is_empty() {
            return Ok(Vec::new());
        }

        // 1. 쿼리 임베딩
        let query_vector = Arc::new(self.dispatcher.embed_query(query).await?);

        // 2. 샤드 병렬 검색
        let vector_search = {
            let store = self.store.clone();
            let params = self.lsh;
            let query_vector = query_vector.clone();
            fan_out(&vector_shards, self.config.search_workers, move |ids| {
                let index = LshIndex::new(params, Some(projections.clone()))?;
                let mut hits = Vec::new();
                for (_, tables) in store.get_vector_shards(ids)? {
                    hits.extend(index.find_similar_in(&query_vector, &tables)?);
                }
                Ok(hits)
            })
        };
        let lexical_search = {
            let store = self.store.clone();
            let query = query.to_string();
            let limit = self.config.candidate_limit;
            fan_out(&lexical_shards, self.config.search_workers, move |ids| {
                let mut hits = Vec::new();
                for (_, index) in store.get_lexical_shards(ids)? {
                    hits.extend(index.search(&query, limit));
                }
                Ok(hits)
            })
        };
        let (mut vector_hits, mut lexical_hits) = tokio::try_join!(vector_search, lexical_search)?;

        // 3. 스트림별 상위 N
        vector_hits.sort_by(|a, b| desc(a.similarity, b.similarity).then(a.id.cmp(&b.id)));
        vector_hits.truncate(self.config.candidate_limit);
        lexical_hits.sort_by(|a, b| desc(a.score, b.score).then(a.id.cmp(&b.id)));
        lexical_hits.truncate(self.config.candidate_limit);

        tracing::debug!(
            "Candidates: {} vector hit(s) from {} shard(s), {} lexical hit(s) from {} shard(s)",
            vector_hits.len(),
            vector_shards.len(),
            lexical_hits.len(),
            lexical_shards.len()
        );

        let candidate_ids: Vec<i64> = vector_hits
            .iter()
            .map(|h| h.id)
            .chain(lexical_hits.iter().map(|h| h.id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let chunks: HashMap<i64, TextChunk> = self
            .store
            .get_chunks(&candidate_ids)?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();

        // 4. 렉시컬 재채점
        let lexical_rows: Vec<(i64, &str)> = lexical_hits
            .iter()
            .filter_map(|h| chunks.get(&h.id).map(|c| (c.id, c.text.as_str())))
            .collect();
        let lexical_normalized = rerank_lexical(query, &lexical_rows);

        // 5-6. 융합
        let fused = fuse_scores(&vector_hits, &lexical_normalized, &self.config);

        // 7. materialize
        let document_ids: Vec<i64> = fused
            .iter()
            .filter_map(|h| chunks.get(&h.id).map(|c| c.document_id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let documents: HashMap<i64, Document> = self
            .store
            .get_documents(&document_ids)?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();

        let mut seen_texts = HashSet::new();
        let mut results = Vec::with_capacity(fused.len());
        for hit in fused {
            let Some(chunk) = chunks.get(&hit.id) else {
                continue;
            };
            let Some(document) = documents.get(&chunk.document_id) else {
                continue;
            };
            if !seen_texts.insert(chunk.text.as_str()) {
                continue;
            }
            results.push(RankedChunk {
                chunk: chunk.clone(),
                document: document.clone(),
                score: hit.score,
                vector_score: hit.vector_score,
                lexical_score: hit.lexical_score,
                method: hit.method,
            });
        }

        let results = apply_budget(results, budget);
        tracing::info!("Search '{}' returned {} result(s)", query, results.len());
        Ok(results)
    }

    /// 연결 범위의 샤드 ID 합집합
    fn scope(&self, connection_ids: &[i64]) -> Result<(Vec<i64>, Vec<i64>)> {
        let connections = if connection_ids.is_empty() {
            self.store.list_connections()?
        } else {
            let mut found = Vec::with_capacity(connection_ids.len());
            for id in connection_ids {
                let connection = self
                    .store
                    .get_connection(*id)?
                    .ok_or_else(|| KbError::ConnectionNotFound(id.to_string()))?;
                found.push(connection);
            }
            found
        };

        let mut vector = Vec::new();
        let mut lexical = Vec::new();
        for connection in connections {
            vector.extend(connection.vector_shards);
            lexical.extend(connection.lexical_shards);
        }
        vector.sort_unstable();
        vector.dedup();
        lexical.sort_unstable();
        lexical.dedup();
        Ok((vector, lexical))
    }
}

/// 샤드 ID를 연속 구간으로 나눠 블로킹 워커에서 처리 후 결과 연결
async fn fan_out<T, F>(ids: &[i64], workers: usize, search: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(&[i64]) -> Result<Vec<T>> + Send + Sync + 'static,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let search = Arc::new(search);
    let per_worker = ids.len().div_ceil(workers.max(1));
    let handles = ids.chunks(per_worker).map(|range| {
        let range = range.to_vec();
        let search = search.clone();
        tokio::task::spawn_blocking(move || search(&range))
    });

    let mut merged = Vec::new();
    for partial in try_join_all(handles).await.context("Shard search worker panicked")? {
        merged.extend(partial?);
    }
    Ok(merged)
}

// ============================================================================
// Scoring
// ============================================================================

#[inline]
fn desc(a: f32, b: f32) -> std::cmp::Ordering {
    b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
}

/// 렉시컬 후보 재채점
///
/// 샤드마다 용어 통계가 달라 원점수는 비교할 수 없으므로 후보만으로 임시
/// 인덱스를 만들어 다시 검색하고, 최대 점수로 나눠 (0, 1] 로 정규화합니다.
pub fn rerank_lexical(query: &str, candidates: &[(i64, &str)]) -> Vec<LexicalHit> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let index = LexicalIndex::build(candidates.iter().copied());
    let mut hits = index.search(query, candidates.len());

    let max = hits.iter().map(|h| h.score).fold(0.0f32, f32::max);
    if max <= 0.0 {
        return Vec::new();
    }
    for hit in hits.iter_mut() {
        hit.score /= max;
    }
    hits
}

/// 렉시컬 전용 결과 스케일
///
/// 벡터 점수를 내림차순 정렬했을 때 `floor(vector_weight * len)` 위치의 값
/// (마지막 원소로 clamp). 벡터 결과가 없으면 1.
pub fn tail_magnitude(vector_scores: &[f32], vector_weight: f32) -> f32 {
    if vector_scores.is_empty() {
        return 1.0;
    }

    let mut sorted = vector_scores.to_vec();
    sorted.sort_by(|a, b| desc(*a, *b));

    let index = (f64::from(vector_weight) * sorted.len() as f64).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// 벡터 점수와 정규화된 렉시컬 점수 융합
///
/// - 양쪽: `Wv * v + Wf * l`
/// - 벡터만: `v`
/// - 렉시컬만: `l * tail_magnitude`
///
/// `min_score` 미만은 제거하고 점수 내림차순 (동점은 ID 오름차순) 으로 정렬합니다.
pub fn fuse_scores(
    vector_hits: &[SimilarHit],
    lexical_hits: &[LexicalHit],
    config: &RankerConfig,
) -> Vec<FusedHit> {
    let vector_scores: Vec<f32> = vector_hits.iter().map(|h| h.similarity).collect();
    let tail = tail_magnitude(&vector_scores, config.vector_weight);

    let mut vector: HashMap<i64, f32> = HashMap::new();
    for hit in vector_hits {
        let entry = vector.entry(hit.id).or_insert(hit.similarity);
        *entry = entry.max(hit.similarity);
    }
    let mut lexical: HashMap<i64, f32> = HashMap::new();
    for hit in lexical_hits {
        let entry = lexical.entry(hit.id).or_insert(hit.score);
        *entry = entry.max(hit.score);
    }

    let ids: HashSet<i64> = vector.keys().chain(lexical.keys()).copied().collect();

    let mut fused: Vec<FusedHit> = ids
        .into_iter()
        .filter_map(|id| {
            let v = vector.get(&id).copied();
            let l = lexical.get(&id).copied();
            let (score, method) = match (v, l) {
                (Some(v), Some(l)) => (
                    config.vector_weight * v + config.lexical_weight * l,
                    SearchMethod::Hybrid,
                ),
                (Some(v), None) => (v, SearchMethod::Vector),
                (None, Some(l)) => (l * tail, SearchMethod::Lexical),
                (None, None) => return None,
            };
            Some(FusedHit {
                id,
                score,
                vector_score: v,
                lexical_score: l,
                method,
            })
        })
        .filter(|h| h.score >= config.min_score)
        .collect();

    fused.sort_by(|a, b| desc(a.score, b.score).then(a.id.cmp(&b.id)));
    fused
}

/// 추정 토큰 수: CJK 문자당 1 + 나머지 문자 4개당 1 (올림)
pub fn estimate_tokens(text: &str) -> usize {
    let (cjk, other) = text.chars().fold((0usize, 0usize), |(cjk, other), c| {
        if is_cjk(c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });
    cjk + other.div_ceil(4)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{1100}'..='\u{11FF}'   // Hangul Jamo
        | '\u{3040}'..='\u{30FF}' // Hiragana, Katakana
        | '\u{3130}'..='\u{318F}' // Hangul Compatibility Jamo
        | '\u{3400}'..='\u{4DBF}' // CJK Extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK Unified
        | '\u{AC00}'..='\u{D7A3}' // Hangul Syllables
        | '\u{F900}'..='\u{FAFF}' // CJK Compatibility
    )
}

/// 예산 적용 (입력은 점수 내림차순)
pub fn apply_budget(mut results: Vec<RankedChunk>, budget: ResultBudget) -> Vec<RankedChunk> {
    match budget {
        ResultBudget::TopK(k) => {
            results.truncate(k);
        }
        ResultBudget::MaxTokens(ceiling) => {
            let mut total: usize = results.iter().map(|r| estimate_tokens(&r.chunk.text)).sum();
            while total > ceiling {
                match results.pop() {
                    Some(dropped) => total -= estimate_tokens(&dropped.chunk.text),
                    None => break,
                }
            }
        }
    }
    results
}

// ============================================================================
// Tests
// ============================================================================
