//! 임베딩 모듈 - 텍스트 배치를 고정 차원 벡터로 변환
//!
//! 프로바이더는 배치 하나를 평탄한 `f32` 버퍼와 `[batch, dim]` 형태로 돌려줍니다.
//! 문서 청크와 검색 쿼리는 서로 다른 태스크 태그로 인코딩합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = GeminiEmbedding::from_env()?;
//! let batch = embedder.encode(&["Hello, world!".to_string()], TaskTag::Query).await?;
//! let vector = batch.row(0);
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::KbError;

// ============================================================================
// Types
// ============================================================================

/// 인코딩 용도
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTag {
    /// 색인할 문서 청크
    Document,
    /// 검색 쿼리
    Query,
}

impl TaskTag {
    /// Gemini `taskType` 값
    pub fn gemini_task_type(&self) -> &'static str {
        match self {
            TaskTag::Document => "RETRIEVAL_DOCUMENT",
            TaskTag::Query => "RETRIEVAL_QUERY",
        }
    }
}

/// 인코딩 결과 - 행 우선 평탄 버퍼
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBatch {
    data: Vec<f32>,
    shape: [usize; 2],
}

impl EmbeddingBatch {
    /// 평탄 버퍼와 형태로 생성
    pub fn new(data: Vec<f32>, shape: [usize; 2]) -> Result<Self> {
        if data.len() != shape[0] * shape[1] {
            return Err(KbError::Embedding(format!(
                "buffer of {} floats does not match shape {:?}",
                data.len(),
                shape
            ))
            .into());
        }
        Ok(Self { data, shape })
    }

    /// 행 벡터들로 생성 (모든 행의 길이가 `dimension` 이어야 함)
    pub fn from_rows(rows: Vec<Vec<f32>>, dimension: usize) -> Result<Self> {
        let mut data = Vec::with_capacity(rows.len() * dimension);
        for row in rows.iter() {
            if row.len() != dimension {
                return Err(KbError::DimensionMismatch {
                    expected: dimension,
                    actual: row.len(),
                }
                .into());
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            data,
            shape: [rows.len(), dimension],
        })
    }

    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] == 0
    }

    pub fn dimension(&self) -> usize {
        self.shape[1]
    }

    /// `index` 번째 행
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        if index >= self.shape[0] {
            return None;
        }
        let dim = self.shape[1];
        Some(&self.data[index * dim..(index + 1) * dim])
    }

    /// 행 순회
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        // dim == 0 이면 chunks_exact 가 패닉하므로 빈 반복자로 대체
        let dim = self.shape[1].max(1);
        let take = if self.shape[1] == 0 { 0 } else { self.shape[0] };
        self.data.chunks_exact(dim).take(take)
    }

    /// 요청한 행 수/차원과 일치하는지 확인
    pub fn check_shape(&self, rows: usize, dimension: usize) -> Result<()> {
        if self.shape[0] != rows {
            return Err(KbError::Embedding(format!(
                "provider returned {} vectors for {} texts",
                self.shape[0], rows
            ))
            .into());
        }
        if self.shape[1] != dimension {
            return Err(KbError::DimensionMismatch {
                expected: dimension,
                actual: self.shape[1],
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 반환되는 배치는 입력과 같은 순서, 같은 개수의 행을 가져야 합니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 텍스트 배치 인코딩
    async fn encode(&self, texts: &[String], tag: TaskTag) -> Result<EmbeddingBatch>;

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Google Gemini Embedding
// ============================================================================

/// Gemini 배치 임베딩 API 엔드포인트 (gemini-embedding-001 - MRL 지원)
/// source: https://ai.google.dev/gemini-api/docs/embeddings
const GEMINI_BATCH_EMBED_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-embedding-001:batchEmbedContents";

const GEMINI_MODEL: &str = "models/gemini-embedding-001";

/// 기본 임베딩 차원
pub const DEFAULT_DIMENSION: usize = 768;

/// 요청당 최대 텍스트 수 (API 제한)
const MAX_BATCH_REQUESTS: usize = 100;
/// 호출 간 최소 간격 (무료 티어 60 RPM)
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(1000);
/// 429 에러 시 최대 재시도 횟수
const MAX_RETRIES: u32 = 3;
/// 재시도 시 초기 백오프 (ms)
const INITIAL_BACKOFF_MS: u64 = 2000;

/// Google Gemini 임베딩 구현체
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    dimension: usize,
    last_request: Arc<Mutex<Option<Instant>>>,
}

impl GeminiEmbedding {
    /// 차원을 지정하여 생성 (768, 1536, 3072 중 선택)
    pub fn new(api_key: String, dimension: usize) -> Result<Self> {
        if ![768, 1536, 3072].contains(&dimension) {
            return Err(KbError::InvalidConfig(format!(
                "Invalid dimension: {}. Must be 768, 1536, or 3072",
                dimension
            ))
            .into());
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            client,
            dimension,
            last_request: Arc::new(Mutex::new(None)),
        })
    }

    /// 환경변수에서 API 키를 읽어 생성
    ///
    /// 우선순위: GEMINI_API_KEY > GOOGLE_AI_API_KEY
    pub fn from_env(dimension: usize) -> Result<Self> {
        let api_key = get_api_key()?;
        let embedder = Self::new(api_key, dimension)?;
        tracing::info!("Using Gemini API embedding (dimension: {})", dimension);
        Ok(embedder)
    }

    /// 최소 호출 간격 보장 (버스트 방지)
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                let wait_time = MIN_REQUEST_INTERVAL - elapsed;
                tracing::debug!("Min interval: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// 요청 하나 (최대 100개) 전송, 429 시 지수 백오프
    async fn request_batch(&self, texts: &[&str], tag: TaskTag) -> Result<Vec<Vec<f32>>> {
        let request = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedRequest {
                    model: GEMINI_MODEL,
                    content: EmbedContent {
                        parts: vec![EmbedPart { text }],
                    },
                    task_type: tag.gemini_task_type(),
                    output_dimensionality: self.dimension,
                })
                .collect(),
        };

        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=MAX_RETRIES {
            self.throttle().await;

            // API 키는 URL이 아닌 헤더로 전송
            let response = match self
                .client
                .post(GEMINI_BATCH_EMBED_URL)
                .header("x-goog-api-key", &self.api_key)
                .json(&request)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("Failed to send embedding request: {}", e));
                    if attempt < MAX_RETRIES {
                        let backoff = backoff_for(attempt);
                        tracing::warn!(
                            "Request failed, retrying in {:?} (attempt {}/{})",
                            backoff,
                            attempt + 1,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    break;
                }
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .context("Failed to read response body")?;

            if status.is_success() {
                let parsed: BatchEmbedResponse =
                    serde_json::from_str(&body).context("Failed to parse embedding response")?;
                return Ok(parsed.embeddings.into_iter().map(|e| e.values).collect());
            }

            if status.as_u16() == 429 {
                let backoff = backoff_for(attempt);
                tracing::warn!(
                    "Rate limit hit (429), backing off {:?} (attempt {}/{})",
                    backoff,
                    attempt + 1,
                    MAX_RETRIES
                );
                last_error = Some(KbError::Embedding("rate limit exceeded (429)".to_string()).into());
                if attempt < MAX_RETRIES {
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            } else {
                let message = match serde_json::from_str::<GeminiError>(&body) {
                    Ok(error) => format!("Gemini API error ({}): {}", error.error.status, error.error.message),
                    Err(_) => format!("Gemini API error ({}): {}", status, body),
                };
                return Err(KbError::Embedding(message).into());
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Embedding failed after {} retries", MAX_RETRIES)))
    }
}

fn backoff_for(attempt: u32) -> Duration {
    Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt))
}

/// Gemini batchEmbedContents 요청 본문
#[derive(Debug, Serialize)]
struct BatchEmbedRequest<'a> {
    requests: Vec<EmbedRequest<'a>>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'static str,
    content: EmbedContent<'a>,
    #[serde(rename = "taskType")]
    task_type: &'static str,
    #[serde(rename = "outputDimensionality")]
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent<'a> {
    parts: Vec<EmbedPart<'a>>,
}

#[derive(Debug, Serialize)]
struct EmbedPart<'a> {
    text: &'a str,
}

/// Gemini API 응답
#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// Gemini API 에러 응답
#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[serde(default)]
    status: String,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn encode(&self, texts: &[String], tag: TaskTag) -> Result<EmbeddingBatch> {
        let mut rows: Vec<Vec<f32>> = vec![Vec::new(); texts.len()];

        // 빈 텍스트는 API가 거부하므로 영벡터로 채움
        let mut pending: Vec<(usize, &str)> = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                rows[i] = vec![0.0; self.dimension];
            } else {
                pending.push((i, text.as_str()));
            }
        }

        for (n, group) in pending.chunks(MAX_BATCH_REQUESTS).enumerate() {
            tracing::debug!(
                "Embedding request {} ({} texts, {:?})",
                n + 1,
                group.len(),
                tag
            );
            let batch_texts: Vec<&str> = group.iter().map(|(_, t)| *t).collect();
            let vectors = self.request_batch(&batch_texts, tag).await?;

            if vectors.len() != group.len() {
                return Err(KbError::Embedding(format!(
                    "Gemini returned {} embeddings for {} texts",
                    vectors.len(),
                    group.len()
                ))
                .into());
            }
            for ((index, _), vector) in group.iter().zip(vectors) {
                rows[*index] = vector;
            }
        }

        EmbeddingBatch::from_rows(rows, self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "gemini-embedding-001"
    }
}

// ============================================================================
// API Key Management
// ============================================================================

const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"];

/// API 키 로드 (환경변수에서)
///
/// 우선순위:
/// 1. `GEMINI_API_KEY` 환경변수
/// 2. `GOOGLE_AI_API_KEY` 환경변수
pub fn get_api_key() -> Result<String> {
    for var in API_KEY_VARS {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                tracing::debug!("Using API key from {}", var);
                return Ok(key);
            }
        }
    }

    anyhow::bail!(
        "API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY environment variable.\n\
         Get your API key at: https://aistudio.google.com/app/apikey"
    )
}

/// API 키 존재 여부 확인
pub fn has_api_key() -> bool {
    API_KEY_VARS
        .iter()
        .any(|var| std::env::var(var).map(|k| !k.is_empty()).unwrap_or(false))
}

// ============================================================================
// Test Providers
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    //! 결정적 테스트용 프로바이더

    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use tokio::sync::Semaphore;

    use super::*;
    use crate::knowledge::tokenize;

    /// 해시 bag-of-words 임베딩
    ///
    /// 토큰마다 고정 위치에 1을 더한 뒤 정규화합니다. 같은 단어를 공유하는
    /// 텍스트끼리 코사인 유사도가 높아집니다.
    pub struct HashEmbedding {
        dimension: usize,
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
    }

    impl HashEmbedding {
        pub fn new(dimension: usize) -> Self {
            Self {
                dimension,
                calls: AtomicUsize::new(0),
                fail_on_call: None,
            }
        }

        /// `n` 번째 호출(0부터)만 실패
        pub fn failing_on(dimension: usize, n: usize) -> Self {
            Self {
                fail_on_call: Some(n),
                ..Self::new(dimension)
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn vector(&self, text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; self.dimension];
            for token in tokenize(text) {
                let mut hasher = DefaultHasher::new();
                token.hash(&mut hasher);
                let h = hasher.finish();
                let idx = (h % self.dimension as u64) as usize;
                v[idx] += if (h >> 63) == 0 { 1.0 } else { -1.0 };
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                v.iter_mut().for_each(|x| *x /= norm);
            }
            v
        }
    }

    #[async_trait]
    impl EmbeddingProvider for HashEmbedding {
        async fn encode(&self, texts: &[String], _tag: TaskTag) -> Result<EmbeddingBatch> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                return Err(KbError::Embedding(format!("injected failure on call {call}")).into());
            }
            let rows = texts.iter().map(|t| self.vector(t)).collect();
            EmbeddingBatch::from_rows(rows, self.dimension)
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn name(&self) -> &str {
            "hash-bow"
        }
    }

    /// 게이트가 열릴 때까지 대기하는 프로바이더 (스케줄링 순서 검증용)
    ///
    /// 각 호출은 시작 시 첫 텍스트를 기록한 뒤 게이트 허가를 하나 소비합니다.
    /// 첫 텍스트가 `"fail"` 이면 에러를 반환합니다.
    pub struct GatedEmbedding {
        pub gate: Semaphore,
        started: StdMutex<Vec<String>>,
    }

    impl GatedEmbedding {
        pub fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                started: StdMutex::new(Vec::new()),
            }
        }

        pub fn started(&self) -> Vec<String> {
            self.started.lock().map(|s| s.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for GatedEmbedding {
        async fn encode(&self, texts: &[String], _tag: TaskTag) -> Result<EmbeddingBatch> {
            let first = texts.first().cloned().unwrap_or_default();
            if let Ok(mut started) = self.started.lock() {
                started.push(first.clone());
            }
            self.gate.acquire().await?.forget();

            if first == "fail" {
                return Err(KbError::Embedding("gated failure".to_string()).into());
            }
            EmbeddingBatch::from_rows(vec![vec![1.0, 0.0]; texts.len()], 2)
        }

        fn dimension(&self) -> usize {
            2
        }

        fn name(&self) -> &str {
            "gated"
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::testing::HashEmbedding;
    use super::*;
    use crate::knowledge::cosine_similarity;

    #[test]
    fn test_invalid_dimension() {
        let result = GeminiEmbedding::new("fake_key".to_string(), 999);
        let err = result.err().unwrap();
        assert!(err.to_string().contains("Invalid dimension"));
    }

    #[test]
    fn test_valid_dimensions() {
        for dim in [768, 1536, 3072] {
            assert!(GeminiEmbedding::new("fake_key".to_string(), dim).is_ok());
        }
    }

    #[test]
    fn test_task_types() {
        assert_eq!(TaskTag::Document.gemini_task_type(), "RETRIEVAL_DOCUMENT");
        assert_eq!(TaskTag::Query.gemini_task_type(), "RETRIEVAL_QUERY");
    }

    #[test]
    fn test_batch_request_serialization() {
        let request = BatchEmbedRequest {
            requests: vec![EmbedRequest {
                model: GEMINI_MODEL,
                content: EmbedContent {
                    parts: vec![EmbedPart { text: "hello" }],
                },
                task_type: TaskTag::Query.gemini_task_type(),
                output_dimensionality: 768,
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["requests"][0]["taskType"], "RETRIEVAL_QUERY");
        assert_eq!(json["requests"][0]["outputDimensionality"], 768);
        assert_eq!(json["requests"][0]["content"]["parts"][0]["text"], "hello");
    }

    #[test]
    fn test_batch_rows_and_shape() {
        let batch = EmbeddingBatch::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]], 2).unwrap();
        assert_eq!(batch.shape(), [2, 2]);
        assert_eq!(batch.row(1), Some(&[3.0, 4.0][..]));
        assert_eq!(batch.row(2), None);
        assert_eq!(batch.rows().count(), 2);
        assert!(batch.check_shape(2, 2).is_ok());
        assert!(batch.check_shape(3, 2).is_err());

        assert!(EmbeddingBatch::from_rows(vec![vec![1.0]], 2).is_err());
        assert!(EmbeddingBatch::new(vec![1.0; 5], [2, 2]).is_err());
        assert_eq!(EmbeddingBatch::new(Vec::new(), [3, 0]).unwrap().rows().count(), 0);
    }

    #[tokio::test]
    async fn test_hash_embedding_is_deterministic() {
        let provider = HashEmbedding::new(64);
        let texts = vec![
            "vector search engine".to_string(),
            "vector search engine".to_string(),
            "completely different words".to_string(),
        ];
        let batch = provider.encode(&texts, TaskTag::Document).await.unwrap();

        let a = batch.row(0).unwrap();
        let b = batch.row(1).unwrap();
        let c = batch.row(2).unwrap();
        assert!((cosine_similarity(a, b) - 1.0).abs() < 1e-5);
        assert!(cosine_similarity(a, c) < 0.9);
    }

    #[tokio::test]
    async fn test_hash_embedding_injected_failure() {
        let provider = HashEmbedding::failing_on(8, 1);
        let texts = vec!["a text".to_string()];
        assert!(provider.encode(&texts, TaskTag::Document).await.is_ok());
        assert!(provider.encode(&texts, TaskTag::Document).await.is_err());
        assert!(provider.encode(&texts, TaskTag::Document).await.is_ok());
        assert_eq!(provider.calls(), 3);
    }
}
