//! 설정 - 기본값 + 환경변수 오버라이드
//!
//! ```text
//! PALANK_KB_DATA_DIR              데이터 디렉토리
//! PALANK_KB_DIMENSION             임베딩 차원 (768 / 1536 / 3072)
//! PALANK_KB_WORKERS               임베딩 워커 수
//! PALANK_KB_LSH_TABLES            LSH 테이블 수
//! PALANK_KB_LSH_HASHES            테이블당 해시 수
//! PALANK_KB_SIMILARITY_THRESHOLD  벡터 유사도 하한
//! PALANK_KB_VECTOR_WEIGHT         벡터 가중치 (렉시컬 = 1 - 벡터)
//! PALANK_KB_CANDIDATE_LIMIT       스트림별 후보 수
//! PALANK_KB_MIN_SCORE             최종 점수 하한
//! PALANK_KB_WINDOW_SIZE           빌드 윈도우 크기
//! PALANK_KB_EMBED_BATCH           임베딩 서브배치 크기
//! PALANK_KB_DELETE_GRACE_SECS     빌드 중 문서 삭제 유예 (초)
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;

use crate::error::KbError;
use crate::knowledge::{BuildConfig, LshParams, RankerConfig, EMBEDDING_DIMENSION};

/// 빌드 중 문서 삭제 보호 기간
pub const DEFAULT_DELETE_GRACE: Duration = Duration::from_secs(30 * 60);

/// 지식베이스 설정
#[derive(Debug, Clone)]
pub struct KbConfig {
    pub data_dir: PathBuf,
    /// 임베딩 워커 풀 크기 (시작 시 고정)
    pub workers: usize,
    /// LSH 파라미터 (`dimensions` 가 임베딩 차원)
    pub lsh: LshParams,
    pub ranker: RankerConfig,
    pub build: BuildConfig,
    pub delete_grace: Duration,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            workers: 1,
            lsh: LshParams::default(),
            ranker: RankerConfig::default(),
            build: BuildConfig::default(),
            delete_grace: DEFAULT_DELETE_GRACE,
        }
    }
}

impl KbConfig {
    /// 지정 디렉토리를 사용하는 기본 설정
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// 기본값에 환경변수 오버라이드 적용
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = env_string("PALANK_KB_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse("PALANK_KB_DIMENSION")? {
            config.lsh.dimensions = v;
        }
        if let Some(v) = env_parse("PALANK_KB_WORKERS")? {
            config.workers = v;
        }
        if let Some(v) = env_parse("PALANK_KB_LSH_TABLES")? {
            config.lsh.num_tables = v;
        }
        if let Some(v) = env_parse("PALANK_KB_LSH_HASHES")? {
            config.lsh.hashes_per_table = v;
        }
        if let Some(v) = env_parse("PALANK_KB_SIMILARITY_THRESHOLD")? {
            config.lsh.similarity_threshold = v;
        }
        if let Some(v) = env_parse::<f32>("PALANK_KB_VECTOR_WEIGHT")? {
            config.ranker.vector_weight = v;
            config.ranker.lexical_weight = 1.0 - v;
        }
        if let Some(v) = env_parse("PALANK_KB_CANDIDATE_LIMIT")? {
            config.ranker.candidate_limit = v;
        }
        if let Some(v) = env_parse("PALANK_KB_MIN_SCORE")? {
            config.ranker.min_score = v;
        }
        if let Some(v) = env_parse("PALANK_KB_WINDOW_SIZE")? {
            config.build.window_size = v;
        }
        if let Some(v) = env_parse("PALANK_KB_EMBED_BATCH")? {
            config.build.embed_batch_size = v;
        }
        if let Some(secs) = env_parse("PALANK_KB_DELETE_GRACE_SECS")? {
            config.delete_grace = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// 임베딩 차원
    pub fn dimension(&self) -> usize {
        self.lsh.dimensions
    }

    /// SQLite 파일 경로
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("knowledge.db")
    }

    /// 값 검증
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(KbError::InvalidConfig(msg).into()) };

        if self.workers == 0 {
            return invalid("workers must be at least 1".to_string());
        }
        if self.lsh.dimensions == 0 || self.lsh.num_tables == 0 || self.lsh.hashes_per_table == 0 {
            return invalid(format!(
                "LSH shape must be non-zero (dim={}, tables={}, hashes={})",
                self.lsh.dimensions, self.lsh.num_tables, self.lsh.hashes_per_table
            ));
        }
        if !(-1.0..=1.0).contains(&self.lsh.similarity_threshold) {
            return invalid(format!(
                "similarity threshold {} is outside [-1, 1]",
                self.lsh.similarity_threshold
            ));
        }

        let r = &self.ranker;
        if !(0.0..=1.0).contains(&r.vector_weight) || !(0.0..=1.0).contains(&r.lexical_weight) {
            return invalid(format!(
                "weights must be within [0, 1] (vector={}, lexical={})",
                r.vector_weight, r.lexical_weight
            ));
        }
        if ((r.vector_weight + r.lexical_weight) - 1.0).abs() > 1e-4 {
            return invalid(format!(
                "vector and lexical weights must sum to 1 (got {})",
                r.vector_weight + r.lexical_weight
            ));
        }
        if r.candidate_limit == 0 || r.search_workers == 0 {
            return invalid("candidate_limit and search_workers must be at least 1".to_string());
        }
        if self.build.window_size == 0 || self.build.embed_batch_size == 0 {
            return invalid("window_size and embed_batch_size must be at least 1".to_string());
        }

        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 기본 데이터 디렉토리 (`<local data dir>/.palank-kb`)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".palank-kb")
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => {
            let value = parse_value(key, &raw)?;
            tracing::debug!("Config override from {}", key);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// 환경변수 값 파싱 (실패 시 `KbError::InvalidConfig`)
fn parse_value<T>(key: &str, raw: &str) -> Result<T, KbError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| KbError::InvalidConfig(format!("Invalid value for {}: '{}' ({})", key, raw, e)))
}

// ============================================================================
// Tests
// ============================================================================
