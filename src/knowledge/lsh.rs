//! LSH 벡터 인덱스 - 랜덤 초평면 기반 근사 최근접 이웃 검색
//!
//! 각 테이블은 `hashes_per_table` 개의 투영 벡터로 H-bit 시그니처를 만들고,
//! 같은 시그니처 버킷에 들어온 후보만 정확한 코사인 유사도로 비교합니다.
//!
//! - 테이블 수 증가: 재현율 증가, 메모리/빌드 시간 선형 증가
//! - 테이블당 해시 수 증가: 버킷 축소 (빠른 조회, 테이블당 재현율 감소)
//!
//! 투영 집합([`ProjectionSet`])은 지식베이스당 한 번 생성되어 모든 샤드가 공유합니다.
//! 그래야 샤드 간 시그니처가 비교 가능합니다.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::KbError;

/// 벡터 임베딩 차원 (Gemini gemini-embedding-001 기본값)
pub const EMBEDDING_DIMENSION: usize = 768;

// ============================================================================
// Types
// ============================================================================

/// LSH 파라미터
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LshParams {
    pub dimensions: usize,
    pub num_tables: usize,
    pub hashes_per_table: usize,
    /// 이 값을 **초과**하는 유사도만 결과에 포함
    pub similarity_threshold: f32,
}

impl Default for LshParams {
    fn default() -> Self {
        Self {
            dimensions: EMBEDDING_DIMENSION,
            num_tables: 10,
            hashes_per_table: 4,
            similarity_threshold: 0.3,
        }
    }
}

/// 공유 투영 집합 (write-once)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSet {
    dimensions: usize,
    num_tables: usize,
    hashes_per_table: usize,
    vectors: Vec<Vec<f32>>,
}

impl ProjectionSet {
    /// `num_tables * hashes_per_table` 개의 [-1, 1] 균등 분포 벡터 생성
    pub fn random(params: &LshParams) -> Self {
        Self::with_rng(params, &mut rand::rng())
    }

    /// 지정된 RNG로 생성 (테스트에서 시드 고정용)
    pub fn with_rng<R: Rng>(params: &LshParams, rng: &mut R) -> Self {
        let count = params.num_tables * params.hashes_per_table;
        let vectors = (0..count)
            .map(|_| {
                (0..params.dimensions)
                    .map(|_| rng.random_range(-1.0f32..=1.0))
                    .collect()
            })
            .collect();

        Self {
            dimensions: params.dimensions,
            num_tables: params.num_tables,
            hashes_per_table: params.hashes_per_table,
            vectors,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn num_tables(&self) -> usize {
        self.num_tables
    }

    pub fn hashes_per_table(&self) -> usize {
        self.hashes_per_table
    }

    /// 파라미터와 형태가 일치하는지 확인
    pub fn matches(&self, params: &LshParams) -> bool {
        self.dimensions == params.dimensions
            && self.num_tables == params.num_tables
            && self.hashes_per_table == params.hashes_per_table
    }
}

/// 버킷 엔트리 - 청크 ID와 원본 벡터
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketEntry {
    pub id: i64,
    pub vector: Vec<f32>,
}

/// 시그니처 → 버킷
pub type HashTable = HashMap<String, Vec<BucketEntry>>;

/// 영속화되는 벡터 샤드 (T 개의 해시 테이블)
///
/// 벡터는 테이블마다 복제됩니다. 메모리가 T 배로 늘지만 조회 시
/// 별도의 벡터 저장소를 거치지 않아도 됩니다.
/// TODO: 메모리 제약 환경용으로 벡터를 한 번만 저장하고 버킷에는 ID만 두는 포맷 추가
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardTables {
    pub tables: Vec<HashTable>,
}

impl ShardTables {
    /// 샤드에 포함된 고유 청크 ID 수
    pub fn chunk_count(&self) -> usize {
        self.tables
            .first()
            .map(|t| t.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

/// 유사도 검색 결과
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarHit {
    pub id: i64,
    pub similarity: f32,
}

// ============================================================================
// LshIndex
// ============================================================================

/// LSH 인덱스 (샤드 하나)
#[derive(Debug, Clone)]
pub struct LshIndex {
    params: LshParams,
    projections: Arc<ProjectionSet>,
    tables: ShardTables,
}

impl LshIndex {
    /// 새 인덱스 생성
    ///
    /// `projections` 가 주어지면 재사용하고 (샤드 비교를 위해 필수),
    /// 없으면 새로 생성합니다.
    pub fn new(params: LshParams, projections: Option<Arc<ProjectionSet>>) -> Result<Self> {
        let projections = match projections {
            Some(p) => {
                if !p.matches(&params) {
                    return Err(KbError::InvalidConfig(format!(
                        "projection set is {}x{}x{}, index expects {}x{}x{}",
                        p.num_tables,
                        p.hashes_per_table,
                        p.dimensions,
                        params.num_tables,
                        params.hashes_per_table,
                        params.dimensions
                    ))
                    .into());
                }
                p
            }
            None => Arc::new(ProjectionSet::random(&params)),
        };

        Ok(Self {
            params,
            projections,
            tables: ShardTables {
                tables: vec![HashTable::new(); params.num_tables],
            },
        })
    }

    /// 영속화된 테이블로 인덱스 복원
    pub fn with_tables(mut self, tables: ShardTables) -> Result<Self> {
        if tables.tables.len() != self.params.num_tables {
            return Err(KbError::InvalidConfig(format!(
                "shard has {} tables, index expects {}",
                tables.tables.len(),
                self.params.num_tables
            ))
            .into());
        }
        self.tables = tables;
        Ok(self)
    }

    pub fn params(&self) -> &LshParams {
        &self.params
    }

    pub fn projections(&self) -> &Arc<ProjectionSet> {
        &self.projections
    }

    pub fn tables(&self) -> &ShardTables {
        &self.tables
    }

    pub fn into_tables(self) -> ShardTables {
        self.tables
    }

    /// 테이블 `table_index` 에 대한 H-bit 시그니처
    ///
    /// 비용은 O(hashes_per_table) 이며 코퍼스 크기와 무관합니다.
    pub fn compute_hash(&self, vector: &[f32], table_index: usize) -> String {
        let h = self.params.hashes_per_table;
        self.projections.vectors[table_index * h..(table_index + 1) * h]
            .iter()
            .map(|projection| if dot(vector, projection) > 0.0 { '1' } else { '0' })
            .collect()
    }

    /// 벡터 하나를 모든 테이블의 해당 버킷에 추가
    pub fn add_vector(&mut self, id: i64, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;

        for t in 0..self.params.num_tables {
            let key = self.compute_hash(vector, t);
            self.tables.tables[t].entry(key).or_default().push(BucketEntry {
                id,
                vector: vector.to_vec(),
            });
        }
        Ok(())
    }

    /// 배치 추가 후 영속화할 테이블 반환
    pub fn add_vectors<I, V>(&mut self, batch: I) -> Result<&ShardTables>
    where
        I: IntoIterator<Item = (i64, V)>,
        V: AsRef<[f32]>,
    {
        for (id, vector) in batch {
            self.add_vector(id, vector.as_ref())?;
        }
        Ok(&self.tables)
    }

    /// 자체 테이블에서 유사 벡터 검색
    pub fn find_similar(&self, query: &[f32]) -> Result<Vec<SimilarHit>> {
        self.find_similar_in(query, &self.tables)
    }

    /// 주어진 테이블에서 유사 벡터 검색
    ///
    /// 결과는 정렬되지 않으며 정렬/절단은 호출자 책임입니다.
    /// ID 중복은 먼저 나온 테이블의 값을 유지합니다. 같은 ID의 벡터는 모든
    /// 테이블에서 동일하므로 유사도도 같습니다. 테이블별로 다른 벡터를 저장하는
    /// 포맷이 생기면 최대값 유지로 바꿔야 합니다.
    pub fn find_similar_in(&self, query: &[f32], tables: &ShardTables) -> Result<Vec<SimilarHit>> {
        self.check_dimension(query)?;

        let mut seen = HashSet::new();
        let mut hits = Vec::new();

        for (t, table) in tables.tables.iter().enumerate() {
            let key = self.compute_hash(query, t);
            let Some(bucket) = table.get(&key) else {
                continue;
            };

            for entry in bucket {
                if seen.contains(&entry.id) {
                    continue;
                }
                let similarity = cosine_similarity(query, &entry.vector);
                if similarity > self.params.similarity_threshold {
                    seen.insert(entry.id);
                    hits.push(SimilarHit {
                        id: entry.id,
                        similarity,
                    });
                }
            }
        }

        Ok(hits)
    }

    /// 비어있지 않은 버킷의 평균 크기 (전체 테이블)
    pub fn average_bucket_size(&self) -> f64 {
        let (buckets, entries) = self
            .tables
            .tables
            .iter()
            .flat_map(|t| t.values())
            .fold((0usize, 0usize), |(b, e), bucket| (b + 1, e + bucket.len()));

        if buckets == 0 {
            0.0
        } else {
            entries as f64 / buckets as f64
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.params.dimensions {
            return Err(KbError::DimensionMismatch {
                expected: self.params.dimensions,
                actual: vector.len(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// 코사인 유사도 (-1.0 ~ 1.0)
///
/// 길이가 다르거나 영벡터면 0.0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot(a, b) / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn params(dimensions: usize, num_tables: usize, hashes_per_table: usize) -> LshParams {
        LshParams {
            dimensions,
            num_tables,
            hashes_per_table,
            similarity_threshold: 0.5,
        }
    }

    fn seeded_index(p: LshParams, seed: u64) -> LshIndex {
        let mut rng = StdRng::seed_from_u64(seed);
        let projections = Arc::new(ProjectionSet::with_rng(&p, &mut rng));
        LshIndex::new(p, Some(projections)).unwrap()
    }

    fn random_vector(rng: &mut StdRng, dim: usize) -> Vec<f32> {
        (0..dim).map(|_| rng.random_range(-1.0f32..=1.0)).collect()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-4);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-4);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-4);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_projection_set_shape_and_range() {
        let p = params(16, 3, 5);
        let set = ProjectionSet::with_rng(&p, &mut StdRng::seed_from_u64(1));
        assert_eq!(set.vectors.len(), 15);
        assert!(set.vectors.iter().all(|v| v.len() == 16));
        assert!(set
            .vectors
            .iter()
            .flatten()
            .all(|x| (-1.0..=1.0).contains(x)));
        assert!(set.matches(&p));
        assert!(!set.matches(&params(16, 3, 4)));
    }

    #[test]
    fn test_compute_hash_is_deterministic() {
        let index = seeded_index(params(32, 4, 6), 7);
        let mut rng = StdRng::seed_from_u64(99);
        let v = random_vector(&mut rng, 32);

        for t in 0..4 {
            let first = index.compute_hash(&v, t);
            assert_eq!(first.len(), 6);
            assert!(first.chars().all(|c| c == '0' || c == '1'));
            assert_eq!(first, index.compute_hash(&v, t));
        }
    }

    #[test]
    fn test_self_match() {
        let mut index = seeded_index(params(32, 10, 4), 3);
        let mut rng = StdRng::seed_from_u64(11);
        let v = random_vector(&mut rng, 32);
        index.add_vector(42, &v).unwrap();

        let hits = index.find_similar(&v).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 42);
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_vector_is_replicated_into_every_table() {
        let mut index = seeded_index(params(8, 5, 3), 5);
        index.add_vector(1, &[0.5; 8]).unwrap();
        for table in &index.tables().tables {
            assert_eq!(table.values().map(Vec::len).sum::<usize>(), 1);
        }
        assert_eq!(index.tables().chunk_count(), 1);
    }

    #[test]
    fn test_find_similar_dedups_and_applies_threshold() {
        let mut index = seeded_index(params(4, 10, 2), 9);
        index.add_vector(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add_vector(2, &[0.9, 0.1, 0.0, 0.0]).unwrap();
        index.add_vector(3, &[-1.0, 0.0, 0.0, 0.0]).unwrap();

        let hits = index.find_similar(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let ids: HashSet<i64> = hits.iter().map(|h| h.id).collect();

        assert_eq!(ids.len(), hits.len(), "ids must be unique");
        assert!(ids.contains(&1));
        assert!(!ids.contains(&3), "opposite vector is below threshold");
        assert!(hits.iter().all(|h| h.similarity > 0.5));
    }

    #[test]
    fn test_more_hashes_never_grow_buckets() {
        let mut rng = StdRng::seed_from_u64(2024);
        let vectors: Vec<Vec<f32>> = (0..400).map(|_| random_vector(&mut rng, 24)).collect();

        let mut previous = f64::INFINITY;
        for hashes in [1, 2, 4, 8] {
            let mut index = seeded_index(params(24, 6, hashes), 17);
            index
                .add_vectors(vectors.iter().enumerate().map(|(i, v)| (i as i64, v)))
                .unwrap();
            let avg = index.average_bucket_size();
            assert!(
                avg <= previous,
                "hashes={hashes}: avg bucket {avg} > previous {previous}"
            );
            previous = avg;
        }
    }

    #[test]
    fn test_shard_round_trip_preserves_results() {
        let p = params(16, 6, 3);
        let mut rng = StdRng::seed_from_u64(77);
        let projections = Arc::new(ProjectionSet::with_rng(&p, &mut rng));

        let mut index = LshIndex::new(p, Some(projections.clone())).unwrap();
        let vectors: Vec<Vec<f32>> = (0..50).map(|_| random_vector(&mut rng, 16)).collect();
        index
            .add_vectors(vectors.iter().enumerate().map(|(i, v)| (i as i64 + 100, v)))
            .unwrap();

        let json = serde_json::to_string(index.tables()).unwrap();
        let restored: ShardTables = serde_json::from_str(&json).unwrap();
        let reloaded = LshIndex::new(p, Some(projections))
            .unwrap()
            .with_tables(restored)
            .unwrap();

        for query in vectors.iter().take(10) {
            assert_eq!(
                index.find_similar(query).unwrap(),
                reloaded.find_similar(query).unwrap()
            );
        }
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let mut index = seeded_index(params(8, 2, 2), 1);
        let err = index.add_vector(1, &[1.0; 4]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KbError>(),
            Some(KbError::DimensionMismatch {
                expected: 8,
                actual: 4
            })
        ));
        assert!(index.find_similar(&[1.0; 3]).is_err());
    }

    #[test]
    fn test_mismatched_projection_set_is_rejected() {
        let set = Arc::new(ProjectionSet::random(&params(8, 2, 2)));
        assert!(LshIndex::new(params(8, 3, 2), Some(set)).is_err());
    }
}
