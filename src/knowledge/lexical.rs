//! 렉시컬 인덱스 - 직렬화 가능한 BM25 역색인
//!
//! 빌드 윈도우 하나의 "big" 청크만 담는 샤드 단위 인덱스입니다.
//! 샤드마다 용어 통계가 달라 점수를 샤드 간에 직접 비교할 수 없으므로,
//! 하이브리드 검색기가 후보만으로 임시 인덱스를 다시 만들어 재채점합니다.
//!
//! CJK 분절은 외부 책임이며, 여기서는 공백/구두점 기준으로만 토큰화합니다.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// BM25 파라미터
const K1: f32 = 1.2;
const B: f32 = 0.75;

/// 렉시컬 검색 결과 (`ref` = 청크 ID)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalHit {
    pub id: i64,
    pub score: f32,
}

/// BM25 역색인
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LexicalIndex {
    /// term -> (chunk_id -> term frequency)
    postings: HashMap<String, HashMap<i64, u32>>,
    /// chunk_id -> 토큰 수
    doc_lengths: HashMap<i64, u32>,
    total_length: u64,
}

impl LexicalIndex {
    /// `{id, text}` 행들로 인덱스 생성
    pub fn build<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (i64, &'a str)>,
    {
        let mut index = Self::default();
        for (id, text) in rows {
            index.add(id, text);
        }
        index
    }

    fn add(&mut self, id: i64, text: &str) {
        // 같은 ID가 다시 들어오면 이전 텍스트를 먼저 제거
        if let Some(old) = self.doc_lengths.remove(&id) {
            self.total_length -= u64::from(old);
            self.postings.retain(|_, docs| {
                docs.remove(&id);
                !docs.is_empty()
            });
        }

        let tokens = tokenize(text);

        let mut term_freq: HashMap<String, u32> = HashMap::new();
        for token in tokens.iter() {
            *term_freq.entry(token.clone()).or_insert(0) += 1;
        }
        for (term, freq) in term_freq {
            self.postings.entry(term).or_default().insert(id, freq);
        }

        self.doc_lengths.insert(id, tokens.len() as u32);
        self.total_length += tokens.len() as u64;
    }

    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }

    /// 쿼리로 검색, 점수 내림차순 상위 `limit` 개
    ///
    /// ```text
    /// score = Σ IDF(t) * tf * (k1 + 1) / (tf + k1 * (1 - b + b * dl / avgdl))
    /// IDF(t) = ln((N - df + 0.5) / (df + 0.5) + 1)
    /// ```
    pub fn search(&self, query: &str, limit: usize) -> Vec<LexicalHit> {
        if self.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut query_terms = tokenize(query);
        query_terms.sort();
        query_terms.dedup();
        if query_terms.is_empty() {
            return Vec::new();
        }

        let n = self.len() as f32;
        let avgdl = (self.total_length as f32 / n).max(1.0);
        let mut scores: HashMap<i64, f32> = HashMap::new();

        for term in query_terms.iter() {
            let Some(postings) = self.postings.get(term) else {
                continue;
            };
            let df = postings.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (&id, &tf) in postings {
                let tf = tf as f32;
                let dl = self.doc_lengths.get(&id).copied().unwrap_or(0) as f32;
                let term_score = idf * tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * dl / avgdl));
                *scores.entry(id).or_insert(0.0) += term_score;
            }
        }

        let mut hits: Vec<LexicalHit> = scores
            .into_iter()
            .map(|(id, score)| LexicalHit { id, score })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        hits
    }

    /// 샤드 저장용 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize lexical index")
    }

    /// 저장된 샤드 복원
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Failed to deserialize lexical index")
    }
}

/// 소문자 영숫자 토큰으로 분할
///
/// 단일 ASCII 문자는 버립니다. 한 글자 한글/한자 단어는 유지합니다.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !(w.len() == 1 && w.is_ascii()))
        .map(str::to_lowercase)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
