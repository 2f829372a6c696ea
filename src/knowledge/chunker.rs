//! 텍스트 분할 모듈
//!
//! Markdown 구조를 존중하면서 문서를 줄 단위로 묶어 청크를 만듭니다.
//! 같은 문서를 두 가지 크기로 분할합니다:
//! - big: 컨텍스트로 돌려줄 크기 (렉시컬 + 벡터 색인)
//! - mini: 정밀 매칭용 (벡터 색인만)
//!
//! 각 청크는 원본의 줄 범위(1부터)와 페이지 번호를 가집니다.
//! 폼 피드(`\x0c`)가 페이지 경계이며, 폼 피드가 없는 문서는 페이지가 `None` 입니다.

use anyhow::{Context, Result};
use regex::Regex;

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// 최소 청크 크기 (바이트, 이보다 작으면 다음 청크와 병합)
    pub min_characters: usize,
    /// 최대 청크 크기 (바이트)
    pub max_characters: usize,
}

impl ChunkConfig {
    /// big 청크 설정
    pub fn big() -> Self {
        Self {
            min_characters: 300,
            max_characters: 1500,
        }
    }

    /// mini 청크 설정
    pub fn mini() -> Self {
        Self {
            min_characters: 50,
            max_characters: 300,
        }
    }
}

/// 분할된 청크 (아직 저장 전, ID 없음)
#[derive(Debug, Clone, PartialEq)]
pub struct SplitChunk {
    pub text: String,
    pub line_from: u32,
    pub line_to: u32,
    pub page: Option<u32>,
}

/// 한 문서의 분할 결과
#[derive(Debug, Clone, Default)]
pub struct DocumentChunks {
    pub big: Vec<SplitChunk>,
    pub mini: Vec<SplitChunk>,
}

impl DocumentChunks {
    pub fn len(&self) -> usize {
        self.big.len() + self.mini.len()
    }

    pub fn is_empty(&self) -> bool {
        self.big.is_empty() && self.mini.is_empty()
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 문서 분할 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 big/mini 청크로 분할
    fn split(&self, text: &str) -> DocumentChunks;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// MarkdownChunker
// ============================================================================

/// 원본 한 줄
struct Line<'a> {
    number: u32,
    page: Option<u32>,
    text: &'a str,
}

/// 진행 중인 청크
struct Pending {
    text: String,
    line_from: u32,
    line_to: u32,
    page: Option<u32>,
}

impl Pending {
    fn start(line: &Line<'_>) -> Self {
        Self {
            text: String::new(),
            line_from: line.number,
            line_to: line.number,
            page: line.page,
        }
    }

    fn push(&mut self, line: &Line<'_>) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line.text);
        self.line_to = line.number;
    }

    fn finish(self) -> Option<SplitChunk> {
        let text = self.text.trim();
        if text.is_empty() {
            return None;
        }
        Some(SplitChunk {
            text: text.to_string(),
            line_from: self.line_from,
            line_to: self.line_to,
            page: self.page,
        })
    }
}

/// Markdown 인식 청커
///
/// - 헤더에서 새 청크 시작
/// - 코드 블록 내부에서는 최대 크기의 두 배까지 분할하지 않음
/// - 페이지를 넘는 청크를 만들지 않음
/// - 최소 크기 미만 청크는 같은 페이지의 다음 청크와 병합
pub struct MarkdownChunker {
    big: ChunkConfig,
    mini: ChunkConfig,
    header_re: Regex,
}

impl MarkdownChunker {
    /// 설정으로 생성
    pub fn new(big: ChunkConfig, mini: ChunkConfig) -> Result<Self> {
        let header_re = Regex::new(r"^#{1,6}\s+").context("Failed to compile header pattern")?;
        Ok(Self {
            big,
            mini,
            header_re,
        })
    }

    /// 기본 설정으로 생성
    pub fn with_defaults() -> Result<Self> {
        Self::new(ChunkConfig::big(), ChunkConfig::mini())
    }

    /// 한 가지 설정으로 분할
    fn split_with(&self, lines: &[Line<'_>], config: &ChunkConfig) -> Vec<SplitChunk> {
        let mut chunks = Vec::new();
        let mut current: Option<Pending> = None;
        let mut in_code_block = false;

        for line in lines {
            let is_fence = line.text.trim_start().starts_with("```");
            let is_header = !in_code_block && self.header_re.is_match(line.text);

            if let Some(pending) = current.take() {
                let size_limit = if in_code_block {
                    config.max_characters * 2
                } else {
                    config.max_characters
                };
                let overflow = pending.text.len() + line.text.len() + 1 > size_limit;
                let page_break = pending.page != line.page;

                if is_header || overflow || page_break {
                    chunks.extend(pending.finish());
                } else {
                    current = Some(pending);
                }
            }

            if is_fence {
                in_code_block = !in_code_block;
            }

            // 한 줄이 최대 크기를 넘으면 조각내서 바로 내보냄
            if line.text.len() > config.max_characters {
                chunks.extend(current.take().and_then(Pending::finish));
                for piece in split_long_line(line.text, config.max_characters) {
                    let mut pending = Pending::start(line);
                    pending.text.push_str(piece);
                    chunks.extend(pending.finish());
                }
                continue;
            }

            current.get_or_insert_with(|| Pending::start(line)).push(line);
        }

        chunks.extend(current.and_then(Pending::finish));
        merge_small_chunks(chunks, config)
    }
}

impl Chunker for MarkdownChunker {
    fn split(&self, text: &str) -> DocumentChunks {
        if text.trim().is_empty() {
            return DocumentChunks::default();
        }

        let lines = number_lines(text);
        DocumentChunks {
            big: self.split_with(&lines, &self.big),
            mini: self.split_with(&lines, &self.mini),
        }
    }

    fn name(&self) -> &'static str {
        "MarkdownChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 줄 번호와 페이지 부여 (폼 피드 제거)
fn number_lines(text: &str) -> Vec<Line<'_>> {
    let paged = text.contains('\x0c');
    let mut page = 1u32;

    text.lines()
        .enumerate()
        .map(|(i, raw)| {
            let breaks = raw.matches('\x0c').count() as u32;
            page += breaks;
            Line {
                number: i as u32 + 1,
                page: paged.then_some(page),
                text: raw.trim_start_matches('\x0c').trim_end_matches('\x0c'),
            }
        })
        .collect()
}

/// 작은 청크 병합 (같은 페이지, 최대 크기 이내)
fn merge_small_chunks(chunks: Vec<SplitChunk>, config: &ChunkConfig) -> Vec<SplitChunk> {
    if config.min_characters == 0 {
        return chunks;
    }

    let mut result: Vec<SplitChunk> = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        if let Some(last) = result.last_mut() {
            if last.text.len() < config.min_characters
                && last.page == chunk.page
                && last.text.len() + chunk.text.len() + 2 <= config.max_characters
            {
                last.text.push_str("\n\n");
                last.text.push_str(&chunk.text);
                last.line_to = chunk.line_to;
                continue;
            }
        }
        result.push(chunk);
    }

    result
}

/// 긴 한 줄을 UTF-8 경계에서 최대 크기 이하 조각으로 분할
fn split_long_line(line: &str, max: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;

    while start < line.len() {
        let mut end = floor_char_boundary(line, start + max);
        if end <= start {
            // 최대 크기보다 큰 단일 문자
            end = line[start..]
                .char_indices()
                .nth(1)
                .map(|(i, _)| start + i)
                .unwrap_or(line.len());
        }
        pieces.push(&line[start..end]);
        start = end;
    }

    pieces
}

/// UTF-8 경계 조정 (인덱스 이하로)
#[inline]
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        s.len()
    } else {
        let mut i = index;
        while i > 0 && !s.is_char_boundary(i) {
            i -= 1;
        }
        i
    }
}

// ============================================================================
// Tests
// ============================================================================
