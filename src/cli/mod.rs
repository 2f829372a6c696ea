//! CLI 모듈
//!
//! palank-kb CLI 명령어 정의 및 구현

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use walkdir::{DirEntry, WalkDir};

use crate::config::KbConfig;
use crate::embedding::{has_api_key, GeminiEmbedding};
use crate::knowledge::{
    ensure_deletable, KnowledgeBase, KnowledgeStore, ResultBudget, SearchMethod,
    DEFAULT_CONNECTION,
};

/// 수집 대상 텍스트 확장자
const TEXT_EXTENSIONS: &[&str] = &[
    "md", "markdown", "txt", "rst", "rs", "ts", "tsx", "js", "jsx", "py", "json", "toml", "yaml",
    "yml", "html", "css", "go", "java", "c", "cpp", "h", "hpp", "sh", "sql", "xml", "csv",
];

/// 최대 파일 크기 (10MB)
const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "palank-kb")]
#[command(version, about = "로컬 하이브리드 지식베이스 (LSH 벡터 + BM25)", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 텍스트, 파일, 또는 폴더를 지식베이스에 추가
    Ingest {
        /// 직접 입력할 텍스트
        #[arg(short, long)]
        text: Option<String>,

        /// 수집할 파일 경로 (UTF-8 텍스트)
        #[arg(long)]
        file: Option<PathBuf>,

        /// 수집할 폴더 경로 (재귀)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// 대상 연결 이름 (없으면 생성)
        #[arg(short, long, default_value = DEFAULT_CONNECTION)]
        connection: String,

        /// 문서 이름 (기본: 파일 이름)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// 지식베이스 검색
    Query {
        /// 검색 쿼리
        query: String,

        /// 결과 개수 제한 (기본 5)
        #[arg(short, long, conflicts_with = "max_tokens")]
        limit: Option<usize>,

        /// 결과 토큰 예산
        #[arg(long)]
        max_tokens: Option<usize>,

        /// 검색 범위 연결 (반복 가능, 기본: 전체)
        #[arg(short, long = "connection")]
        connections: Vec<String>,
    },

    /// 저장된 문서 목록
    List {
        /// 결과 개수 제한
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// 연결 필터
        #[arg(short, long)]
        connection: Option<String>,
    },

    /// 문서 삭제
    Delete {
        /// 삭제할 문서 ID
        #[arg(short, long)]
        id: i64,
    },

    /// 연결 목록
    Connections,

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config = KbConfig::from_env().context("설정 로드 실패")?;

    match cli.command {
        Commands::Ingest {
            text,
            file,
            dir,
            connection,
            name,
        } => cmd_ingest(config, text, file, dir, &connection, name).await,
        Commands::Query {
            query,
            limit,
            max_tokens,
            connections,
        } => cmd_query(config, &query, budget_from_args(limit, max_tokens), &connections).await,
        Commands::List { limit, connection } => cmd_list(&config, limit, connection.as_deref()),
        Commands::Delete { id } => cmd_delete(&config, id),
        Commands::Connections => cmd_connections(&config),
        Commands::Status => cmd_status(&config),
    }
}

fn require_api_key() -> Result<()> {
    if !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             또는\n  \
             export GOOGLE_AI_API_KEY=your-api-key\n\n\
             API 키 발급: https://aistudio.google.com/app/apikey"
        );
    }
    Ok(())
}

/// 임베딩이 필요한 명령어용
fn open_kb(config: KbConfig) -> Result<KnowledgeBase> {
    require_api_key()?;
    let provider = GeminiEmbedding::from_env(config.dimension()).context("임베딩 프로바이더 생성 실패")?;
    KnowledgeBase::open(config, std::sync::Arc::new(provider)).context("지식베이스 열기 실패")
}

/// 저장소만 필요한 명령어용
fn open_store(config: &KbConfig) -> Result<KnowledgeStore> {
    KnowledgeStore::open(&config.db_path()).context("KnowledgeStore 열기 실패")
}

fn budget_from_args(limit: Option<usize>, max_tokens: Option<usize>) -> ResultBudget {
    match max_tokens {
        Some(tokens) => ResultBudget::MaxTokens(tokens),
        None => ResultBudget::TopK(limit.unwrap_or(5)),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 문서 수집 명령어 (ingest)
async fn cmd_ingest(
    config: KbConfig,
    text: Option<String>,
    file: Option<PathBuf>,
    dir: Option<PathBuf>,
    connection: &str,
    name: Option<String>,
) -> Result<()> {
    if text.is_none() && file.is_none() && dir.is_none() {
        bail!("--text, --file, --dir 중 하나를 지정해야 합니다");
    }

    let kb = open_kb(config)?;
    let connection = kb.connection(connection).context("연결 생성 실패")?;
    println!("[*] 연결: {} (#{})", connection.name, connection.id);

    let result = ingest_into(&kb, connection.id, text, file, dir, name).await;
    kb.shutdown().await?;
    result
}

async fn ingest_into(
    kb: &KnowledgeBase,
    connection_id: i64,
    text: Option<String>,
    file: Option<PathBuf>,
    dir: Option<PathBuf>,
    name: Option<String>,
) -> Result<()> {
    if let Some(text) = text {
        let name = name.unwrap_or_else(|| "direct-input".to_string());
        println!("[*] 문서 분할 및 임베딩 생성 중...");
        let report = kb
            .ingest_text(&name, connection_id, &text, None)
            .await
            .context("문서 추가 실패")?;
        println!(
            "[OK] 문서가 추가되었습니다 (ID: {}, 청크: {}, 윈도우: {})",
            report.document_id,
            report.chunk_count(),
            report.windows.len()
        );
        return Ok(());
    }

    let files = match (file, dir) {
        (Some(path), _) => vec![path],
        (None, Some(dir)) => collect_text_files(&dir)?,
        (None, None) => Vec::new(),
    };

    if files.is_empty() {
        println!("[!] 수집할 파일이 없습니다.");
        return Ok(());
    }

    let total_size: u64 = files
        .iter()
        .filter_map(|f| std::fs::metadata(f).ok())
        .map(|m| m.len())
        .sum();
    println!("[*] 수집 대상: {} 파일 ({})", files.len(), format_bytes(total_size as usize));
    println!();

    let single = files.len() == 1;
    let mut success_count = 0;
    let mut error_count = 0;

    for (i, path) in files.iter().enumerate() {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let doc_name = match (&name, single) {
            (Some(name), true) => name.clone(),
            _ => file_name.clone(),
        };

        print!("[{}/{}] {}... ", i + 1, files.len(), file_name);

        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                println!("읽기 실패: {}", e);
                error_count += 1;
                continue;
            }
        };
        let Ok(text) = std::str::from_utf8(&bytes) else {
            println!("건너뜀 (UTF-8 텍스트가 아님)");
            error_count += 1;
            continue;
        };
        let chunks = kb.split(text);

        match kb.ingest_chunks(&doc_name, connection_id, chunks, Some(bytes)).await {
            Ok(report) => {
                println!("완료 (ID: {}, 청크: {})", report.document_id, report.chunk_count());
                success_count += 1;
            }
            Err(e) => {
                println!("실패: {:#}", e);
                error_count += 1;
            }
        }
    }

    println!();
    println!("[OK] 완료: 성공 {}, 실패 {}", success_count, error_count);

    Ok(())
}

/// 검색 명령어 (query)
async fn cmd_query(
    config: KbConfig,
    query: &str,
    budget: ResultBudget,
    connections: &[String],
) -> Result<()> {
    let kb = open_kb(config)?;

    let mut connection_ids = Vec::with_capacity(connections.len());
    for name in connections {
        connection_ids.push(kb.connection_id(name)?);
    }

    println!("[*] 검색 중: \"{}\"", query);
    let results = kb.search(query, &connection_ids, budget).await;
    kb.shutdown().await?;
    let results = results.context("검색 실패")?;

    if results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", results.len());

    for (i, result) in results.iter().enumerate() {
        let method_str = match result.method {
            SearchMethod::Vector => "VEC",
            SearchMethod::Lexical => "LEX",
            SearchMethod::Hybrid => "HYB",
        };

        println!(
            "{}. [{}] [점수: {:.4}] {} (Doc #{})",
            i + 1,
            method_str,
            result.score,
            result.document.name,
            result.document.id
        );

        let location = match result.chunk.page {
            Some(page) => format!(
                "p.{} L{}-{}",
                page, result.chunk.line_from, result.chunk.line_to
            ),
            None => format!("L{}-{}", result.chunk.line_from, result.chunk.line_to),
        };
        println!("   위치: {}", location);
        println!("   내용: {}", truncate_text(&result.chunk.text, 200));
        println!();
    }

    Ok(())
}

/// 목록 명령어 (list)
fn cmd_list(config: &KbConfig, limit: usize, connection: Option<&str>) -> Result<()> {
    let store = open_store(config)?;

    let connection_id = match connection {
        Some(name) => Some(
            store
                .find_connection(name)?
                .map(|c| c.id)
                .ok_or_else(|| anyhow::anyhow!("연결 '{}'을 찾을 수 없습니다", name))?,
        ),
        None => None,
    };

    let docs = store
        .list_documents(limit, connection_id)
        .context("문서 목록 조회 실패")?;

    if docs.is_empty() {
        println!("[!] 저장된 문서가 없습니다.");
        return Ok(());
    }

    println!("[OK] 저장된 문서 ({} 건):\n", docs.len());

    for doc in docs {
        let range = doc
            .chunk_range
            .map(|(from, to)| format!("{}-{}", from, to))
            .unwrap_or_else(|| "-".to_string());

        println!(
            "  #{:<4} [{}] {}",
            doc.id,
            doc.status.as_str(),
            truncate_text(&doc.name, 50)
        );
        println!(
            "        {} | 청크 {} | 샤드 {}/{}",
            doc.created_at.format("%Y-%m-%d %H:%M"),
            range,
            doc.vector_shards.len(),
            doc.lexical_shards.len()
        );
        println!();
    }

    Ok(())
}

/// 삭제 명령어 (delete)
fn cmd_delete(config: &KbConfig, id: i64) -> Result<()> {
    let store = open_store(config)?;

    let doc = store
        .get_document(id)
        .context("문서 조회 실패")?
        .ok_or_else(|| anyhow::anyhow!("ID {}인 문서를 찾을 수 없습니다", id))?;

    ensure_deletable(&doc, config.delete_grace)?;

    if store.delete_document(id).context("문서 삭제 실패")? {
        println!("[OK] 문서 #{} 삭제됨 ({})", id, doc.name);
    } else {
        println!("[!] 삭제할 문서를 찾을 수 없습니다");
    }

    Ok(())
}

/// 연결 목록 명령어 (connections)
fn cmd_connections(config: &KbConfig) -> Result<()> {
    let store = open_store(config)?;
    let connections = store.list_connections().context("연결 목록 조회 실패")?;

    if connections.is_empty() {
        println!("[!] 연결이 없습니다.");
        return Ok(());
    }

    println!("[OK] 연결 ({} 건):\n", connections.len());
    for connection in connections {
        println!(
            "  #{:<4} {} [{}] 문서 {} | 샤드 {}/{}",
            connection.id,
            connection.name,
            connection.kind,
            connection.document_ids.len(),
            connection.vector_shards.len(),
            connection.lexical_shards.len()
        );
    }

    Ok(())
}

/// 상태 명령어 (status)
fn cmd_status(config: &KbConfig) -> Result<()> {
    println!("palank-kb v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] 데이터 디렉토리: {}", config.data_dir.display());
    println!(
        "[*] 임베딩 차원: {}, 워커: {}, LSH: {} 테이블 x {} 해시",
        config.dimension(),
        config.workers,
        config.lsh.num_tables,
        config.lsh.hashes_per_table
    );

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    match open_store(config).and_then(|store| store.stats()) {
        Ok(stats) => {
            println!(
                "[OK] 문서: {} 건 (빌드 중 {}, 실패 {})",
                stats.document_count, stats.building_count, stats.failed_count
            );
            println!("     연결: {} 개, 청크: {} 개", stats.connection_count, stats.chunk_count);
            println!(
                "     샤드: 벡터 {} / 렉시컬 {}",
                stats.vector_shard_count, stats.lexical_shard_count
            );
            if let Ok(meta) = std::fs::metadata(&stats.db_path) {
                println!("     DB 크기: {}", format_bytes(meta.len() as usize));
            }
        }
        Err(e) => {
            println!("[!] 통계 조회 실패: {}", e);
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// 폴더에서 텍스트 파일 수집 (숨김 항목 제외, 경로순)
fn collect_text_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("폴더가 아닙니다: {}", dir.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_entry(|e| !is_hidden(e)) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_text_file(entry.path()) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > MAX_FILE_SIZE {
            tracing::warn!("Skipping large file: {:?} ({} bytes)", entry.path(), size);
            continue;
        }
        files.push(entry.into_path());
    }

    files.sort();
    Ok(files)
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
