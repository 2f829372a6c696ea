//! Knowledge Store - rusqlite 기반 동기 지식 저장소
//!
//! 청크, 문서, 연결(Connection), 벡터/렉시컬 샤드, 투영 집합, 바이너리 리소스를 저장합니다.
//! 여러 테이블에 걸친 변경(문서 완료, 삭제)은 하나의 트랜잭션으로 처리합니다.
//! 저장 위치: `<data_dir>/knowledge.db`

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{
    params, params_from_iter, Connection as SqliteConnection, OpenFlags, OptionalExtension, Row,
    Transaction,
};
use serde::{Deserialize, Serialize};

use super::lexical::LexicalIndex;
use super::lsh::{ProjectionSet, ShardTables};

// ============================================================================
// Types
// ============================================================================

/// 청크 단위
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkKind {
    /// 컨텍스트 크기 청크 (렉시컬 + 벡터 색인)
    Big,
    /// 정밀 매칭용 작은 청크 (벡터 색인만)
    Mini,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Big => "big",
            ChunkKind::Mini => "mini",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "big" => Some(ChunkKind::Big),
            "mini" => Some(ChunkKind::Mini),
            _ => None,
        }
    }
}

/// 저장된 청크 (불변)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub id: i64,
    pub document_id: i64,
    pub kind: ChunkKind,
    pub text: String,
    pub line_from: u32,
    pub line_to: u32,
    pub page: Option<u32>,
}

/// 새 청크 입력용 구조체
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub document_id: i64,
    pub kind: ChunkKind,
    pub text: String,
    pub line_from: u32,
    pub line_to: u32,
    pub page: Option<u32>,
}

/// 문서 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentStatus {
    Building,
    Success,
    Fail,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Building => "building",
            DocumentStatus::Success => "success",
            DocumentStatus::Fail => "fail",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "building" => Some(DocumentStatus::Building),
            "success" => Some(DocumentStatus::Success),
            "fail" => Some(DocumentStatus::Fail),
            _ => None,
        }
    }
}

/// 저장된 문서 엔트리
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub name: String,
    pub connection_id: i64,
    pub status: DocumentStatus,
    /// 모든 청크를 포함하는 ID 범위 [from, to] (빌드 성공 후에만 기록)
    pub chunk_range: Option<(i64, i64)>,
    pub vector_shards: Vec<i64>,
    pub lexical_shards: Vec<i64>,
    pub resource_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// 새 문서 입력용 구조체
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub name: String,
    pub connection_id: i64,
    /// 원본 바이너리 (업로드 파일 등)
    pub resource: Option<Vec<u8>>,
}

/// 문서 그룹 (업로드 파일 전체, 크롤 소스 하나 등)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub document_ids: Vec<i64>,
    /// 멤버 문서들의 벡터 샤드 합집합 (검색 범위)
    pub vector_shards: Vec<i64>,
    /// 멤버 문서들의 렉시컬 샤드 합집합
    pub lexical_shards: Vec<i64>,
}

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub connection_count: usize,
    pub document_count: usize,
    pub building_count: usize,
    pub failed_count: usize,
    pub chunk_count: usize,
    pub vector_shard_count: usize,
    pub lexical_shard_count: usize,
    pub db_path: PathBuf,
}

// ============================================================================
// KnowledgeStore
// ============================================================================

/// Knowledge Store - 동기 지식 저장소
///
/// 연결 하나를 `Mutex` 로 보호하므로 `Arc<KnowledgeStore>` 로 여러 태스크에서
/// 공유할 수 있습니다. 검색 시 블로킹 워커에서도 그대로 사용합니다.
pub struct KnowledgeStore {
    conn: Arc<Mutex<SqliteConnection>>,
    db_path: PathBuf,
}

const DOCUMENT_COLUMNS: &str = "id, name, connection_id, status, chunk_from, chunk_to, \
     vector_shards, lexical_shards, resource_id, created_at";

const CHUNK_COLUMNS: &str = "id, document_id, kind, text, line_from, line_to, page";

const CONNECTION_COLUMNS: &str = "id, name, kind, document_ids, vector_shards, lexical_shards";

impl KnowledgeStore {
    /// 저장소 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let conn = SqliteConnection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        store.initialize()?;
        Ok(store)
    }

    /// DB 경로 반환
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<MutexGuard<'_, SqliteConnection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = OFF;

            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                document_ids TEXT NOT NULL DEFAULT '[]',
                vector_shards TEXT NOT NULL DEFAULT '[]',
                lexical_shards TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                connection_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                chunk_from INTEGER,
                chunk_to INTEGER,
                vector_shards TEXT NOT NULL DEFAULT '[]',
                lexical_shards TEXT NOT NULL DEFAULT '[]',
                resource_id INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_connection ON documents(connection_id);

            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                text TEXT NOT NULL,
                line_from INTEGER NOT NULL,
                line_to INTEGER NOT NULL,
                page INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);

            CREATE TABLE IF NOT EXISTS vector_shards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS lexical_shards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS projections (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                data BLOB NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS resources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data BLOB NOT NULL
            );
            "#,
        )
        .context("Failed to initialize schema")?;

        tracing::debug!("Knowledge store initialized at {:?}", self.db_path);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// 이름으로 연결 조회, 없으면 생성
    pub fn ensure_connection(&self, name: &str, kind: &str) -> Result<Connection> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT OR IGNORE INTO connections (name, kind) VALUES (?1, ?2)",
            params![name, kind],
        )
        .context("Failed to insert connection")?;

        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE name = ?1");
        let connection = conn
            .query_row(&sql, params![name], connection_from_row)
            .context("Failed to load connection")?;

        Ok(connection)
    }

    /// ID로 연결 조회
    pub fn get_connection(&self, id: i64) -> Result<Option<Connection>> {
        let conn = self.lock()?;
        load_connection(&conn, id)
    }

    /// 이름으로 연결 조회
    pub fn find_connection(&self, name: &str) -> Result<Option<Connection>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE name = ?1");
        let connection = conn
            .query_row(&sql, params![name], connection_from_row)
            .optional()?;
        Ok(connection)
    }

    /// 연결 목록
    pub fn list_connections(&self) -> Result<Vec<Connection>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {CONNECTION_COLUMNS} FROM connections ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], connection_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------------

    /// 문서 생성 (Building 상태)
    ///
    /// 리소스 저장, 문서 삽입, 연결 멤버 등록을 하나의 트랜잭션으로 처리합니다.
    pub fn create_document(&self, doc: NewDocument) -> Result<Document> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut connection = load_connection(&tx, doc.connection_id)?
            .ok_or_else(|| anyhow::anyhow!("Connection {} not found", doc.connection_id))?;

        let resource_id = match doc.resource {
            Some(ref bytes) => {
                tx.execute("INSERT INTO resources (data) VALUES (?1)", params![bytes])
                    .context("Failed to insert resource")?;
                Some(tx.last_insert_rowid())
            }
            None => None,
        };

        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO documents (name, connection_id, status, resource_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                doc.name,
                doc.connection_id,
                DocumentStatus::Building.as_str(),
                resource_id,
                created_at.to_rfc3339()
            ],
        )
        .context("Failed to insert document")?;
        let id = tx.last_insert_rowid();

        connection.document_ids.push(id);
        save_connection(&tx, &connection)?;
        tx.commit()?;

        tracing::info!("Created document: {} (id={})", doc.name, id);

        Ok(Document {
            id,
            name: doc.name,
            connection_id: doc.connection_id,
            status: DocumentStatus::Building,
            chunk_range: None,
            vector_shards: Vec::new(),
            lexical_shards: Vec::new(),
            resource_id,
            created_at,
        })
    }

    /// ID로 문서 조회
    pub fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let conn = self.lock()?;
        load_document(&conn, id)
    }

    /// 여러 문서 조회 (없는 ID는 무시)
    pub fn get_documents(&self, ids: &[i64]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let docs = stmt
            .query_map(params_from_iter(ids.iter()), document_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(docs)
    }

    /// 문서 목록 (최신순)
    pub fn list_documents(&self, limit: usize, connection_id: Option<i64>) -> Result<Vec<Document>> {
        let conn = self.lock()?;

        let docs = if let Some(cid) = connection_id {
            let sql = format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents
                 WHERE connection_id = ?1 ORDER BY id DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![cid, limit as i64], document_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        } else {
            let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY id DESC LIMIT ?1");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit as i64], document_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        Ok(docs)
    }

    /// 빌드 완료 처리
    ///
    /// 문서의 범위/샤드 목록/상태를 갱신하고, 연결의 샤드 합집합에 병합합니다.
    pub fn complete_document(
        &self,
        id: i64,
        chunk_range: Option<(i64, i64)>,
        vector_shards: &[i64],
        lexical_shards: &[i64],
    ) -> Result<Document> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut doc = load_document(&tx, id)?.ok_or_else(|| anyhow::anyhow!("Document {} not found", id))?;
        doc.status = DocumentStatus::Success;
        doc.chunk_range = chunk_range;
        doc.vector_shards = vector_shards.to_vec();
        doc.lexical_shards = lexical_shards.to_vec();

        tx.execute(
            "UPDATE documents SET status = ?2, chunk_from = ?3, chunk_to = ?4,
                    vector_shards = ?5, lexical_shards = ?6
             WHERE id = ?1",
            params![
                id,
                doc.status.as_str(),
                chunk_range.map(|r| r.0),
                chunk_range.map(|r| r.1),
                to_json(&doc.vector_shards)?,
                to_json(&doc.lexical_shards)?
            ],
        )
        .context("Failed to update document")?;

        if let Some(mut connection) = load_connection(&tx, doc.connection_id)? {
            merge_ids(&mut connection.vector_shards, vector_shards);
            merge_ids(&mut connection.lexical_shards, lexical_shards);
            save_connection(&tx, &connection)?;
        } else {
            tracing::warn!(
                "Connection {} of document {} is gone; shard lists not merged",
                doc.connection_id,
                id
            );
        }

        tx.commit()?;
        Ok(doc)
    }

    /// 빌드 실패 처리 (상태만 변경)
    pub fn fail_document(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE documents SET status = ?2 WHERE id = ?1",
            params![id, DocumentStatus::Fail.as_str()],
        )
        .context("Failed to mark document as failed")?;
        Ok(())
    }

    /// 문서 삭제
    ///
    /// 연결에서 문서/샤드 ID 제거, 샤드 행 삭제, 범위 내 청크 삭제,
    /// 리소스 삭제를 하나의 트랜잭션으로 처리합니다.
    pub fn delete_document(&self, id: i64) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let Some(doc) = load_document(&tx, id)? else {
            return Ok(false);
        };

        if let Some(mut connection) = load_connection(&tx, doc.connection_id)? {
            connection.document_ids.retain(|d| *d != id);
            connection
                .vector_shards
                .retain(|s| !doc.vector_shards.contains(s));
            connection
                .lexical_shards
                .retain(|s| !doc.lexical_shards.contains(s));
            save_connection(&tx, &connection)?;
        }

        delete_ids(&tx, "vector_shards", &doc.vector_shards)?;
        delete_ids(&tx, "lexical_shards", &doc.lexical_shards)?;

        // 다른 문서의 윈도우와 ID가 교차할 수 있으므로 소유 문서도 함께 확인
        if let Some((from, to)) = doc.chunk_range {
            tx.execute(
                "DELETE FROM chunks WHERE document_id = ?1 AND id BETWEEN ?2 AND ?3",
                params![id, from, to],
            )
            .context("Failed to delete chunks")?;
        }

        if let Some(resource_id) = doc.resource_id {
            tx.execute("DELETE FROM resources WHERE id = ?1", params![resource_id])?;
        }

        tx.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        tx.commit()?;

        tracing::info!("Deleted document: {} (id={})", doc.name, id);
        Ok(true)
    }

    /// 리소스 조회
    pub fn get_resource(&self, id: i64) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let data = conn
            .query_row(
                "SELECT data FROM resources WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    // ------------------------------------------------------------------------
    // Chunks
    // ------------------------------------------------------------------------

    /// 청크 배치 저장 (ID 자동 할당, 입력 순서대로 반환)
    pub fn add_chunks(&self, chunks: &[NewChunk]) -> Result<Vec<i64>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut ids = Vec::with_capacity(chunks.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (document_id, kind, text, line_from, line_to, page)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    chunk.document_id,
                    chunk.kind.as_str(),
                    chunk.text,
                    chunk.line_from,
                    chunk.line_to,
                    chunk.page
                ])
                .context("Failed to insert chunk")?;
                ids.push(tx.last_insert_rowid());
            }
        }

        tx.commit()?;
        Ok(ids)
    }

    /// 여러 청크 조회 (ID 오름차순, 없는 ID는 무시)
    pub fn get_chunks(&self, ids: &[i64]) -> Result<Vec<TextChunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE id IN ({}) ORDER BY id",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let chunks = stmt
            .query_map(params_from_iter(ids.iter()), chunk_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    /// ID 범위 스캔
    pub fn chunks_in_range(&self, from: i64, to: i64) -> Result<Vec<TextChunk>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id BETWEEN ?1 AND ?2 ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let chunks = stmt
            .query_map(params![from, to], chunk_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    // ------------------------------------------------------------------------
    // Projection set & shards
    // ------------------------------------------------------------------------

    /// 투영 집합 조회
    pub fn load_projections(&self) -> Result<Option<ProjectionSet>> {
        let conn = self.lock()?;
        let data: Option<Vec<u8>> = conn
            .query_row("SELECT data FROM projections WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        data.map(|bytes| {
            serde_json::from_slice(&bytes).context("Failed to deserialize projection set")
        })
        .transpose()
    }

    /// 투영 집합 저장 (write-once)
    ///
    /// 이미 저장된 집합이 있으면 그대로 두고 저장된 쪽을 반환합니다.
    pub fn init_projections(&self, projections: &ProjectionSet) -> Result<ProjectionSet> {
        {
            let conn = self.lock()?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO projections (id, data, created_at) VALUES (1, ?1, ?2)",
                    params![serde_json::to_vec(projections)?, Utc::now().to_rfc3339()],
                )
                .context("Failed to insert projection set")?;
            if inserted > 0 {
                tracing::info!(
                    "Projection set created ({} tables x {} hashes, dim={})",
                    projections.num_tables(),
                    projections.hashes_per_table(),
                    projections.dimensions()
                );
            }
        }

        self.load_projections()?
            .ok_or_else(|| anyhow::anyhow!("Projection set missing after insert"))
    }

    /// 벡터 샤드 저장
    pub fn add_vector_shard(&self, tables: &ShardTables) -> Result<i64> {
        let data = serde_json::to_vec(tables).context("Failed to serialize vector shard")?;
        let conn = self.lock()?;
        conn.execute("INSERT INTO vector_shards (data) VALUES (?1)", params![data])
            .context("Failed to insert vector shard")?;
        Ok(conn.last_insert_rowid())
    }

    /// 벡터 샤드 조회 (없는 ID는 무시)
    pub fn get_vector_shards(&self, ids: &[i64]) -> Result<Vec<(i64, ShardTables)>> {
        self.load_blobs("vector_shards", ids)?
            .into_iter()
            .map(|(id, bytes)| {
                let tables = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to deserialize vector shard {id}"))?;
                Ok((id, tables))
            })
            .collect()
    }

    /// 렉시컬 샤드 저장
    pub fn add_lexical_shard(&self, index: &LexicalIndex) -> Result<i64> {
        let data = index.to_bytes()?;
        let conn = self.lock()?;
        conn.execute("INSERT INTO lexical_shards (data) VALUES (?1)", params![data])
            .context("Failed to insert lexical shard")?;
        Ok(conn.last_insert_rowid())
    }

    /// 렉시컬 샤드 조회 (없는 ID는 무시)
    pub fn get_lexical_shards(&self, ids: &[i64]) -> Result<Vec<(i64, LexicalIndex)>> {
        self.load_blobs("lexical_shards", ids)?
            .into_iter()
            .map(|(id, bytes)| Ok((id, LexicalIndex::from_bytes(&bytes)?)))
            .collect()
    }

    fn load_blobs(&self, table: &str, ids: &[i64]) -> Result<Vec<(i64, Vec<u8>)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT id, data FROM {table} WHERE id IN ({}) ORDER BY id",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(StoreStats {
            connection_count: count("SELECT COUNT(*) FROM connections")?,
            document_count: count("SELECT COUNT(*) FROM documents")?,
            building_count: count("SELECT COUNT(*) FROM documents WHERE status = 'building'")?,
            failed_count: count("SELECT COUNT(*) FROM documents WHERE status = 'fail'")?,
            chunk_count: count("SELECT COUNT(*) FROM chunks")?,
            vector_shard_count: count("SELECT COUNT(*) FROM vector_shards")?,
            lexical_shard_count: count("SELECT COUNT(*) FROM lexical_shards")?,
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// RFC3339 문자열을 DateTime<Utc>로 파싱
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn to_json(ids: &[i64]) -> Result<String> {
    serde_json::to_string(ids).context("Failed to serialize id list")
}

/// 중복 없이 뒤에 추가
fn merge_ids(target: &mut Vec<i64>, ids: &[i64]) {
    for id in ids {
        if !target.contains(id) {
            target.push(*id);
        }
    }
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn id_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<i64>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn unknown_value(idx: usize, value: &str) -> rusqlite::Error {
    conversion_error(
        idx,
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("unknown value '{value}'")),
    )
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    let status: String = row.get(3)?;
    let chunk_from: Option<i64> = row.get(4)?;
    let chunk_to: Option<i64> = row.get(5)?;

    Ok(Document {
        id: row.get(0)?,
        name: row.get(1)?,
        connection_id: row.get(2)?,
        status: DocumentStatus::parse(&status).ok_or_else(|| unknown_value(3, &status))?,
        chunk_range: chunk_from.zip(chunk_to),
        vector_shards: id_list(row, 6)?,
        lexical_shards: id_list(row, 7)?,
        resource_id: row.get(8)?,
        created_at: parse_datetime(row.get(9)?),
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<TextChunk> {
    let kind: String = row.get(2)?;
    Ok(TextChunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        kind: ChunkKind::parse(&kind).ok_or_else(|| unknown_value(2, &kind))?,
        text: row.get(3)?,
        line_from: row.get(4)?,
        line_to: row.get(5)?,
        page: row.get(6)?,
    })
}

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<Connection> {
    Ok(Connection {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        document_ids: id_list(row, 3)?,
        vector_shards: id_list(row, 4)?,
        lexical_shards: id_list(row, 5)?,
    })
}

fn load_document(conn: &SqliteConnection, id: i64) -> Result<Option<Document>> {
    let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1");
    let doc = conn
        .query_row(&sql, params![id], document_from_row)
        .optional()?;
    Ok(doc)
}

fn load_connection(conn: &SqliteConnection, id: i64) -> Result<Option<Connection>> {
    let sql = format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE id = ?1");
    let connection = conn
        .query_row(&sql, params![id], connection_from_row)
        .optional()?;
    Ok(connection)
}

fn save_connection(tx: &Transaction<'_>, connection: &Connection) -> Result<()> {
    tx.execute(
        "UPDATE connections SET document_ids = ?2, vector_shards = ?3, lexical_shards = ?4
         WHERE id = ?1",
        params![
            connection.id,
            to_json(&connection.document_ids)?,
            to_json(&connection.vector_shards)?,
            to_json(&connection.lexical_shards)?
        ],
    )
    .context("Failed to update connection")?;
    Ok(())
}

fn delete_ids(tx: &Transaction<'_>, table: &str, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let sql = format!("DELETE FROM {table} WHERE id IN ({})", placeholders(ids.len()));
    tx.execute(&sql, params_from_iter(ids.iter()))
        .with_context(|| format!("Failed to delete from {table}"))?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
