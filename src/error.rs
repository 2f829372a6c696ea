//! 도메인 에러 타입
//!
//! 호출자가 분기해야 하는 조건만 여기에 정의합니다.
//! I/O 와 저장소 에러는 `anyhow::Context` 로 감싸서 전파하고,
//! 특정 조건 확인은 `err.downcast_ref::<KbError>()` 로 합니다.

use std::time::Duration;

use thiserror::Error;

/// palank-kb 도메인 에러
#[derive(Debug, Error)]
pub enum KbError {
    /// 문서 없음
    #[error("document {0} not found")]
    DocumentNotFound(i64),

    /// 연결(Connection) 없음
    #[error("connection '{0}' not found")]
    ConnectionNotFound(String),

    /// 빌드 중인 문서 삭제 시도 (유예 기간 내)
    #[error(
        "document {id} is still building; try again in {} minute(s)",
        remaining.as_secs().div_ceil(60)
    )]
    StillBuilding { id: i64, remaining: Duration },

    /// 디스패처가 종료됨
    #[error("embedding dispatcher is shut down")]
    DispatcherClosed,

    /// 임베딩 실패
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// 벡터 차원 불일치
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 잘못된 설정
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_still_building_message_rounds_up_minutes() {
        let err = KbError::StillBuilding {
            id: 7,
            remaining: Duration::from_secs(61),
        };
        assert_eq!(
            err.to_string(),
            "document 7 is still building; try again in 2 minute(s)"
        );
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = KbError::DispatcherClosed.into();
        assert!(matches!(
            err.downcast_ref::<KbError>(),
            Some(KbError::DispatcherClosed)
        ));
    }
}
