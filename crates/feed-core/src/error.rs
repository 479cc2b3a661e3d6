//! 피드 파이프라인의 에러 타입.

use thiserror::Error;

/// 핵심 도메인 에러.
#[derive(Debug, Error)]
pub enum FeedError {
    /// 구독 키 파싱 실패
    #[error("잘못된 구독 키 '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// 지원하지 않는 인터벌
    #[error("지원하지 않는 인터벌: {0}")]
    UnsupportedInterval(String),

    /// 잘못된 데이터 (페이로드 등)
    #[error("잘못된 데이터: {0}")]
    InvalidData(String),

    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 직렬화 에러
    #[error("직렬화 에러: {0}")]
    Serialization(String),
}

/// 핵심 작업을 위한 Result 타입.
pub type FeedResult<T> = Result<T, FeedError>;

impl FeedError {
    /// 구독 키 파싱 에러를 생성합니다.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        FeedError::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// 입력 데이터 문제로 인한 에러인지 확인합니다.
    ///
    /// 이런 에러는 해당 항목만 버리고 처리를 계속해야 합니다.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            FeedError::InvalidKey { .. }
                | FeedError::UnsupportedInterval(_)
                | FeedError::InvalidData(_)
                | FeedError::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for FeedError {
    fn from(err: config::ConfigError) -> Self {
        FeedError::Config(err.to_string())
    }
}
