//! 에러 타입 정의.

use feed_core::FeedError;
use feed_exchange::ExchangeError;
use feed_store::DataError;
use thiserror::Error;

/// 동기화 서비스 에러 타입
#[derive(Debug, Error)]
pub enum SyncError {
    /// 도메인 에러 (키 파싱, 설정)
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// 거래소 연결 에러
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// 저장소 에러
    #[error(transparent)]
    Data(#[from] DataError),

    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, SyncError>;
