//! 거래소 에러 타입.

use thiserror::Error;

/// 거래소 연결 관련 에러.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    NetworkError(String),

    /// 거래소 연결 끊김
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    ParseError(String),

    /// 알 수 없는 이벤트 타입의 푸시 프레임
    #[error("Unknown event type: {0}")]
    UnknownEvent(String),

    /// WebSocket 에러
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// 타임아웃
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// 연결 태스크가 종료됨
    #[error("Connection task closed: {0}")]
    ChannelClosed(String),
}

impl ExchangeError {
    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkError(_)
                | ExchangeError::Disconnected(_)
                | ExchangeError::Timeout(_)
                | ExchangeError::WebSocket(_)
        )
    }

    /// 입력 하나만 버리면 되는 에러인지 확인.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            ExchangeError::ParseError(_) | ExchangeError::UnknownEvent(_)
        )
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::ParseError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                ExchangeError::Disconnected(err.to_string())
            }
            WsError::Io(e) => ExchangeError::NetworkError(e.to_string()),
            other => ExchangeError::WebSocket(other.to_string()),
        }
    }
}

impl From<feed_core::FeedError> for ExchangeError {
    fn from(err: feed_core::FeedError) -> Self {
        ExchangeError::ParseError(err.to_string())
    }
}
