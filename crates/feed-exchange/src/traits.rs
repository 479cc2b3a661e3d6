//! 거래소 연결 trait 정의.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::{Exchange, Market};
use std::collections::HashSet;
use std::fmt;

use crate::ExchangeError;

/// 거래소 작업을 위한 Result 타입.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// 관리되는 거래소 연결의 식별자.
///
/// 구독 키의 파생상품 접미사가 어느 연결을 쓸지 결정합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    /// 거래소
    pub exchange: Exchange,
    /// 시장 구분
    pub market: Market,
}

impl ConnectionId {
    /// 새 연결 식별자를 생성합니다.
    pub const fn new(exchange: Exchange, market: Market) -> Self {
        Self { exchange, market }
    }

    /// Binance 현물 연결.
    pub const BINANCE_SPOT: ConnectionId = ConnectionId::new(Exchange::Binance, Market::Spot);

    /// Binance USD-M 무기한 선물 연결.
    pub const BINANCE_PERPETUAL: ConnectionId =
        ConnectionId::new(Exchange::Binance, Market::Perpetual);
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.exchange.as_str().to_lowercase(), self.market)
    }
}

/// 연결에서 수신한 원본 푸시 프레임.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// 프레임이 도착한 연결
    pub connection: ConnectionId,
    /// 원본 텍스트
    pub text: String,
    /// 수신 시각
    pub received_at: DateTime<Utc>,
}

/// 연결 태스크가 내보내는 이벤트.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// 푸시 프레임 수신
    Frame(RawFrame),
    /// 예기치 않게 연결이 끊김
    Disconnected(ConnectionId),
    /// 예기치 않은 끊김 이후 재연결됨 (라이브 구독은 비어 있음)
    Reconnected(ConnectionId),
}

/// 구독을 관리하는 거래소 스트림 연결.
///
/// 모든 메서드는 `&self`를 받으며 내부에서 연결 태스크와 통신합니다.
#[async_trait]
pub trait StreamConnection: Send + Sync {
    /// 연결 식별자.
    fn id(&self) -> ConnectionId;

    /// 스트림들을 구독합니다. 이미 구독 중인 스트림은 다시 보내지 않습니다.
    ///
    /// 새로 구독한 스트림 수를 반환합니다.
    async fn subscribe(&self, streams: Vec<String>) -> ExchangeResult<usize>;

    /// 스트림 구독을 해제합니다. 구독 중이 아닌 스트림은 무시합니다.
    ///
    /// 실제로 해제한 스트림 수를 반환합니다.
    async fn unsubscribe(&self, streams: Vec<String>) -> ExchangeResult<usize>;

    /// 연결을 끊고 다시 연결합니다. 완료되면 라이브 구독은 비어 있습니다.
    async fn reconnect(&self) -> ExchangeResult<()>;

    /// 현재 라이브 구독 스트림 목록.
    async fn live_streams(&self) -> HashSet<String>;
}
