//! 정규 구독 키 ⇄ 거래소 스트림 이름 변환.
//!
//! Binance 스트림 이름은 `<소문자 심볼>@<채널>` 형식입니다:
//!
//! | 데이터 타입 | 채널 |
//! |---|---|
//! | `KLINE_<n>` | `kline_<거래소 인터벌>` |
//! | `QUOTES` | `ticker` |
//! | `TRADE` | `trade` |
//!
//! 스트림 이름에는 파생상품 접미사가 없으므로 역변환에는 프레임이 도착한
//! 연결 정보가 필요합니다.

use feed_core::{DataType, FeedError, FeedResult, SubscriptionKey, Timeframe};

use crate::traits::ConnectionId;

const TICKER_CHANNEL: &str = "ticker";
const TRADE_CHANNEL: &str = "trade";
const KLINE_CHANNEL_PREFIX: &str = "kline_";

/// 키를 담당하는 거래소 연결.
pub fn connection_for(key: &SubscriptionKey) -> ConnectionId {
    ConnectionId::new(key.exchange(), key.market())
}

/// 데이터 타입에 해당하는 거래소 채널 이름.
pub fn channel_for(data_type: DataType) -> String {
    match data_type {
        DataType::Kline(tf) => format!("{}{}", KLINE_CHANNEL_PREFIX, tf.to_binance_interval()),
        DataType::Quotes => TICKER_CHANNEL.to_string(),
        DataType::Trade => TRADE_CHANNEL.to_string(),
    }
}

/// 거래소 채널 이름을 데이터 타입으로 변환합니다. 인터벌은 대소문자를 구분합니다.
pub fn data_type_for(channel: &str) -> Option<DataType> {
    match channel {
        TICKER_CHANNEL => Some(DataType::Quotes),
        TRADE_CHANNEL => Some(DataType::Trade),
        _ => channel
            .strip_prefix(KLINE_CHANNEL_PREFIX)
            .and_then(Timeframe::from_binance_interval)
            .map(DataType::Kline),
    }
}

/// 정규 키를 거래소 스트림 이름으로 변환합니다.
///
/// 예: `BINANCE:BTCUSDT.P@KLINE_60` → `btcusdt@kline_1h`
pub fn to_exchange_stream(key: &SubscriptionKey) -> String {
    format!(
        "{}@{}",
        key.symbol().to_ascii_lowercase(),
        channel_for(key.data_type())
    )
}

/// 거래소 스트림 이름과 연결 정보로 정규 키를 복원합니다.
///
/// 접미사는 연결에서, 인터벌은 거래소 표기에서 정규 표기로 되돌립니다.
pub fn from_exchange_stream(stream: &str, connection: ConnectionId) -> FeedResult<SubscriptionKey> {
    let (symbol, channel) = stream
        .split_once('@')
        .ok_or_else(|| FeedError::invalid_key(stream, "스트림 이름에 '@' 없음"))?;

    let data_type = data_type_for(channel)
        .ok_or_else(|| FeedError::invalid_key(stream, format!("알 수 없는 채널: {}", channel)))?;

    SubscriptionKey::new(connection.exchange, symbol, connection.market, data_type)
}
