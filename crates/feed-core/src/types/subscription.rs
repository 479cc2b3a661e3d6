//! 정규 구독 키 정의.
//!
//! 구독 키는 거래소 중립적으로 하나의 논리적 데이터 피드를 식별합니다:
//!
//! ```text
//! EXCHANGE ":" SYMBOL ["." SUFFIX] "@" DATA_TYPE ["_" INTERVAL]
//! ```
//!
//! 예: `BINANCE:BTCUSDT@KLINE_60`, `BINANCE:ETHUSDT.P@TRADE`.
//! 입력은 대소문자를 구분하지 않으며 저장 형태는 대문자입니다.
//! `SUFFIX`는 어떤 거래소 연결이 키를 담당하는지만 바꾸고 식별성에는 영향이 없습니다.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::timeframe::Timeframe;
use crate::error::{FeedError, FeedResult};

/// 관리 대상 거래소.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Exchange {
    /// 바이낸스
    Binance,
}

impl Exchange {
    /// 정규 표기.
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "BINANCE",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BINANCE" => Ok(Exchange::Binance),
            other => Err(FeedError::invalid_key(s, format!("알 수 없는 거래소: {}", other))),
        }
    }
}

/// 시장 구분. 키의 파생상품 접미사에서 결정됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Market {
    /// 현물 (접미사 없음)
    Spot,
    /// USD-M 무기한 선물 (접미사 `P`)
    Perpetual,
}

impl Market {
    /// 키에 붙는 접미사.
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            Market::Spot => None,
            Market::Perpetual => Some("P"),
        }
    }

    /// 접미사에서 시장을 결정합니다.
    pub fn from_suffix(suffix: Option<&str>) -> Option<Self> {
        match suffix.map(|s| s.to_ascii_uppercase()) {
            None => Some(Market::Spot),
            Some(s) if s == "P" => Some(Market::Perpetual),
            Some(_) => None,
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Market::Spot => f.write_str("spot"),
            Market::Perpetual => f.write_str("perpetual"),
        }
    }
}

/// 구독 데이터 타입.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    /// 캔들 (`KLINE_<interval>`)
    Kline(Timeframe),
    /// 24시간 시세 (`QUOTES`)
    Quotes,
    /// 체결 (`TRADE`)
    Trade,
}

impl DataType {
    /// 캔들 타입이면 타임프레임을 반환합니다.
    pub fn timeframe(&self) -> Option<Timeframe> {
        match self {
            DataType::Kline(tf) => Some(*tf),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Kline(tf) => write!(f, "KLINE_{}", tf.canonical_token()),
            DataType::Quotes => f.write_str("QUOTES"),
            DataType::Trade => f.write_str("TRADE"),
        }
    }
}

impl FromStr for DataType {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        match upper.as_str() {
            "QUOTES" => Ok(DataType::Quotes),
            "TRADE" => Ok(DataType::Trade),
            _ => {
                let token = upper.strip_prefix("KLINE_").ok_or_else(|| {
                    FeedError::invalid_key(s, "데이터 타입은 KLINE_<interval>, QUOTES, TRADE 중 하나")
                })?;
                Timeframe::from_canonical_token(token)
                    .map(DataType::Kline)
                    .ok_or_else(|| FeedError::UnsupportedInterval(token.to_string()))
            }
        }
    }
}

/// 정규 구독 키.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubscriptionKey {
    exchange: Exchange,
    symbol: String,
    market: Market,
    data_type: DataType,
}

impl SubscriptionKey {
    /// 구성 요소로 키를 생성합니다. 심볼은 대문자로 정규화됩니다.
    pub fn new(
        exchange: Exchange,
        symbol: impl AsRef<str>,
        market: Market,
        data_type: DataType,
    ) -> FeedResult<Self> {
        let symbol = symbol.as_ref().to_ascii_uppercase();
        validate_symbol(&symbol)?;
        Ok(Self {
            exchange,
            symbol,
            market,
            data_type,
        })
    }

    /// 문자열 키를 파싱합니다.
    pub fn parse(key: &str) -> FeedResult<Self> {
        let trimmed = key.trim();
        let (exchange, rest) = trimmed
            .split_once(':')
            .ok_or_else(|| FeedError::invalid_key(key, "':' 구분자 없음"))?;
        let (instrument, data_type) = rest
            .split_once('@')
            .ok_or_else(|| FeedError::invalid_key(key, "'@' 구분자 없음"))?;

        let (symbol, suffix) = match instrument.split_once('.') {
            Some((symbol, suffix)) => (symbol, Some(suffix)),
            None => (instrument, None),
        };

        let exchange: Exchange = exchange.parse()?;
        let market = Market::from_suffix(suffix)
            .ok_or_else(|| FeedError::invalid_key(key, "알 수 없는 접미사"))?;
        let data_type: DataType = data_type.parse().map_err(|e| match e {
            FeedError::UnsupportedInterval(token) => {
                FeedError::invalid_key(key, format!("지원하지 않는 인터벌: {}", token))
            }
            other => other,
        })?;

        Self::new(exchange, symbol, market, data_type)
            .map_err(|_| FeedError::invalid_key(key, "잘못된 심볼"))
    }

    /// 거래소.
    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    /// 대문자 심볼 (예: `BTCUSDT`).
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// 시장 구분.
    pub fn market(&self) -> Market {
        self.market
    }

    /// 데이터 타입.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// 캔들 키이면 타임프레임.
    pub fn timeframe(&self) -> Option<Timeframe> {
        self.data_type.timeframe()
    }
}

fn validate_symbol(symbol: &str) -> FeedResult<()> {
    if symbol.is_empty() {
        return Err(FeedError::invalid_key(symbol, "빈 심볼"));
    }
    if !symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(FeedError::invalid_key(symbol, "심볼에 허용되지 않는 문자"));
    }
    Ok(())
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)?;
        if let Some(suffix) = self.market.suffix() {
            write!(f, ".{}", suffix)?;
        }
        write!(f, "@{}", self.data_type)
    }
}

impl FromStr for SubscriptionKey {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SubscriptionKey {
    type Error = FeedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SubscriptionKey> for String {
    fn from(key: SubscriptionKey) -> Self {
        key.to_string()
    }
}
