//! Binance 거래소 커넥터.
//!
//! 현물 및 USD-M 선물 WebSocket 스트림 설정과 푸시 프레임/캔들 페이로드 파싱.

use chrono::{DateTime, Utc};
use feed_core::{Bar, ExchangeConfig, Market};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

use crate::traits::{ConnectionId, ExchangeResult};
use crate::ExchangeError;

// ============================================================================
// 설정
// ============================================================================

/// Binance 스트림 연결 설정.
#[derive(Debug, Clone)]
pub struct BinanceStreamConfig {
    /// 현물 WebSocket URL
    pub spot_ws_url: String,
    /// USD-M 선물 WebSocket URL
    pub futures_ws_url: String,
    /// 재연결 대기 시간
    pub reconnect_delay: Duration,
    /// SUBSCRIBE 메시지당 최대 스트림 수
    pub max_streams_per_request: usize,
    /// 클라이언트 Ping 간격
    pub ping_interval: Duration,
}

impl Default for BinanceStreamConfig {
    fn default() -> Self {
        Self::from_settings(&ExchangeConfig::default())
    }
}

impl BinanceStreamConfig {
    /// 설정 파일의 `exchange` 섹션에서 생성합니다.
    pub fn from_settings(settings: &ExchangeConfig) -> Self {
        Self {
            spot_ws_url: settings.spot_ws_url.clone(),
            futures_ws_url: settings.futures_ws_url.clone(),
            reconnect_delay: settings.reconnect_delay(),
            max_streams_per_request: settings.max_streams_per_request.max(1),
            ping_interval: settings.ping_interval(),
        }
    }

    /// 연결별 WebSocket URL 반환.
    pub fn ws_url(&self, connection: ConnectionId) -> &str {
        match connection.market {
            Market::Spot => &self.spot_ws_url,
            Market::Perpetual => &self.futures_ws_url,
        }
    }

    /// 관리 대상 연결 전체.
    pub fn connections(&self) -> [ConnectionId; 2] {
        [ConnectionId::BINANCE_SPOT, ConnectionId::BINANCE_PERPETUAL]
    }
}

// ============================================================================
// 푸시 프레임
// ============================================================================

/// 이벤트 타입 태그.
const EVENT_KLINE: &str = "kline";
const EVENT_TICKER: &str = "24hrTicker";
const EVENT_TRADE: &str = "trade";

/// 결합 스트림(`/stream?streams=`) 봉투.
#[derive(Debug, Deserialize)]
struct CombinedFrame {
    #[allow(dead_code)]
    stream: String,
    data: Value,
}

/// 구독 응답. `{"result": null, "id": 1}`
#[derive(Debug, Deserialize)]
struct WsAck {
    id: u64,
    #[serde(default)]
    result: Value,
}

/// 모든 이벤트에 공통인 헤더.
#[derive(Debug, Deserialize)]
struct WsEventHeader {
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
    #[serde(rename = "s")]
    symbol: String,
}

/// 캔들 이벤트. 심볼과 인터벌만 라우팅에 사용합니다.
#[derive(Debug, Deserialize)]
struct WsKlineEvent {
    #[serde(rename = "k")]
    kline: WsKline,
}

#[derive(Debug, Deserialize)]
struct WsKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x", default)]
    is_closed: bool,
}

/// 분류된 시장 이벤트.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    /// 거래소 심볼 (예: `BTCUSDT`)
    pub symbol: String,
    /// 거래소 채널 (예: `kline_1h`, `ticker`, `trade`)
    pub channel: String,
    /// 이벤트 시각 (`E`)
    pub event_time: Option<DateTime<Utc>>,
    /// 이벤트 본문
    pub payload: Value,
}

impl PushEvent {
    /// 이벤트가 속한 거래소 스트림 이름.
    pub fn stream_name(&self) -> String {
        format!("{}@{}", self.symbol.to_ascii_lowercase(), self.channel)
    }
}

/// 푸시 프레임 분류 결과.
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    /// 시장 데이터 이벤트
    Event(PushEvent),
    /// 구독/해제 응답
    Ack {
        /// 요청 ID
        id: u64,
        /// 오류 응답 여부
        error: bool,
    },
}

/// 원본 텍스트 프레임을 분류합니다.
///
/// 결합 스트림 봉투는 벗겨내고, 구독 응답은 `Ack`로 돌려줍니다.
/// 알 수 없는 이벤트 타입은 `ExchangeError::UnknownEvent`입니다.
pub fn parse_push_frame(text: &str) -> ExchangeResult<PushFrame> {
    let value: Value = serde_json::from_str(text)?;

    let data = if value.get("stream").is_some() && value.get("data").is_some() {
        serde_json::from_value::<CombinedFrame>(value)?.data
    } else {
        value
    };

    let Some(event_type) = data.get("e").and_then(Value::as_str) else {
        if data.get("id").is_some() {
            let ack = WsAck::deserialize(&data)?;
            return Ok(PushFrame::Ack {
                id: ack.id,
                error: !ack.result.is_null(),
            });
        }
        return Err(ExchangeError::ParseError(format!(
            "이벤트 태그 없는 프레임: {}",
            truncate(text)
        )));
    };

    let channel = match event_type {
        EVENT_KLINE => {
            let event = WsKlineEvent::deserialize(&data)?;
            format!("kline_{}", event.kline.interval)
        }
        EVENT_TICKER => "ticker".to_string(),
        EVENT_TRADE => "trade".to_string(),
        other => return Err(ExchangeError::UnknownEvent(other.to_string())),
    };
    let header = WsEventHeader::deserialize(&data)?;

    Ok(PushFrame::Event(PushEvent {
        symbol: header.symbol,
        channel,
        event_time: header.event_time.and_then(DateTime::from_timestamp_millis),
        payload: data,
    }))
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(120) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// 캔들 파싱
// ============================================================================

fn parse_decimal(field: &str, s: &str) -> ExchangeResult<Decimal> {
    Decimal::from_str(s)
        .map_err(|e| ExchangeError::ParseError(format!("{} 필드 '{}': {}", field, s, e)))
}

fn timestamp(field: &str, ms: i64) -> ExchangeResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ExchangeError::ParseError(format!("{} 범위 밖 시각: {}", field, ms)))
}

/// 스트림 캔들 이벤트(`{"e":"kline","k":{...}}`) 또는 `k` 객체를 바로 변환합니다.
pub fn parse_kline_payload(payload: &Value) -> ExchangeResult<Bar> {
    let kline = match payload.get("k") {
        Some(k) => WsKline::deserialize(k)?,
        None => WsKline::deserialize(payload)?,
    };

    Ok(Bar {
        open_time: timestamp("t", kline.open_time)?,
        open: parse_decimal("o", &kline.open)?,
        high: parse_decimal("h", &kline.high)?,
        low: parse_decimal("l", &kline.low)?,
        close: parse_decimal("c", &kline.close)?,
        volume: parse_decimal("v", &kline.volume)?,
        close_time: timestamp("T", kline.close_time)?,
        closed: kline.is_closed,
    })
}

/// REST 캔들 응답 행 하나.
///
/// `[open_time, "o", "h", "l", "c", "v", close_time, ...]`. 가격 필드는 문자열 또는 숫자입니다.
fn parse_rest_row(row: &Value) -> ExchangeResult<Bar> {
    let cells = row
        .as_array()
        .ok_or_else(|| ExchangeError::ParseError("캔들 행이 배열이 아님".to_string()))?;
    if cells.len() < 7 {
        return Err(ExchangeError::ParseError(format!(
            "캔들 행 필드 부족: {}개",
            cells.len()
        )));
    }

    let int_cell = |idx: usize, name: &str| -> ExchangeResult<i64> {
        cells[idx]
            .as_i64()
            .ok_or_else(|| ExchangeError::ParseError(format!("{} 필드가 정수가 아님", name)))
    };
    let decimal_cell = |idx: usize, name: &str| -> ExchangeResult<Decimal> {
        match &cells[idx] {
            Value::String(s) => parse_decimal(name, s),
            Value::Number(n) => parse_decimal(name, &n.to_string()),
            other => Err(ExchangeError::ParseError(format!(
                "{} 필드 타입 오류: {}",
                name, other
            ))),
        }
    };

    Ok(Bar {
        open_time: timestamp("open_time", int_cell(0, "open_time")?)?,
        open: decimal_cell(1, "open")?,
        high: decimal_cell(2, "high")?,
        low: decimal_cell(3, "low")?,
        close: decimal_cell(4, "close")?,
        volume: decimal_cell(5, "volume")?,
        close_time: timestamp("close_time", int_cell(6, "close_time")?)?,
        closed: true,
    })
}

/// 백필 태스크 결과를 바 목록으로 변환합니다.
///
/// REST 캔들 배열 또는 `{"klines": [...]}` 형태를 받습니다. 결과는 시작 시각 오름차순입니다.
pub fn parse_rest_klines(result: &Value) -> ExchangeResult<Vec<Bar>> {
    let rows = match result {
        Value::Array(rows) => rows,
        Value::Object(map) => map
            .get("klines")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::ParseError("klines 배열 없음".to_string()))?,
        other => {
            return Err(ExchangeError::ParseError(format!(
                "캔들 결과 타입 오류: {}",
                truncate(&other.to_string())
            )))
        }
    };

    let mut bars = rows
        .iter()
        .map(parse_rest_row)
        .collect::<ExchangeResult<Vec<_>>>()?;
    bars.sort_by_key(|bar| bar.open_time);
    Ok(bars)
}
