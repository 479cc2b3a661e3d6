//! 거래소 연결 및 스트림 이름 변환.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - `StreamConnection` trait: 구독/해제/재연결을 위한 연결 인터페이스
//! - Binance 현물/USD-M 선물 WebSocket 클라이언트
//! - 정규 구독 키 ⇄ 거래소 스트림 이름 변환
//! - Binance 푸시 프레임 분류 및 페이로드 파싱

pub mod connector;
pub mod error;
pub mod naming;
pub mod traits;
pub mod websocket;

pub use connector::binance::{
    parse_kline_payload, parse_push_frame, parse_rest_klines, BinanceStreamConfig, PushFrame,
};
pub use error::*;
pub use naming::{connection_for, from_exchange_stream, to_exchange_stream};
pub use traits::*;
pub use websocket::stream::BinanceStreamClient;
