//! # Feed Core
//!
//! 시장 데이터 피드 파이프라인의 핵심 도메인 타입을 제공합니다.
//!
//! 이 크레이트는 파이프라인 전반에서 사용되는 기본 타입을 제공합니다:
//! - 정규 구독 키 (`SubscriptionKey`) 및 데이터 타입
//! - 타임프레임과 기간 경계 계산
//! - OHLCV 바 구조체
//! - 설정 관리
//! - 로깅 인프라

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::*;
pub use error::*;
pub use logging::*;
pub use types::*;
