//! 시장 데이터 피드 동기화 서비스.
//!
//! 이 crate는 구독 저장소를 중심으로 동작하는 세 서비스를 제공합니다:
//! - **Reconciler**: 저장소의 원하는 구독과 거래소 라이브 구독을 일치시킴
//! - **Router**: 거래소 푸시 프레임을 정규 키로 바꿔 저장소에 최신 값으로 기록
//! - **Continuity Engine**: 키별 바 캐시를 유지하고 빈틈을 백필로 복구

pub mod config;
pub mod error;
pub mod modules;
pub mod stats;

pub use config::load_config;
pub use error::{Result, SyncError};
pub use modules::continuity::{
    BarSeries, Clock, ContinuityEngine, FeedState, FillOutcome, GapClass, RepairReason,
    SystemClock, UpdateDecision,
};
pub use modules::reconciler::{PendingBatch, Reconciler};
pub use modules::router::{RouteOutcome, Router};
pub use stats::{FillStats, ReconcileStats, RouterStats};
