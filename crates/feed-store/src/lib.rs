//! 구독 저장소 및 백필 작업 큐.
//!
//! 이 crate는 다음을 제공합니다:
//! - PostgreSQL 연결 풀과 스키마 마이그레이션
//! - 구독 저장소 (`subscriptions` 테이블): 참조 카운트되는 구독자 집합과 최신 페이로드
//! - LISTEN/NOTIFY 기반 변경 알림 스트림
//! - 백필 작업 큐 (`tasks` 테이블) 계약

pub mod database;
pub mod error;
pub mod notifications;
pub mod subscriptions;
pub mod tasks;
pub mod traits;

pub use database::Database;
pub use error::{DataError, Result};
pub use notifications::{
    decode_notification, NotificationStream, StoreNotification, CHANNEL_ADDED, CHANNEL_DATA_UPDATED,
    CHANNEL_REMOVED, CHANNEL_RESET,
};
pub use subscriptions::{SubscriptionRecord, SubscriptionStore};
pub use tasks::{
    BackfillTask, KlineTaskPayload, PgBackfillQueue, PgBackfillSession, TaskOutcome, TaskStatus,
    TASK_TYPE_GET_KLINES,
};
pub use traits::{BackfillQueue, BackfillSession, FrameSink, SubscriptionSource};
