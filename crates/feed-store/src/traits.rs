//! 저장소 계층 trait 정의.
//!
//! 서비스는 이 trait들에만 의존하므로 데이터베이스 없이 메모리 구현으로 테스트할 수 있습니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::SubscriptionKey;
use serde_json::Value;
use std::time::Duration;

use crate::error::Result;
use crate::subscriptions::SubscriptionRecord;
use crate::tasks::{KlineTaskPayload, TaskOutcome};

/// 구독 저장소 읽기 및 구독자 관리.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// 현재 원하는 구독 키 전체.
    async fn list_keys(&self) -> Result<Vec<SubscriptionKey>>;

    /// 키의 레코드 (최신 페이로드 포함).
    async fn get(&self, key: &SubscriptionKey) -> Result<Option<SubscriptionRecord>>;

    /// 소유자를 구독자로 추가합니다. 새 행이 생성되면 `true`.
    async fn add_subscriber(&self, key: &SubscriptionKey, owner: &str) -> Result<bool>;

    /// 소유자를 제거합니다. 행이 삭제되면 `true`.
    async fn remove_subscriber(&self, key: &SubscriptionKey, owner: &str) -> Result<bool>;
}

/// 라우터가 최신 페이로드를 기록하는 대상.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// 키의 최신 값을 덮어씁니다. 행이 없으면 `false`이며 아무것도 생성하지 않습니다.
    async fn write_latest(
        &self,
        key: &SubscriptionKey,
        data: &Value,
        event_time: Option<DateTime<Utc>>,
    ) -> Result<bool>;
}

/// 백필 작업 큐.
#[async_trait]
pub trait BackfillQueue: Send + Sync {
    /// 채우기 루프 하나가 독점하는 세션을 엽니다.
    async fn open_session(&self) -> Result<Box<dyn BackfillSession>>;
}

/// 전용 연결 위에서 작업 제출과 완료 대기를 수행하는 세션.
#[async_trait]
pub trait BackfillSession: Send {
    /// `get_klines` 작업을 `pending` 상태로 제출하고 ID를 반환합니다.
    async fn submit(&mut self, payload: &KlineTaskPayload) -> Result<i64>;

    /// 작업이 끝나거나 `timeout`이 지날 때까지 기다립니다.
    async fn wait_for(&mut self, task_id: i64, timeout: Duration) -> Result<TaskOutcome>;

    /// 세션을 닫습니다.
    async fn close(self: Box<Self>) -> Result<()>;
}
