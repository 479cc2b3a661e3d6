//! 구독 저장소.
//!
//! `subscriptions` 테이블은 "지금 무엇을 스트리밍해야 하는가"의 유일한 기준입니다.
//! 한 행은 여러 소유자가 공유하는 참조 카운트 자원이며, `subscribers` 배열 변경은 항상
//! 단일 구문 안의 집합 연산으로 표현하여 읽고-쓰기 경쟁을 피합니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_core::SubscriptionKey;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::notifications::CHANNEL_RESET;
use crate::traits::{FrameSink, SubscriptionSource};

/// 구독 저장소 레코드.
#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRecord {
    pub subscription_key: String,
    pub data_type: String,
    pub data: Option<Value>,
    pub event_time: Option<DateTime<Utc>>,
    pub subscribers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// 저장된 키를 파싱합니다.
    pub fn key(&self) -> feed_core::FeedResult<SubscriptionKey> {
        SubscriptionKey::parse(&self.subscription_key)
    }
}

/// 구독 저장소.
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    /// 새 저장소를 생성합니다.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 소유자를 구독자로 추가합니다. 행이 없으면 생성합니다.
    ///
    /// 이미 구독자이면 아무것도 바뀌지 않습니다. 새 행이 만들어졌으면 `true`.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn add_subscriber(&self, key: &SubscriptionKey, owner: &str) -> Result<bool> {
        let (inserted,): (bool,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (subscription_key, data_type, subscribers)
            VALUES ($1, $2, ARRAY[$3::TEXT])
            ON CONFLICT (subscription_key)
            DO UPDATE SET
                subscribers = CASE
                    WHEN $3 = ANY(subscriptions.subscribers) THEN subscriptions.subscribers
                    ELSE array_append(subscriptions.subscribers, $3)
                END,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(key.to_string())
        .bind(key.data_type().to_string())
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;

        if inserted {
            info!(owner, "구독 생성");
        } else {
            debug!(owner, "기존 구독에 소유자 추가");
        }
        Ok(inserted)
    }

    /// 소유자를 구독자에서 제거합니다. 마지막 소유자였으면 행을 삭제하고 `true`.
    ///
    /// 행을 잠근 뒤 남는 소유자 집합에 따라 UPDATE와 DELETE 중 하나만 적용하는 단일 구문입니다.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn remove_subscriber(&self, key: &SubscriptionKey, owner: &str) -> Result<bool> {
        let (deleted,): (bool,) = sqlx::query_as(
            r#"
            WITH target AS (
                SELECT subscription_key, array_remove(subscribers, $2::TEXT) AS remaining
                FROM subscriptions
                WHERE subscription_key = $1
                FOR UPDATE
            ),
            removed AS (
                DELETE FROM subscriptions s
                USING target t
                WHERE s.subscription_key = t.subscription_key
                  AND cardinality(t.remaining) = 0
                RETURNING s.subscription_key
            ),
            updated AS (
                UPDATE subscriptions s
                SET subscribers = t.remaining,
                    updated_at = NOW()
                FROM target t
                WHERE s.subscription_key = t.subscription_key
                  AND cardinality(t.remaining) > 0
                RETURNING s.subscription_key
            )
            SELECT EXISTS (SELECT 1 FROM removed) AS deleted
            "#,
        )
        .bind(key.to_string())
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;

        if deleted {
            info!(owner, "마지막 소유자 제거, 구독 삭제");
        }
        Ok(deleted)
    }

    /// 최신 페이로드를 덮어씁니다. 행이 없으면 아무것도 만들지 않고 `false`.
    ///
    /// 행을 만드는 upsert가 아닙니다. 삭제 직후 도착한 프레임이 행을 되살리면 구독자 없는
    /// 행이 남고 조정기가 그 스트림을 다시 구독하게 되므로, 행 생성은 `add_subscriber`만 합니다.
    pub async fn update_data(
        &self,
        key: &SubscriptionKey,
        data: &Value,
        event_time: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET data = $2, event_time = $3, updated_at = NOW()
            WHERE subscription_key = $1
            "#,
        )
        .bind(key.to_string())
        .bind(Json(data))
        .bind(event_time)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 키로 레코드를 조회합니다.
    pub async fn get(&self, key: &SubscriptionKey) -> Result<Option<SubscriptionRecord>> {
        let record = sqlx::query_as(
            r#"
            SELECT subscription_key, data_type, data, event_time, subscribers, created_at, updated_at
            FROM subscriptions
            WHERE subscription_key = $1
            "#,
        )
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// 전체 레코드 목록.
    pub async fn list(&self) -> Result<Vec<SubscriptionRecord>> {
        let records = sqlx::query_as(
            r#"
            SELECT subscription_key, data_type, data, event_time, subscribers, created_at, updated_at
            FROM subscriptions
            ORDER BY subscription_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// 전체 구독 키 목록. 해석할 수 없는 키는 경고 후 건너뜁니다.
    pub async fn list_keys(&self) -> Result<Vec<SubscriptionKey>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT subscription_key FROM subscriptions ORDER BY subscription_key")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(raw,)| match SubscriptionKey::parse(&raw) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(key = %raw, error = %e, "잘못된 구독 키 무시");
                    None
                }
            })
            .collect())
    }

    /// 전체 재동기화를 요청하는 reset 알림을 발행합니다.
    pub async fn request_reset(&self, reason: &str) -> Result<()> {
        let payload = serde_json::json!({ "reason": reason }).to_string();
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL_RESET)
            .bind(payload)
            .execute(&self.pool)
            .await?;

        info!(reason, "구독 reset 알림 발행");
        Ok(())
    }
}

#[async_trait]
impl SubscriptionSource for SubscriptionStore {
    async fn list_keys(&self) -> Result<Vec<SubscriptionKey>> {
        SubscriptionStore::list_keys(self).await
    }

    async fn get(&self, key: &SubscriptionKey) -> Result<Option<SubscriptionRecord>> {
        SubscriptionStore::get(self, key).await
    }

    async fn add_subscriber(&self, key: &SubscriptionKey, owner: &str) -> Result<bool> {
        SubscriptionStore::add_subscriber(self, key, owner).await
    }

    async fn remove_subscriber(&self, key: &SubscriptionKey, owner: &str) -> Result<bool> {
        SubscriptionStore::remove_subscriber(self, key, owner).await
    }
}

#[async_trait]
impl FrameSink for SubscriptionStore {
    async fn write_latest(
        &self,
        key: &SubscriptionKey,
        data: &Value,
        event_time: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.update_data(key, data, event_time).await
    }
}
